//! The DRAM routing index over bottom nodes.
//!
//! [`InnerIndex`] owns every [`InnerNode`] and every [`BottomNode`]. Nodes
//! are never freed while the index is alive, so raw pointers read from a
//! node stay valid for the index's lifetime and readers need no epoch-based
//! reclamation. Bottom nodes released at runtime are unlinked from the
//! chain and parked on a retired list until the index drops.
//!
//! ```text
//!                  root (level h-1)
//!                 /        \
//!          inner (0) ──► inner (0)          sibling links per level
//!         /   |   \       /    \
//!       bn ─► bn ─► bn ─► bn ─► bn          bottom nodes, `next` chain
//!       │     │     │     │     │
//!      leaf  leaf  leaf  leaf  leaf         persistent leaf chain
//! ```

use std::ptr as StdPtr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::bottom::BottomNode;
use crate::internode::{InnerNode, PendingSeparator, Route, StoreOutcome};
use crate::nodeversion::Backoff;
use crate::ordering::READ_ORD;

/// One store attempt at a single node.
enum Step {
    /// The key moved to this sibling; store there.
    Retry(*mut InnerNode),
    /// Stored, possibly leaving a separator for the next level.
    Done(Option<PendingSeparator>),
}

/// Root pointer, node ownership and split accounting.
#[derive(Debug)]
pub struct InnerIndex {
    root: AtomicPtr<InnerNode>,
    first_bottom: *mut BottomNode,
    retired: Mutex<Vec<*mut BottomNode>>,
    inner_nodes: AtomicUsize,
    bottom_nodes: AtomicUsize,
    inner_splits: AtomicU64,
}

// SAFETY: all shared node state is atomic or written under node locks, and
// nodes outlive every reference handed out by `&self` methods.
unsafe impl Send for InnerIndex {}
// SAFETY: see above.
unsafe impl Sync for InnerIndex {}

impl InnerIndex {
    /// A one-level index with a single bottom node covering every key.
    ///
    /// `first_bottom` must come from [`BottomNode::boxed`]; the index takes
    /// ownership of it and of everything later linked after it.
    #[must_use]
    pub fn new(first_bottom: *mut BottomNode) -> Self {
        Self {
            root: AtomicPtr::new(InnerNode::boxed(0, i64::MIN, first_bottom.cast())),
            first_bottom,
            retired: Mutex::new(Vec::new()),
            inner_nodes: AtomicUsize::new(1),
            bottom_nodes: AtomicUsize::new(1),
            inner_splits: AtomicU64::new(0),
        }
    }

    #[inline]
    fn root(&self) -> &InnerNode {
        // SAFETY: the root is never null and never freed before `drop`.
        unsafe { &*self.root.load(READ_ORD) }
    }

    /// Number of inner levels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.root().level() + 1
    }

    /// Inner nodes allocated so far.
    #[must_use]
    pub fn inner_nodes(&self) -> usize {
        self.inner_nodes.load(Ordering::Relaxed)
    }

    /// Bottom nodes linked into the index.
    #[must_use]
    pub fn bottom_nodes(&self) -> usize {
        self.bottom_nodes.load(Ordering::Relaxed)
    }

    /// Inner-node splits so far.
    #[must_use]
    pub fn inner_splits(&self) -> u64 {
        self.inner_splits.load(Ordering::Relaxed)
    }

    /// Head of the bottom-node chain.
    #[must_use]
    pub fn first_bottom(&self) -> &BottomNode {
        // SAFETY: owned by the index.
        unsafe { &*self.first_bottom }
    }

    /// The bottom node the index routes `key` to.
    ///
    /// A concurrent split may already have moved `key` further right; the
    /// caller checks the node's range and walks `next`.
    #[must_use]
    pub fn descend(&self, key: i64) -> &BottomNode {
        let mut node: &InnerNode = self.root();
        loop {
            match node.linear_search(key) {
                // SAFETY: siblings live as long as the index.
                Route::Sibling(sibling) => node = unsafe { &*sibling },
                Route::Child(child) if node.level() == 0 => {
                    // SAFETY: level-0 children are bottom nodes owned by the index.
                    return unsafe { &*child.cast::<BottomNode>() };
                }
                // SAFETY: children above level 0 are inner nodes.
                Route::Child(child) => node = unsafe { &*child.cast::<InnerNode>() },
            }
        }
    }

    /// The inner node at `level` whose range holds `key`.
    fn descend_to(&self, level: u32, key: i64) -> &InnerNode {
        let mut node: &InnerNode = self.root();
        while node.level() > level {
            node = match node.linear_search(key) {
                // SAFETY: as in `descend`.
                Route::Sibling(sibling) => unsafe { &*sibling },
                // SAFETY: as in `descend`.
                Route::Child(child) => unsafe { &*child.cast::<InnerNode>() },
            };
        }
        node
    }

    /// Record a bottom node produced by a leaf split.
    ///
    /// Called while the split bottom node is still locked, so the node is
    /// routable before any reader can miss it. Returns a separator for the
    /// next level if the level-0 node split; the caller passes it to
    /// [`InnerIndex::insert_separator`] once it has released its locks.
    #[must_use = "a pending separator must be propagated"]
    pub fn link_bottom(&self, low: i64, bottom: *mut BottomNode) -> Option<PendingSeparator> {
        self.bottom_nodes.fetch_add(1, Ordering::Relaxed);
        let mut node: &InnerNode = self.descend_to(0, low);
        loop {
            match self.store(node, low, bottom.cast()) {
                // SAFETY: siblings live as long as the index.
                Step::Retry(sibling) => node = unsafe { &*sibling },
                Step::Done(pending) => return pending,
            }
        }
    }

    /// Send every route to `dead` to `owner`, which has absorbed its range,
    /// and keep `dead` allocated until the index drops.
    ///
    /// Called while both nodes are still locked, so their ranges are
    /// stable. Every level-0 pointer to `dead` lies within its old range.
    pub fn retire_bottom(&self, dead: *mut BottomNode, owner: *mut BottomNode) {
        // SAFETY: `dead` is owned by the index and only parked below.
        let dead_node: &BottomNode = unsafe { &*dead };
        let high: Option<i64> = dead_node.high();

        let mut node: &InnerNode = self.descend_to(0, dead_node.low());
        loop {
            node.repoint(dead.cast(), owner.cast());
            let sibling: *mut InnerNode = node.sibling();
            if sibling.is_null() {
                break;
            }
            // SAFETY: siblings live as long as the index.
            let sibling: &InnerNode = unsafe { &*sibling };
            if high.is_some_and(|high| sibling.min_key() >= high) {
                break;
            }
            node = sibling;
        }

        self.bottom_nodes.fetch_sub(1, Ordering::Relaxed);
        self.retired.lock().push(dead);
    }

    /// Store `(key, child)` at `level`, splitting upward as needed.
    ///
    /// If the tree has not yet grown to `level` (the thread growing the
    /// root is still finishing), waits with backoff rather than dropping the
    /// separator.
    pub fn insert_separator(&self, mut pending: PendingSeparator) {
        let mut backoff = Backoff::new();
        loop {
            if self.root().level() < pending.level {
                backoff.snooze();
                continue;
            }

            let mut node: &InnerNode = self.descend_to(pending.level, pending.key);
            let next = loop {
                match self.store(node, pending.key, pending.child) {
                    // SAFETY: siblings live as long as the index.
                    Step::Retry(sibling) => node = unsafe { &*sibling },
                    Step::Done(next) => break next,
                }
            };
            match next {
                Some(up) => pending = up,
                None => return,
            }
        }
    }

    fn store(&self, node: &InnerNode, key: i64, child: *mut u8) -> Step {
        match node.store(key, child, &self.root) {
            StoreOutcome::Inserted => Step::Done(None),
            StoreOutcome::MovedRight(sibling) => Step::Retry(sibling),
            StoreOutcome::GrewRoot => {
                self.inner_nodes.fetch_add(2, Ordering::Relaxed);
                self.inner_splits.fetch_add(1, Ordering::Relaxed);
                Step::Done(None)
            }
            StoreOutcome::Split(pending) => {
                self.inner_nodes.fetch_add(1, Ordering::Relaxed);
                self.inner_splits.fetch_add(1, Ordering::Relaxed);
                Step::Done(Some(pending))
            }
        }
    }

    /// Visit every bottom node reachable through the level-0 inner nodes.
    ///
    /// Each inner node's children are snapshotted under its lock, then
    /// visited with no inner lock held.
    ///
    /// A node that absorbed released neighbours may be routed to from
    /// several records in a row; it is visited once.
    pub fn for_each_bottom(&self, mut visit: impl FnMut(&BottomNode)) {
        let mut node: *mut InnerNode = self.level_head(0);
        let mut children: Vec<*mut u8> = Vec::new();
        let mut last: *mut u8 = StdPtr::null_mut();
        while !node.is_null() {
            // SAFETY: inner nodes live as long as the index.
            let inner: &InnerNode = unsafe { &*node };
            children.clear();
            inner.children(&mut children);
            for &child in &children {
                if child == last {
                    continue;
                }
                last = child;
                // SAFETY: level-0 children are bottom nodes owned by the index.
                visit(unsafe { &*child.cast::<BottomNode>() });
            }
            node = inner.sibling();
        }
    }

    /// Leftmost inner node at `level`.
    fn level_head(&self, level: u32) -> *mut InnerNode {
        let mut node: *mut InnerNode = self.root.load(READ_ORD);
        // SAFETY: leftmost children above level 0 are inner nodes.
        while unsafe { (*node).level() } > level {
            node = unsafe { (*node).leftmost() }.cast();
        }
        node
    }
}

impl Drop for InnerIndex {
    fn drop(&mut self) {
        let mut heads: Vec<*mut InnerNode> = Vec::new();
        let mut node: *mut InnerNode = *self.root.get_mut();
        while !node.is_null() {
            heads.push(node);
            // SAFETY: nothing has been freed yet.
            let inner: &InnerNode = unsafe { &*node };
            node = if inner.level() == 0 {
                StdPtr::null_mut()
            } else {
                inner.leftmost().cast()
            };
        }

        for head in heads {
            let mut node: *mut InnerNode = head;
            while !node.is_null() {
                // SAFETY: every inner node came from `InnerNode::boxed` or a
                // split and appears in exactly one level chain.
                let boxed = unsafe { Box::from_raw(node) };
                node = boxed.sibling();
            }
        }

        let mut bottom: *mut BottomNode = self.first_bottom;
        while !bottom.is_null() {
            // SAFETY: bottom nodes came from `BottomNode::boxed` and appear
            // once in the chain.
            let boxed = unsafe { Box::from_raw(bottom) };
            bottom = boxed.next();
        }

        for dead in self.retired.get_mut().drain(..) {
            // SAFETY: retired nodes were unlinked from the chain above.
            drop(unsafe { Box::from_raw(dead) });
        }
    }
}
