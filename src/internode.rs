//! Inner node of the DRAM routing index.
//!
//! Inner nodes are FAST&FAIR pages: a sorted record array that writers
//! shift in place, one word at a time, in an order that lets readers scan
//! it without any lock. Readers never see a torn record; at worst they see
//! two neighbouring records with the same child pointer, which they skip.
//!
//! # Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ header                                                       │
//! │   version: NodeVersion       writer lock                     │
//! │   switch_counter: AtomicU32  even = forward, odd = backward  │
//! │   last_index: AtomicI32      index of the last record        │
//! │   level: u32                 0 = children are bottom nodes   │
//! │   min_key: i64               smallest key routed here        │
//! │   leftmost: AtomicPtr<u8>    child for keys < records[0]     │
//! │   sibling: AtomicPtr<Self>   right neighbour, same level     │
//! ├──────────────────────────────────────────────────────────────┤
//! │ records[30]: (key: AtomicI64, ptr: AtomicPtr<u8>)            │
//! │   live records end at the first null ptr                     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Routing
//!
//! ```text
//!   leftmost   records[0].ptr   records[1].ptr   ...
//!   k < K0     K0 <= k < K1     K1 <= k < K2
//! ```
//!
//! A split moves the upper half into a new right sibling and publishes it
//! before truncating this node, so a reader that lands on a node which no
//! longer owns its key finds it through `sibling` (`key >= sibling.min_key`).
//!
//! # Thread Safety
//!
//! - **Readers** run [`InnerNode::linear_search`] without locks and retry
//!   while `switch_counter` moves under them.
//! - **Writers** hold the node's [`NodeVersion`] lock. A writer never holds
//!   two inner-node locks at once, except a split's brand-new sibling, which
//!   no other writer can reach yet.

use std::fmt as StdFmt;
use std::ptr as StdPtr;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicPtr, AtomicU32};

use crate::nodeversion::NodeVersion;
use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};
use crate::tracing_helpers::debug_log;

/// Records per inner node, the null terminator included.
pub const INNER_CARDINALITY: usize = 30;

/// Most keys an inner node holds before it splits.
pub const INNER_MAX_KEYS: usize = INNER_CARDINALITY - 1;

#[inline]
const fn is_forward(switch_counter: u32) -> bool {
    switch_counter % 2 == 0
}

// ============================================================================
//  Records
// ============================================================================

#[derive(Debug)]
struct InnerRecord {
    key: AtomicI64,
    ptr: AtomicPtr<u8>,
}

impl InnerRecord {
    const fn empty() -> Self {
        Self {
            key: AtomicI64::new(i64::MAX),
            ptr: AtomicPtr::new(StdPtr::null_mut()),
        }
    }

    #[inline]
    fn key(&self) -> i64 {
        self.key.load(READ_ORD)
    }

    #[inline]
    fn ptr(&self) -> *mut u8 {
        self.ptr.load(READ_ORD)
    }
}

/// Where [`InnerNode::linear_search`] sends a lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    /// A child one level down: a bottom node at level 0, an inner node above.
    Child(*mut u8),
    /// The right sibling now owns the key; search it at the same level.
    Sibling(*mut InnerNode),
}

/// A separator that still has to reach the next level up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingSeparator {
    /// Level of the inner node that must receive it.
    pub level: u32,
    /// Smallest key routed to `child`.
    pub key: i64,
    /// The new right node.
    pub child: *mut u8,
}

/// Result of [`InnerNode::store`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreOutcome {
    /// The record was added in place.
    Inserted,
    /// The key belongs to the right sibling; store there instead.
    MovedRight(*mut InnerNode),
    /// The node split and a new root was installed above it.
    GrewRoot,
    /// The node split; the separator goes one level up.
    Split(PendingSeparator),
}

// ============================================================================
//  InnerNode
// ============================================================================

/// A FAST&FAIR routing page.
#[repr(C, align(64))]
pub struct InnerNode {
    version: NodeVersion,
    switch_counter: AtomicU32,
    last_index: AtomicI32,
    level: u32,
    min_key: i64,
    leftmost: AtomicPtr<u8>,
    sibling: AtomicPtr<InnerNode>,
    records: [InnerRecord; INNER_CARDINALITY],
}

impl StdFmt::Debug for InnerNode {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("InnerNode")
            .field("level", &self.level)
            .field("min_key", &self.min_key)
            .field("keys", &self.keys())
            .field("switch_counter", &self.switch_counter.load(RELAXED))
            .finish_non_exhaustive()
    }
}

impl InnerNode {
    /// An empty node routing everything to `leftmost`.
    #[must_use]
    pub fn new(level: u32, min_key: i64, leftmost: *mut u8) -> Self {
        Self {
            version: NodeVersion::new(),
            switch_counter: AtomicU32::new(0),
            last_index: AtomicI32::new(-1),
            level,
            min_key,
            leftmost: AtomicPtr::new(leftmost),
            sibling: AtomicPtr::new(StdPtr::null_mut()),
            records: std::array::from_fn(|_| InnerRecord::empty()),
        }
    }

    /// Allocate on the heap and leak; freed by the index on drop.
    #[must_use]
    pub fn boxed(level: u32, min_key: i64, leftmost: *mut u8) -> *mut Self {
        Box::into_raw(Box::new(Self::new(level, min_key, leftmost)))
    }

    /// Distance from the bottom-node level.
    #[inline]
    #[must_use]
    pub const fn level(&self) -> u32 {
        self.level
    }

    /// Smallest key this node was created to route.
    #[inline]
    #[must_use]
    pub const fn min_key(&self) -> i64 {
        self.min_key
    }

    /// Child for keys below the first separator.
    #[inline]
    #[must_use]
    pub fn leftmost(&self) -> *mut u8 {
        self.leftmost.load(READ_ORD)
    }

    /// Right neighbour, or null.
    #[inline]
    #[must_use]
    pub fn sibling(&self) -> *mut Self {
        self.sibling.load(READ_ORD)
    }

    /// Number of live records.
    ///
    /// Lock-free; retries while a writer flips the scan direction.
    #[must_use]
    #[expect(
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap,
        clippy::cast_possible_truncation,
        reason = "bounded by INNER_CARDINALITY"
    )]
    pub fn count(&self) -> usize {
        loop {
            let switch: u32 = self.switch_counter.load(READ_ORD);
            let mut count: i32 = self.last_index.load(READ_ORD) + 1;

            while (0..INNER_CARDINALITY as i32).contains(&count)
                && !self.records[count as usize].ptr().is_null()
            {
                if is_forward(switch) {
                    count += 1;
                } else {
                    count -= 1;
                }
            }

            if count < 0 {
                count = 0;
                while (count as usize) < INNER_CARDINALITY
                    && !self.records[count as usize].ptr().is_null()
                {
                    count += 1;
                }
            }

            if switch == self.switch_counter.load(READ_ORD) {
                return (count as usize).min(INNER_MAX_KEYS);
            }
        }
    }

    /// Separator keys in order. Meant for writers and quiescent inspection.
    #[must_use]
    pub fn keys(&self) -> Vec<i64> {
        (0..self.count()).map(|i| self.records[i].key()).collect()
    }

    /// Route `key` without taking the lock.
    #[must_use]
    pub fn linear_search(&self, key: i64) -> Route {
        let ret: *mut u8 = loop {
            let switch: u32 = self.switch_counter.load(READ_ORD);
            let found: *mut u8 = if is_forward(switch) {
                self.scan_forward(key)
            } else {
                self.scan_backward(key).unwrap_or(StdPtr::null_mut())
            };
            if switch == self.switch_counter.load(READ_ORD) {
                break found;
            }
        };

        let sibling: *mut Self = self.sibling();
        // SAFETY: siblings are never freed while the index is alive.
        if !sibling.is_null() && key >= unsafe { (*sibling).min_key } {
            return Route::Sibling(sibling);
        }

        if ret.is_null() {
            Route::Child(self.leftmost())
        } else {
            Route::Child(ret)
        }
    }

    /// Forward pass. A record whose pointer equals its left neighbour's is a
    /// shift in progress and is skipped.
    fn scan_forward(&self, key: i64) -> *mut u8 {
        if key < self.records[0].key() {
            let leftmost: *mut u8 = self.leftmost();
            if leftmost != self.records[0].ptr() {
                return leftmost;
            }
        }

        let mut i: usize = 1;
        while i < INNER_CARDINALITY && !self.records[i].ptr().is_null() {
            if key < self.records[i].key() {
                let left: *mut u8 = self.records[i - 1].ptr();
                if left != self.records[i].ptr() {
                    return left;
                }
            }
            i += 1;
        }
        self.records[i - 1].ptr()
    }

    /// Backward pass, used while a writer shifts records to the left.
    fn scan_backward(&self, key: i64) -> Option<*mut u8> {
        for i in (0..self.count()).rev() {
            if key >= self.records[i].key() {
                let here: *mut u8 = self.records[i].ptr();
                let left: *mut u8 = if i == 0 {
                    self.leftmost()
                } else {
                    self.records[i - 1].ptr()
                };
                if left != here {
                    return Some(here);
                }
            }
        }
        None
    }

    /// Every distinct child, leftmost first, read under the lock.
    ///
    /// Neighbouring records that share a child (after [`InnerNode::repoint`])
    /// are reported once.
    pub fn children(&self, out: &mut Vec<*mut u8>) {
        let _lock = self.version.lock();
        out.push(self.leftmost());
        for i in 0..self.count() {
            let ptr: *mut u8 = self.records[i].ptr();
            if out.last() != Some(&ptr) {
                out.push(ptr);
            }
        }
    }

    // ========================================================================
    //  Writers
    // ========================================================================

    /// Shift `(key, ptr)` into place. Caller holds the lock (or owns an
    /// unpublished node) and guarantees `num < INNER_MAX_KEYS`.
    ///
    /// Each record moves pointer first, then key, so a concurrent forward
    /// reader sees either the old record or a duplicate of its neighbour.
    #[expect(clippy::cast_possible_truncation, clippy::cast_possible_wrap, reason = "bounded by INNER_CARDINALITY")]
    fn insert_key(&self, key: i64, ptr: *mut u8, num: usize) {
        debug_assert!(num < INNER_MAX_KEYS);

        let switch: u32 = self.switch_counter.load(RELAXED);
        if !is_forward(switch) {
            self.switch_counter.store(switch + 1, WRITE_ORD);
        }

        if num == 0 {
            self.records[0].key.store(key, WRITE_ORD);
            self.records[0].ptr.store(ptr, WRITE_ORD);
            self.records[1].ptr.store(StdPtr::null_mut(), WRITE_ORD);
        } else {
            let recs: &[InnerRecord; INNER_CARDINALITY] = &self.records;
            recs[num + 1].ptr.store(recs[num].ptr(), WRITE_ORD);

            let mut inserted: bool = false;
            for i in (0..num).rev() {
                if key < recs[i].key() {
                    recs[i + 1].ptr.store(recs[i].ptr(), WRITE_ORD);
                    recs[i + 1].key.store(recs[i].key(), WRITE_ORD);
                } else {
                    recs[i + 1].ptr.store(recs[i].ptr(), WRITE_ORD);
                    recs[i + 1].key.store(key, WRITE_ORD);
                    recs[i + 1].ptr.store(ptr, WRITE_ORD);
                    inserted = true;
                    break;
                }
            }

            if !inserted {
                recs[0].ptr.store(self.leftmost(), WRITE_ORD);
                recs[0].key.store(key, WRITE_ORD);
                recs[0].ptr.store(ptr, WRITE_ORD);
            }
        }

        self.last_index.store(num as i32, WRITE_ORD);
    }

    /// Route everything that went to `from` to `to` instead. Returns how
    /// many pointers changed.
    ///
    /// `to` must already cover the key ranges `from` covered. A record may
    /// end up sharing its pointer with its left neighbour; readers treat
    /// such a pair like a shift in progress and still land on `to`.
    pub fn repoint(&self, from: *mut u8, to: *mut u8) -> usize {
        let _lock = self.version.lock();
        let mut changed: usize = 0;
        if self.leftmost() == from {
            self.leftmost.store(to, WRITE_ORD);
            changed += 1;
        }
        for record in &self.records[..self.count()] {
            if record.ptr() == from {
                record.ptr.store(to, WRITE_ORD);
                changed += 1;
            }
        }
        changed
    }

    /// Add the separator `(key, child)`, splitting if the node is full.
    ///
    /// If this node is the root when it splits, a new root is built and
    /// swapped into `root` before the lock is released; otherwise the
    /// separator for the new sibling is returned for the caller to store one
    /// level up once it holds no locks.
    #[expect(clippy::cast_possible_truncation, clippy::cast_possible_wrap, reason = "bounded by INNER_CARDINALITY")]
    pub fn store(&self, key: i64, child: *mut u8, root: &AtomicPtr<Self>) -> StoreOutcome {
        let _lock = self.version.lock();

        let sibling: *mut Self = self.sibling();
        // SAFETY: siblings are never freed while the index is alive.
        if !sibling.is_null() && key >= unsafe { (*sibling).min_key } {
            return StoreOutcome::MovedRight(sibling);
        }

        let num: usize = self.count();
        if num < INNER_MAX_KEYS {
            self.insert_key(key, child, num);
            return StoreOutcome::Inserted;
        }

        // Split: records[m] becomes the separator and the sibling's leftmost.
        let m: usize = num / 2;
        let split_key: i64 = self.records[m].key();
        let right = Box::new(Self::new(self.level, split_key, self.records[m].ptr()));
        for (j, i) in (m + 1..num).enumerate() {
            right.records[j].key.store(self.records[i].key(), RELAXED);
            right.records[j].ptr.store(self.records[i].ptr(), RELAXED);
        }
        let moved: usize = num - m - 1;
        right.last_index.store(moved as i32 - 1, RELAXED);
        right.sibling.store(self.sibling(), RELAXED);

        let right: *mut Self = Box::into_raw(right);
        self.sibling.store(right, WRITE_ORD);

        let switch: u32 = self.switch_counter.load(RELAXED);
        let bump: u32 = if is_forward(switch) { 2 } else { 1 };
        self.switch_counter.store(switch + bump, WRITE_ORD);

        self.records[m].ptr.store(StdPtr::null_mut(), WRITE_ORD);
        self.last_index.store(m as i32 - 1, WRITE_ORD);

        if key < split_key {
            self.insert_key(key, child, m);
        } else {
            // SAFETY: just allocated; only this writer can modify it.
            unsafe { (*right).insert_key(key, child, moved) };
        }

        let this: *mut Self = StdPtr::from_ref(self).cast_mut();
        if root.load(READ_ORD) == this {
            let new_root: *mut Self = Self::boxed(self.level + 1, self.min_key, this.cast());
            // SAFETY: just allocated and not yet published.
            unsafe { (*new_root).insert_key(split_key, right.cast(), 0) };
            root.store(new_root, WRITE_ORD);
            debug_log!(level = self.level + 1, "inner root grew");
            return StoreOutcome::GrewRoot;
        }

        StoreOutcome::Split(PendingSeparator {
            level: self.level + 1,
            key: split_key,
            child: right.cast(),
        })
    }
}
