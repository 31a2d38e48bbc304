//! Optimistic reads: point lookups and forward range scans.
//!
//! Readers never lock. Each node is read between two version checks and
//! re-read if a writer entered it meanwhile. A reader that lands on a node
//! split away from under it walks right along `next`; one that lands on a
//! released node moves to the node that absorbed it.

use std::sync::atomic::Ordering;

use crate::bottom::{BottomNode, CacheLookup, CachedEntry};

use super::TreeCore;

/// One consistent read of a bottom node and its leaf.
enum NodeView {
    Live {
        pairs: Vec<(i64, i64)>,
        high: Option<i64>,
        next: *mut BottomNode,
    },
    /// The node was released; its keys now live in this node.
    Released(*mut BottomNode),
}

impl TreeCore {
    pub(crate) fn search(&self, key: i64) -> Option<i64> {
        let mut node: &BottomNode = self.index.descend(key);
        loop {
            let version: u64 = node.version().stable();
            let owner: *mut BottomNode = node.merged_into();
            if !owner.is_null() {
                // SAFETY: released nodes and their owners live as long as the index.
                node = unsafe { &*owner };
                continue;
            }
            if node.is_right_of(key) {
                // SAFETY: a bounded node has a successor owned by the index.
                node = unsafe { &*node.next() };
                continue;
            }

            let (found, from_cache) = match node.lookup_cache(key) {
                CacheLookup::Value(value) => (Some(value), true),
                CacheLookup::Tombstone => (None, true),
                CacheLookup::Miss => (self.leaf(node.leaf()).get(key), false),
            };
            if !node.version().has_changed(version) {
                if from_cache {
                    self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                }
                return found;
            }
        }
    }

    /// Append up to `max_count` pairs with keys `>= min_key` to `out`.
    pub(crate) fn scan_into(&self, min_key: i64, max_count: usize, out: &mut Vec<(i64, i64)>) {
        if max_count == 0 {
            return;
        }
        let start: usize = out.len();
        let mut last: Option<i64> = None;
        let mut cached: Vec<CachedEntry> = Vec::new();
        let mut node: *const BottomNode = self.index.descend(min_key);

        while !node.is_null() {
            // SAFETY: bottom nodes live as long as the index.
            let bottom: &BottomNode = unsafe { &*node };
            let (pairs, high, next) = match self.read_node(bottom, &mut cached) {
                NodeView::Live { pairs, high, next } => (pairs, high, next),
                NodeView::Released(owner) => {
                    // Keys already emitted from the owner are skipped below.
                    node = owner;
                    continue;
                }
            };

            for (key, value) in pairs {
                if key < min_key || last.is_some_and(|l| key <= l) {
                    continue;
                }
                out.push((key, value));
                last = Some(key);
                if out.len() - start == max_count {
                    return;
                }
            }
            if high.is_none() {
                return;
            }
            node = next;
        }
    }

    /// Live pairs of one node below its high key, sorted, cache shadowing
    /// the leaf.
    fn read_node(&self, node: &BottomNode, cached: &mut Vec<CachedEntry>) -> NodeView {
        let leaf = self.leaf(node.leaf());
        let mut pairs: Vec<(i64, i64)> = Vec::new();
        loop {
            pairs.clear();
            cached.clear();
            let version: u64 = node.version().stable();
            let owner: *mut BottomNode = node.merged_into();
            if !owner.is_null() {
                return NodeView::Released(owner);
            }

            node.cached_entries(cached);
            leaf.collect_into(&mut pairs);
            let high: Option<i64> = node.high();
            let next: *mut BottomNode = node.next();

            if node.version().has_changed(version) {
                continue;
            }

            for entry in cached.iter() {
                pairs.retain(|&(k, _)| k != entry.key);
                if !entry.tombstone {
                    pairs.push((entry.key, entry.value));
                }
            }
            if let Some(high) = high {
                pairs.retain(|&(k, _)| k < high);
            }
            pairs.sort_unstable_by_key(|&(k, _)| k);
            return NodeView::Live { pairs, high, next };
        }
    }
}
