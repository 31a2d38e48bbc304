//! Point-in-time counters.

use std::fmt as StdFmt;

use crate::nodeversion::LockBackend;

/// A snapshot of a tree's sizes and counters.
///
/// Fields are read one by one with relaxed loads; under concurrent writes
/// they need not agree with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TreeStats {
    /// Leaves in use.
    pub leaves: usize,
    /// Bottom nodes, one per leaf.
    pub bottom_nodes: usize,
    /// Inner nodes across all levels.
    pub inner_nodes: usize,
    /// Inner levels.
    pub height: u32,
    /// Leaf splits since creation or recovery.
    pub leaf_splits: u64,
    /// Emptied leaves unlinked and returned to the pool.
    pub leaves_freed: u64,
    /// Inner node splits, root growth included.
    pub inner_splits: u64,
    /// Reads and writes served by a bottom-node cache.
    pub cache_hits: u64,
    /// Cache drains into leaves.
    pub cache_drains: u64,
    /// Bytes in current log generations.
    pub log_bytes: u64,
    /// Log chunks held by generations.
    pub log_chunks_in_use: usize,
    /// Log chunks on the free list.
    pub log_chunks_free: usize,
    /// Log entries known to be superseded.
    pub superseded_entries: u64,
    /// Completed recycle passes.
    pub recycles: u64,
    /// Current recycle epoch.
    pub epoch: u64,
    /// Resolved lock policy.
    pub lock_backend: LockBackend,
}

impl StdFmt::Display for TreeStats {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        write!(
            f,
            "leaves={} bottom={} inner={} height={} splits={}/{} freed={} cache_hits={} drains={} \
             log={}B chunks={}+{}free superseded={} recycles={} epoch={} backend={}",
            self.leaves,
            self.bottom_nodes,
            self.inner_nodes,
            self.height,
            self.leaf_splits,
            self.inner_splits,
            self.leaves_freed,
            self.cache_hits,
            self.cache_drains,
            self.log_bytes,
            self.log_chunks_in_use,
            self.log_chunks_free,
            self.superseded_entries,
            self.recycles,
            self.epoch,
            self.lock_backend.as_str(),
        )
    }
}
