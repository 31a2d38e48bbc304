//! `CclBTree`: a buffered-leaf persistent B+-tree.
//!
//! ```text
//!   CclBTree ──► TreeCore ─┬─ InnerIndex   (DRAM: inner nodes + bottom nodes)
//!       │                  ├─ LeafPool     (persistent leaves)
//!       │                  ├─ LogPool      (persistent log, clock, epoch)
//!       │                  └─ counters
//!       └──► Recycler (background thread, holds an Arc<TreeCore>)
//! ```
//!
//! Writes go through a [`Session`] or through one of the tree's shared logs,
//! picked per calling thread. Reads never log and need no session.

use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::bottom::{BottomGuard, BottomNode};
use crate::config::TreeConfig;
use crate::error::TreeError;
use crate::index::InnerIndex;
use crate::leaf::{LeafId, LeafNode};
use crate::log::{LogChunk, LogConfig, LogPool, ThreadLog};
use crate::nodeversion::LockBackend;
use crate::pool::LeafPool;
use crate::recycler::{RecycleReport, Recycler};
use crate::stats::TreeStats;
use crate::tracing_helpers::{debug_log, info_log, warn_log};

mod insert;
mod recovery;
mod scan;

pub(crate) use insert::WriteOp;

// ============================================================================
//  Thread → shared log assignment
// ============================================================================

static NEXT_THREAD: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static THREAD_SLOT: Cell<Option<usize>> = const { Cell::new(None) };
}

/// A small per-thread number, assigned on first use.
fn thread_slot() -> usize {
    THREAD_SLOT.with(|slot| {
        slot.get().unwrap_or_else(|| {
            let id: usize = NEXT_THREAD.fetch_add(1, Ordering::Relaxed);
            slot.set(Some(id));
            id
        })
    })
}

// ============================================================================
//  Counters
// ============================================================================

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) leaf_splits: AtomicU64,
    pub(crate) leaves_freed: AtomicU64,
    pub(crate) cache_hits: AtomicU64,
    pub(crate) cache_drains: AtomicU64,
    pub(crate) recycles: AtomicU64,
}

// ============================================================================
//  TreeCore
// ============================================================================

/// State shared between the handle and the recycler thread.
#[derive(Debug)]
pub(crate) struct TreeCore {
    pub(crate) config: TreeConfig,
    pub(crate) backend: LockBackend,
    pub(crate) leaves: Arc<LeafPool>,
    pub(crate) index: InnerIndex,
    pub(crate) logs: LogPool,
    shared_logs: Box<[Arc<ThreadLog>]>,
    pub(crate) recycle_log: Arc<ThreadLog>,
    pub(crate) len: AtomicUsize,
    pub(crate) counters: Counters,
    /// Serializes recycle passes.
    pub(crate) pass_lock: Mutex<()>,
    /// A pass switched generations but has not yet retired the old ones.
    pub(crate) pending_retire: AtomicBool,
}

impl TreeCore {
    /// Shared state over an existing leaf pool and the index built on it.
    fn new(config: TreeConfig, leaves: Arc<LeafPool>, index: InnerIndex, len: usize) -> Self {
        let backend: LockBackend = config.lock_backend.resolve();
        let logs = LogPool::new(LogConfig::from(&config));
        let shared_logs: Box<[Arc<ThreadLog>]> = (0..config.threads).map(|_| logs.register()).collect();
        let recycle_log: Arc<ThreadLog> = logs.register();
        Self {
            config,
            backend,
            leaves,
            index,
            logs,
            shared_logs,
            recycle_log,
            len: AtomicUsize::new(len),
            counters: Counters::default(),
            pass_lock: Mutex::new(()),
            pending_retire: AtomicBool::new(false),
        }
    }

    /// The shared log for the calling thread.
    fn shared_log(&self) -> &ThreadLog {
        &self.shared_logs[thread_slot() % self.shared_logs.len()]
    }

    #[inline]
    pub(crate) fn leaf(&self, id: LeafId) -> &LeafNode {
        self.leaves.get(id)
    }

    /// Lock the bottom node owning `key`, walking right past splits and
    /// left past released nodes.
    pub(crate) fn lock_bottom(&self, key: i64) -> BottomGuard<'_> {
        let mut node: &BottomNode = self.index.descend(key);
        loop {
            let guard: BottomGuard<'_> = node.lock();
            let owner: *mut BottomNode = node.merged_into();
            if !owner.is_null() {
                drop(guard);
                // SAFETY: released nodes and their owners live as long as the index.
                node = unsafe { &*owner };
                continue;
            }
            debug_assert!(key >= node.low(), "index routed {key} below {}", node.low());
            if !node.is_right_of(key) {
                return guard;
            }
            let next: *mut BottomNode = node.next();
            drop(guard);
            // SAFETY: a bounded node always has a successor, owned by the index.
            node = unsafe { &*next };
        }
    }

    /// Drain every cached write into the leaves.
    pub(crate) fn checkpoint(&self) -> Result<usize, TreeError> {
        let mut drained: usize = 0;
        let mut node: *const BottomNode = self.index.first_bottom();
        while !node.is_null() {
            // SAFETY: bottom nodes live as long as the index.
            let bottom: &BottomNode = unsafe { &*node };
            let guard: BottomGuard<'_> = bottom.lock();
            if guard.node().meta().count > 0 {
                self.drain_node(guard)?;
                drained += 1;
            } else {
                drop(guard);
            }
            node = bottom.next();
        }
        debug_log!(drained, "checkpoint complete");
        Ok(drained)
    }
}

impl From<&TreeConfig> for LogConfig {
    fn from(config: &TreeConfig) -> Self {
        Self {
            chunk_entries: config.chunk_entries,
            log_file_chunks: config.log_file_chunks,
            max_log_chunks: config.max_log_chunks,
            check_interval: config.recycle_check_interval,
            log_to_leaf_ratio: config.log_to_leaf_ratio,
            garbage_ratio: config.garbage_ratio,
        }
    }
}

// ============================================================================
//  Session
// ============================================================================

/// A registered per-thread log context.
///
/// Writes made through a session go to its own log instead of a shared
/// one. Dropping the session keeps its log until the next recycle pass has
/// retired everything in it.
#[derive(Debug, Clone)]
pub struct Session {
    log: Arc<ThreadLog>,
    owner: usize,
}

// ============================================================================
//  PersistentImage
// ============================================================================

/// What survives a shutdown or a crash: the leaves and the log.
#[derive(Debug)]
pub struct PersistentImage {
    leaves: Arc<LeafPool>,
    log_chunks: Vec<LogChunk>,
}

impl PersistentImage {
    /// The leaf arena.
    #[must_use]
    pub fn leaves(&self) -> &LeafPool {
        &self.leaves
    }

    /// Every log chunk that was held by a log generation.
    #[must_use]
    pub fn log_chunks(&self) -> &[LogChunk] {
        &self.log_chunks
    }

    /// Intact log entries across all chunks.
    #[must_use]
    pub fn log_entries(&self) -> usize {
        self.log_chunks.iter().map(|c| c.live_entries().count()).sum()
    }
}

// ============================================================================
//  CclBTree
// ============================================================================

/// A concurrent ordered `i64 → i64` map over persistent leaves.
///
/// # Example
///
/// ```rust
/// use ccl_btree::{CclBTree, TreeConfig};
///
/// let tree = CclBTree::new(TreeConfig::default().with_background_recycler(false)).unwrap();
/// assert!(tree.insert(7, 70, false).unwrap());
/// assert!(!tree.insert(7, 71, false).unwrap());
/// assert_eq!(tree.search(7), Some(70));
/// assert!(tree.remove(7).unwrap());
/// assert_eq!(tree.search(7), None);
/// ```
#[derive(Debug)]
pub struct CclBTree {
    core: Arc<TreeCore>,
    recycler: Option<Recycler>,
}

impl CclBTree {
    /// An empty tree.
    ///
    /// # Errors
    /// [`TreeError::InvalidConfig`] if `config` does not validate.
    pub fn new(config: TreeConfig) -> Result<Self, TreeError> {
        config.validate()?;
        let leaves = Arc::new(LeafPool::new(config.leaf_capacity)?);
        let index = InnerIndex::new(BottomNode::boxed(LeafId::FIRST, i64::MIN, None));
        let core = TreeCore::new(config, leaves, index, 0);
        info_log!(
            threads = core.config.threads,
            leaf_capacity = core.config.leaf_capacity,
            backend = core.backend.as_str(),
            "tree created"
        );
        Ok(Self::start(core))
    }

    /// An empty tree with `threads` shared logs and default settings.
    ///
    /// # Errors
    /// [`TreeError::InvalidConfig`] if `threads` is zero.
    pub fn with_threads(threads: usize) -> Result<Self, TreeError> {
        Self::new(TreeConfig::default().with_threads(threads))
    }

    /// Rebuild a tree from what a shutdown or crash left behind.
    ///
    /// # Errors
    /// [`TreeError::InvalidConfig`] for a bad `config`,
    /// [`TreeError::CorruptImage`] if the leaf chain is unusable, and the
    /// capacity errors of the write path while replaying the log.
    pub fn recover(image: PersistentImage, config: TreeConfig) -> Result<Self, TreeError> {
        recovery::recover(image, config)
    }

    fn start(core: TreeCore) -> Self {
        let core = Arc::new(core);
        let recycler: Option<Recycler> = if core.config.background_recycler {
            Recycler::start(Arc::clone(&core))
        } else {
            None
        };
        Self { core, recycler }
    }

    // ========================================================================
    //  Sessions
    // ========================================================================

    /// Register a log context for the calling thread.
    #[must_use]
    pub fn session(&self) -> Session {
        Session {
            log: self.core.logs.register(),
            owner: Arc::as_ptr(&self.core).addr(),
        }
    }

    fn session_log<'a>(&self, session: &'a Session) -> &'a ThreadLog {
        debug_assert_eq!(
            session.owner,
            Arc::as_ptr(&self.core).addr(),
            "session belongs to another tree"
        );
        &session.log
    }

    // ========================================================================
    //  Key-value API
    // ========================================================================

    /// Insert `key → value`. If the key exists, overwrite it only when
    /// `update` is set.
    ///
    /// Returns whether the pair was written.
    ///
    /// # Errors
    /// [`TreeError::PoolExhausted`] or [`TreeError::LogExhausted`]; the tree
    /// is unchanged.
    pub fn insert(&self, key: i64, value: i64, update: bool) -> Result<bool, TreeError> {
        self.core.write(self.core.shared_log(), key, WriteOp::Put { value, update })
    }

    /// [`CclBTree::insert`] through `session`'s log.
    ///
    /// # Errors
    /// As [`CclBTree::insert`].
    pub fn insert_with_session(
        &self,
        session: &Session,
        key: i64,
        value: i64,
        update: bool,
    ) -> Result<bool, TreeError> {
        self.core.write(self.session_log(session), key, WriteOp::Put { value, update })
    }

    /// Remove `key`. Returns whether a live key was removed.
    ///
    /// # Errors
    /// As [`CclBTree::insert`].
    pub fn remove(&self, key: i64) -> Result<bool, TreeError> {
        self.core.write(self.core.shared_log(), key, WriteOp::Delete)
    }

    /// [`CclBTree::remove`] through `session`'s log.
    ///
    /// # Errors
    /// As [`CclBTree::insert`].
    pub fn remove_with_session(&self, session: &Session, key: i64) -> Result<bool, TreeError> {
        self.core.write(self.session_log(session), key, WriteOp::Delete)
    }

    /// The value stored under `key`.
    #[must_use]
    pub fn search(&self, key: i64) -> Option<i64> {
        self.core.search(key)
    }

    /// Values of the first `max_count` keys `>= min_key`, in key order.
    #[must_use]
    pub fn scan(&self, min_key: i64, max_count: usize) -> Vec<i64> {
        let mut out: Vec<(i64, i64)> = Vec::new();
        self.core.scan_into(min_key, max_count, &mut out);
        out.into_iter().map(|(_, v)| v).collect()
    }

    /// Like [`CclBTree::scan`], returning `(key, value)` pairs.
    #[must_use]
    pub fn scan_pairs(&self, min_key: i64, max_count: usize) -> Vec<(i64, i64)> {
        let mut out: Vec<(i64, i64)> = Vec::new();
        self.core.scan_into(min_key, max_count, &mut out);
        out
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.core.len.load(Ordering::Relaxed)
    }

    /// Whether the tree holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inner levels above the bottom nodes.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.core.index.height()
    }

    /// Leaves in use.
    #[must_use]
    pub fn leaf_count(&self) -> usize {
        self.core.leaves.allocated()
    }

    // ========================================================================
    //  Maintenance
    // ========================================================================

    /// Raise the recycle flag and wake the recycler. Returns whether the
    /// flag was newly raised.
    pub fn request_recycle(&self) -> bool {
        self.core.logs.request_recycle()
    }

    /// Run one recycle pass on the calling thread.
    ///
    /// # Errors
    /// [`TreeError::LogExhausted`] if re-logging a cached write found no
    /// chunk. The pass resumes where it stopped next time.
    pub fn recycle_now(&self) -> Result<RecycleReport, TreeError> {
        crate::recycler::recycle_pass(&self.core)
    }

    /// Drain every bottom-node cache into its leaf.
    ///
    /// # Errors
    /// [`TreeError::PoolExhausted`] if a drain needed to split a leaf and
    /// none was free; earlier nodes stay drained.
    pub fn checkpoint(&self) -> Result<(), TreeError> {
        self.core.checkpoint().map(|_| ())
    }

    /// Counters and sizes.
    #[must_use]
    pub fn stats(&self) -> TreeStats {
        let core: &TreeCore = &self.core;
        TreeStats {
            leaves: core.leaves.allocated(),
            bottom_nodes: core.index.bottom_nodes(),
            inner_nodes: core.index.inner_nodes(),
            height: core.index.height(),
            leaf_splits: core.counters.leaf_splits.load(Ordering::Relaxed),
            leaves_freed: core.counters.leaves_freed.load(Ordering::Relaxed),
            inner_splits: core.index.inner_splits(),
            cache_hits: core.counters.cache_hits.load(Ordering::Relaxed),
            cache_drains: core.counters.cache_drains.load(Ordering::Relaxed),
            log_bytes: core.logs.log_bytes(),
            log_chunks_in_use: core.logs.chunks_in_use(),
            log_chunks_free: core.logs.chunks_free(),
            superseded_entries: core.logs.superseded_entries(),
            recycles: core.counters.recycles.load(Ordering::Relaxed),
            epoch: core.logs.epoch(),
            lock_backend: core.backend,
        }
    }

    /// The resolved mutual-exclusion policy.
    #[must_use]
    pub fn lock_backend(&self) -> LockBackend {
        self.core.backend
    }

    // ========================================================================
    //  Lifecycle
    // ========================================================================

    fn stop_recycler(&mut self) {
        if let Some(recycler) = self.recycler.take() {
            recycler.shutdown();
        }
    }

    /// Stop the recycler, drain every cache, retire the log and hand back
    /// the durable state.
    ///
    /// If a drain cannot allocate a leaf, the log is kept instead, and
    /// [`CclBTree::recover`] replays what the leaves miss.
    #[must_use]
    pub fn shutdown(mut self) -> PersistentImage {
        self.stop_recycler();
        if self.core.checkpoint().is_ok() {
            self.core.logs.retire_all();
        } else {
            warn_log!("a drain could not allocate a leaf; shutdown kept the log");
        }
        let image = self.image();
        info_log!(
            leaves = image.leaves.allocated(),
            log_entries = image.log_entries(),
            "tree shut down"
        );
        image
    }

    /// Simulate power loss: stop the recycler and keep only what is
    /// durable. Bottom-node caches are lost; the log covers them.
    #[must_use]
    pub fn crash(mut self) -> PersistentImage {
        self.stop_recycler();
        self.image()
    }

    fn image(&self) -> PersistentImage {
        PersistentImage {
            leaves: Arc::clone(&self.core.leaves),
            log_chunks: self.core.logs.take_all_chunks(),
        }
    }
}

impl Drop for CclBTree {
    fn drop(&mut self) {
        self.stop_recycler();
    }
}
