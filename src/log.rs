//! Write log for buffered entries.
//!
//! Every mutation is appended here before it touches a bottom-node cache or
//! a leaf, which is what makes cached writes survive a crash. Each
//! [`ThreadLog`] owns two generations of chunk lists; one receives appends
//! while the recycler drains the other.
//!
//! ```text
//! LogPool ── free list ──► [chunk][chunk][chunk]          (log files)
//!    │
//!    ├── clock  (one logical clock for entries and leaf timestamps)
//!    ├── epoch  (flipped once per recycle pass)
//!    └── registry ─► ThreadLog ─► group { alt, gen[0], gen[1] }
//! ```
//!
//! # Entry format
//!
//! A [`LogEntry`] is `(key, value, stamp)`, 24 bytes. The stamp word packs
//! `tombstone:1 | check:7 | clock:56`. Entries in a chunk carry strictly
//! increasing clocks, so recovery reads a chunk up to the first entry whose
//! clock does not increase or whose check bits do not match.
//!
//! # Lock order
//!
//! bottom node → log group. The registry lock is taken before group locks,
//! and only by the recycler and accounting.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::TreeError;
use crate::persist;
use crate::tracing_helpers::{debug_log, error_log, info_log};

/// Size of one log entry in bytes.
pub const ENTRY_SIZE: usize = 24;

/// Nominal chunk size in bytes.
pub const CHUNK_BYTES: usize = 4 << 20;

/// Entries per 4 MiB chunk.
pub const DEFAULT_CHUNK_ENTRIES: usize = CHUNK_BYTES / ENTRY_SIZE;

const CLOCK_BITS: u32 = 56;
const CLOCK_MASK: u64 = (1 << CLOCK_BITS) - 1;
const CHECK_MASK: u64 = 0x7f;
const TOMBSTONE_BIT: u64 = 1 << 63;

// ============================================================================
//  LogEntry
// ============================================================================

/// One durable log record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct LogEntry {
    key: i64,
    value: i64,
    stamp: u64,
}

const _: () = assert!(size_of::<LogEntry>() == ENTRY_SIZE);

impl LogEntry {
    /// All-zero entry. Never intact: clock zero is never issued.
    pub const EMPTY: Self = Self {
        key: 0,
        value: 0,
        stamp: 0,
    };

    /// Build a record for `key` at logical time `clock`.
    #[must_use]
    pub const fn new(key: i64, value: i64, clock: u64, tombstone: bool) -> Self {
        let clock: u64 = clock & CLOCK_MASK;
        let mut stamp: u64 = clock | (check_bits(key, value, clock) << CLOCK_BITS);
        if tombstone {
            stamp |= TOMBSTONE_BIT;
        }
        Self { key, value, stamp }
    }

    /// Key.
    #[inline]
    #[must_use]
    pub const fn key(&self) -> i64 {
        self.key
    }

    /// Value (meaningless for tombstones).
    #[inline]
    #[must_use]
    pub const fn value(&self) -> i64 {
        self.value
    }

    /// Logical time of the write.
    #[inline]
    #[must_use]
    pub const fn clock(&self) -> u64 {
        self.stamp & CLOCK_MASK
    }

    /// Whether the record is a deletion.
    #[inline]
    #[must_use]
    pub const fn is_tombstone(&self) -> bool {
        self.stamp & TOMBSTONE_BIT != 0
    }

    /// Whether the record was written completely.
    #[must_use]
    pub const fn is_intact(&self) -> bool {
        let clock: u64 = self.clock();
        clock != 0 && (self.stamp >> CLOCK_BITS) & CHECK_MASK == check_bits(self.key, self.value, clock)
    }
}

/// Seven bits mixed from every field of an entry.
#[expect(clippy::cast_sign_loss, reason = "hashing bit patterns")]
const fn check_bits(key: i64, value: i64, clock: u64) -> u64 {
    let mut x: u64 = (key as u64) ^ (value as u64).rotate_left(21) ^ clock.rotate_left(42);
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
    x ^= x >> 29;
    x & CHECK_MASK
}

// ============================================================================
//  LogChunk
// ============================================================================

/// Fixed-capacity append-only run of entries.
///
/// A generation's chunks form its list in append order; the list itself
/// plays the part of the on-media `next` links.
#[derive(Debug)]
pub struct LogChunk {
    entries: Box<[LogEntry]>,
}

impl LogChunk {
    fn new(capacity: usize) -> Self {
        Self {
            entries: vec![LogEntry::EMPTY; capacity].into_boxed_slice(),
        }
    }

    /// Entries the chunk can hold.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Invalidate the previous contents before reuse.
    ///
    /// Later stale entries are rejected because their clocks are older than
    /// whatever gets written in front of them.
    fn reset(&mut self) {
        if let Some(first) = self.entries.first_mut() {
            *first = LogEntry::EMPTY;
            persist::flush_value(first);
        }
    }

    fn write(&mut self, index: usize, entry: LogEntry) {
        let slot: &mut LogEntry = &mut self.entries[index];
        *slot = entry;
        persist::flush_value(slot);
    }

    /// The durable prefix: intact entries with strictly increasing clocks.
    pub fn live_entries(&self) -> impl Iterator<Item = &LogEntry> + '_ {
        let mut last: u64 = 0;
        self.entries.iter().take_while(move |e| {
            let ok: bool = e.is_intact() && e.clock() > last;
            last = e.clock();
            ok
        })
    }
}

// ============================================================================
//  ThreadLog
// ============================================================================

#[derive(Debug, Default)]
struct Generation {
    chunks: Vec<LogChunk>,
    /// Entries used in the last chunk.
    tail_len: usize,
}

impl Generation {
    fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

#[derive(Debug, Default)]
struct LogGroup {
    alt: usize,
    generations: [Generation; 2],
}

/// What an append reports back to the writer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Appended {
    /// Epoch bit the entry was logged under; the cached slot takes this tag.
    pub epoch: u8,
    /// Logical time stamped on the entry.
    pub clock: u64,
    /// The per-log append counter hit the check interval.
    pub check_due: bool,
}

/// Per-thread log context with two generations.
///
/// Shared logs and session logs are the same type; the group mutex lets
/// several threads use one log.
#[derive(Debug, Default)]
pub struct ThreadLog {
    group: Mutex<LogGroup>,
    /// Entries in the current generation.
    entries: AtomicU64,
    /// Entries of the current generation already reflected in leaves.
    superseded: AtomicU64,
    appends: AtomicU64,
}

impl ThreadLog {
    /// Append one entry and persist it.
    ///
    /// # Errors
    /// [`TreeError::LogExhausted`] if a new chunk was needed and none could
    /// be created. Nothing was written.
    pub fn append(
        &self,
        pool: &LogPool,
        key: i64,
        value: i64,
        tombstone: bool,
    ) -> Result<Appended, TreeError> {
        let mut group = self.group.lock();
        let alt: usize = group.alt;
        let generation: &mut Generation = &mut group.generations[alt];

        let tail_full: bool = generation
            .chunks
            .last()
            .is_none_or(|c| generation.tail_len == c.capacity());
        if tail_full {
            let chunk: LogChunk = pool.take_chunk()?;
            generation.chunks.push(chunk);
            generation.tail_len = 0;
        }

        // Epoch and clock are read under the group lock; the recycler flips
        // the epoch while holding every group lock.
        let epoch: u8 = pool.epoch_bit();
        let clock: u64 = pool.tick();
        let index: usize = generation.tail_len;
        if let Some(chunk) = generation.chunks.last_mut() {
            chunk.write(index, LogEntry::new(key, value, clock, tombstone));
        }
        generation.tail_len += 1;
        drop(group);

        self.entries.fetch_add(1, Ordering::Relaxed);
        let appends: u64 = self.appends.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(Appended {
            epoch,
            clock,
            check_due: appends % pool.config.check_interval == 0,
        })
    }

    /// Record that `n` logged entries now live in a leaf.
    pub fn note_superseded(&self, n: u64) {
        self.superseded.fetch_add(n, Ordering::Relaxed);
    }

    /// Bytes logged in the current generation.
    #[must_use]
    pub fn log_bytes(&self) -> u64 {
        self.entries.load(Ordering::Relaxed) * ENTRY_SIZE as u64
    }

    /// Bytes of the current generation already superseded.
    #[must_use]
    pub fn garbage_bytes(&self) -> u64 {
        self.superseded.load(Ordering::Relaxed) * ENTRY_SIZE as u64
    }

    /// Start appending to the other generation. Caller holds the group.
    fn switch(group: &mut LogGroup) {
        let next: usize = 1 - group.alt;
        debug_assert!(group.generations[next].is_empty(), "switching onto an unretired generation");
        group.generations[next] = Generation::default();
        group.alt = next;
    }

    /// Chunks of the generation not currently appended to.
    fn take_previous(&self) -> Vec<LogChunk> {
        let mut group = self.group.lock();
        let prev: usize = 1 - group.alt;
        std::mem::take(&mut group.generations[prev]).chunks
    }

    fn is_idle(&self) -> bool {
        let group = self.group.lock();
        group.generations.iter().all(Generation::is_empty)
    }
}

// ============================================================================
//  LogPool
// ============================================================================

/// Log sizing and trigger policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogConfig {
    /// Entries per chunk.
    pub chunk_entries: usize,
    /// Chunks created together when the free list is empty.
    pub log_file_chunks: usize,
    /// Upper bound on chunks in existence.
    pub max_log_chunks: usize,
    /// Appends between two trigger checks.
    pub check_interval: u64,
    /// Log bytes must exceed this fraction of leaf bytes.
    pub log_to_leaf_ratio: f64,
    /// Superseded bytes must exceed this fraction of log bytes.
    pub garbage_ratio: f64,
}

/// Shared log state: chunk free list, clock, epoch and the log registry.
#[derive(Debug)]
pub struct LogPool {
    config: LogConfig,
    free: Mutex<Vec<LogChunk>>,
    chunks_created: AtomicUsize,
    log_files: AtomicUsize,
    clock: AtomicU64,
    epoch: AtomicU64,
    recycle_requested: AtomicBool,
    registry: Mutex<Vec<Arc<ThreadLog>>>,
    waker: Mutex<Option<std::thread::Thread>>,
}

impl LogPool {
    /// Empty pool; no chunk exists until the first append.
    #[must_use]
    pub fn new(config: LogConfig) -> Self {
        Self {
            config,
            free: Mutex::new(Vec::new()),
            chunks_created: AtomicUsize::new(0),
            log_files: AtomicUsize::new(0),
            clock: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            recycle_requested: AtomicBool::new(false),
            registry: Mutex::new(Vec::new()),
            waker: Mutex::new(None),
        }
    }

    /// Sizing and policy.
    #[must_use]
    pub const fn config(&self) -> &LogConfig {
        &self.config
    }

    // ========================================================================
    //  Clock / epoch
    // ========================================================================

    /// Advance the logical clock and return the new time.
    #[inline]
    pub fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Current logical time.
    #[must_use]
    pub fn now(&self) -> u64 {
        self.clock.load(Ordering::Acquire)
    }

    /// Move the clock to at least `clock`.
    pub fn advance_clock(&self, clock: u64) {
        self.clock.fetch_max(clock, Ordering::AcqRel);
    }

    /// Number of epoch flips so far.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Current epoch bit, used to tag cached slots.
    #[inline]
    #[must_use]
    #[expect(clippy::cast_possible_truncation, reason = "one bit")]
    pub fn epoch_bit(&self) -> u8 {
        (self.epoch.load(Ordering::Acquire) & 1) as u8
    }

    // ========================================================================
    //  Registry
    // ========================================================================

    /// Create and register a new log.
    pub fn register(&self) -> Arc<ThreadLog> {
        let log: Arc<ThreadLog> = Arc::new(ThreadLog::default());
        self.registry.lock().push(Arc::clone(&log));
        log
    }

    /// Number of registered logs.
    #[cfg(test)]
    pub(crate) fn registered(&self) -> usize {
        self.registry.lock().len()
    }

    // ========================================================================
    //  Chunks
    // ========================================================================

    fn take_chunk(&self) -> Result<LogChunk, TreeError> {
        let mut free = self.free.lock();
        if free.is_empty() {
            self.create_log_file(&mut free)?;
        }
        let mut chunk: LogChunk = free.pop().ok_or(TreeError::LogExhausted {
            limit: self.config.max_log_chunks,
        })?;
        drop(free);
        chunk.reset();
        Ok(chunk)
    }

    /// Reserve the next batch of chunks. Caller holds the free list.
    fn create_log_file(&self, free: &mut Vec<LogChunk>) -> Result<(), TreeError> {
        let created: usize = self.chunks_created.load(Ordering::Relaxed);
        let room: usize = self.config.max_log_chunks.saturating_sub(created);
        let count: usize = self.config.log_file_chunks.min(room);
        if count == 0 {
            error_log!(limit = self.config.max_log_chunks, "log exhausted");
            return Err(TreeError::LogExhausted {
                limit: self.config.max_log_chunks,
            });
        }

        free.extend((0..count).map(|_| LogChunk::new(self.config.chunk_entries)));
        self.chunks_created.fetch_add(count, Ordering::Relaxed);
        self.log_files.fetch_add(1, Ordering::Relaxed);
        debug_log!(
            file = self.log_files.load(Ordering::Relaxed),
            chunks = count,
            "log file created"
        );
        Ok(())
    }

    /// Hand chunks back to the free list.
    pub fn release(&self, chunks: Vec<LogChunk>) -> usize {
        let n: usize = chunks.len();
        if n > 0 {
            self.free.lock().extend(chunks);
        }
        n
    }

    /// Adopt chunks that came from a persistent image.
    ///
    /// Chunks of a different size, and any beyond `max_log_chunks`, are
    /// dropped. Returns how many were kept.
    pub(crate) fn adopt(&self, chunks: Vec<LogChunk>) -> usize {
        let offered: usize = chunks.len();
        let mut free = self.free.lock();
        let created: usize = self.chunks_created.load(Ordering::Relaxed);
        let room: usize = self.config.max_log_chunks.saturating_sub(created);
        let before: usize = free.len();
        free.extend(
            chunks
                .into_iter()
                .filter(|c| c.capacity() == self.config.chunk_entries)
                .take(room),
        );
        let kept: usize = free.len() - before;
        self.chunks_created.fetch_add(kept, Ordering::Relaxed);
        if kept < offered {
            debug_log!(offered, kept, "dropped surplus image log chunks");
        }
        kept
    }

    /// Chunks ever created.
    #[must_use]
    pub fn chunks_created(&self) -> usize {
        self.chunks_created.load(Ordering::Relaxed)
    }

    /// Chunks on the free list.
    #[must_use]
    pub fn chunks_free(&self) -> usize {
        self.free.lock().len()
    }

    /// Chunks held by generations.
    #[must_use]
    pub fn chunks_in_use(&self) -> usize {
        self.chunks_created().saturating_sub(self.chunks_free())
    }

    // ========================================================================
    //  Accounting / trigger
    // ========================================================================

    /// Bytes logged in current generations across all logs.
    #[must_use]
    pub fn log_bytes(&self) -> u64 {
        self.registry.lock().iter().map(|l| l.log_bytes()).sum()
    }

    /// Superseded entries in current generations across all logs.
    #[must_use]
    pub fn superseded_entries(&self) -> u64 {
        self.registry.lock().iter().map(|l| l.garbage_bytes()).sum::<u64>() / ENTRY_SIZE as u64
    }

    /// The recycle condition against the current leaf footprint.
    #[must_use]
    #[expect(clippy::cast_precision_loss, reason = "ratio comparison")]
    pub fn should_recycle(&self, leaf_bytes: u64) -> bool {
        let (log, garbage) = self
            .registry
            .lock()
            .iter()
            .fold((0u64, 0u64), |(l, g), t| (l + t.log_bytes(), g + t.garbage_bytes()));
        (log as f64) > (leaf_bytes as f64) * self.config.log_to_leaf_ratio
            && (garbage as f64) > (log as f64) * self.config.garbage_ratio
    }

    /// Raise the recycle flag and wake the recycler. Idempotent.
    pub fn request_recycle(&self) -> bool {
        let won: bool = self
            .recycle_requested
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            debug_log!("recycle requested");
            if let Some(thread) = self.waker.lock().as_ref() {
                thread.unpark();
            }
        }
        won
    }

    /// Whether a recycle was requested and not yet served.
    #[must_use]
    pub fn recycle_requested(&self) -> bool {
        self.recycle_requested.load(Ordering::Acquire)
    }

    pub(crate) fn clear_recycle_request(&self) {
        self.recycle_requested.store(false, Ordering::Release);
    }

    pub(crate) fn set_waker(&self, thread: Option<std::thread::Thread>) {
        *self.waker.lock() = thread;
    }

    // ========================================================================
    //  Recycle steps
    // ========================================================================

    /// Steps 1 and 2: every log switches generation, then the epoch flips.
    ///
    /// All group locks are held together, so every append is either in an
    /// old generation under the old epoch or in a new one under the new.
    pub(crate) fn switch_generations(&self) -> u64 {
        let registry = self.registry.lock();
        let mut groups: Vec<_> = registry.iter().map(|l| l.group.lock()).collect();
        for group in &mut groups {
            ThreadLog::switch(group);
        }
        for log in registry.iter() {
            log.entries.store(0, Ordering::Relaxed);
            log.superseded.store(0, Ordering::Relaxed);
        }
        let epoch: u64 = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        drop(groups);
        epoch
    }

    /// Step 4: return every previous generation to the free list.
    ///
    /// Logs nobody else holds and that are now empty leave the registry.
    pub(crate) fn retire_previous_generations(&self) -> usize {
        let mut registry = self.registry.lock();
        let mut freed: usize = 0;
        for log in registry.iter() {
            freed += self.release(log.take_previous());
        }
        let before: usize = registry.len();
        registry.retain(|log| Arc::strong_count(log) > 1 || !log.is_idle());
        let dropped: usize = before - registry.len();
        if dropped > 0 {
            debug_log!(dropped, "retired idle logs");
        }
        freed
    }

    /// Remove every chunk from every log, in no particular order.
    pub(crate) fn take_all_chunks(&self) -> Vec<LogChunk> {
        let registry = self.registry.lock();
        let mut out: Vec<LogChunk> = Vec::new();
        for log in registry.iter() {
            let mut group = log.group.lock();
            for generation in &mut group.generations {
                out.append(&mut std::mem::take(generation).chunks);
            }
            log.entries.store(0, Ordering::Relaxed);
            log.superseded.store(0, Ordering::Relaxed);
        }
        out
    }

    /// Drop every logged entry: all of them are reflected in leaves.
    pub(crate) fn retire_all(&self) -> usize {
        let chunks: Vec<LogChunk> = self.take_all_chunks();
        let n: usize = self.release(chunks);
        info_log!(chunks = n, "log retired");
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(chunk_entries: usize) -> LogConfig {
        LogConfig {
            chunk_entries,
            log_file_chunks: 2,
            max_log_chunks: 4,
            check_interval: 3,
            log_to_leaf_ratio: 0.2,
            garbage_ratio: 0.5,
        }
    }

    fn entries_of(chunks: &[LogChunk]) -> Vec<LogEntry> {
        chunks.iter().flat_map(LogChunk::live_entries).copied().collect()
    }

    #[test]
    fn test_entry_stamp_layout() {
        let e = LogEntry::new(-5, 0, 42, true);
        assert_eq!(e.key(), -5);
        assert_eq!(e.value(), 0);
        assert_eq!(e.clock(), 42);
        assert!(e.is_tombstone());
        assert!(e.is_intact());
        assert!(!LogEntry::new(1, 2, 3, false).is_tombstone());
        assert!(!LogEntry::EMPTY.is_intact());
    }

    #[test]
    fn test_torn_entry_detected() {
        // A new stamp over a stale key/value pair, or the reverse.
        let torn_pairs = (1..200).filter(|&c| {
            let fresh = LogEntry::new(1000 + c, 7, c as u64, false);
            let torn = LogEntry {
                key: 3,
                value: 9,
                stamp: fresh.stamp,
            };
            torn.is_intact()
        });
        // Seven check bits: a handful of false accepts out of 199 at most.
        assert!(torn_pairs.count() < 10);
    }

    #[test]
    fn test_append_and_read_back() {
        let pool = LogPool::new(config(4));
        let log = pool.register();
        for k in 0..6 {
            log.append(&pool, k, k * 10, k == 5).unwrap();
        }
        assert_eq!(pool.chunks_created(), 2);
        assert_eq!(log.log_bytes(), 6 * ENTRY_SIZE as u64);

        let entries = entries_of(&pool.take_all_chunks());
        let keys: Vec<i64> = entries.iter().map(LogEntry::key).collect();
        assert_eq!(keys, vec![0, 1, 2, 3, 4, 5]);
        assert!(entries[5].is_tombstone());
        assert!(entries.windows(2).all(|w| w[0].clock() < w[1].clock()));
    }

    #[test]
    fn test_check_due_every_interval() {
        let pool = LogPool::new(config(16));
        let log = pool.register();
        let due: Vec<bool> = (0..6).map(|k| log.append(&pool, k, k, false).unwrap().check_due).collect();
        assert_eq!(due, vec![false, false, true, false, false, true]);
    }

    #[test]
    fn test_exhaustion_leaves_log_untouched() {
        let pool = LogPool::new(config(1));
        let log = pool.register();
        for k in 0..4 {
            log.append(&pool, k, k, false).unwrap();
        }
        assert_eq!(
            log.append(&pool, 9, 9, false),
            Err(TreeError::LogExhausted { limit: 4 })
        );
        assert_eq!(log.log_bytes(), 4 * ENTRY_SIZE as u64);
        assert_eq!(entries_of(&pool.take_all_chunks()).len(), 4);
    }

    #[test]
    fn test_reused_chunk_hides_stale_entries() {
        let pool = LogPool::new(config(8));
        let log = pool.register();
        for k in 0..5 {
            log.append(&pool, k, k, false).unwrap();
        }
        pool.switch_generations();
        assert_eq!(pool.retire_previous_generations(), 1);

        // The same chunk comes back with two new entries in front of stale ones.
        log.append(&pool, 100, 1, false).unwrap();
        log.append(&pool, 101, 1, false).unwrap();
        let keys: Vec<i64> = entries_of(&pool.take_all_chunks()).iter().map(LogEntry::key).collect();
        assert_eq!(keys, vec![100, 101]);
    }

    #[test]
    fn test_switch_flips_epoch_and_separates_generations() {
        let pool = LogPool::new(config(8));
        let log = pool.register();
        let before = log.append(&pool, 1, 1, false).unwrap();
        assert_eq!(before.epoch, 0);

        assert_eq!(pool.switch_generations(), 1);
        let after = log.append(&pool, 2, 2, false).unwrap();
        assert_eq!(after.epoch, 1);
        assert!(after.clock > before.clock);
        assert_eq!(log.log_bytes(), ENTRY_SIZE as u64);

        assert_eq!(pool.retire_previous_generations(), 1);
        let keys: Vec<i64> = entries_of(&pool.take_all_chunks()).iter().map(LogEntry::key).collect();
        assert_eq!(keys, vec![2]);
    }

    #[test]
    fn test_idle_unshared_logs_leave_registry() {
        let pool = LogPool::new(config(8));
        let kept = pool.register();
        let dropped = pool.register();
        dropped.append(&pool, 1, 1, false).unwrap();
        drop(dropped);
        assert_eq!(pool.registered(), 2);

        // First pass: its entries move to the previous generation and are freed.
        pool.switch_generations();
        pool.retire_previous_generations();
        assert_eq!(pool.registered(), 1);
        drop(kept);
    }

    #[test]
    fn test_adopt_respects_chunk_limit() {
        let pool = LogPool::new(config(4));
        let log = pool.register();
        log.append(&pool, 1, 1, false).unwrap();
        assert_eq!(pool.chunks_created(), 2);

        let image: Vec<LogChunk> = (0..5).map(|_| LogChunk::new(4)).chain([LogChunk::new(8)]).collect();
        assert_eq!(pool.adopt(image), 2);
        assert_eq!(pool.chunks_created(), 4);
        assert_eq!(pool.chunks_free(), 3);
        assert_eq!(pool.adopt(vec![LogChunk::new(4)]), 0);
    }

    #[test]
    fn test_should_recycle_thresholds() {
        let pool = LogPool::new(config(64));
        let log = pool.register();
        for k in 0..10 {
            log.append(&pool, k, k, false).unwrap();
        }
        // 240 log bytes against 256 leaf bytes: above 20%, but no garbage yet.
        assert!(!pool.should_recycle(256));
        log.note_superseded(6);
        assert!(pool.should_recycle(256));
        // Plenty of leaf bytes: the log is small in comparison.
        assert!(!pool.should_recycle(256 * 100));
        assert_eq!(pool.superseded_entries(), 6);
    }

    #[test]
    fn test_request_recycle_is_idempotent() {
        let pool = LogPool::new(config(8));
        assert!(pool.request_recycle());
        assert!(!pool.request_recycle());
        assert!(pool.recycle_requested());
        pool.clear_recycle_request();
        assert!(!pool.recycle_requested());
    }
}
