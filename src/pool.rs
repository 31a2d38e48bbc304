//! Leaf arena.
//!
//! [`LeafPool`] stands in for the persistent region leaves live in. Leaves
//! are addressed by 1-based [`LeafId`]s so the 48-bit `next` field of a leaf
//! stays meaningful across restarts. Memory is reserved in fixed segments
//! the first time an id inside them is handed out.
//!
//! Allocation state (bump watermark and free list) is volatile: recovery
//! recomputes it from the leaf chain, so a crash between allocating a leaf
//! and linking it leaks nothing.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::TreeError;
use crate::leaf::{LEAF_SIZE, LeafId, LeafNode, MAX_LEAF_ID};
use crate::tracing_helpers::{debug_log, error_log};

/// Leaves per lazily reserved segment.
pub const SEGMENT_LEAVES: usize = 4096;

type Segment = Box<[LeafNode]>;

/// Fixed-capacity arena of persistent leaves.
#[derive(Debug)]
pub struct LeafPool {
    segments: Box<[OnceLock<Segment>]>,
    segment_len: usize,
    capacity: usize,
    /// Ids `1..=high_water` have been handed out at least once.
    high_water: AtomicUsize,
    free: Mutex<Vec<LeafId>>,
    live: AtomicUsize,
}

impl LeafPool {
    /// Create an arena holding at most `capacity` leaves.
    ///
    /// The first leaf is allocated, emptied and persisted immediately; it is
    /// the head of every leaf chain and is never freed.
    ///
    /// # Errors
    /// [`TreeError::InvalidConfig`] if `capacity` is zero or exceeds the
    /// 48-bit id space.
    pub fn new(capacity: usize) -> Result<Self, TreeError> {
        if capacity == 0 {
            return Err(TreeError::InvalidConfig("leaf capacity must be at least 1"));
        }
        if capacity as u64 > MAX_LEAF_ID {
            return Err(TreeError::InvalidConfig("leaf capacity exceeds the 48-bit id space"));
        }

        let segment_len: usize = capacity.min(SEGMENT_LEAVES);
        let segments: Box<[OnceLock<Segment>]> = (0..capacity.div_ceil(segment_len))
            .map(|_| OnceLock::new())
            .collect();

        let pool = Self {
            segments,
            segment_len,
            capacity,
            high_water: AtomicUsize::new(0),
            free: Mutex::new(Vec::new()),
            live: AtomicUsize::new(0),
        };

        let first: LeafId = pool.alloc()?;
        debug_assert_eq!(first, LeafId::FIRST);
        let head: &LeafNode = pool.get(first);
        head.reset();
        head.relink(None, 0);
        Ok(pool)
    }

    /// The leaf behind `id`.
    ///
    /// # Panics
    /// Panics if `id` lies beyond this arena's capacity.
    #[inline]
    #[must_use]
    pub fn get(&self, id: LeafId) -> &LeafNode {
        let index: usize = id.index();
        let segment: &Segment = self.segments[index / self.segment_len].get_or_init(|| {
            (0..self.segment_len).map(|_| LeafNode::new()).collect()
        });
        &segment[index % self.segment_len]
    }

    /// Take a leaf from the free list, or a fresh one.
    ///
    /// The returned leaf's contents are unspecified.
    ///
    /// # Errors
    /// [`TreeError::PoolExhausted`] once every id is in use.
    pub fn alloc(&self) -> Result<LeafId, TreeError> {
        if let Some(id) = self.free.lock().pop() {
            self.live.fetch_add(1, Ordering::Relaxed);
            return Ok(id);
        }

        let claimed = self
            .high_water
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |hw| {
                (hw < self.capacity).then_some(hw + 1)
            });

        match claimed {
            Ok(hw) => {
                if (hw + 1) % self.segment_len == 1 {
                    debug_log!(segment = hw / self.segment_len, "reserving leaf segment");
                }
                self.live.fetch_add(1, Ordering::Relaxed);
                Ok(LeafId::from_raw(hw as u64 + 1).ok_or(TreeError::PoolExhausted {
                    capacity: self.capacity,
                })?)
            }
            Err(_) => {
                error_log!(capacity = self.capacity, "leaf pool exhausted");
                Err(TreeError::PoolExhausted {
                    capacity: self.capacity,
                })
            }
        }
    }

    /// Return a leaf to the free list.
    ///
    /// The caller guarantees nothing can still reach the leaf.
    pub fn free(&self, id: LeafId) {
        debug_assert_ne!(id, LeafId::FIRST, "the first leaf is never freed");
        self.free.lock().push(id);
        self.live.fetch_sub(1, Ordering::Relaxed);
    }

    /// Leaves currently in use.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Bytes of persistent memory held by leaves in use.
    #[must_use]
    pub fn leaf_bytes(&self) -> u64 {
        (self.allocated() * LEAF_SIZE) as u64
    }

    /// Maximum number of leaves.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Walk the leaf chain from the first leaf.
    #[must_use]
    pub fn chain(&self) -> Chain<'_> {
        Chain {
            pool: self,
            next: Some(LeafId::FIRST),
            steps: 0,
        }
    }

    /// Recompute allocation state so that exactly `reachable` is in use.
    pub(crate) fn rebuild_allocation(&self, reachable: &[LeafId]) {
        let high_water: usize = self.high_water.load(Ordering::Acquire);
        let mut in_use = vec![false; high_water];
        for id in reachable {
            if let Some(slot) = in_use.get_mut(id.index()) {
                *slot = true;
            }
        }

        let mut free = self.free.lock();
        free.clear();
        // Highest ids last so they are handed out first; low ids fill back in.
        free.extend(
            in_use
                .iter()
                .enumerate()
                .filter(|&(_, used)| !used)
                .filter_map(|(i, _)| LeafId::from_raw(i as u64 + 1)),
        );
        self.live.store(reachable.len(), Ordering::Relaxed);
    }
}

/// Iterator over `(id, leaf)` along the `next` links.
///
/// Bounded by the pool capacity, so a corrupted cycle cannot loop forever.
#[derive(Debug)]
pub struct Chain<'a> {
    pool: &'a LeafPool,
    next: Option<LeafId>,
    steps: usize,
}

impl<'a> Iterator for Chain<'a> {
    type Item = (LeafId, &'a LeafNode);

    fn next(&mut self) -> Option<Self::Item> {
        let id: LeafId = self.next?;
        if self.steps >= self.pool.capacity || id.index() >= self.pool.capacity {
            self.next = None;
            return None;
        }
        self.steps += 1;
        let leaf: &LeafNode = self.pool.get(id);
        self.next = leaf.next();
        Some((id, leaf))
    }
}
