//! Persistent leaf nodes.
//!
//! A [`LeafNode`] is one 256-byte, cache-line aligned block in the leaf
//! arena. Its first line carries all metadata, so committing a change is a
//! single line flush:
//!
//! ```text
//! line 0: meta (bitmap:14 | next:48) | timestamp | fingerprints[14] + pad[2] | slot 0 | slot 1
//! line 1: slot 2 .. slot 5
//! line 2: slot 6 .. slot 9
//! line 3: slot 10 .. slot 13
//! ```
//!
//! # Persistence ordering
//!
//! - Slot payload is flushed before the bitmap bit that publishes it.
//! - Within line 0, fingerprints are stored before the meta word and the
//!   timestamp after it; stores to one line reach memory in program order.
//! - A split leaf is flushed in full before the old leaf's `next` names it.
//!
//! # Concurrency
//!
//! Leaves have no lock of their own. Writers hold the owning bottom node's
//! lock; readers validate against that bottom node's version.

use std::num::NonZeroU64;
use std::sync::atomic::{AtomicI64, AtomicU64};

use crate::fingerprint;
use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};
use crate::persist::{self, CACHE_LINE_SIZE};

mod split;

pub use split::{ApplyOutcome, LeafOp, LeafPlan, MAX_BATCH, SpareLeaf};

/// Slots per leaf.
pub const LEAF_SLOTS: usize = 14;

/// Bitmap with every slot occupied.
pub const FULL_BITMAP: u16 = (1 << LEAF_SLOTS) - 1;

/// Size of a leaf in bytes.
pub const LEAF_SIZE: usize = 256;

const BITMAP_MASK: u64 = FULL_BITMAP as u64;
const NEXT_SHIFT: u32 = LEAF_SLOTS as u32;

/// Largest leaf id representable in the 48-bit `next` field.
pub const MAX_LEAF_ID: u64 = (1 << 48) - 1;

/// Offset of slot 0 from the start of the leaf.
const SLOT_BASE: usize = 32;

/// Cache line (0..=3) holding slot `slot`.
#[inline]
#[must_use]
pub const fn slot_line(slot: usize) -> usize {
    (SLOT_BASE + slot * size_of::<LeafSlot>()) / CACHE_LINE_SIZE
}

// ============================================================================
//  LeafId / LeafMeta
// ============================================================================

/// 1-based index of a leaf in the arena. Zero encodes "no leaf".
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LeafId(NonZeroU64);

impl LeafId {
    /// The first leaf of every tree. Never freed.
    pub const FIRST: Self = Self(NonZeroU64::MIN);

    /// Build an id from its raw encoding; `0` yields `None`.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw & MAX_LEAF_ID) {
            Some(id) => Some(Self(id)),
            None => None,
        }
    }

    /// Raw 1-based value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0.get()
    }

    /// Zero-based arena index.
    #[inline]
    #[must_use]
    #[expect(clippy::cast_possible_truncation, reason = "ids are bounded by the arena size")]
    pub const fn index(self) -> usize {
        (self.0.get() - 1) as usize
    }
}

/// Decoded form of the leaf meta word.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct LeafMeta {
    /// Occupied slots.
    pub bitmap: u16,
    /// Right neighbour in the leaf chain.
    pub next: Option<LeafId>,
}

impl LeafMeta {
    /// Pack into the on-media word.
    #[inline]
    #[must_use]
    pub const fn pack(self) -> u64 {
        let next: u64 = match self.next {
            Some(id) => id.get(),
            None => 0,
        };
        (self.bitmap as u64 & BITMAP_MASK) | (next << NEXT_SHIFT)
    }

    /// Unpack an on-media word.
    #[inline]
    #[must_use]
    #[expect(clippy::cast_possible_truncation, reason = "masked to 14 bits")]
    pub const fn unpack(word: u64) -> Self {
        Self {
            bitmap: (word & BITMAP_MASK) as u16,
            next: LeafId::from_raw(word >> NEXT_SHIFT),
        }
    }

    /// Number of occupied slots.
    #[inline]
    #[must_use]
    pub const fn len(self) -> usize {
        self.bitmap.count_ones() as usize
    }

    /// Whether no slot is occupied.
    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.bitmap == 0
    }

    /// Lowest free slot, if any.
    #[inline]
    #[must_use]
    pub const fn first_free(self) -> Option<usize> {
        let free: u16 = !self.bitmap & FULL_BITMAP;
        if free == 0 {
            None
        } else {
            Some(free.trailing_zeros() as usize)
        }
    }
}

// ============================================================================
//  LeafNode
// ============================================================================

/// One key/value slot.
#[derive(Debug, Default)]
#[repr(C)]
pub struct LeafSlot {
    key: AtomicI64,
    value: AtomicI64,
}

/// Fixed-capacity, fingerprinted, persistent leaf.
#[derive(Debug, Default)]
#[repr(C, align(64))]
pub struct LeafNode {
    meta: AtomicU64,
    timestamp: AtomicU64,
    fingerprints: [AtomicU64; 2],
    slots: [LeafSlot; LEAF_SLOTS],
}

const _: () = assert!(size_of::<LeafNode>() == LEAF_SIZE);
const _: () = assert!(align_of::<LeafNode>() == CACHE_LINE_SIZE);

impl LeafNode {
    /// An empty, unlinked leaf.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    //  Readers
    // ========================================================================

    /// Decoded meta word.
    #[inline]
    #[must_use]
    pub fn meta(&self) -> LeafMeta {
        LeafMeta::unpack(self.meta.load(READ_ORD))
    }

    /// Logical time of the last committed change.
    #[inline]
    #[must_use]
    pub fn timestamp(&self) -> u64 {
        self.timestamp.load(READ_ORD)
    }

    /// Right neighbour in the leaf chain.
    #[inline]
    #[must_use]
    pub fn next(&self) -> Option<LeafId> {
        self.meta().next
    }

    /// Number of live keys.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.meta().len()
    }

    /// Whether the leaf holds no live key.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.meta().is_empty()
    }

    /// Key stored in `slot` (meaningful only if the slot is occupied).
    #[inline]
    #[must_use]
    pub fn key_at(&self, slot: usize) -> i64 {
        self.slots[slot].key.load(READ_ORD)
    }

    /// Value stored in `slot` (meaningful only if the slot is occupied).
    #[inline]
    #[must_use]
    pub fn value_at(&self, slot: usize) -> i64 {
        self.slots[slot].value.load(READ_ORD)
    }

    /// Fingerprint stored for `slot`.
    #[inline]
    #[must_use]
    pub fn fingerprint_at(&self, slot: usize) -> u8 {
        let word: u64 = self.fingerprints[slot / 8].load(READ_ORD);
        word.to_le_bytes()[slot % 8]
    }

    /// Slot holding `key`, if it is live.
    ///
    /// Compares the key's fingerprint against all lanes at once, masks by
    /// the bitmap, then confirms each candidate.
    #[inline]
    #[must_use]
    pub fn find_slot(&self, key: i64) -> Option<usize> {
        self.find_slot_in(self.meta().bitmap, key)
    }

    fn find_slot_in(&self, bitmap: u16, key: i64) -> Option<usize> {
        let lo: u64 = self.fingerprints[0].load(READ_ORD);
        let hi: u64 = self.fingerprints[1].load(READ_ORD);
        let mut candidates: u16 = fingerprint::match_mask(lo, hi, fingerprint::hash(key)) & bitmap;

        while candidates != 0 {
            let slot: usize = candidates.trailing_zeros() as usize;
            if self.key_at(slot) == key {
                return Some(slot);
            }
            candidates &= candidates - 1;
        }
        None
    }

    /// Value for `key`, if it is live.
    #[inline]
    #[must_use]
    pub fn get(&self, key: i64) -> Option<i64> {
        self.find_slot(key).map(|slot| self.value_at(slot))
    }

    /// Append every live `(key, value)` to `out`, unordered.
    pub fn collect_into(&self, out: &mut Vec<(i64, i64)>) {
        let mut bitmap: u16 = self.meta().bitmap;
        while bitmap != 0 {
            let slot: usize = bitmap.trailing_zeros() as usize;
            out.push((self.key_at(slot), self.value_at(slot)));
            bitmap &= bitmap - 1;
        }
    }

    /// Smallest live key.
    #[must_use]
    pub fn min_key(&self) -> Option<i64> {
        let mut bitmap: u16 = self.meta().bitmap;
        let mut min: Option<i64> = None;
        while bitmap != 0 {
            let slot: usize = bitmap.trailing_zeros() as usize;
            let key: i64 = self.key_at(slot);
            min = Some(min.map_or(key, |m| m.min(key)));
            bitmap &= bitmap - 1;
        }
        min
    }

    // ========================================================================
    //  Writers (caller holds the owning bottom node's lock)
    // ========================================================================

    /// Point `next` at `next` and persist. Used when unlinking empty leaves.
    pub fn relink(&self, next: Option<LeafId>, stamp: u64) {
        let meta: LeafMeta = self.meta();
        self.commit(LeafMeta { next, ..meta }, stamp);
    }

    /// Write payload and fingerprint of `slot`. Nothing is published.
    fn write_slot(&self, slot: usize, key: i64, value: i64) {
        self.slots[slot].key.store(key, WRITE_ORD);
        self.slots[slot].value.store(value, WRITE_ORD);
        self.set_fingerprint(slot, fingerprint::hash(key));
    }

    fn set_fingerprint(&self, slot: usize, fp: u8) {
        let word: &AtomicU64 = &self.fingerprints[slot / 8];
        let mut bytes: [u8; 8] = word.load(RELAXED).to_le_bytes();
        bytes[slot % 8] = fp;
        word.store(u64::from_le_bytes(bytes), WRITE_ORD);
    }

    /// Store meta then timestamp into line 0 and flush it.
    ///
    /// Every payload line the new bitmap depends on must already be durable.
    fn commit(&self, meta: LeafMeta, stamp: u64) {
        self.meta.store(meta.pack(), WRITE_ORD);
        self.timestamp.store(stamp, WRITE_ORD);
        self.flush_line(0);
    }

    /// Persist one line without a fence.
    fn flush_line_nofence(&self, line: usize) {
        let base: *const u8 = std::ptr::from_ref(self).cast();
        persist::flush_nofence(base.wrapping_add(line * CACHE_LINE_SIZE), CACHE_LINE_SIZE);
    }

    fn flush_line(&self, line: usize) {
        self.flush_line_nofence(line);
        persist::fence();
    }

    /// Persist the whole leaf.
    fn flush_all(&self) {
        persist::flush_value(self);
    }

    /// Reset to the empty, unlinked state without persisting.
    pub(crate) fn reset(&self) {
        self.meta.store(0, WRITE_ORD);
        self.timestamp.store(0, WRITE_ORD);
        self.fingerprints[0].store(0, WRITE_ORD);
        self.fingerprints[1].store(0, WRITE_ORD);
    }

    /// Raw words of the leaf, for crash simulation.
    #[cfg(test)]
    pub(crate) fn words(&self) -> [u64; LEAF_SIZE / 8] {
        let base = std::ptr::from_ref(self).cast::<AtomicU64>();
        // SAFETY: the leaf is 256 bytes of 8-byte atomics.
        std::array::from_fn(|i| unsafe { (*base.add(i)).load(RELAXED) })
    }
}

#[cfg(test)]
impl LeafNode {
    /// A leaf holding `pairs` (distinct keys) in slot order, committed at
    /// `stamp`.
    pub(crate) fn with_pairs(pairs: &[(i64, i64)], stamp: u64) -> Self {
        let leaf = Self::new();
        for chunk in pairs.chunks(MAX_BATCH) {
            let ops: Vec<LeafOp> = chunk
                .iter()
                .map(|&(key, value)| LeafOp::Put { key, value })
                .collect();
            let plan: LeafPlan = leaf.plan(&ops);
            assert!(!plan.needs_split(), "more pairs than slots");
            leaf.apply(&plan, None, stamp);
        }
        leaf.relink(None, stamp);
        leaf
    }
}

#[cfg(test)]
mod crash_tests;
