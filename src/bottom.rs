//! Bottom nodes: the DRAM write buffer in front of each leaf.
//!
//! A [`BottomNode`] absorbs up to [`CACHE_SLOTS`] recent writes for its leaf.
//! Cached writes are durable through the log only; a full cache is drained
//! into the leaf in one batch.
//!
//! Each bottom node owns the half-open key range `[low, high)`. `low` never
//! changes. A split lowers `high` to the separator and points `next` at the
//! new right neighbour, both under the node's lock, so a reader that lands
//! too far left can always walk right.
//!
//! A node whose leaf ran empty is released into its left neighbour
//! ([`BottomGuard::absorb`]): the neighbour takes over its range and `next`,
//! and the released node records the neighbour in `merged`. Released nodes
//! stay allocated until the index drops, so anyone still holding one
//! follows `merged` to the owner.
//!
//! # Meta word
//!
//! ```text
//! bits 0-1   count       cached slots in use (0..=2)
//! bits 2-3   epoch tags  one per slot
//! bits 4-5   tombstones  one per slot; a set bit means "deleted"
//! ```
//!
//! # Concurrency
//!
//! Writers (foreground and recycler) hold the [`NodeVersion`] lock through
//! a [`BottomGuard`]. Readers take [`NodeVersion::stable`], read, and retry
//! if [`NodeVersion::has_changed`].

use std::ptr as StdPtr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicPtr, AtomicU64};

use crate::leaf::LeafId;
use crate::nodeversion::{LockGuard, NodeVersion};
use crate::ordering::{READ_ORD, WRITE_ORD};

/// Cached writes per bottom node.
pub const CACHE_SLOTS: usize = 2;

const COUNT_MASK: u64 = 0b11;
const TAG_SHIFT: u32 = 2;
const TOMB_SHIFT: u32 = 4;
const SLOT_MASK: u64 = (1 << CACHE_SLOTS) - 1;

// ============================================================================
//  BottomMeta
// ============================================================================

/// Decoded meta word.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BottomMeta {
    /// Slots in use.
    pub count: usize,
    /// Epoch bit per slot.
    pub tags: u8,
    /// Tombstone bit per slot.
    pub tombstones: u8,
}

impl BottomMeta {
    /// Pack into the atomic word.
    #[inline]
    #[must_use]
    pub const fn pack(self) -> u64 {
        (self.count as u64 & COUNT_MASK)
            | ((self.tags as u64 & SLOT_MASK) << TAG_SHIFT)
            | ((self.tombstones as u64 & SLOT_MASK) << TOMB_SHIFT)
    }

    /// Unpack the atomic word.
    #[inline]
    #[must_use]
    #[expect(clippy::cast_possible_truncation, reason = "fields are masked")]
    pub const fn unpack(word: u64) -> Self {
        Self {
            count: (word & COUNT_MASK) as usize,
            tags: ((word >> TAG_SHIFT) & SLOT_MASK) as u8,
            tombstones: ((word >> TOMB_SHIFT) & SLOT_MASK) as u8,
        }
    }

    /// Epoch bit of `slot`.
    #[inline]
    #[must_use]
    pub const fn tag(self, slot: usize) -> u8 {
        (self.tags >> slot) & 1
    }

    /// Whether `slot` holds a deletion.
    #[inline]
    #[must_use]
    pub const fn is_tombstone(self, slot: usize) -> bool {
        (self.tombstones >> slot) & 1 != 0
    }

    const fn with_slot(mut self, slot: usize, tombstone: bool, epoch: u8) -> Self {
        let bit: u8 = 1 << slot;
        self.tags = (self.tags & !bit) | ((epoch & 1) << slot);
        self.tombstones = if tombstone {
            self.tombstones | bit
        } else {
            self.tombstones & !bit
        };
        self
    }
}

/// One cached write, as seen by a drain or scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CachedEntry {
    /// Key.
    pub key: i64,
    /// Value (meaningless for tombstones).
    pub value: i64,
    /// Whether the write is a deletion.
    pub tombstone: bool,
    /// Epoch the slot was last logged under.
    pub tag: u8,
}

/// Result of [`BottomNode::lookup_cache`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheLookup {
    /// The key is cached with this value.
    Value(i64),
    /// The key is cached as deleted.
    Tombstone,
    /// The cache says nothing about the key.
    Miss,
}

/// Result of [`BottomGuard::try_cache_write`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheWrite {
    /// The key's slot was overwritten.
    Overwrote,
    /// A new slot was taken.
    Appended,
    /// Every slot holds another key.
    Full,
}

// ============================================================================
//  BottomNode
// ============================================================================

#[derive(Debug, Default)]
struct CacheSlot {
    key: AtomicI64,
    value: AtomicI64,
}

/// Write buffer and range owner for one leaf.
#[derive(Debug)]
#[repr(C, align(64))]
pub struct BottomNode {
    version: NodeVersion,
    meta: AtomicU64,
    cache: [CacheSlot; CACHE_SLOTS],
    leaf: LeafId,
    low: i64,
    high: AtomicI64,
    bounded: AtomicBool,
    next: AtomicPtr<BottomNode>,
    merged: AtomicPtr<BottomNode>,
}

impl BottomNode {
    /// A node with an empty cache covering `[low, high)`.
    #[must_use]
    pub fn new(leaf: LeafId, low: i64, high: Option<i64>) -> Self {
        Self {
            version: NodeVersion::new(),
            meta: AtomicU64::new(0),
            cache: Default::default(),
            leaf,
            low,
            high: AtomicI64::new(high.unwrap_or(i64::MAX)),
            bounded: AtomicBool::new(high.is_some()),
            next: AtomicPtr::new(StdPtr::null_mut()),
            merged: AtomicPtr::new(StdPtr::null_mut()),
        }
    }

    /// Allocate on the heap and leak; freed by the index on drop.
    #[must_use]
    pub fn boxed(leaf: LeafId, low: i64, high: Option<i64>) -> *mut Self {
        Box::into_raw(Box::new(Self::new(leaf, low, high)))
    }

    /// A node for `leaf` taking over `[low, high)` and the `next` link of
    /// `self`. Caller holds `self`'s lock and follows up with
    /// [`BottomGuard::split_off`].
    #[must_use]
    pub fn boxed_right_of(&self, leaf: LeafId, low: i64) -> *mut Self {
        let right = Self::new(leaf, low, self.high());
        right.next.store(self.next(), WRITE_ORD);
        Box::into_raw(Box::new(right))
    }

    /// The node's version lock.
    #[inline]
    #[must_use]
    pub const fn version(&self) -> &NodeVersion {
        &self.version
    }

    /// The leaf this node buffers for.
    #[inline]
    #[must_use]
    pub const fn leaf(&self) -> LeafId {
        self.leaf
    }

    /// Inclusive lower bound.
    #[inline]
    #[must_use]
    pub const fn low(&self) -> i64 {
        self.low
    }

    /// Exclusive upper bound; `None` for the rightmost node.
    #[inline]
    #[must_use]
    pub fn high(&self) -> Option<i64> {
        let high: i64 = self.high.load(READ_ORD);
        self.bounded.load(READ_ORD).then_some(high)
    }

    /// Whether `key` lies at or beyond the upper bound.
    #[inline]
    #[must_use]
    pub fn is_right_of(&self, key: i64) -> bool {
        self.high().is_some_and(|high| key >= high)
    }

    /// Right neighbour, or null.
    #[inline]
    #[must_use]
    pub fn next(&self) -> *mut Self {
        self.next.load(READ_ORD)
    }

    /// The node that absorbed this one, or null while it is live.
    #[inline]
    #[must_use]
    pub fn merged_into(&self) -> *mut Self {
        self.merged.load(READ_ORD)
    }

    /// Decoded meta word.
    #[inline]
    #[must_use]
    pub fn meta(&self) -> BottomMeta {
        BottomMeta::unpack(self.meta.load(READ_ORD))
    }

    /// Cached state of `key`. Readers validate the version afterwards.
    #[must_use]
    pub fn lookup_cache(&self, key: i64) -> CacheLookup {
        let meta: BottomMeta = self.meta();
        for slot in 0..meta.count {
            if self.cache[slot].key.load(READ_ORD) == key {
                if meta.is_tombstone(slot) {
                    return CacheLookup::Tombstone;
                }
                return CacheLookup::Value(self.cache[slot].value.load(READ_ORD));
            }
        }
        CacheLookup::Miss
    }

    /// Append every cached write to `out`, in slot order.
    pub fn cached_entries(&self, out: &mut Vec<CachedEntry>) {
        let meta: BottomMeta = self.meta();
        for slot in 0..meta.count {
            out.push(CachedEntry {
                key: self.cache[slot].key.load(READ_ORD),
                value: self.cache[slot].value.load(READ_ORD),
                tombstone: meta.is_tombstone(slot),
                tag: meta.tag(slot),
            });
        }
    }

    /// Acquire the node's lock.
    pub fn lock(&self) -> BottomGuard<'_> {
        BottomGuard {
            _lock: self.version.lock(),
            node: self,
        }
    }
}

// ============================================================================
//  BottomGuard
// ============================================================================

/// Exclusive access to a [`BottomNode`]; released on drop.
#[derive(Debug)]
#[must_use = "dropping the guard releases the bottom node"]
pub struct BottomGuard<'a> {
    _lock: LockGuard<'a>,
    node: &'a BottomNode,
}

impl<'a> BottomGuard<'a> {
    /// The locked node.
    #[inline]
    #[must_use]
    pub const fn node(&self) -> &'a BottomNode {
        self.node
    }

    /// Cache slot holding `key`, live or tombstone.
    #[must_use]
    pub fn find(&self, key: i64) -> Option<usize> {
        let meta: BottomMeta = self.node.meta();
        (0..meta.count).find(|&slot| self.node.cache[slot].key.load(READ_ORD) == key)
    }

    /// Whether every slot is taken.
    #[inline]
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.node.meta().count == CACHE_SLOTS
    }

    /// Cached deletions.
    #[must_use]
    pub fn cached_tombstones(&self) -> usize {
        let meta: BottomMeta = self.node.meta();
        let live: u8 = (1 << meta.count) - 1;
        (meta.tombstones & live).count_ones() as usize
    }

    /// Cache a write tagged with `epoch`.
    ///
    /// Overwrites the key's slot if cached, otherwise takes a free slot. The
    /// write must already be logged.
    pub fn try_cache_write(&self, key: i64, value: i64, tombstone: bool, epoch: u8) -> CacheWrite {
        let meta: BottomMeta = self.node.meta();
        let (slot, outcome) = match self.find(key) {
            Some(slot) => (slot, CacheWrite::Overwrote),
            None if meta.count < CACHE_SLOTS => (meta.count, CacheWrite::Appended),
            None => return CacheWrite::Full,
        };

        let cache: &CacheSlot = &self.node.cache[slot];
        cache.key.store(key, WRITE_ORD);
        cache.value.store(value, WRITE_ORD);

        let mut next: BottomMeta = meta.with_slot(slot, tombstone, epoch);
        if outcome == CacheWrite::Appended {
            next.count += 1;
        }
        self.node.meta.store(next.pack(), WRITE_ORD);
        outcome
    }

    /// Re-tag `slot` after it was logged again under `epoch`.
    pub fn retag(&self, slot: usize, epoch: u8) {
        let meta: BottomMeta = self.node.meta();
        debug_assert!(slot < meta.count);
        let next: BottomMeta = meta.with_slot(slot, meta.is_tombstone(slot), epoch);
        self.node.meta.store(next.pack(), WRITE_ORD);
    }

    /// Empty the cache after a drain.
    pub fn clear_cache(&self) {
        self.node.meta.store(0, WRITE_ORD);
    }

    /// Hand `[split_key, high)` to `right`, which must already cover it.
    ///
    /// `right` must stay allocated for as long as this node is reachable.
    pub fn split_off(&self, split_key: i64, right: *mut BottomNode) {
        debug_assert!(split_key > self.node.low, "split below the node's range");
        self.node.next.store(right, WRITE_ORD);
        self.node.high.store(split_key, WRITE_ORD);
        self.node.bounded.store(true, WRITE_ORD);
    }

    /// Take over the range and `next` link of `right`, this node's direct
    /// successor, and mark `right` released.
    ///
    /// `right` must have an empty cache. Both nodes stay locked for the
    /// duration, so readers of either one retry.
    pub fn absorb(&self, right: &BottomGuard<'_>) {
        let dead: &BottomNode = right.node;
        debug_assert!(StdPtr::eq(self.node.next(), dead), "absorbing a non-neighbour");
        debug_assert_eq!(dead.meta().count, 0, "absorbing a node with cached writes");

        self.node.next.store(dead.next(), WRITE_ORD);
        self.node.high.store(dead.high.load(READ_ORD), WRITE_ORD);
        self.node.bounded.store(dead.bounded.load(READ_ORD), WRITE_ORD);
        dead.merged.store(StdPtr::from_ref(self.node).cast_mut(), WRITE_ORD);
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> BottomNode {
        BottomNode::new(LeafId::FIRST, i64::MIN, None)
    }

    #[test]
    fn test_meta_roundtrip() {
        let meta = BottomMeta {
            count: 2,
            tags: 0b10,
            tombstones: 0b01,
        };
        assert_eq!(BottomMeta::unpack(meta.pack()), meta);
        assert_eq!(meta.tag(0), 0);
        assert_eq!(meta.tag(1), 1);
        assert!(meta.is_tombstone(0));
        assert!(!meta.is_tombstone(1));
    }

    #[test]
    fn test_cache_write_then_full() {
        let n = node();
        let g = n.lock();
        assert_eq!(g.try_cache_write(5, 50, false, 0), CacheWrite::Appended);
        assert_eq!(g.try_cache_write(6, 60, false, 1), CacheWrite::Appended);
        assert!(g.is_full());
        assert_eq!(g.try_cache_write(7, 70, false, 0), CacheWrite::Full);
        assert_eq!(g.try_cache_write(5, 55, false, 0), CacheWrite::Overwrote);
        drop(g);

        assert_eq!(n.lookup_cache(5), CacheLookup::Value(55));
        assert_eq!(n.lookup_cache(6), CacheLookup::Value(60));
        assert_eq!(n.lookup_cache(7), CacheLookup::Miss);
        assert_eq!(n.meta().tag(1), 1);
    }

    #[test]
    fn test_tombstone_and_zero_value() {
        let n = node();
        let g = n.lock();
        g.try_cache_write(1, 0, false, 0);
        g.try_cache_write(2, 0, true, 0);
        drop(g);
        assert_eq!(n.lookup_cache(1), CacheLookup::Value(0));
        assert_eq!(n.lookup_cache(2), CacheLookup::Tombstone);

        let g = n.lock();
        g.try_cache_write(2, 9, false, 0);
        drop(g);
        assert_eq!(n.lookup_cache(2), CacheLookup::Value(9));
    }

    #[test]
    fn test_cleared_slots_are_not_served() {
        let n = node();
        let g = n.lock();
        g.try_cache_write(3, 30, false, 0);
        g.clear_cache();
        drop(g);
        assert_eq!(n.lookup_cache(3), CacheLookup::Miss);

        let mut out = Vec::new();
        n.cached_entries(&mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_retag_keeps_tombstone() {
        let n = node();
        let g = n.lock();
        g.try_cache_write(4, 0, true, 0);
        g.retag(0, 1);
        drop(g);
        let mut out = Vec::new();
        n.cached_entries(&mut out);
        assert_eq!(
            out,
            vec![CachedEntry {
                key: 4,
                value: 0,
                tombstone: true,
                tag: 1
            }]
        );
    }

    #[test]
    fn test_split_off_narrows_range() {
        let left = node();
        let right = BottomNode::boxed(LeafId::from_raw(2).unwrap(), 100, None);
        assert!(!left.is_right_of(1000));

        let g = left.lock();
        g.split_off(100, right);
        drop(g);

        assert_eq!(left.high(), Some(100));
        assert!(left.is_right_of(100));
        assert!(!left.is_right_of(99));
        assert_eq!(left.next(), right);

        // SAFETY: allocated by `boxed` above and not shared.
        drop(unsafe { Box::from_raw(right) });
    }

    #[test]
    fn test_absorb_takes_over_range() {
        let left = node();
        let mid = BottomNode::boxed(LeafId::from_raw(2).unwrap(), 100, None);
        let right = BottomNode::boxed(LeafId::from_raw(3).unwrap(), 200, None);
        left.lock().split_off(100, mid);
        // SAFETY: allocated by `boxed` above and freed at the end of the test.
        let (mid_ref, right_ref) = unsafe { (&*mid, &*right) };
        mid_ref.lock().split_off(200, right);

        let before = mid_ref.version().stable();
        let owner = left.lock();
        let dead = mid_ref.lock();
        owner.absorb(&dead);
        drop(dead);
        drop(owner);

        assert_eq!(left.high(), Some(200));
        assert_eq!(left.next(), right);
        assert!(!left.is_right_of(150));
        assert!(left.merged_into().is_null());
        assert_eq!(mid_ref.merged_into(), StdPtr::from_ref(&left).cast_mut());
        assert!(mid_ref.version().has_changed(before));
        assert!(right_ref.merged_into().is_null());

        // Absorbing the last node leaves the owner unbounded.
        let owner = left.lock();
        let dead = right_ref.lock();
        owner.absorb(&dead);
        drop(dead);
        drop(owner);
        assert_eq!(left.high(), None);
        assert!(left.next().is_null());

        // SAFETY: allocated by `boxed` above and not shared.
        unsafe {
            drop(Box::from_raw(mid));
            drop(Box::from_raw(right));
        }
    }

    #[test]
    fn test_cached_tombstones_ignore_cleared_slots() {
        let n = node();
        let g = n.lock();
        g.try_cache_write(1, 0, true, 0);
        g.try_cache_write(2, 5, false, 0);
        assert_eq!(g.cached_tombstones(), 1);
        g.clear_cache();
        assert_eq!(g.cached_tombstones(), 0);
        g.try_cache_write(3, 7, false, 0);
        assert_eq!(g.cached_tombstones(), 0);
    }

    #[test]
    fn test_writes_bump_version() {
        let n = node();
        let before = n.version().stable();
        drop(n.lock());
        assert!(n.version().has_changed(before));
        let now = n.version().stable();
        assert!(!n.version().has_changed(now));
    }
}
