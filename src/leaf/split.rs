//! Batched leaf updates and the crash-consistent split.
//!
//! A drained write buffer arrives as a handful of [`LeafOp`]s. They are
//! resolved against the leaf first ([`LeafNode::plan`]) so the caller knows
//! whether a split will happen and can allocate the right sibling before
//! anything is mutated. [`LeafNode::apply`] then performs the batch:
//!
//! 1. Deletes clear bits in a working copy of the meta; updates overwrite
//!    values in place.
//! 2. Inserts fill slots that are free in the durable bitmap. Slots freed by
//!    this batch are reused only after an intermediate commit (keeping the
//!    old timestamp) has made those deletes durable.
//! 3. If slots run out, the full leaf is split at its median key: the upper
//!    half is copied into the spare leaf, the remaining inserts are routed
//!    by the separator, the spare is flushed in full, and only then does the
//!    old leaf's meta word name it as `next`.

use super::{FULL_BITMAP, LEAF_SLOTS, LeafId, LeafMeta, LeafNode, slot_line};
use crate::fingerprint;
use crate::ordering::WRITE_ORD;
use crate::persist;
use crate::tracing_helpers::trace_log;

/// Largest batch a single drain produces (cached entries + the incoming one).
pub const MAX_BATCH: usize = 4;

/// One resolved-later write against a leaf.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeafOp {
    /// Insert or overwrite.
    Put {
        /// Key.
        key: i64,
        /// Value.
        value: i64,
    },
    /// Remove if present.
    Delete {
        /// Key.
        key: i64,
    },
}

impl LeafOp {
    /// Key the op applies to.
    #[inline]
    #[must_use]
    pub const fn key(self) -> i64 {
        match self {
            Self::Put { key, .. } | Self::Delete { key } => key,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Resolved {
    op: LeafOp,
    slot: Option<usize>,
}

/// A batch resolved against one leaf.
#[derive(Clone, Debug)]
pub struct LeafPlan {
    ops: [Option<Resolved>; MAX_BATCH],
    inserts: usize,
    freed: usize,
    free_before: usize,
}

impl LeafPlan {
    /// Whether applying this plan overflows the leaf.
    #[inline]
    #[must_use]
    pub const fn needs_split(&self) -> bool {
        self.inserts > self.free_before + self.freed
    }

    fn resolved(&self) -> impl Iterator<Item = Resolved> + '_ {
        self.ops.iter().flatten().copied()
    }
}

/// The pre-allocated right sibling for a planned split.
#[derive(Clone, Copy, Debug)]
pub struct SpareLeaf<'a> {
    /// Arena id of the spare.
    pub id: LeafId,
    /// The spare itself.
    pub leaf: &'a LeafNode,
}

/// What [`LeafNode::apply`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Everything fit in the leaf.
    InPlace,
    /// The leaf split; `right` now holds every key `>= split_key`.
    Split {
        /// Smallest key moved into the right sibling.
        split_key: i64,
        /// The right sibling, linked and durable.
        right: LeafId,
    },
}

/// Tracks which of lines 1..=3 hold unflushed payload.
#[derive(Clone, Copy, Default)]
struct DirtyLines(u8);

impl DirtyLines {
    fn mark(&mut self, slot: usize) {
        self.0 |= 1 << slot_line(slot);
    }

    /// Flush dirty payload lines (line 0 goes out with the commit) and fence.
    fn flush(self, leaf: &LeafNode) {
        for line in (1..4).rev() {
            if self.0 & (1 << line) != 0 {
                leaf.flush_line_nofence(line);
            }
        }
        persist::fence();
    }
}

impl LeafNode {
    /// Resolve `ops` against the current contents.
    ///
    /// Keys in a batch must be distinct.
    #[must_use]
    pub fn plan(&self, ops: &[LeafOp]) -> LeafPlan {
        debug_assert!(ops.len() <= MAX_BATCH, "batch too large");

        let meta: LeafMeta = self.meta();
        let mut plan = LeafPlan {
            ops: [None; MAX_BATCH],
            inserts: 0,
            freed: 0,
            free_before: LEAF_SLOTS - meta.len(),
        };

        for (entry, &op) in plan.ops.iter_mut().zip(ops) {
            let slot: Option<usize> = self.find_slot_in(meta.bitmap, op.key());
            match (op, slot) {
                (LeafOp::Put { .. }, None) => plan.inserts += 1,
                (LeafOp::Delete { .. }, Some(_)) => plan.freed += 1,
                _ => {}
            }
            *entry = Some(Resolved { op, slot });
        }
        plan
    }

    /// Apply a plan produced by [`LeafNode::plan`] on this leaf.
    ///
    /// `spare` must be `Some` when [`LeafPlan::needs_split`] is true. The
    /// spare's previous contents are overwritten.
    ///
    /// # Panics
    /// Panics if a split is required and no spare leaf was supplied.
    ///
    /// Only the last commit of a batch carries `stamp`; any earlier commit
    /// keeps the leaf's previous timestamp so recovery still replays the
    /// batch if the crash lands in between.
    pub fn apply(&self, plan: &LeafPlan, spare: Option<SpareLeaf<'_>>, stamp: u64) -> ApplyOutcome {
        let old: LeafMeta = self.meta();
        let old_stamp: u64 = self.timestamp();
        let mut meta: LeafMeta = old;
        let mut dirty = DirtyLines::default();

        // Updates and deletes first.
        for resolved in plan.resolved() {
            match (resolved.op, resolved.slot) {
                (LeafOp::Delete { .. }, Some(slot)) => meta.bitmap &= !(1 << slot),
                (LeafOp::Put { value, .. }, Some(slot)) => {
                    self.slots[slot].value.store(value, WRITE_ORD);
                    dirty.mark(slot);
                }
                _ => {}
            }
        }

        // Inserts go only into slots that are free on media.
        let mut reusable: u16 = !old.bitmap & FULL_BITMAP;
        let mut pending = plan
            .resolved()
            .filter_map(|r| match (r.op, r.slot) {
                (LeafOp::Put { key, value }, None) => Some((key, value)),
                _ => None,
            })
            .peekable();

        while let Some(&(key, value)) = pending.peek() {
            if reusable == 0 {
                // Slots freed by this batch are still set in the durable bitmap.
                reusable = !meta.bitmap & FULL_BITMAP;
                if reusable == 0 {
                    break;
                }
                dirty.flush(self);
                self.commit(meta, old_stamp);
                dirty = DirtyLines::default();
                continue;
            }
            let slot: usize = reusable.trailing_zeros() as usize;
            reusable &= reusable - 1;

            self.write_slot(slot, key, value);
            meta.bitmap |= 1 << slot;
            dirty.mark(slot);
            pending.next();
        }

        let remaining: Vec<(i64, i64)> = pending.collect();
        if remaining.is_empty() {
            dirty.flush(self);
            self.commit(meta, stamp);
            return ApplyOutcome::InPlace;
        }

        let Some(spare) = spare else {
            panic!("leaf overflow without a spare leaf: plan/apply mismatch");
        };
        self.split_into(meta, dirty, spare, &remaining, (old_stamp, stamp))
    }

    /// Split a full leaf (working meta `meta`) and place `remaining` inserts.
    fn split_into(
        &self,
        mut meta: LeafMeta,
        dirty: DirtyLines,
        spare: SpareLeaf<'_>,
        remaining: &[(i64, i64)],
        (old_stamp, stamp): (u64, u64),
    ) -> ApplyOutcome {
        debug_assert_eq!(meta.len(), LEAF_SLOTS, "split of a non-full leaf");

        let mut sorted: [usize; LEAF_SLOTS] = std::array::from_fn(|i| i);
        sorted.sort_unstable_by_key(|&slot| self.key_at(slot));

        let split: usize = LEAF_SLOTS / 2;
        let split_key: i64 = self.key_at(sorted[split]);
        let right: &LeafNode = spare.leaf;

        // Upper half into the spare, packed from slot 0.
        let mut moved: u16 = 0;
        let mut right_meta = LeafMeta {
            bitmap: 0,
            next: meta.next,
        };
        let mut right_fps = [0u8; 16];
        for (dst, &src) in sorted[split..].iter().enumerate() {
            right.slots[dst].key.store(self.key_at(src), WRITE_ORD);
            right.slots[dst].value.store(self.value_at(src), WRITE_ORD);
            right_fps[dst] = self.fingerprint_at(src);
            right_meta.bitmap |= 1 << dst;
            moved |= 1 << src;
        }

        let mut left_pending: Vec<(i64, i64)> = Vec::with_capacity(remaining.len());
        for &(key, value) in remaining {
            if key >= split_key {
                let Some(dst) = right_meta.first_free() else {
                    unreachable!("right half cannot overflow");
                };
                right.slots[dst].key.store(key, WRITE_ORD);
                right.slots[dst].value.store(value, WRITE_ORD);
                right_fps[dst] = fingerprint::hash(key);
                right_meta.bitmap |= 1 << dst;
            } else {
                left_pending.push((key, value));
            }
        }

        let (lo, hi) = right_fps.split_at(8);
        let mut lo_bytes = [0u8; 8];
        let mut hi_bytes = [0u8; 8];
        lo_bytes.copy_from_slice(lo);
        hi_bytes.copy_from_slice(hi);
        right.fingerprints[0].store(u64::from_le_bytes(lo_bytes), WRITE_ORD);
        right.fingerprints[1].store(u64::from_le_bytes(hi_bytes), WRITE_ORD);
        right.meta.store(right_meta.pack(), WRITE_ORD);
        right.timestamp.store(stamp, WRITE_ORD);

        // The right leaf is fully durable before anything names it.
        right.flush_all();

        // Payload updated in place on the left, then the link. The batch is
        // finished only once the left-bound inserts are committed too.
        dirty.flush(self);
        meta.bitmap &= !moved;
        meta.next = Some(spare.id);
        self.commit(meta, if left_pending.is_empty() { stamp } else { old_stamp });

        trace_log!(
            split_key,
            right = spare.id.get(),
            left_len = meta.len(),
            right_len = right_meta.len(),
            "leaf split"
        );

        // Inserts that stay on the left take the slots the split freed.
        if !left_pending.is_empty() {
            let mut dirty = DirtyLines::default();
            for (key, value) in left_pending {
                let Some(slot) = meta.first_free() else {
                    unreachable!("left half cannot overflow");
                };
                self.write_slot(slot, key, value);
                meta.bitmap |= 1 << slot;
                dirty.mark(slot);
            }
            dirty.flush(self);
            self.commit(meta, stamp);
        }

        ApplyOutcome::Split {
            split_key,
            right: spare.id,
        }
    }
}
