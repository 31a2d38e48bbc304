//! The write path.
//!
//! A write runs as a small state machine under its bottom node's lock:
//!
//! ```text
//!   ProbeCache ──hit─────────────────────────────► done (cache overwrite)
//!       │ miss
//!       ▼
//!   ProbeLeaf ──room in cache────────────────────► done (cache append)
//!       │ cache full
//!       ▼
//!   Drain ──fits──► ApplyInPlace ──leaf emptied──► release ──► done
//!       └──overflows──► SplitLeaf ──► PropagateSeparator ──► done
//! ```
//!
//! A delete that would leave the leaf empty skips the cache and drains at
//! once, so the emptied leaf (other than the first) can be unlinked and
//! returned to the pool right away.
//!
//! Every write is logged before it reaches the cache or the leaf. Anything
//! that can fail (allocating a split leaf, taking a log chunk) happens
//! before the first mutation, so an `Err` leaves the tree unchanged.
//!
//! A checkpoint enters the same machine at `Drain` with no incoming write.

use std::ptr as StdPtr;
use std::sync::atomic::Ordering;

use crate::bottom::{BottomGuard, BottomNode, CACHE_SLOTS, CacheLookup, CacheWrite, CachedEntry};
use crate::error::TreeError;
use crate::internode::PendingSeparator;
use crate::leaf::{ApplyOutcome, LeafId, LeafNode, LeafOp, LeafPlan, MAX_BATCH, SpareLeaf};
use crate::log::{Appended, ThreadLog};
use crate::tracing_helpers::{debug_log, trace_log};

use super::TreeCore;

/// A single-key mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WriteOp {
    /// Insert, or overwrite when `update` is set.
    Put {
        /// New value.
        value: i64,
        /// Overwrite an existing key.
        update: bool,
    },
    /// Remove.
    Delete,
}

impl WriteOp {
    /// Whether the op is a no-op given the key's current liveness.
    const fn refused(self, live: bool) -> bool {
        match self {
            Self::Put { update, .. } => live && !update,
            Self::Delete => !live,
        }
    }

    const fn is_delete(self) -> bool {
        matches!(self, Self::Delete)
    }

    const fn value(self) -> i64 {
        match self {
            Self::Put { value, .. } => value,
            Self::Delete => 0,
        }
    }
}

#[derive(Clone, Copy)]
struct Incoming<'l> {
    log: &'l ThreadLog,
    key: i64,
    op: WriteOp,
}

impl Incoming<'_> {
    const fn leaf_op(self) -> LeafOp {
        match self.op {
            WriteOp::Put { value, .. } => LeafOp::Put { key: self.key, value },
            WriteOp::Delete => LeafOp::Delete { key: self.key },
        }
    }
}

const fn cached_op(entry: &CachedEntry) -> LeafOp {
    if entry.tombstone {
        LeafOp::Delete { key: entry.key }
    } else {
        LeafOp::Put {
            key: entry.key,
            value: entry.value,
        }
    }
}

enum State<'l> {
    ProbeCache(Incoming<'l>),
    ProbeLeaf(Incoming<'l>),
    Drain,
    ApplyInPlace(LeafPlan),
    SplitLeaf(LeafPlan),
    PropagateSeparator(PendingSeparator),
}

/// What a run of the state machine did.
#[derive(Clone, Copy, Debug, Default)]
struct Outcome {
    written: bool,
    appended: Option<Appended>,
}

impl TreeCore {
    /// Apply one write. `Ok(false)` means the write was refused: the key
    /// exists and `update` is not set, or a delete found nothing.
    pub(crate) fn write(&self, log: &ThreadLog, key: i64, op: WriteOp) -> Result<bool, TreeError> {
        let guard: BottomGuard<'_> = self.lock_bottom(key);
        let incoming = Incoming { log, key, op };
        let outcome: Outcome = self.run(guard, State::ProbeCache(incoming), Some(incoming))?;

        if let Some(appended) = outcome.appended {
            self.maybe_request_recycle(appended);
        }
        Ok(outcome.written)
    }

    /// Merge a locked node's cached writes into its leaf and release it.
    pub(crate) fn drain_node(&self, guard: BottomGuard<'_>) -> Result<(), TreeError> {
        self.run(guard, State::Drain, None).map(|_| ())
    }

    fn run(
        &self,
        guard: BottomGuard<'_>,
        start: State<'_>,
        incoming: Option<Incoming<'_>>,
    ) -> Result<Outcome, TreeError> {
        let node = guard.node();
        let leaf: &LeafNode = self.leaf(node.leaf());
        let mut cached: Vec<CachedEntry> = Vec::with_capacity(CACHE_SLOTS);
        let mut live: bool = false;
        let mut appended: Option<Appended> = None;

        let mut state: State<'_> = start;
        loop {
            state = match state {
                State::ProbeCache(w) => match node.lookup_cache(w.key) {
                    CacheLookup::Miss => State::ProbeLeaf(w),
                    hit => {
                        live = matches!(hit, CacheLookup::Value(_));
                        if w.op.refused(live) {
                            return Ok(Outcome::default());
                        }
                        let logged: Appended = w.log.append(&self.logs, w.key, w.op.value(), w.op.is_delete())?;
                        let wrote = guard.try_cache_write(w.key, w.op.value(), w.op.is_delete(), logged.epoch);
                        debug_assert_eq!(wrote, CacheWrite::Overwrote);
                        w.log.note_superseded(1);
                        self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                        appended = Some(logged);
                        break;
                    }
                },

                State::ProbeLeaf(w) => {
                    live = leaf.find_slot(w.key).is_some();
                    if w.op.refused(live) {
                        return Ok(Outcome::default());
                    }
                    let empties_leaf: bool = w.op.is_delete()
                        && node.leaf() != LeafId::FIRST
                        && leaf.len() <= 1 + guard.cached_tombstones();
                    if guard.is_full() || empties_leaf {
                        State::Drain
                    } else {
                        let logged: Appended = w.log.append(&self.logs, w.key, w.op.value(), w.op.is_delete())?;
                        let wrote = guard.try_cache_write(w.key, w.op.value(), w.op.is_delete(), logged.epoch);
                        debug_assert_eq!(wrote, CacheWrite::Appended);
                        appended = Some(logged);
                        break;
                    }
                }

                State::Drain => {
                    node.cached_entries(&mut cached);
                    let mut ops: Vec<LeafOp> = Vec::with_capacity(MAX_BATCH);
                    ops.extend(cached.iter().map(cached_op));
                    ops.extend(incoming.map(Incoming::leaf_op));

                    let plan: LeafPlan = leaf.plan(&ops);
                    if plan.needs_split() {
                        State::SplitLeaf(plan)
                    } else {
                        State::ApplyInPlace(plan)
                    }
                }

                State::ApplyInPlace(plan) => {
                    appended = self.log_incoming(incoming)?;
                    let stamp: u64 = self.logs.tick();
                    let applied = leaf.apply(&plan, None, stamp);
                    debug_assert_eq!(applied, ApplyOutcome::InPlace);
                    self.finish_drain(&guard, cached.len(), incoming);
                    if leaf.is_empty() && node.leaf() != LeafId::FIRST {
                        drop(guard);
                        self.release_empty(node);
                    }
                    break;
                }

                State::SplitLeaf(plan) => {
                    let spare: LeafId = self.leaves.alloc()?;
                    appended = match self.log_incoming(incoming) {
                        Ok(logged) => logged,
                        Err(err) => {
                            self.leaves.free(spare);
                            return Err(err);
                        }
                    };
                    let stamp: u64 = self.logs.tick();
                    let spare_leaf = SpareLeaf {
                        id: spare,
                        leaf: self.leaf(spare),
                    };
                    let applied: ApplyOutcome = leaf.apply(&plan, Some(spare_leaf), stamp);
                    self.finish_drain(&guard, cached.len(), incoming);

                    let ApplyOutcome::Split { split_key, right } = applied else {
                        self.leaves.free(spare);
                        break;
                    };
                    let new_node = node.boxed_right_of(right, split_key);
                    guard.split_off(split_key, new_node);
                    self.counters.leaf_splits.fetch_add(1, Ordering::Relaxed);
                    debug_log!(split_key, leaf = right.get(), "leaf split");

                    match self.index.link_bottom(split_key, new_node) {
                        Some(separator) => State::PropagateSeparator(separator),
                        None => break,
                    }
                }

                State::PropagateSeparator(separator) => {
                    drop(guard);
                    self.index.insert_separator(separator);
                    break;
                }
            };
        }

        if let Some(w) = incoming {
            self.adjust_len(live, w.op);
        }
        Ok(Outcome {
            written: true,
            appended,
        })
    }

    /// Unlink `node`'s emptied leaf and hand its range to the left
    /// neighbour. Gives up if the neighbourhood changed or the node took
    /// new writes since it was drained; recovery unlinks whatever is left.
    ///
    /// Locks left to right: the neighbour first, then `node`.
    fn release_empty(&self, node: &BottomNode) {
        let left: BottomGuard<'_> = self.lock_bottom(node.low() - 1);
        if !StdPtr::eq(left.node().next(), node) {
            return;
        }
        let right: BottomGuard<'_> = node.lock();
        let dead_leaf: &LeafNode = self.leaf(node.leaf());
        if node.meta().count > 0 || !dead_leaf.is_empty() {
            return;
        }

        let left_leaf: &LeafNode = self.leaf(left.node().leaf());
        debug_assert_eq!(left_leaf.next(), Some(node.leaf()));
        left_leaf.relink(dead_leaf.next(), left_leaf.timestamp());

        left.absorb(&right);
        self.index.retire_bottom(
            StdPtr::from_ref(node).cast_mut(),
            StdPtr::from_ref(left.node()).cast_mut(),
        );
        drop(right);
        drop(left);

        self.leaves.free(node.leaf());
        self.counters.leaves_freed.fetch_add(1, Ordering::Relaxed);
        trace_log!(low = node.low(), leaf = node.leaf().get(), "empty leaf released");
    }

    fn log_incoming(&self, incoming: Option<Incoming<'_>>) -> Result<Option<Appended>, TreeError> {
        incoming
            .map(|w| w.log.append(&self.logs, w.key, w.op.value(), w.op.is_delete()))
            .transpose()
    }

    /// Empty the cache once its entries live in the leaf.
    fn finish_drain(&self, guard: &BottomGuard<'_>, cached: usize, incoming: Option<Incoming<'_>>) {
        guard.clear_cache();
        let merged: u64 = (cached + usize::from(incoming.is_some())) as u64;
        incoming
            .map_or(&*self.recycle_log, |w| w.log)
            .note_superseded(merged);
        self.counters.cache_drains.fetch_add(1, Ordering::Relaxed);
        trace_log!(low = guard.node().low(), merged, "cache drained");
    }

    fn adjust_len(&self, was_live: bool, op: WriteOp) {
        match (was_live, op) {
            (false, WriteOp::Put { .. }) => {
                self.len.fetch_add(1, Ordering::Relaxed);
            }
            (true, WriteOp::Delete) => {
                self.len.fetch_sub(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    fn maybe_request_recycle(&self, appended: Appended) {
        if appended.check_due
            && self.logs.should_recycle(self.leaves.leaf_bytes())
            && self.logs.request_recycle()
        {
            debug_log!(clock = appended.clock, "recycle triggered");
        }
    }
}
