//! Rebuilding a tree from a [`PersistentImage`].
//!
//! 1. Walk the leaf chain; it must end and its minimum keys must increase.
//! 2. Collect intact log entries and drop those every candidate leaf
//!    already reflects.
//! 3. Unlink empty leaves (except the first) and rebuild the allocator.
//! 4. Rebuild bottom nodes and the inner index over the surviving chain.
//! 5. Move the clock past everything observed and replay the kept entries
//!    through the normal write path, in clock order.

use std::sync::Arc;

use crate::bottom::BottomNode;
use crate::config::TreeConfig;
use crate::error::TreeError;
use crate::index::InnerIndex;
use crate::leaf::{LeafId, LeafNode};
use crate::log::{LogChunk, LogEntry};
use crate::tracing_helpers::{debug_log, info_log};

use super::{CclBTree, PersistentImage, TreeCore, WriteOp};

/// One leaf of the chain as found in the image.
struct ChainLeaf<'a> {
    id: LeafId,
    leaf: &'a LeafNode,
    min_key: Option<i64>,
}

pub(super) fn recover(image: PersistentImage, config: TreeConfig) -> Result<CclBTree, TreeError> {
    config.validate()?;
    let PersistentImage { leaves, log_chunks } = image;

    let chain: Vec<ChainLeaf<'_>> = leaves
        .chain()
        .map(|(id, leaf)| ChainLeaf {
            id,
            leaf,
            min_key: leaf.min_key(),
        })
        .collect();
    check_chain(&chain)?;

    let mut entries: Vec<LogEntry> = log_chunks
        .iter()
        .flat_map(LogChunk::live_entries)
        .copied()
        .collect();
    let scanned: usize = entries.len();
    let max_clock: u64 = entries
        .iter()
        .map(LogEntry::clock)
        .chain(chain.iter().map(|c| c.leaf.timestamp()))
        .max()
        .unwrap_or(0);

    let thresholds = Thresholds::new(&chain);
    entries.retain(|e| e.clock() > thresholds.for_key(e.key()));
    entries.sort_unstable_by_key(LogEntry::clock);
    debug_log!(scanned, kept = entries.len(), "log entries filtered");

    let kept: Vec<&ChainLeaf<'_>> = unlink_empty(&chain);
    let kept_ids: Vec<LeafId> = kept.iter().map(|c| c.id).collect();
    leaves.rebuild_allocation(&kept_ids);
    let len: usize = kept.iter().map(|c| c.leaf.len()).sum();
    let index: InnerIndex = build_index(&kept);

    let core = TreeCore::new(config, Arc::clone(&leaves), index, len);
    core.logs.advance_clock(max_clock);

    let log = core.shared_log();
    for entry in &entries {
        let op: WriteOp = if entry.is_tombstone() {
            WriteOp::Delete
        } else {
            WriteOp::Put {
                value: entry.value(),
                update: true,
            }
        };
        core.write(log, entry.key(), op)?;
    }
    core.logs.adopt(log_chunks);

    let tree: CclBTree = CclBTree::start(core);
    info_log!(
        leaves = leaves.allocated(),
        keys = tree.len(),
        replayed = entries.len(),
        "tree recovered"
    );
    Ok(tree)
}

fn check_chain(chain: &[ChainLeaf<'_>]) -> Result<(), TreeError> {
    if chain.last().and_then(|c| c.leaf.next()).is_some() {
        return Err(TreeError::CorruptImage("leaf chain does not terminate"));
    }
    let mins: Vec<i64> = chain.iter().filter_map(|c| c.min_key).collect();
    if mins.windows(2).any(|w| w[0] >= w[1]) {
        return Err(TreeError::CorruptImage("leaf minimum keys are not increasing"));
    }
    Ok(())
}

/// Per-key replay threshold: the oldest timestamp among the leaves a key
/// could have been written to.
///
/// A key `k` lives between the last non-empty leaf with minimum `<= k` and
/// the next non-empty leaf (both included, with any empty leaves between).
/// An entry newer than every one of those leaves may be missing from them.
struct Thresholds {
    /// Minimum keys of the non-empty leaves, in chain order.
    mins: Vec<i64>,
    /// `stamps[j]` covers keys whose last non-empty leaf is `j - 1`;
    /// `stamps[0]` covers keys below every minimum.
    stamps: Vec<u64>,
}

impl Thresholds {
    fn new(chain: &[ChainLeaf<'_>]) -> Self {
        let filled: Vec<(usize, i64)> = chain
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.min_key.map(|m| (i, m)))
            .collect();
        let last: usize = chain.len().saturating_sub(1);
        let oldest = |from: usize, to: usize| -> u64 {
            chain[from..=to]
                .iter()
                .map(|c| c.leaf.timestamp())
                .min()
                .unwrap_or(0)
        };

        let mut stamps: Vec<u64> = Vec::with_capacity(filled.len() + 1);
        stamps.push(oldest(0, filled.first().map_or(last, |&(i, _)| i)));
        for (j, &(from, _)) in filled.iter().enumerate() {
            let to: usize = filled.get(j + 1).map_or(last, |&(i, _)| i);
            stamps.push(oldest(from, to));
        }

        Self {
            mins: filled.into_iter().map(|(_, m)| m).collect(),
            stamps,
        }
    }

    fn for_key(&self, key: i64) -> u64 {
        self.stamps[self.mins.partition_point(|&m| m <= key)]
    }
}

/// Drop empty leaves after the first from the chain. Returns the leaves
/// that stay linked.
fn unlink_empty<'c, 'a>(chain: &'c [ChainLeaf<'a>]) -> Vec<&'c ChainLeaf<'a>> {
    let mut kept: Vec<&ChainLeaf<'a>> = Vec::with_capacity(chain.len());
    for c in chain {
        match kept.last() {
            Some(prev) if c.leaf.is_empty() => {
                prev.leaf.relink(c.leaf.next(), prev.leaf.timestamp());
            }
            _ => kept.push(c),
        }
    }
    kept
}

/// One bottom node per leaf; the first covers everything below the second
/// leaf's minimum key.
fn build_index(kept: &[&ChainLeaf<'_>]) -> InnerIndex {
    let mut prev: *mut BottomNode = BottomNode::boxed(LeafId::FIRST, i64::MIN, None);
    let index = InnerIndex::new(prev);

    for c in kept.iter().skip(1) {
        // Every leaf after the first is non-empty once unlinking is done.
        let Some(low) = c.min_key else { continue };
        let node: *mut BottomNode = BottomNode::boxed(c.id, low, None);
        // SAFETY: `prev` was linked into the index above and is not freed
        // while the index lives.
        unsafe { &*prev }.lock().split_off(low, node);
        if let Some(pending) = index.link_bottom(low, node) {
            index.insert_separator(pending);
        }
        prev = node;
    }
    index
}
