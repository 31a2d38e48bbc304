//! Crash simulation for leaf writes.
//!
//! Every line written back during an operation is recorded. Replaying the
//! first `n` recorded lines onto the pre-operation image yields the durable
//! state had power failed right after the `n`-th writeback. Each such image
//! must decode to a consistent leaf chain:
//!
//! - every set bitmap bit names a slot whose payload and fingerprint agree;
//! - no key that existed before the operation (and was not deleted by it)
//!   disappears;
//! - a leaf reachable through `next` is already fully durable;
//! - every key shows either its pre-batch or its post-batch state;
//! - once the left leaf carries the batch timestamp, the whole batch is
//!   visible, since recovery skips log entries older than that timestamp.

use std::collections::{BTreeMap, BTreeSet};

use super::*;
use crate::persist::recorder::{self, FlushedLine};

const WORDS: usize = LEAF_SIZE / 8;

fn addr_of(leaf: &LeafNode) -> usize {
    std::ptr::from_ref(leaf).addr()
}

/// Overlay recorded lines that fall inside `leaf_addr`'s block.
fn replay(image: &mut [u64; WORDS], leaf_addr: usize, lines: &[FlushedLine]) {
    for line in lines {
        if line.addr >= leaf_addr && line.addr < leaf_addr + LEAF_SIZE {
            let first = (line.addr - leaf_addr) / 8;
            image[first..first + 8].copy_from_slice(&line.words);
        }
    }
}

/// Decode an image into its meta and live entries, checking fingerprints.
#[expect(clippy::cast_possible_wrap, reason = "reinterpreting raw words")]
fn decode(image: &[u64; WORDS]) -> (LeafMeta, BTreeMap<i64, i64>) {
    let meta = LeafMeta::unpack(image[0]);
    let mut fps = [0u8; 16];
    fps[..8].copy_from_slice(&image[2].to_le_bytes());
    fps[8..].copy_from_slice(&image[3].to_le_bytes());

    let mut live = BTreeMap::new();
    for slot in 0..LEAF_SLOTS {
        if meta.bitmap & (1 << slot) == 0 {
            continue;
        }
        let key = image[4 + 2 * slot] as i64;
        let value = image[5 + 2 * slot] as i64;
        assert_eq!(
            fps[slot],
            fingerprint::hash(key),
            "slot {slot} visible with a stale fingerprint"
        );
        assert!(live.insert(key, value).is_none(), "key {key} visible twice");
    }
    (meta, live)
}

fn filled(keys: impl IntoIterator<Item = i64>) -> LeafNode {
    let pairs: Vec<(i64, i64)> = keys.into_iter().map(|k| (k, k + 1000)).collect();
    LeafNode::with_pairs(&pairs, 1)
}

const STAMP: u64 = 9;

/// Apply `ops` to a leaf holding `keys` (value `k + 1000`) and check the
/// durable image after every recorded writeback. Returns the number of
/// writebacks.
fn check_every_cut(keys: &[i64], ops: &[LeafOp], splits: bool) -> usize {
    let leaf = filled(keys.iter().copied());
    // A recycled spare still carrying another leaf's entries.
    let spare = filled([9000, 9010, 9020, 9030]);
    let spare_id = LeafId::from_raw(2).unwrap();

    let old: BTreeMap<i64, i64> = keys.iter().map(|&k| (k, k + 1000)).collect();
    let mut expected = old.clone();
    for op in ops {
        match *op {
            LeafOp::Put { key, value } => {
                expected.insert(key, value);
            }
            LeafOp::Delete { key } => {
                expected.remove(&key);
            }
        }
    }

    let left_before = leaf.words();
    let right_before = spare.words();
    let plan = leaf.plan(ops);
    assert_eq!(plan.needs_split(), splits);

    recorder::start();
    let spare_leaf = splits.then_some(SpareLeaf { id: spare_id, leaf: &spare });
    let outcome = leaf.apply(&plan, spare_leaf, STAMP);
    let lines = recorder::take();
    assert_eq!(matches!(outcome, ApplyOutcome::Split { .. }), splits);
    assert!(!lines.is_empty());
    let right_final = spare.words();

    for cut in 0..=lines.len() {
        let mut left = left_before;
        let mut right = right_before;
        replay(&mut left, addr_of(&leaf), &lines[..cut]);
        replay(&mut right, addr_of(&spare), &lines[..cut]);

        let (left_meta, mut visible) = decode(&left);
        if left_meta.next == Some(spare_id) {
            assert_eq!(right, right_final, "cut {cut}: right leaf linked before durable");
            let (_, right_live) = decode(&right);
            for (k, v) in right_live {
                assert!(visible.insert(k, v).is_none(), "cut {cut}: key {k} on both sides");
            }
        }

        let touched: BTreeSet<i64> = old
            .keys()
            .chain(expected.keys())
            .chain(visible.keys())
            .copied()
            .collect();
        for k in touched {
            let seen = visible.get(&k);
            assert!(
                seen == old.get(&k) || seen == expected.get(&k),
                "cut {cut}: key {k} shows {seen:?}"
            );
        }
        if left[1] == STAMP || cut == lines.len() {
            assert_eq!(visible, expected, "cut {cut}: batch timestamp on a partial batch");
        }
    }
    lines.len()
}

#[test]
fn test_crash_during_in_place_batch() {
    check_every_cut(
        &[10, 20, 30, 40, 50],
        &[
            LeafOp::Put { key: 20, value: 2 },
            LeafOp::Delete { key: 40 },
            LeafOp::Put { key: 60, value: 6 },
            LeafOp::Put { key: 5, value: 5 },
        ],
        false,
    );
}

#[test]
fn test_crash_during_single_insert() {
    check_every_cut(&[1, 2], &[LeafOp::Put { key: 3, value: 33 }], false);
}

#[test]
fn test_crash_reusing_payload_line_slot_of_full_leaf() {
    // Slot 5 sits in line 1; its new payload must not land under a bit
    // that is still set on media.
    let keys: Vec<i64> = (0..14).collect();
    let writebacks = check_every_cut(
        &keys,
        &[
            LeafOp::Put { key: 0, value: 9 },
            LeafOp::Delete { key: 5 },
            LeafOp::Put { key: 100, value: 1 },
        ],
        false,
    );
    // Delete commit, payload line, final commit.
    assert_eq!(writebacks, 3);
}

#[test]
fn test_crash_reusing_each_slot_of_full_leaf() {
    let keys: Vec<i64> = (0..14).collect();
    for victim in keys.iter().copied() {
        check_every_cut(
            &keys,
            &[
                LeafOp::Delete { key: victim },
                LeafOp::Put { key: 100 + victim, value: victim },
            ],
            false,
        );
    }
}

#[test]
fn test_crash_reusing_slots_in_two_lines() {
    let keys: Vec<i64> = (0..14).collect();
    check_every_cut(
        &keys,
        &[
            LeafOp::Delete { key: 1 },
            LeafOp::Delete { key: 12 },
            LeafOp::Put { key: 100, value: 1 },
            LeafOp::Put { key: 101, value: 2 },
        ],
        false,
    );
}

#[test]
fn test_crash_during_update_delete_insert_on_full_leaf() {
    let keys: Vec<i64> = (0..14).collect();
    check_every_cut(
        &keys,
        &[
            LeafOp::Put { key: 7, value: 77 },
            LeafOp::Delete { key: 13 },
            LeafOp::Put { key: 200, value: 2 },
        ],
        false,
    );
}

#[test]
fn test_crash_after_free_slots_run_out() {
    // Two slots free on media, one freed by the batch, three inserts.
    let keys: Vec<i64> = (0..12).collect();
    check_every_cut(
        &keys,
        &[
            LeafOp::Delete { key: 2 },
            LeafOp::Put { key: 100, value: 1 },
            LeafOp::Put { key: 101, value: 2 },
            LeafOp::Put { key: 102, value: 3 },
        ],
        false,
    );
}

#[test]
fn test_crash_during_split() {
    let keys: Vec<i64> = (0..14).map(|k| k * 10).collect();
    check_every_cut(
        &keys,
        &[
            LeafOp::Put { key: 5, value: 5 },
            LeafOp::Put { key: 95, value: 95 },
            LeafOp::Put { key: 200, value: 200 },
        ],
        true,
    );
}

#[test]
fn test_crash_during_split_with_every_insert_right() {
    let keys: Vec<i64> = (0..14).map(|k| k * 10).collect();
    check_every_cut(
        &keys,
        &[
            LeafOp::Put { key: 200, value: 1 },
            LeafOp::Put { key: 210, value: 2 },
        ],
        true,
    );
}

#[test]
fn test_crash_during_split_after_slot_reuse() {
    // The freed slot is reused first, then the leaf still overflows.
    let keys: Vec<i64> = (0..14).map(|k| k * 10).collect();
    check_every_cut(
        &keys,
        &[
            LeafOp::Delete { key: 60 },
            LeafOp::Put { key: -5, value: 1 },
            LeafOp::Put { key: 65, value: 2 },
            LeafOp::Put { key: 300, value: 3 },
        ],
        true,
    );
}
