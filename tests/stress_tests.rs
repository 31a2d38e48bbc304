//! Stress tests for concurrent `CclBTree` operations.
//!
//! These tests are designed to expose race conditions through:
//! - Many writer threads splitting the same leaves
//! - Readers and scanners running against in-flight splits
//! - Leaves emptied and released while readers still route to them
//! - Recycle passes racing with writers
//! - Crashes taken right after heavy concurrent traffic
//!
//! Run all stress tests:
//! ```bash
//! cargo nextest run --test stress_tests --release
//! ```
//!
//! With recycler and split events:
//! ```bash
//! RUST_LOG=ccl_btree=debug cargo nextest run --features tracing --test stress_tests --release
//! ```

#![allow(clippy::pedantic)]
#![expect(clippy::unwrap_used)]
#![allow(clippy::panic)]

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use ccl_btree::{CclBTree, TreeConfig};

// =============================================================================
// Helpers
// =============================================================================

/// Verify all keys are findable, panic with details if any missing.
fn verify_all_keys<F>(tree: &CclBTree, key_gen: F, count: usize, test_name: &str)
where
    F: Fn(usize) -> (i64, i64),
{
    let mut missing = Vec::new();
    let mut wrong = Vec::new();

    for i in 0..count {
        let (key, value) = key_gen(i);
        match tree.search(key) {
            None => missing.push(key),
            Some(v) if v != value => wrong.push((key, v, value)),
            Some(_) => {}
        }
    }

    if !missing.is_empty() || !wrong.is_empty() {
        panic!(
            "{}: missing {} keys (first 20: {:?}), {} wrong values (first 5: {:?})\n\
             tree.len()={}, expected={}",
            test_name,
            missing.len(),
            &missing[..missing.len().min(20)],
            wrong.len(),
            &wrong[..wrong.len().min(5)],
            tree.len(),
            count
        );
    }
}

fn spawn_writers<F>(tree: &Arc<CclBTree>, threads: usize, per_thread: usize, key_of: F) -> Vec<thread::JoinHandle<()>>
where
    F: Fn(usize, usize) -> i64 + Send + Sync + Copy + 'static,
{
    (0..threads)
        .map(|t| {
            let tree = Arc::clone(tree);
            thread::spawn(move || {
                let session = tree.session();
                for i in 0..per_thread {
                    let key = key_of(t, i);
                    assert!(tree.insert_with_session(&session, key, key * 2, false).unwrap());
                }
            })
        })
        .collect()
}

// =============================================================================
// WRITER TESTS
// =============================================================================

/// Each thread owns a contiguous key range.
#[test]
fn disjoint_ranges_8_threads() {
    common::init_tracing();

    const NUM_THREADS: usize = 8;
    const KEYS_PER_THREAD: usize = 5_000;
    const TOTAL_KEYS: usize = NUM_THREADS * KEYS_PER_THREAD;

    let tree = Arc::new(common::tree(NUM_THREADS));
    let handles = spawn_writers(&tree, NUM_THREADS, KEYS_PER_THREAD, |t, i| {
        (t * KEYS_PER_THREAD + i) as i64
    });
    for h in handles {
        h.join().unwrap();
    }

    verify_all_keys(&tree, |i| (i as i64, i as i64 * 2), TOTAL_KEYS, "disjoint_ranges_8_threads");
    assert_eq!(tree.len(), TOTAL_KEYS);
    let stats = tree.stats();
    assert_eq!(stats.leaves, stats.bottom_nodes);
}

/// Threads interleave keys, so every leaf is split by several writers.
#[test]
fn interleaved_keys_8_threads() {
    common::init_tracing();

    const NUM_THREADS: usize = 8;
    const KEYS_PER_THREAD: usize = 4_000;
    const TOTAL_KEYS: usize = NUM_THREADS * KEYS_PER_THREAD;

    let tree = Arc::new(common::tree(NUM_THREADS));
    let handles = spawn_writers(&tree, NUM_THREADS, KEYS_PER_THREAD, |t, i| {
        (i * NUM_THREADS + t) as i64
    });
    for h in handles {
        h.join().unwrap();
    }

    verify_all_keys(&tree, |i| (i as i64, i as i64 * 2), TOTAL_KEYS, "interleaved_keys_8_threads");
    assert_eq!(tree.len(), TOTAL_KEYS);
    assert!(tree.height() >= 2);
}

/// Scattered keys through the shared logs instead of sessions.
#[test]
fn scattered_keys_shared_logs() {
    common::init_tracing();

    const NUM_THREADS: usize = 6;
    const KEYS_PER_THREAD: usize = 3_000;

    let scatter = |t: usize, i: usize| -> i64 {
        ((t * KEYS_PER_THREAD + i) as i64).wrapping_mul(0x9E37_79B9_7F4A_7C15u64 as i64)
    };

    let tree = Arc::new(common::tree(2));
    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|t| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                for i in 0..KEYS_PER_THREAD {
                    let key = scatter(t, i);
                    tree.insert(key, i as i64, false).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    for t in 0..NUM_THREADS {
        for i in 0..KEYS_PER_THREAD {
            assert_eq!(tree.search(scatter(t, i)), Some(i as i64));
        }
    }
    let pairs = tree.scan_pairs(i64::MIN, usize::MAX);
    assert_eq!(pairs.len(), NUM_THREADS * KEYS_PER_THREAD);
    assert!(pairs.windows(2).all(|w| w[0].0 < w[1].0));
}

/// Writers upsert and remove a tiny shared key set.
#[test]
fn hot_keys_upsert_remove() {
    common::init_tracing();

    const NUM_THREADS: usize = 8;
    const ROUNDS: usize = 3_000;
    const HOT: i64 = 16;

    let tree = Arc::new(common::tree(NUM_THREADS));
    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|t| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                let session = tree.session();
                for i in 0..ROUNDS {
                    let key = (i as i64 * 7 + t as i64) % HOT;
                    if i % 3 == 0 {
                        tree.remove_with_session(&session, key).unwrap();
                    } else {
                        tree.insert_with_session(&session, key, key * 100 + t as i64, true).unwrap();
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let mut live = 0;
    for key in 0..HOT {
        if let Some(v) = tree.search(key) {
            live += 1;
            assert_eq!(v / 100, key, "value written for another key");
        }
    }
    assert_eq!(tree.len(), live);
}

// =============================================================================
// READERS AGAINST WRITERS
// =============================================================================

/// A key published by a writer must stay visible to every reader.
#[test]
fn readers_see_published_keys() {
    common::init_tracing();

    const WRITERS: usize = 4;
    const READERS: usize = 4;
    const KEYS_PER_WRITER: usize = 5_000;

    let tree = Arc::new(common::tree(WRITERS));
    let progress: Arc<Vec<AtomicUsize>> = Arc::new((0..WRITERS).map(|_| AtomicUsize::new(0)).collect());
    let done = Arc::new(AtomicBool::new(false));

    let writers: Vec<_> = (0..WRITERS)
        .map(|t| {
            let tree = Arc::clone(&tree);
            let progress = Arc::clone(&progress);
            thread::spawn(move || {
                let session = tree.session();
                for i in 0..KEYS_PER_WRITER {
                    let key = (i * WRITERS + t) as i64;
                    tree.insert_with_session(&session, key, key, false).unwrap();
                    progress[t].store(i + 1, Ordering::Release);
                }
            })
        })
        .collect();

    let readers: Vec<_> = (0..READERS)
        .map(|r| {
            let tree = Arc::clone(&tree);
            let progress = Arc::clone(&progress);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut round = 0usize;
                while !done.load(Ordering::Acquire) {
                    let t = (round + r) % WRITERS;
                    let published = progress[t].load(Ordering::Acquire);
                    if published > 0 {
                        let i = (round * 31) % published;
                        let key = (i * WRITERS + t) as i64;
                        assert_eq!(tree.search(key), Some(key), "published key {key} not visible");
                    }
                    round += 1;
                }
            })
        })
        .collect();

    for h in writers {
        h.join().unwrap();
    }
    done.store(true, Ordering::Release);
    for h in readers {
        h.join().unwrap();
    }
    assert_eq!(tree.len(), WRITERS * KEYS_PER_WRITER);
}

/// Scans racing with splits stay sorted and never invent values.
#[test]
fn scans_during_splits() {
    common::init_tracing();

    const WRITERS: usize = 4;
    const KEYS_PER_WRITER: usize = 4_000;

    let tree = Arc::new(common::tree(WRITERS));
    let done = Arc::new(AtomicBool::new(false));

    let writers = spawn_writers(&tree, WRITERS, KEYS_PER_WRITER, |t, i| (i * WRITERS + t) as i64);

    let scanners: Vec<_> = (0..2)
        .map(|s| {
            let tree = Arc::clone(&tree);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut start = s as i64 * 1_000;
                while !done.load(Ordering::Acquire) {
                    let pairs = tree.scan_pairs(start, 64);
                    assert!(pairs.len() <= 64);
                    assert!(pairs.windows(2).all(|w| w[0].0 < w[1].0), "scan out of order");
                    for &(k, v) in &pairs {
                        assert!(k >= start);
                        assert_eq!(v, k * 2);
                    }
                    start = (start + 97) % (WRITERS * KEYS_PER_WRITER) as i64;
                }
            })
        })
        .collect();

    for h in writers {
        h.join().unwrap();
    }
    done.store(true, Ordering::Release);
    for h in scanners {
        h.join().unwrap();
    }

    let all = tree.scan(0, usize::MAX);
    assert_eq!(all.len(), WRITERS * KEYS_PER_WRITER);
}

/// Writers repeatedly fill and empty their own key blocks, so leaves are
/// released and reused under readers. Anchor keys between the blocks never
/// move and must stay visible throughout.
#[test]
fn releases_during_reads() {
    common::init_tracing();

    const WRITERS: usize = 4;
    const ROUNDS: usize = 40;
    const BLOCK: i64 = 10_000;
    const CHURN: i64 = 200;

    let tree = Arc::new(common::tree(WRITERS));
    let anchors: Vec<i64> = (0..WRITERS as i64)
        .flat_map(|t| [t * BLOCK + BLOCK / 2, t * BLOCK + BLOCK - 1])
        .collect();
    for &k in &anchors {
        tree.insert(k, k, false).unwrap();
    }
    let anchors = Arc::new(anchors);
    let done = Arc::new(AtomicBool::new(false));

    let writers: Vec<_> = (0..WRITERS)
        .map(|t| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                let session = tree.session();
                let base = t as i64 * BLOCK;
                for _ in 0..ROUNDS {
                    for k in base..base + CHURN {
                        assert!(tree.insert_with_session(&session, k, k, false).unwrap());
                    }
                    for k in base..base + CHURN {
                        assert!(tree.remove_with_session(&session, k).unwrap());
                    }
                }
            })
        })
        .collect();

    let readers: Vec<_> = (0..2)
        .map(|r| {
            let tree = Arc::clone(&tree);
            let anchors = Arc::clone(&anchors);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut round = r;
                while !done.load(Ordering::Acquire) {
                    let anchor = anchors[round % anchors.len()];
                    assert_eq!(tree.search(anchor), Some(anchor), "anchor {anchor} lost");

                    let pairs = tree.scan_pairs(anchor - BLOCK / 2, 512);
                    assert!(pairs.windows(2).all(|w| w[0].0 < w[1].0), "scan out of order");
                    assert!(pairs.iter().all(|&(k, v)| k == v));
                    round += 1;
                }
            })
        })
        .collect();

    for h in writers {
        h.join().unwrap();
    }
    done.store(true, Ordering::Release);
    for h in readers {
        h.join().unwrap();
    }

    let stats = tree.stats();
    assert!(stats.leaves_freed > 0);
    assert_eq!(stats.leaves, stats.bottom_nodes);
    assert_eq!(tree.scan(i64::MIN, usize::MAX), *anchors);

    let tree = Arc::into_inner(tree).unwrap();
    let tree = CclBTree::recover(tree.crash(), common::test_config(WRITERS)).unwrap();
    assert_eq!(tree.scan(i64::MIN, usize::MAX), *anchors);
}

// =============================================================================
// RECYCLING AGAINST WRITERS
// =============================================================================

/// Explicit recycle passes racing with writers lose nothing, before and
/// after a crash.
#[test]
fn recycle_passes_during_writes() {
    common::init_tracing();

    const WRITERS: usize = 4;
    const KEYS_PER_WRITER: usize = 4_000;

    let tree = Arc::new(common::tree(WRITERS));
    let done = Arc::new(AtomicBool::new(false));
    let writers = spawn_writers(&tree, WRITERS, KEYS_PER_WRITER, |t, i| (i * WRITERS + t) as i64);

    let recycler = {
        let tree = Arc::clone(&tree);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut passes = 0u64;
            while !done.load(Ordering::Acquire) {
                tree.recycle_now().unwrap();
                passes += 1;
            }
            passes
        })
    };

    for h in writers {
        h.join().unwrap();
    }
    done.store(true, Ordering::Release);
    let passes = recycler.join().unwrap();
    assert!(passes > 0);

    let total = WRITERS * KEYS_PER_WRITER;
    verify_all_keys(&tree, |i| (i as i64, i as i64 * 2), total, "recycle_passes_during_writes");

    let tree = Arc::into_inner(tree).unwrap();
    let tree = CclBTree::recover(tree.crash(), common::test_config(WRITERS)).unwrap();
    verify_all_keys(&tree, |i| (i as i64, i as i64 * 2), total, "recycle_passes_during_writes/recovered");
    assert_eq!(tree.len(), total);
}

/// The background recycler, triggered by the write path, keeps the log
/// bounded under sustained overwrites.
#[test]
fn background_recycler_bounds_log() {
    common::init_tracing();

    const WRITERS: usize = 4;
    const ROUNDS: usize = 20_000;
    const KEYS: i64 = 512;

    let config = TreeConfig::default()
        .with_threads(WRITERS)
        .with_leaf_capacity(1 << 12)
        .with_chunk_entries(256)
        .with_recycle_check_interval(64)
        .with_recycle_thresholds(0.5, 0.3)
        .with_recycle_poll(Duration::from_millis(1));
    let tree = Arc::new(CclBTree::new(config).unwrap());
    let last: Arc<Vec<AtomicI64>> = Arc::new((0..KEYS).map(|_| AtomicI64::new(-1)).collect());

    let writers: Vec<_> = (0..WRITERS)
        .map(|t| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                let session = tree.session();
                for i in 0..ROUNDS {
                    // Each thread owns the keys congruent to t, so the final
                    // value per key is known.
                    let key = ((i * WRITERS + t) as i64) % KEYS;
                    tree.insert_with_session(&session, key, i as i64, true).unwrap();
                }
            })
        })
        .collect();
    for h in writers {
        h.join().unwrap();
    }

    for key in 0..KEYS {
        let t = key as usize % WRITERS;
        let i = (0..ROUNDS).rev().find(|&i| ((i * WRITERS + t) as i64) % KEYS == key).unwrap();
        last[key as usize].store(i as i64, Ordering::Relaxed);
    }

    let stats = tree.stats();
    assert!(stats.recycles > 0, "recycler never ran: {stats}");

    let expected: BTreeMap<i64, i64> = (0..KEYS)
        .map(|k| (k, last[k as usize].load(Ordering::Relaxed)))
        .collect();
    common::assert_matches(&tree, &expected);

    let tree = Arc::into_inner(tree).unwrap();
    let tree = CclBTree::recover(tree.crash(), common::test_config(WRITERS)).unwrap();
    common::assert_matches(&tree, &expected);
}
