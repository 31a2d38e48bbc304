//! Shared test setup: tracing subscriber and tree helpers.
//!
//! `RUST_LOG` filters events (default `info`). Events go to the console
//! unless `CCLBTREE_LOG_CONSOLE=0`, and as NDJSON to
//! `$CCLBTREE_LOG_DIR/ccl_btree.jsonl` (default `logs/`).

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::env;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Once;

use ccl_btree::{CclBTree, TreeConfig};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

static INIT: Once = Once::new();

/// Install the test subscriber once per process.
pub fn init_tracing() {
    INIT.call_once(setup_tracing);
}

/// Small chunks and no background thread unless a test asks for one.
pub fn test_config(threads: usize) -> TreeConfig {
    TreeConfig::default()
        .with_threads(threads)
        .with_leaf_capacity(1 << 16)
        .with_chunk_entries(512)
        .with_background_recycler(false)
}

/// A tree built from [`test_config`].
#[expect(clippy::expect_used)]
pub fn tree(threads: usize) -> CclBTree {
    CclBTree::new(test_config(threads)).expect("test config is valid")
}

/// Assert the whole tree equals `model`, through both scan and search.
pub fn assert_matches(tree: &CclBTree, model: &BTreeMap<i64, i64>) {
    let pairs: Vec<(i64, i64)> = tree.scan_pairs(i64::MIN, usize::MAX);
    let expected: Vec<(i64, i64)> = model.iter().map(|(&k, &v)| (k, v)).collect();
    assert_eq!(pairs, expected);
    for (&k, &v) in model {
        assert_eq!(tree.search(k), Some(v), "key {k}");
    }
    assert_eq!(tree.len(), model.len());
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

#[expect(clippy::expect_used)]
fn setup_tracing() {
    let dir = env::var("CCLBTREE_LOG_DIR").map_or_else(|_| PathBuf::from("logs"), PathBuf::from);
    std::fs::create_dir_all(&dir).expect("create log directory");
    // Append: nextest runs each test in its own process.
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("ccl_btree.jsonl"))
        .expect("open log file");

    let console = env::var("CCLBTREE_LOG_CONSOLE").map_or(true, |v| v != "0").then(|| {
        tracing_subscriber::fmt::layer()
            .with_thread_names(true)
            .compact()
            .with_filter(filter())
    });
    let json = tracing_subscriber::fmt::layer()
        .with_writer(std::sync::Mutex::new(file))
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .json()
        .with_filter(filter());

    let _ = Registry::default().with(console).with(json).try_init();
}
