//! # `CclBTree`
//!
//! A concurrent ordered `i64 → i64` map laid out for persistent memory.
//!
//! Leaves live in a persistent arena and are chained left to right. Every
//! leaf has a DRAM bottom node in front of it that buffers the two most
//! recent writes; a full buffer is merged into the leaf in one batch, which
//! turns several small persistent writes into one. Writes reach a
//! persistent log before they reach a buffer, so buffered data survives a
//! crash. A background recycler keeps the log from growing without bound.
//!
//! ```text
//!            inner nodes (DRAM, B-link)
//!                    │
//!   bottom ─► bottom ─► bottom        write buffers (DRAM)
//!     │         │         │
//!   leaf ──►  leaf ──►  leaf          persistent leaf chain
//!
//!   per-thread logs ──► recycler       persistent log (two generations)
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use ccl_btree::{CclBTree, TreeConfig};
//!
//! let tree = CclBTree::new(TreeConfig::default().with_threads(2)).unwrap();
//! let session = tree.session();
//! for k in 0..100 {
//!     tree.insert_with_session(&session, k, k * 10, false).unwrap();
//! }
//! assert_eq!(tree.scan(40, 3), vec![400, 410, 420]);
//!
//! // Power loss: only leaves and the log survive.
//! let image = tree.crash();
//! let tree = CclBTree::recover(image, TreeConfig::default()).unwrap();
//! assert_eq!(tree.search(99), Some(990));
//! ```
//!
//! ## Persistence
//!
//! The persistent region is simulated in process memory. Durability points
//! go through [`persist`]; [`CclBTree::crash`] hands back exactly what would
//! have survived.

#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod tracing_helpers;

pub mod bottom;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod index;
pub mod internode;
pub mod leaf;
pub mod log;
pub mod nodeversion;
pub mod ordering;
pub mod persist;
pub mod pool;
pub mod recycler;
pub mod stats;
pub mod tree;

pub use config::TreeConfig;
pub use error::TreeError;
pub use nodeversion::LockBackend;
pub use recycler::RecycleReport;
pub use stats::TreeStats;
pub use tree::{CclBTree, PersistentImage, Session};
