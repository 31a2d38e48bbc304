//! Memory orderings shared by every node type.
//!
//! Nodes are read optimistically and written under a version lock, so every
//! field access is one of a handful of patterns. Naming them keeps the
//! pairing between readers and writers visible at each access point.

use std::sync::atomic::Ordering;

/// Reading a node field outside the lock (optimistic readers).
/// Pairs with [`WRITE_ORD`].
pub const READ_ORD: Ordering = Ordering::Acquire;

/// Writing a node field while holding its lock.
/// Pairs with [`READ_ORD`].
pub const WRITE_ORD: Ordering = Ordering::Release;

/// CAS success: acquiring a version lock, raising a flag, swapping a root.
pub const CAS_SUCCESS: Ordering = Ordering::AcqRel;

/// CAS failure: only the observed value matters.
pub const CAS_FAILURE: Ordering = Ordering::Acquire;

/// Loads and stores made while the lock already orders them, and counters.
pub const RELAXED: Ordering = Ordering::Relaxed;

/// Snapshotting a version before an optimistic read.
pub const VERSION_ORD: Ordering = Ordering::Acquire;

/// Releasing a version lock. Publishes every write made under it.
pub const UNLOCK_ORD: Ordering = Ordering::Release;
