//! Errors surfaced by the tree.
//!
//! Contention never shows up here: it is always retried internally. A
//! missing or already-present key is reported through the `bool` results of
//! the write API. What remains is running out of persistent space and bad
//! input.

use std::fmt as StdFmt;

/// Errors returned by tree construction, writes and recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeError {
    /// Every leaf in the arena is in use; a split could not allocate.
    ///
    /// The write that hit this left the tree unchanged.
    PoolExhausted {
        /// Arena capacity in leaves.
        capacity: usize,
    },

    /// The log reached its chunk limit.
    ///
    /// The write that hit this left the tree unchanged. A recycle pass may
    /// free chunks.
    LogExhausted {
        /// Maximum number of chunks.
        limit: usize,
    },

    /// A configuration value is out of range.
    InvalidConfig(&'static str),

    /// A persistent image is not usable for recovery.
    CorruptImage(&'static str),
}

impl StdFmt::Display for TreeError {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        match self {
            Self::PoolExhausted { capacity } => {
                write!(f, "leaf pool exhausted ({capacity} leaves)")
            }

            Self::LogExhausted { limit } => {
                write!(f, "log exhausted ({limit} chunks)")
            }

            Self::InvalidConfig(reason) => write!(f, "invalid configuration: {reason}"),

            Self::CorruptImage(reason) => write!(f, "corrupt persistent image: {reason}"),
        }
    }
}

impl std::error::Error for TreeError {}
