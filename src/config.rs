//! Tree configuration.
//!
//! [`TreeConfig`] is a plain struct with `with_*` builders. Values can be
//! overridden from `CCLBTREE_*` environment variables through
//! [`TreeConfig::from_env`]; unparsable values are ignored with a warning.

use std::time::Duration;

use crate::error::TreeError;
use crate::log::DEFAULT_CHUNK_ENTRIES;
use crate::nodeversion::LockBackend;
use crate::tracing_helpers::warn_log;

/// Tunables for a [`CclBTree`](crate::CclBTree).
#[derive(Debug, Clone, PartialEq)]
pub struct TreeConfig {
    /// Number of shared logs used by calls made without a session.
    pub threads: usize,
    /// Maximum number of leaves in the arena.
    pub leaf_capacity: usize,
    /// Entries per log chunk.
    pub chunk_entries: usize,
    /// Chunks reserved together whenever the log free list runs dry.
    pub log_file_chunks: usize,
    /// Upper bound on log chunks in existence.
    pub max_log_chunks: usize,
    /// Appends between two checks of the recycle condition.
    pub recycle_check_interval: u64,
    /// Recycle once log bytes exceed this fraction of leaf bytes...
    pub log_to_leaf_ratio: f64,
    /// ...and superseded entries exceed this fraction of log bytes.
    pub garbage_ratio: f64,
    /// How long the recycler sleeps between flag checks.
    pub recycle_poll: Duration,
    /// Run the recycler on a background thread.
    pub background_recycler: bool,
    /// Requested mutual-exclusion policy.
    pub lock_backend: LockBackend,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            threads: std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
            leaf_capacity: 1 << 20,
            chunk_entries: DEFAULT_CHUNK_ENTRIES,
            log_file_chunks: 16,
            max_log_chunks: 4096,
            recycle_check_interval: 10_000,
            log_to_leaf_ratio: 0.2,
            garbage_ratio: 0.5,
            recycle_poll: Duration::from_millis(1),
            background_recycler: true,
            lock_backend: LockBackend::Optimistic,
        }
    }
}

impl TreeConfig {
    /// Defaults, then environment overrides.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply `CCLBTREE_*` overrides on top of `self`.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        override_from_env("CCLBTREE_THREADS", &mut self.threads);
        override_from_env("CCLBTREE_LEAF_CAPACITY", &mut self.leaf_capacity);
        override_from_env("CCLBTREE_CHUNK_ENTRIES", &mut self.chunk_entries);
        override_from_env("CCLBTREE_LOG_FILE_CHUNKS", &mut self.log_file_chunks);
        override_from_env("CCLBTREE_MAX_LOG_CHUNKS", &mut self.max_log_chunks);
        override_from_env(
            "CCLBTREE_RECYCLE_CHECK_INTERVAL",
            &mut self.recycle_check_interval,
        );
        override_from_env("CCLBTREE_LOCK_BACKEND", &mut self.lock_backend);

        let mut poll_us: u64 = u64::try_from(self.recycle_poll.as_micros()).unwrap_or(u64::MAX);
        override_from_env("CCLBTREE_RECYCLE_POLL_US", &mut poll_us);
        self.recycle_poll = Duration::from_micros(poll_us);

        if let Ok(raw) = std::env::var("CCLBTREE_BACKGROUND_RECYCLER") {
            match raw.trim() {
                "1" | "true" | "on" => self.background_recycler = true,
                "0" | "false" | "off" => self.background_recycler = false,
                _ => {
                    warn_log!(value = %raw, "ignoring CCLBTREE_BACKGROUND_RECYCLER");
                }
            }
        }
        self
    }

    /// Set [`TreeConfig::threads`].
    #[must_use]
    pub const fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Set [`TreeConfig::leaf_capacity`].
    #[must_use]
    pub const fn with_leaf_capacity(mut self, leaves: usize) -> Self {
        self.leaf_capacity = leaves;
        self
    }

    /// Set [`TreeConfig::chunk_entries`].
    #[must_use]
    pub const fn with_chunk_entries(mut self, entries: usize) -> Self {
        self.chunk_entries = entries;
        self
    }

    /// Set [`TreeConfig::log_file_chunks`].
    #[must_use]
    pub const fn with_log_file_chunks(mut self, chunks: usize) -> Self {
        self.log_file_chunks = chunks;
        self
    }

    /// Set [`TreeConfig::max_log_chunks`].
    #[must_use]
    pub const fn with_max_log_chunks(mut self, chunks: usize) -> Self {
        self.max_log_chunks = chunks;
        self
    }

    /// Set [`TreeConfig::recycle_check_interval`].
    #[must_use]
    pub const fn with_recycle_check_interval(mut self, appends: u64) -> Self {
        self.recycle_check_interval = appends;
        self
    }

    /// Set both recycle thresholds.
    #[must_use]
    pub const fn with_recycle_thresholds(mut self, log_to_leaf: f64, garbage: f64) -> Self {
        self.log_to_leaf_ratio = log_to_leaf;
        self.garbage_ratio = garbage;
        self
    }

    /// Set [`TreeConfig::recycle_poll`].
    #[must_use]
    pub const fn with_recycle_poll(mut self, poll: Duration) -> Self {
        self.recycle_poll = poll;
        self
    }

    /// Set [`TreeConfig::background_recycler`].
    #[must_use]
    pub const fn with_background_recycler(mut self, enabled: bool) -> Self {
        self.background_recycler = enabled;
        self
    }

    /// Set [`TreeConfig::lock_backend`].
    #[must_use]
    pub const fn with_lock_backend(mut self, backend: LockBackend) -> Self {
        self.lock_backend = backend;
        self
    }

    /// Check every field.
    ///
    /// # Errors
    /// [`TreeError::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<(), TreeError> {
        if self.threads == 0 {
            return Err(TreeError::InvalidConfig("threads must be at least 1"));
        }
        if self.leaf_capacity < 2 {
            return Err(TreeError::InvalidConfig("leaf_capacity must be at least 2"));
        }
        if self.chunk_entries == 0 {
            return Err(TreeError::InvalidConfig("chunk_entries must be at least 1"));
        }
        if self.log_file_chunks == 0 {
            return Err(TreeError::InvalidConfig("log_file_chunks must be at least 1"));
        }
        if self.max_log_chunks < self.log_file_chunks {
            return Err(TreeError::InvalidConfig(
                "max_log_chunks must be at least log_file_chunks",
            ));
        }
        if self.recycle_check_interval == 0 {
            return Err(TreeError::InvalidConfig(
                "recycle_check_interval must be at least 1",
            ));
        }
        if !(self.log_to_leaf_ratio >= 0.0 && self.log_to_leaf_ratio.is_finite()) {
            return Err(TreeError::InvalidConfig(
                "log_to_leaf_ratio must be finite and non-negative",
            ));
        }
        if !(0.0..=1.0).contains(&self.garbage_ratio) {
            return Err(TreeError::InvalidConfig("garbage_ratio must lie in [0, 1]"));
        }
        Ok(())
    }
}

fn override_from_env<T: std::str::FromStr>(name: &str, slot: &mut T) {
    let Ok(raw) = std::env::var(name) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(_) => {
            warn_log!(var = name, value = %raw, "ignoring unparsable override");
        }
    }
}
