//! Optimistic versioned lock shared by inner pages and bottom nodes.
//!
//! [`NodeVersion`] is a single `u64` counter: odd means locked. Writers CAS
//! an even value `v` to `v + 1` and release by storing `v + 2`, so every
//! completed critical section advances the version by exactly two.
//!
//! # Concurrency Model
//! 1. Readers: call [`NodeVersion::stable`], read the node without locking,
//!    then call [`NodeVersion::has_changed`]. A change means the read may be
//!    torn and must be retried.
//! 2. Writers: call [`NodeVersion::lock`] to get a [`LockGuard`], modify the
//!    node, let the guard drop.
//!
//! Nothing here blocks on an OS primitive. Waiting is a [`Backoff`] loop.

use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, RELAXED, UNLOCK_ORD, VERSION_ORD};
use crate::tracing_helpers::warn_log;

/// Lock bit: the node is held by a writer.
pub const LOCK_BIT: u64 = 1;

// ============================================================================
//  Backoff
// ============================================================================

/// Bounded-cost waiting for contended locks and unstable versions.
///
/// Phase 1 (0-64): spin - handles most cases (short critical sections)
/// Phase 2 (64-1024): yield - the holder may be descheduled
/// Phase 3 (1024+): short sleep - the holder is flushing or recycling
#[derive(Debug, Default, Clone)]
pub struct Backoff {
    step: u32,
}

impl Backoff {
    const SPIN_LIMIT: u32 = 64;
    const YIELD_LIMIT: u32 = 1024;
    const SLEEP: Duration = Duration::from_micros(10);

    /// Start a fresh backoff sequence.
    #[must_use]
    pub const fn new() -> Self {
        Self { step: 0 }
    }

    /// Wait a little longer than last time.
    #[inline]
    pub fn snooze(&mut self) {
        self.step = self.step.saturating_add(1);

        if self.step <= Self::SPIN_LIMIT {
            for _ in 0..(1u32 << self.step.min(6)) {
                std::hint::spin_loop();
            }
        } else if self.step <= Self::YIELD_LIMIT {
            std::thread::yield_now();
        } else {
            std::thread::sleep(Self::SLEEP);
        }
    }

    /// Number of times [`Backoff::snooze`] was called.
    #[must_use]
    pub const fn steps(&self) -> u32 {
        self.step
    }
}

// ============================================================================
//  NodeVersion
// ============================================================================

/// A versioned lock: odd = locked, even = quiescent.
///
/// # Example
///
/// ```rust
/// use ccl_btree::nodeversion::NodeVersion;
///
/// let v = NodeVersion::new();
/// let before = v.stable();
/// {
///     let _guard = v.lock();
///     assert!(v.is_locked());
/// }
/// assert!(v.has_changed(before));
/// assert_eq!(v.value(), before + 2);
/// ```
#[derive(Debug, Default)]
pub struct NodeVersion {
    value: AtomicU64,
}

/// Proof that a [`NodeVersion`] is held.
///
/// The lock is released when the guard drops, even during unwinding.
/// Guards are `!Send` and `!Sync` via `PhantomData<*mut ()>` so a lock is
/// always released by the thread that took it.
#[derive(Debug)]
#[must_use = "releasing a lock without using the guard is a logic error"]
pub struct LockGuard<'a> {
    version: &'a NodeVersion,
    locked_value: u64,
    _marker: PhantomData<*mut ()>,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        // odd -> even, two past the value observed before locking.
        self.version
            .value
            .store(self.locked_value + LOCK_BIT, UNLOCK_ORD);
    }
}

impl NodeVersion {
    /// Create an unlocked version at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Create a version from a raw value.
    #[cfg(test)]
    #[must_use]
    pub(crate) const fn from_value(value: u64) -> Self {
        Self {
            value: AtomicU64::new(value),
        }
    }

    /// Raw version value.
    #[inline]
    #[must_use]
    pub fn value(&self) -> u64 {
        self.value.load(RELAXED)
    }

    /// Whether a writer currently holds the lock.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.value.load(RELAXED) & LOCK_BIT != 0
    }

    // ========================================================================
    //  Optimistic Reads
    // ========================================================================

    /// Wait until no writer holds the lock and return the even version.
    #[inline]
    #[must_use]
    pub fn stable(&self) -> u64 {
        let mut backoff = Backoff::new();
        loop {
            let value: u64 = self.value.load(VERSION_ORD);
            if value & LOCK_BIT == 0 {
                return value;
            }
            backoff.snooze();
        }
    }

    /// Whether any writer entered the node since `old` was taken.
    ///
    /// The acquire fence keeps the optimistic reads that preceded this
    /// check from sinking below the version load.
    #[inline]
    #[must_use]
    pub fn has_changed(&self, old: u64) -> bool {
        std::sync::atomic::fence(VERSION_ORD);
        self.value.load(RELAXED) != old
    }

    // ========================================================================
    //  Locking
    // ========================================================================

    /// Acquire the lock, waiting with [`Backoff`] while it is held.
    #[must_use = "releasing a lock without using the guard is a logic error"]
    pub fn lock(&self) -> LockGuard<'_> {
        let mut backoff = Backoff::new();
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            backoff.snooze();
        }
    }

    /// Acquire the lock only if it is free right now.
    #[must_use]
    pub fn try_lock(&self) -> Option<LockGuard<'_>> {
        let value: u64 = self.value.load(RELAXED);
        if value & LOCK_BIT != 0 {
            return None;
        }

        let locked: u64 = value | LOCK_BIT;
        self.value
            .compare_exchange(value, locked, CAS_SUCCESS, CAS_FAILURE)
            .ok()
            .map(|_| LockGuard {
                version: self,
                locked_value: locked,
                _marker: PhantomData,
            })
    }
}

// ============================================================================
//  Lock Backend
// ============================================================================

/// Mutual-exclusion policy for inner pages and bottom nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockBackend {
    /// Versioned lock with optimistic readers. Portable default.
    #[default]
    Optimistic,

    /// Hardware transactional execution with a software-visible lock bit.
    Transactional,
}

impl LockBackend {
    /// Whether the CPU advertises restricted transactional memory.
    #[must_use]
    pub fn hardware_transactions_available() -> bool {
        #[cfg(target_arch = "x86_64")]
        {
            is_x86_feature_detected!("rtm")
        }

        #[cfg(not(target_arch = "x86_64"))]
        {
            false
        }
    }

    /// The backend that will actually run for a requested one.
    ///
    /// Transactional execution needs both CPU support and transaction
    /// intrinsics, which stable Rust does not expose, so a transactional
    /// request always falls back to [`LockBackend::Optimistic`].
    #[must_use]
    pub fn resolve(self) -> Self {
        match self {
            Self::Optimistic => Self::Optimistic,
            Self::Transactional => {
                if Self::hardware_transactions_available() {
                    warn_log!("rtm detected but transaction intrinsics are unavailable; using optimistic locks");
                } else {
                    warn_log!("rtm not supported by this CPU; using optimistic locks");
                }
                Self::Optimistic
            }
        }
    }

    /// Lower-case name, as accepted by [`FromStr`].
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Optimistic => "optimistic",
            Self::Transactional => "transactional",
        }
    }
}

impl fmt::Display for LockBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LockBackend {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "optimistic" | "olc" => Ok(Self::Optimistic),
            "transactional" | "htm" | "rtm" => Ok(Self::Transactional),
            _ => Err("lock backend must be `optimistic` or `transactional`"),
        }
    }
}
