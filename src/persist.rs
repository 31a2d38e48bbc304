//! Persistence primitives.
//!
//! Memory only becomes durable through [`flush`]: every cache line in the
//! range is written back, then a store fence orders the writebacks before
//! any later store. Code that needs several regions durable before a single
//! "commit" store issues [`flush_nofence`] per region followed by one
//! [`fence`].
//!
//! # Platforms
//!
//! - `x86_64`: `clflush` per line + `sfence`.
//! - With the `eadr` feature the caches are inside the persistence domain,
//!   so writebacks are skipped and only the fence is kept.
//! - Other targets: writebacks are no-ops and the fence is a sequentially
//!   consistent atomic fence.

use std::ptr;
#[cfg(not(target_arch = "x86_64"))]
use std::sync::atomic::{self, Ordering};

/// Size of one CPU cache line in bytes.
pub const CACHE_LINE_SIZE: usize = 64;

/// Write back every cache line overlapping `[addr, addr + len)` and fence.
#[inline]
pub fn flush(addr: *const u8, len: usize) {
    flush_nofence(addr, len);
    fence();
}

/// Write back every cache line overlapping `[addr, addr + len)`.
///
/// No ordering is implied until the next [`fence`].
#[inline]
pub fn flush_nofence(addr: *const u8, len: usize) {
    if len == 0 {
        return;
    }

    let end: usize = addr.addr() + len;
    let mut line: usize = addr.addr() & !(CACHE_LINE_SIZE - 1);

    while line < end {
        let line_ptr: *const u8 = addr.with_addr(line);
        writeback_line(line_ptr);

        #[cfg(test)]
        recorder::record(line_ptr);

        line += CACHE_LINE_SIZE;
    }
}

/// Flush the memory backing `value`.
#[inline]
pub fn flush_value<T>(value: &T) {
    flush(ptr::from_ref(value).cast::<u8>(), size_of::<T>());
}

/// Store fence: all prior writebacks complete before later stores.
#[inline]
pub fn fence() {
    #[cfg(target_arch = "x86_64")]
    {
        // SAFETY: sfence has no memory operands; SSE is baseline on x86_64.
        unsafe { std::arch::x86_64::_mm_sfence() };
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        atomic::fence(Ordering::SeqCst);
    }
}

#[cfg(all(target_arch = "x86_64", not(feature = "eadr")))]
#[inline(always)]
fn writeback_line(line: *const u8) {
    // SAFETY: callers derive `line` from a live allocation; clflush only
    // needs the address to be mapped.
    unsafe { std::arch::x86_64::_mm_clflush(line) };
}

#[cfg(not(all(target_arch = "x86_64", not(feature = "eadr"))))]
#[inline(always)]
const fn writeback_line(_line: *const u8) {}

// ============================================================================
//  Flush Recorder (test builds only)
// ============================================================================
