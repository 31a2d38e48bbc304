//! One-byte key fingerprints and the leaf pre-filter built on them.
//!
//! A leaf stores a fingerprint per slot. A lookup hashes the probe key once,
//! compares it against all fingerprints in a single pass, and only confirms
//! full key equality on the (rare) matching lanes.
//!
//! # Architecture Support
//!
//! - **`x86_64`**: SSE2 byte compare + movemask (baseline, no detection needed)
//! - **Other**: SWAR zero-byte detection over two `u64` words

/// Number of fingerprint lanes compared per pass (14 live + 2 padding).
pub const LANES: usize = 16;

/// Hash a key to one byte by folding all eight bytes together.
#[inline]
#[must_use]
#[expect(clippy::cast_possible_truncation, reason = "the fold keeps the low byte on purpose")]
#[expect(clippy::cast_sign_loss, reason = "keys are hashed by bit pattern")]
pub const fn hash(key: i64) -> u8 {
    let mut x: u64 = key as u64;
    x ^= x >> 32;
    x ^= x >> 16;
    x ^= x >> 8;
    (x & 0xff) as u8
}

/// Bitmask of lanes whose byte equals `fp`.
///
/// `lo` holds lanes 0-7 and `hi` lanes 8-15, little-endian (lane `i` is
/// byte `i % 8` of its word). Bit `i` of the result is set iff lane `i`
/// matches. Callers mask the result with the leaf bitmap.
#[inline]
#[must_use]
pub fn match_mask(lo: u64, hi: u64, fp: u8) -> u16 {
    #[cfg(target_arch = "x86_64")]
    {
        sse2_impl::match_mask(lo, hi, fp)
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        match_mask_swar(lo, hi, fp)
    }
}

// ============================================================================
//  SWAR Fallback (always available)
// ============================================================================

/// SWAR lane match. Exact: no false positives from borrows.
#[inline]
#[must_use]
#[allow(dead_code)] // Used on non-x86 and in tests
pub fn match_mask_swar(lo: u64, hi: u64, fp: u8) -> u16 {
    let broadcast: u64 = u64::from(fp) * 0x0101_0101_0101_0101;
    u16::from(zero_lanes(lo ^ broadcast)) | (u16::from(zero_lanes(hi ^ broadcast)) << 8)
}

/// One bit per zero byte of `x`, byte `i` -> bit `i`.
#[inline]
#[expect(clippy::cast_possible_truncation, reason = "top byte holds the gathered bits")]
const fn zero_lanes(x: u64) -> u8 {
    const LOW7: u64 = 0x7f7f_7f7f_7f7f_7f7f;
    // High bit of each byte is set iff that byte is zero.
    let t: u64 = !(((x & LOW7) + LOW7) | x | LOW7);
    // Gather bit 8i+7 into bit 56+i.
    ((t >> 7).wrapping_mul(0x0102_0408_1020_4080) >> 56) as u8
}

// ============================================================================
//  SSE2 Implementation (x86_64, always available)
// ============================================================================

#[cfg(target_arch = "x86_64")]
mod sse2_impl {
    use std::arch::x86_64::{_mm_cmpeq_epi8, _mm_movemask_epi8, _mm_set_epi64x, _mm_set1_epi8};

    #[inline]
    #[expect(clippy::cast_possible_wrap, reason = "bit patterns are reinterpreted")]
    #[expect(clippy::cast_possible_truncation, reason = "movemask yields 16 bits")]
    #[expect(clippy::cast_sign_loss, reason = "movemask is non-negative")]
    pub(super) fn match_mask(lo: u64, hi: u64, fp: u8) -> u16 {
        // SAFETY: SSE2 is part of the x86_64 baseline; these intrinsics only
        // touch registers.
        unsafe {
            let lanes = _mm_set_epi64x(hi as i64, lo as i64);
            let probe = _mm_set1_epi8(fp as i8);
            _mm_movemask_epi8(_mm_cmpeq_epi8(lanes, probe)) as u16
        }
    }
}
