//! The bucket dispatcher routes every allocation request to one of
//! [`BUCKET_COUNT`] fixed size classes, spaced on a "half-exponential"
//! schedule: each class is either a power of two or the midpoint
//! between two consecutive powers of two.  Unlike Slitter's `Class`,
//! this schedule is not user-configurable: it is baked in at compile
//! time so that `address_to_class` (see `sapa`) can recover a class
//! index from a pointer alone.
use static_assertions::const_assert;
use static_assertions::const_assert_eq;

/// log2 of the number of size classes (4-bit index).
pub const BUCKET_COUNT_EXP: u32 = 4;
/// Number of size classes; also the number of stripes in a SAPA arena.
pub const BUCKET_COUNT: usize = 1 << BUCKET_COUNT_EXP;

/// Requests at or below this size are serviced by the bucket
/// dispatcher's per-class free lists; larger requests go to the bulk
/// allocator.
pub const MAX_BUCKET: usize = crate::vm::PAGE_SIZE / 16;

const_assert_eq!(MAX_BUCKET, 256);

/// Maps a size class index to the number of bytes in that class's
/// slots, following the "half-exponential" schedule: class `2k` is
/// `2^(k+3)`, and class `2k+1` is the midpoint `1.5 * 2^(k+3)`.
///
/// This mirrors the reference allocator's `indexToBucketSizeHalfExp`.
#[inline(always)]
pub const fn class_size(idx: u8) -> usize {
    let half = (idx >> 1) as u32;
    let base = 1usize << (half + 3);
    // When `idx` is odd, add the midpoint `base / 2`; when even, add 0.
    let is_odd = (idx & 1) as usize;
    let addition = is_odd.wrapping_neg() & (1usize << (half + 2));
    let raw = base + addition;
    // Round up to a 4-byte boundary. Every raw size above class 1 is
    // already a multiple of 8, so this only ever does work for class
    // 1 (raw 12, already 4-byte aligned, so it's a no-op there too) —
    // an 8-byte rounding step would instead push class 1 up to 16,
    // colliding with class 2.
    (raw + 0b11) & !0b11
}

/// Maps a requested size to the smallest size class whose slots are
/// large enough to hold it.
///
/// This mirrors the reference allocator's `sizeToIndexHalfExp`, a
/// constant-time bit-scan over `sz - 1`.
#[inline(always)]
pub fn size_to_index(sz: usize) -> u8 {
    if sz <= 8 {
        return 0;
    }

    let sz = sz - 1;
    let ix = (usize::BITS - 1 - sz.leading_zeros()) as i64;
    let addition = 1i64 & (sz as i64 >> (ix - 1));
    ((ix - 2) * 2 + addition - 1) as u8
}

/// The smallest class index whose `class_size` exceeds [`MAX_BUCKET`];
/// classes at or above this index are never populated by the
/// dispatcher and their free-list head stays permanently null.
pub const LAST_BUCKETED_CLASS: u8 = {
    // Computed once, by hand, from `class_size`/`size_to_index` above:
    // class 10 is exactly `MAX_BUCKET` (256 bytes).
    10
};

const_assert_eq!(class_size(LAST_BUCKETED_CLASS), MAX_BUCKET);
const_assert!((LAST_BUCKETED_CLASS as usize) < BUCKET_COUNT);
