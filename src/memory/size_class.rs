//! Size classes for the pooled path.
//!
//! Class `i` holds blocks of exactly `(i + 1) * ALIGN` bytes. Requests above
//! [`MAX_POOLED`] never reach this table.

/// Granularity of every size class (bytes). Also the alignment every pooled
/// block is guaranteed to have.
pub const ALIGN: usize = 8;

/// Largest request served from the free lists. Anything larger goes straight
/// to the system allocator.
pub const MAX_POOLED: usize = 4096;

/// Number of size classes (and free lists).
pub const NUM_CLASSES: usize = MAX_POOLED / ALIGN;

/// Free-list index for a request of `bytes` bytes.
///
/// Domain is `1..=MAX_POOLED`. Zero has no class.
#[inline]
pub const fn class_index(bytes: usize) -> usize {
    debug_assert!(bytes != 0 && bytes <= MAX_POOLED);
    bytes.div_ceil(ALIGN) - 1
}

/// `bytes` rounded up to the next multiple of [`ALIGN`].
#[inline]
pub const fn round_up(bytes: usize) -> usize {
    (bytes + ALIGN - 1) & !(ALIGN - 1)
}

/// Canonical block size of class `index`.
#[inline]
pub const fn class_size(index: usize) -> usize {
    (index + 1) * ALIGN
}

/// True if a request of `bytes` bytes is served by the free lists.
#[inline]
pub const fn is_pooled(bytes: usize) -> bool {
    bytes != 0 && bytes <= MAX_POOLED
}
