//! The chunk source: one contiguous range carved front to back.
//!
//! The arena only moves a cursor. Obtaining memory for it (growth) and
//! recovering when growth fails live in the pool, which owns the regions.

use std::ptr::NonNull;

use super::size_class::ALIGN;

pub(crate) struct Arena {
    cursor: NonNull<u8>,
    available: usize,
}

impl Arena {
    pub const fn new() -> Self {
        Self {
            cursor: NonNull::dangling(),
            available: 0,
        }
    }

    /// Bytes between the cursor and the limit.
    #[inline]
    pub fn available(&self) -> usize {
        self.available
    }

    /// Carve up to `count` blocks of `size` bytes.
    ///
    /// Takes all `count` blocks when they fit, otherwise as many whole blocks
    /// as fit. Returns the start of the carve and the number of blocks it
    /// holds, or `None` when not even one block fits. The cursor moves by
    /// exactly `size * carved` and never past the limit.
    pub fn carve(&mut self, size: usize, count: usize) -> Option<(NonNull<u8>, usize)> {
        debug_assert!(size != 0 && count != 0);
        if self.available < size {
            return None;
        }

        let wanted = size.saturating_mul(count);
        let carved = if self.available >= wanted {
            count
        } else {
            self.available / size
        };
        let bytes = size * carved;

        let start = self.cursor;
        // Safety: bytes <= available, so the new cursor stays within (or one
        // past the end of) the current range.
        self.cursor = unsafe { start.add(bytes) };
        self.available -= bytes;
        Some((start, carved))
    }

    /// Hand the unused tail of the range to the caller and leave the arena
    /// empty. `None` if nothing is left.
    pub fn take_remainder(&mut self) -> Option<(NonNull<u8>, usize)> {
        if self.available == 0 {
            return None;
        }
        debug_assert!(self.available.is_multiple_of(ALIGN));
        let tail = (self.cursor, self.available);
        self.clear();
        Some(tail)
    }

    /// Point the arena at a fresh range `[start, start + len)`.
    ///
    /// # Safety
    /// The range must be valid for writes, owned by the pool, and not in use
    /// by anything else for as long as the arena may carve from it.
    pub unsafe fn reset(&mut self, start: NonNull<u8>, len: usize) {
        debug_assert!(len.is_multiple_of(ALIGN));
        self.cursor = start;
        self.available = len;
    }

    pub fn clear(&mut self) {
        self.cursor = NonNull::dangling();
        self.available = 0;
    }
}
