//! Intrusive LIFO free lists, one per size class.
//!
//! A free block's first word holds the pointer to the next free block of the
//! same class. Nothing else is stored outside the blocks themselves apart from
//! the list heads and a bitmap of non-empty classes used by the scavenger.

use super::size_class::{NUM_CLASSES, class_size};
use fixedbitset::FixedBitSet;
use std::ptr::NonNull;

/// 32-bit canary written at offset 8 of every free block of 16 bytes or more.
/// Checked on pop to catch writes through dangling pointers.
/// Only active when debug assertions are enabled.
#[cfg(debug_assertions)]
pub(crate) const FREE_CANARY: u32 = 0xAB_AD_BA_BE;

#[cfg(debug_assertions)]
const CANARY_OFFSET: usize = std::mem::size_of::<*mut u8>();

#[cfg(debug_assertions)]
#[inline]
fn has_canary(block_size: usize) -> bool {
    block_size >= CANARY_OFFSET + std::mem::size_of::<u32>()
}

pub(crate) struct FreeList {
    head: Option<NonNull<u8>>,
    len: usize,
}

impl FreeList {
    pub const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Push `ptr` as the new head.
    ///
    /// # Safety
    /// - `ptr` must be valid for writes of `block_size` bytes and aligned to
    ///   at least `align_of::<*mut u8>()`.
    /// - `ptr` must not already be in any free list.
    #[inline]
    pub unsafe fn push(&mut self, ptr: NonNull<u8>, block_size: usize) {
        let next = self.head.map_or(std::ptr::null_mut(), NonNull::as_ptr);
        // Safety: upheld by caller.
        unsafe { ptr.cast::<*mut u8>().as_ptr().write(next) };

        #[cfg(debug_assertions)]
        if has_canary(block_size) {
            // Safety: block is at least 16 bytes (checked above).
            unsafe {
                ptr.as_ptr()
                    .add(CANARY_OFFSET)
                    .cast::<u32>()
                    .write(FREE_CANARY);
            }
        }
        #[cfg(not(debug_assertions))]
        let _ = block_size;

        self.head = Some(ptr);
        self.len += 1;
    }

    /// Pop the head block, or `None` if the list is empty.
    #[inline]
    pub fn pop(&mut self, block_size: usize) -> Option<NonNull<u8>> {
        let ptr = self.head?;

        #[cfg(debug_assertions)]
        if has_canary(block_size) {
            // Safety: every block in the list was installed through `push` or
            // `install_chain`, both of which wrote the canary.
            let canary = unsafe { ptr.as_ptr().add(CANARY_OFFSET).cast::<u32>().read() };
            assert!(
                canary == FREE_CANARY,
                "binpool corruption: free-block canary at {ptr:p}+{CANARY_OFFSET} was 0x{canary:08x}, expected 0x{FREE_CANARY:08x}",
            );
        }
        #[cfg(not(debug_assertions))]
        let _ = block_size;

        // Safety: `ptr` is a live free block; its first word is the link.
        let next = unsafe { ptr.cast::<*mut u8>().as_ptr().read() };
        self.head = NonNull::new(next);
        self.len -= 1;
        Some(ptr)
    }

    /// Install `count` contiguous blocks starting at `start` as the whole
    /// list, linked front to back so `start` ends up as the head.
    ///
    /// # Safety
    /// - The list must be empty; its previous contents would be lost.
    /// - `start .. start + count * block_size` must be valid for writes and
    ///   owned by the caller.
    pub unsafe fn install_chain(&mut self, start: NonNull<u8>, block_size: usize, count: usize) {
        debug_assert!(self.is_empty(), "install_chain over a non-empty free list");
        for i in (0..count).rev() {
            // Safety: i < count keeps the block inside the caller's range.
            unsafe {
                let block = start.add(i * block_size);
                self.push(block, block_size);
            }
        }
    }

    /// Walk the list without modifying it.
    #[cfg(test)]
    pub fn blocks(&self) -> Vec<NonNull<u8>> {
        let mut out = Vec::with_capacity(self.len);
        let mut node = self.head;
        while let Some(n) = node {
            out.push(n);
            // Safety: test helper walking valid links.
            node = NonNull::new(unsafe { n.cast::<*mut u8>().as_ptr().read() });
        }
        out
    }
}

/// All free lists plus a bitmap of the classes that currently hold blocks.
pub(crate) struct FreeListTable {
    lists: Box<[FreeList]>,
    occupied: FixedBitSet,
}

impl FreeListTable {
    pub fn new() -> Self {
        Self {
            lists: (0..NUM_CLASSES).map(|_| FreeList::new()).collect(),
            occupied: FixedBitSet::with_capacity(NUM_CLASSES),
        }
    }

    #[inline]
    pub fn len(&self, class: usize) -> usize {
        self.lists[class].len()
    }

    pub fn total_blocks(&self) -> usize {
        self.occupied.ones().map(|class| self.lists[class].len()).sum()
    }

    /// # Safety
    /// Same contract as [`FreeList::push`] with `block_size = class_size(class)`.
    /// Pushing a block under the wrong class is not detected here and hands
    /// out wrong-sized memory later.
    #[inline]
    pub unsafe fn push(&mut self, class: usize, ptr: NonNull<u8>) {
        // Safety: upheld by caller.
        unsafe { self.lists[class].push(ptr, class_size(class)) };
        self.occupied.insert(class);
    }

    #[inline]
    pub fn pop(&mut self, class: usize) -> Option<NonNull<u8>> {
        let list = &mut self.lists[class];
        let ptr = list.pop(class_size(class))?;
        if list.is_empty() {
            self.occupied.set(class, false);
        }
        Some(ptr)
    }

    /// # Safety
    /// Same contract as [`FreeList::install_chain`].
    pub unsafe fn install_chain(&mut self, class: usize, start: NonNull<u8>, count: usize) {
        if count == 0 {
            return;
        }
        // Safety: upheld by caller.
        unsafe { self.lists[class].install_chain(start, class_size(class), count) };
        self.occupied.insert(class);
    }

    /// Remove the head block of the first non-empty class at or above
    /// `min_class`. Returns the block and its size.
    pub fn take_spare_from(&mut self, min_class: usize) -> Option<(NonNull<u8>, usize)> {
        let class = self.occupied.ones().find(|&c| c >= min_class)?;
        let ptr = self.pop(class)?;
        Some((ptr, class_size(class)))
    }

    #[cfg(test)]
    pub fn blocks(&self, class: usize) -> Vec<NonNull<u8>> {
        self.lists[class].blocks()
    }
}
