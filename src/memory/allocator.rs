//! Typed allocator front over a [`SharedPool`].

use std::alloc::{GlobalAlloc, Layout};
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;

use allocator_api2::alloc::{AllocError, Allocator};

use super::error::PoolError;
use super::pool::SharedPool;
use super::stats::PoolStats;
use super::system::{PlatformSystem, SystemAlloc};
use crate::sync::OnceLock;

static GLOBAL_POOL: OnceLock<SharedPool> = OnceLock::new();

/// The process-wide pool behind [`PoolAllocator::new`].
///
/// Created on first use and never torn down. Every element type shares it.
pub struct GlobalPool;

impl GlobalPool {
    pub fn get() -> &'static SharedPool {
        GLOBAL_POOL.get_or_init(SharedPool::new)
    }

    pub fn stats() -> PoolStats {
        Self::get().stats()
    }
}

/// Byte-level access to the global pool, with the same caveats as the
/// [`SharedPool`] implementation: contents survive `realloc`, and this is not
/// a `#[global_allocator]`.
// Safety: Implementation follows GlobalAlloc contract.
unsafe impl GlobalAlloc for GlobalPool {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // Safety: forwarded contract.
        unsafe { GlobalPool::get().alloc(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // Safety: forwarded contract.
        unsafe { GlobalPool::get().dealloc(ptr, layout) }
    }
}

/// Allocator for arrays of `T`, backed by a shared pool.
///
/// Clones, and allocators made by [`rebind`](Self::rebind), use the same
/// pool, so storage from one may be released through another.
pub struct PoolAllocator<T, S: SystemAlloc = PlatformSystem> {
    pool: SharedPool<S>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> PoolAllocator<T, PlatformSystem> {
    /// Allocator over the global pool.
    #[must_use]
    pub fn new() -> Self {
        Self::with_pool(GlobalPool::get().clone())
    }
}

impl<T> Default for PoolAllocator<T, PlatformSystem> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, S: SystemAlloc> PoolAllocator<T, S> {
    pub fn with_pool(pool: SharedPool<S>) -> Self {
        Self {
            pool,
            _marker: PhantomData,
        }
    }

    pub fn pool(&self) -> &SharedPool<S> {
        &self.pool
    }

    /// Allocator for `U` over the same pool.
    pub fn rebind<U>(&self) -> PoolAllocator<U, S> {
        PoolAllocator::with_pool(self.pool.clone())
    }

    fn layout_for(n: usize) -> Result<Layout, PoolError> {
        Layout::array::<T>(n).map_err(|_| PoolError::CapacityOverflow {
            count: n,
            elem_size: size_of::<T>(),
        })
    }

    /// Uninitialised storage for `n` values of `T`.
    ///
    /// # Errors
    ///
    /// - `PoolError::CapacityOverflow` if `n * size_of::<T>()` overflows.
    /// - The pool's out-of-memory errors, see [`RawPool::allocate`](super::pool::RawPool::allocate).
    pub fn allocate(&self, n: usize) -> Result<NonNull<T>, PoolError> {
        let layout = Self::layout_for(n)?;
        self.pool.allocate(layout).map(NonNull::cast)
    }

    /// # Safety
    /// `ptr` must come from `allocate(n)` (or `reallocate(_, _, n)`) on an
    /// allocator sharing this pool, with the same `n`, and must not be used
    /// afterwards. Any values in it must already have been destroyed.
    pub unsafe fn deallocate(&self, ptr: NonNull<T>, n: usize) {
        // allocate never hands out storage for an overflowing count.
        let Ok(layout) = Self::layout_for(n) else {
            return;
        };
        // Safety: upheld by caller.
        unsafe { self.pool.deallocate(ptr.cast(), layout) };
    }

    /// Resize storage from `old` to `new` values.
    ///
    /// Above the pooled threshold the contents move with the block. Within
    /// it the old block is released and a new one allocated without copying,
    /// so the values are lost.
    ///
    /// # Safety
    /// Same as [`deallocate`](Self::deallocate) for `ptr` and `old`.
    ///
    /// # Errors
    ///
    /// Same as [`allocate`](Self::allocate).
    pub unsafe fn reallocate(&self, ptr: NonNull<T>, old: usize, new: usize) -> Result<NonNull<T>, PoolError> {
        let old_layout = Self::layout_for(old)?;
        let new_layout = Self::layout_for(new)?;
        // Safety: upheld by caller.
        unsafe { self.pool.reallocate(ptr.cast(), old_layout, new_layout.size()) }.map(NonNull::cast)
    }

    /// Move `value` into uninitialised storage at `ptr`.
    ///
    /// # Safety
    /// `ptr` must be valid for writes and aligned for `T`. Any value already
    /// there is overwritten without being dropped.
    pub unsafe fn construct(&self, ptr: NonNull<T>, value: T) {
        // Safety: upheld by caller.
        unsafe { ptr.as_ptr().write(value) };
    }

    /// Drop the value at `ptr` in place. The storage stays allocated.
    ///
    /// # Safety
    /// `ptr` must point to a live, initialised `T` that is not used again
    /// until re-constructed.
    pub unsafe fn destroy(&self, ptr: NonNull<T>) {
        // Safety: upheld by caller.
        unsafe { ptr.as_ptr().drop_in_place() };
    }

    /// Largest `n` whose byte size does not overflow `usize`.
    pub fn max_size(&self) -> usize {
        usize::MAX.checked_div(size_of::<T>()).unwrap_or(usize::MAX)
    }
}

/// Lets the pool back containers such as `allocator_api2::vec::Vec`.
///
/// The element type only matters to the counted methods above; here every
/// request is a plain layout. Growing and shrinking use the trait's defaults,
/// which copy the contents.
// Safety: a block stays valid until it is deallocated through an allocator
// sharing the same pool, and clones share the pool.
unsafe impl<T, S: SystemAlloc> Allocator for PoolAllocator<T, S> {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        let ptr = self.pool.allocate(layout).map_err(|_| AllocError)?;
        Ok(NonNull::slice_from_raw_parts(ptr, layout.size()))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // Safety: upheld by caller.
        unsafe { self.pool.deallocate(ptr, layout) };
    }
}

impl<T, S: SystemAlloc> Clone for PoolAllocator<T, S> {
    fn clone(&self) -> Self {
        Self::with_pool(self.pool.clone())
    }
}

impl<T, U, S: SystemAlloc> PartialEq<PoolAllocator<U, S>> for PoolAllocator<T, S> {
    fn eq(&self, other: &PoolAllocator<U, S>) -> bool {
        self.pool.same_pool(&other.pool)
    }
}

impl<T, S: SystemAlloc> Eq for PoolAllocator<T, S> {}

impl<T, S: SystemAlloc> fmt::Debug for PoolAllocator<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolAllocator")
            .field("element", &std::any::type_name::<T>())
            .field("element_size", &size_of::<T>())
            .finish_non_exhaustive()
    }
}
