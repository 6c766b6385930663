use std::alloc::Layout;
use std::ptr::NonNull;

use crate::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Alignment `malloc` guarantees on every supported 64-bit target.
#[allow(dead_code)]
const MALLOC_ALIGN: usize = 16;

/// The underlying system allocator the pool grows from and hands large
/// objects to.
///
/// Every method sees a non-zero-sized layout; the pool never forwards
/// zero-sized requests.
pub trait SystemAlloc: Send {
    /// Allocate a block satisfying `layout`. `None` means the system could
    /// not satisfy the request.
    ///
    /// # Safety
    /// `layout.size()` must be non-zero.
    unsafe fn alloc(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Return a block obtained from [`alloc`](Self::alloc) or
    /// [`realloc`](Self::realloc).
    ///
    /// # Safety
    /// `ptr` must be live and `layout` must be the layout it was allocated
    /// (or last reallocated) with.
    unsafe fn dealloc(&self, ptr: NonNull<u8>, layout: Layout);

    /// Resize a block to `new_size` bytes, preserving the first
    /// `min(old, new)` bytes. On `None` the old block is untouched.
    ///
    /// # Safety
    /// Same as [`dealloc`](Self::dealloc) for `ptr`/`layout`; `new_size` must
    /// be non-zero and form a valid layout with `layout.align()`.
    unsafe fn realloc(&self, ptr: NonNull<u8>, layout: Layout, new_size: usize)
        -> Option<NonNull<u8>>;
}

/// The process's system allocator.
#[derive(Clone, Copy, Debug, Default)]
pub struct PlatformSystem;

#[cfg(all(any(target_os = "macos", target_os = "linux"), not(any(loom, miri))))]
mod unix {
    use super::{Layout, MALLOC_ALIGN, NonNull, PlatformSystem, SystemAlloc};

    #[inline]
    fn malloc_fits(align: usize, size: usize) -> bool {
        align <= MALLOC_ALIGN && align <= size
    }

    impl SystemAlloc for PlatformSystem {
        unsafe fn alloc(&self, layout: Layout) -> Option<NonNull<u8>> {
            debug_assert!(layout.size() != 0, "zero-size system allocation");
            if malloc_fits(layout.align(), layout.size()) {
                // Safety: FFI call to malloc.
                let ptr = unsafe { libc::malloc(layout.size()) };
                return NonNull::new(ptr.cast::<u8>());
            }

            let align = layout.align().max(std::mem::size_of::<usize>());
            let mut out: *mut libc::c_void = std::ptr::null_mut();
            // Safety: FFI call to posix_memalign; align is a power of two and a
            // multiple of sizeof(void*).
            let rc = unsafe { libc::posix_memalign(&mut out, align, layout.size()) };
            if rc != 0 {
                return None;
            }
            NonNull::new(out.cast::<u8>())
        }

        unsafe fn dealloc(&self, ptr: NonNull<u8>, _layout: Layout) {
            // Safety: FFI call to free; ptr came from malloc/posix_memalign/realloc.
            unsafe { libc::free(ptr.as_ptr().cast::<libc::c_void>()) };
        }

        unsafe fn realloc(
            &self,
            ptr: NonNull<u8>,
            layout: Layout,
            new_size: usize,
        ) -> Option<NonNull<u8>> {
            debug_assert!(new_size != 0, "zero-size system reallocation");
            if malloc_fits(layout.align(), new_size) {
                // Safety: FFI call to realloc; ptr is live.
                let new = unsafe { libc::realloc(ptr.as_ptr().cast::<libc::c_void>(), new_size) };
                return NonNull::new(new.cast::<u8>());
            }

            // realloc(3) only promises malloc alignment: move by hand.
            let new_layout = Layout::from_size_align(new_size, layout.align()).ok()?;
            // Safety: new_layout has non-zero size.
            let new = unsafe { self.alloc(new_layout)? };
            // Safety: both regions are live and distinct.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    ptr.as_ptr(),
                    new.as_ptr(),
                    layout.size().min(new_size),
                );
                self.dealloc(ptr, layout);
            }
            Some(new)
        }
    }
}

// ---------------------------------------------------------------------------
// Fallback: `std::alloc`.
//
// Used on non-unix targets and under `cfg(loom)` / `cfg(miri)`, where FFI
// calls into libc are either unavailable or invisible to the checker.
// ---------------------------------------------------------------------------
#[cfg(any(not(any(target_os = "macos", target_os = "linux")), loom, miri))]
impl SystemAlloc for PlatformSystem {
    unsafe fn alloc(&self, layout: Layout) -> Option<NonNull<u8>> {
        debug_assert!(layout.size() != 0, "zero-size system allocation");
        // Safety: layout has non-zero size.
        NonNull::new(unsafe { std::alloc::alloc(layout) })
    }

    unsafe fn dealloc(&self, ptr: NonNull<u8>, layout: Layout) {
        // Safety: ptr was allocated with `layout`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
    }

    unsafe fn realloc(&self, ptr: NonNull<u8>, layout: Layout, new_size: usize) -> Option<NonNull<u8>> {
        // Safety: ptr was allocated with `layout`; new_size is non-zero.
        NonNull::new(unsafe { std::alloc::realloc(ptr.as_ptr(), layout, new_size) })
    }
}

/// Fault-injecting wrapper around another [`SystemAlloc`].
///
/// Counts every allocation request and fails the ones it has been armed to
/// fail. Deallocations always go through. Used to drive the pool's recovery
/// path without actually exhausting memory.
#[derive(Debug)]
pub struct FaultySystem<S = PlatformSystem> {
    inner: S,
    fail_next: AtomicUsize,
    fail_all: AtomicBool,
    requests: AtomicUsize,
    failures: AtomicUsize,
}

impl FaultySystem<PlatformSystem> {
    #[must_use]
    pub fn new() -> Self {
        Self::wrap(PlatformSystem)
    }
}

impl Default for FaultySystem<PlatformSystem> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> FaultySystem<S> {
    pub fn wrap(inner: S) -> Self {
        Self {
            inner,
            fail_next: AtomicUsize::new(0),
            fail_all: AtomicBool::new(false),
            requests: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        }
    }

    /// Fail the next `n` allocation/reallocation requests.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::Relaxed);
    }

    /// Fail every request until switched off again.
    pub fn fail_always(&self, on: bool) {
        self.fail_all.store(on, Ordering::Relaxed);
    }

    /// Allocation and reallocation requests seen so far, failed or not.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::Relaxed)
    }

    /// Requests that were failed on purpose.
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::Relaxed)
    }

    fn should_fail(&self) -> bool {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let fail = self.fail_all.load(Ordering::Relaxed)
            || self
                .fail_next
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
                .is_ok();
        if fail {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        fail
    }
}

impl<S: SystemAlloc + Sync> SystemAlloc for FaultySystem<S> {
    unsafe fn alloc(&self, layout: Layout) -> Option<NonNull<u8>> {
        if self.should_fail() {
            return None;
        }
        // Safety: forwarded contract.
        unsafe { self.inner.alloc(layout) }
    }

    unsafe fn dealloc(&self, ptr: NonNull<u8>, layout: Layout) {
        // Safety: forwarded contract.
        unsafe { self.inner.dealloc(ptr, layout) }
    }

    unsafe fn realloc(&self, ptr: NonNull<u8>, layout: Layout, new_size: usize) -> Option<NonNull<u8>> {
        if self.should_fail() {
            return None;
        }
        // Safety: forwarded contract.
        unsafe { self.inner.realloc(ptr, layout, new_size) }
    }
}
