//! The pool engine: refill, arena growth, scavenging and the large-object
//! path.
//!
//! [`RawPool`] is single-threaded and takes `&mut self` on every mutation.
//! [`SharedPool`] puts one behind a lock so any number of allocators, of any
//! element type, can share a single arena and set of free lists.

#[cfg(debug_assertions)]
use std::collections::HashMap;

use std::alloc::{GlobalAlloc, Layout};
use std::ptr::NonNull;

use super::arena::Arena;
use super::error::PoolError;
use super::free_list::FreeListTable;
use super::size_class::{ALIGN, NUM_CLASSES, class_index, class_size, is_pooled, round_up};
use super::stats::{self, PoolStats};
use super::system::{PlatformSystem, SystemAlloc};
use crate::logging;
use crate::sync::{Arc, Mutex, MutexGuard};

/// Tuning for refill and arena growth.
///
/// Growth requests `growth_factor * size * count + round_up(total_grown >>
/// history_shift)` bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Blocks requested from the arena when a free list runs dry.
    pub refill_batch: usize,
    /// Multiple of the immediate request to ask the system for on growth.
    pub growth_factor: usize,
    /// How strongly past growth inflates the next growth request.
    pub history_shift: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            refill_batch: 50,
            growth_factor: 20,
            history_shift: 4,
        }
    }
}

impl PoolConfig {
    /// # Errors
    ///
    /// Returns `PoolError::InvalidConfig` naming the first offending field.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.refill_batch == 0 {
            return Err(PoolError::InvalidConfig("refill_batch must be at least 1".into()));
        }
        if self.growth_factor == 0 {
            return Err(PoolError::InvalidConfig("growth_factor must be at least 1".into()));
        }
        if self.history_shift >= usize::BITS {
            return Err(PoolError::InvalidConfig(format!(
                "history_shift must be below {}",
                usize::BITS
            )));
        }
        Ok(())
    }

    fn growth_bytes(&self, size: usize, count: usize, total_grown: usize) -> Option<usize> {
        let request = self.growth_factor.checked_mul(size)?.checked_mul(count)?;
        request.checked_add(round_up(total_grown >> self.history_shift))
    }
}

#[inline]
fn fits_pool(layout: Layout) -> bool {
    is_pooled(layout.size()) && layout.align() <= ALIGN
}

#[inline]
fn dangling_for(layout: Layout) -> NonNull<u8> {
    NonNull::new(std::ptr::without_provenance_mut::<u8>(layout.align())).unwrap_or(NonNull::dangling())
}

/// Single-threaded pool over a system allocator `S`.
pub struct RawPool<S: SystemAlloc = PlatformSystem> {
    config: PoolConfig,
    system: S,
    arena: Arena,
    free: FreeListTable,
    /// Every arena region obtained from `system`, released on drop.
    regions: Vec<(NonNull<u8>, Layout)>,
    /// System blocks shrunk into the pooled range by `reallocate`. They join
    /// the free lists on deallocation and are released on drop. Each entry is
    /// a distinct block the pool retains until then, so the list grows only
    /// with memory the pool actually holds.
    adopted: Vec<(NonNull<u8>, Layout)>,
    system_calls: usize,
    total_grown: usize,
    refills: usize,
    scavenges: usize,
    large_allocs: usize,
    /// Live pooled blocks and their class, for catching mismatched or
    /// repeated deallocation.
    #[cfg(debug_assertions)]
    live: HashMap<usize, usize>,
}

// Safety: the raw pointers refer to memory owned by the pool alone. Moving
// the pool to another thread moves that ownership with it.
unsafe impl<S: SystemAlloc> Send for RawPool<S> {}

impl RawPool<PlatformSystem> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_system(PlatformSystem)
    }
}

impl Default for RawPool<PlatformSystem> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: SystemAlloc> RawPool<S> {
    pub fn with_system(system: S) -> Self {
        Self::build(PoolConfig::default(), system)
    }

    /// # Errors
    ///
    /// Returns `PoolError::InvalidConfig` if `config` fails validation.
    pub fn with_config(config: PoolConfig, system: S) -> Result<Self, PoolError> {
        config.validate()?;
        Ok(Self::build(config, system))
    }

    fn build(config: PoolConfig, system: S) -> Self {
        Self {
            config,
            system,
            arena: Arena::new(),
            free: FreeListTable::new(),
            regions: Vec::new(),
            adopted: Vec::new(),
            system_calls: 0,
            total_grown: 0,
            refills: 0,
            scavenges: 0,
            large_allocs: 0,
            #[cfg(debug_assertions)]
            live: HashMap::new(),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn system(&self) -> &S {
        &self.system
    }

    /// Allocate a block for `layout`.
    ///
    /// Pooled blocks are aligned to [`ALIGN`]; layouts needing more, or more
    /// than `MAX_POOLED` bytes, go to the system allocator. Zero-sized
    /// layouts get a dangling, aligned pointer.
    ///
    /// # Errors
    ///
    /// - `PoolError::LargeAllocFailed` if the system refuses a large request.
    /// - `PoolError::ArenaExhausted` if arena growth fails and no spare block
    ///   could be scavenged.
    pub fn allocate(&mut self, layout: Layout) -> Result<NonNull<u8>, PoolError> {
        if layout.size() == 0 {
            return Ok(dangling_for(layout));
        }
        if !fits_pool(layout) {
            return self.allocate_large(layout);
        }

        let class = class_index(layout.size());
        let ptr = match self.free.pop(class) {
            Some(ptr) => ptr,
            None => self.refill(class)?,
        };
        self.track_alloc(ptr, class);
        Ok(ptr)
    }

    /// Return a block to the pool, or to the system for large layouts.
    ///
    /// # Safety
    /// `ptr` must come from this pool's `allocate`/`reallocate` with exactly
    /// `layout` (for a reallocated block: the old alignment and the new size),
    /// and must not be used afterwards.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() == 0 {
            return;
        }
        if !fits_pool(layout) {
            #[cfg(debug_assertions)]
            assert!(
                !self.live.contains_key(&ptr.as_ptr().addr()),
                "binpool contract violation: pooled block {ptr:p} deallocated as {} bytes",
                layout.size(),
            );
            // Safety: upheld by caller, the block came from the large path.
            unsafe { self.system.dealloc(ptr, layout) };
            return;
        }

        let class = class_index(layout.size());
        self.track_free(ptr, class);
        // Safety: the block is a live member of `class` handed back by its
        // owner.
        unsafe { self.free.push(class, ptr) };
    }

    /// Resize a block to `new_size` bytes, keeping `old.align()`.
    ///
    /// Large blocks are resized by the system allocator and keep their
    /// contents. Pooled blocks are deallocated and a fresh block allocated,
    /// without copying: the contents of a pooled block are lost.
    ///
    /// # Safety
    /// Same as [`deallocate`](Self::deallocate) for `ptr` and `old`. On
    /// success `ptr` must no longer be used; on failure a large block is
    /// left untouched while a pooled block has already been released.
    ///
    /// # Errors
    ///
    /// Same as [`allocate`](Self::allocate), plus
    /// `PoolError::CapacityOverflow` if `new_size` cannot form a layout.
    pub unsafe fn reallocate(
        &mut self,
        ptr: NonNull<u8>,
        old: Layout,
        new_size: usize,
    ) -> Result<NonNull<u8>, PoolError> {
        let new = Layout::from_size_align(new_size, old.align())
            .map_err(|_| PoolError::CapacityOverflow { count: new_size, elem_size: 1 })?;

        if old.size() == 0 || fits_pool(old) || new_size == 0 {
            // Safety: upheld by caller.
            unsafe { self.deallocate(ptr, old) };
            return self.allocate(new);
        }

        // A large block shrunk into the pooled range is sized to its class so
        // it can later be freed through the pooled path.
        let pooled = fits_pool(new);
        let target = if pooled { round_up(new_size) } else { new_size };

        self.record_system_call();
        self.large_allocs += 1;
        // Safety: upheld by caller; target is non-zero and valid with the
        // old alignment.
        let Some(moved) = (unsafe { self.system.realloc(ptr, old, target) }) else {
            logging::log_large_failure(target);
            return Err(PoolError::LargeAllocFailed { bytes: target });
        };

        if pooled && let Ok(layout) = Layout::from_size_align(target, old.align()) {
            self.adopted.push((moved, layout));
            self.track_alloc(moved, class_index(target));
        }
        Ok(moved)
    }

    fn allocate_large(&mut self, layout: Layout) -> Result<NonNull<u8>, PoolError> {
        self.record_system_call();
        self.large_allocs += 1;
        // Safety: layout has non-zero size.
        match unsafe { self.system.alloc(layout) } {
            Some(ptr) => Ok(ptr),
            None => {
                logging::log_large_failure(layout.size());
                Err(PoolError::LargeAllocFailed { bytes: layout.size() })
            }
        }
    }

    /// Serve an empty class from the arena: the first block goes to the
    /// caller, the rest become the class's free list.
    fn refill(&mut self, class: usize) -> Result<NonNull<u8>, PoolError> {
        let size = class_size(class);
        let (chunk, count) = self.chunk_alloc(size, self.config.refill_batch)?;
        self.refills += 1;

        if count > 1 {
            // Safety: the chunk holds `count` blocks of `size` bytes that only
            // the pool knows about, and refill only runs on an empty class.
            unsafe {
                self.free.install_chain(class, chunk.add(size), count - 1);
            }
        }
        logging::log_refill(size, count);
        Ok(chunk)
    }

    /// Carve up to `count` blocks of `size` bytes, growing the arena (or
    /// scavenging a spare block when growth fails) until the carve succeeds.
    fn chunk_alloc(&mut self, size: usize, count: usize) -> Result<(NonNull<u8>, usize), PoolError> {
        loop {
            if let Some(carved) = self.arena.carve(size, count) {
                return Ok(carved);
            }

            let bytes = self
                .config
                .growth_bytes(size, count, self.total_grown)
                .ok_or(PoolError::CapacityOverflow { count, elem_size: size })?;

            // The tail is shorter than `size`, hence at most MAX_POOLED, and a
            // multiple of ALIGN: a whole block of its own class.
            if let Some((tail, len)) = self.arena.take_remainder() {
                // Safety: the tail is unused arena memory owned by the pool.
                unsafe { self.free.push(class_index(len), tail) };
                logging::log_donation(len);
            }

            if let Some(region) = self.grow(bytes) {
                // Safety: the region was just obtained for the arena.
                unsafe { self.arena.reset(region, bytes) };
                continue;
            }

            logging::log_scavenge_start(bytes, size);
            let Some((block, block_size)) = self.free.take_spare_from(class_index(size)) else {
                logging::log_exhausted(bytes, size);
                return Err(PoolError::ArenaExhausted { bytes, size });
            };
            self.scavenges += 1;
            logging::log_scavenged(size, block_size);
            // Safety: the block was free, so the pool owns it outright.
            unsafe { self.arena.reset(block, block_size) };
        }
    }

    /// Ask the system for a new arena region of `bytes` bytes.
    fn grow(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(bytes, ALIGN).ok()?;
        self.record_system_call();
        // Safety: bytes is non-zero, growth always covers at least one block.
        let region = unsafe { self.system.alloc(layout) }?;

        self.total_grown += bytes;
        self.regions.push((region, layout));
        stats::TOTAL_ARENA_BYTES.add(bytes);
        logging::log_growth(bytes, self.total_grown, self.system_calls);
        Some(region)
    }

    #[inline]
    fn record_system_call(&mut self) {
        self.system_calls += 1;
        stats::TOTAL_SYSTEM_CALLS.add(1);
    }

    #[inline]
    fn track_alloc(&mut self, ptr: NonNull<u8>, class: usize) {
        #[cfg(debug_assertions)]
        self.live.insert(ptr.as_ptr().addr(), class);
        #[cfg(not(debug_assertions))]
        let _ = (ptr, class);
    }

    #[inline]
    fn track_free(&mut self, ptr: NonNull<u8>, class: usize) {
        #[cfg(debug_assertions)]
        match self.live.remove(&ptr.as_ptr().addr()) {
            Some(live) if live == class => {}
            Some(live) => panic!(
                "binpool contract violation: block {ptr:p} allocated as {} bytes, deallocated as {} bytes",
                class_size(live),
                class_size(class),
            ),
            None => panic!(
                "binpool contract violation: block {ptr:p} is not live (double free or foreign pointer)"
            ),
        }
        #[cfg(not(debug_assertions))]
        let _ = (ptr, class);
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            system_calls: self.system_calls,
            total_grown: self.total_grown,
            arena_remaining: self.arena.available(),
            refills: self.refills,
            scavenges: self.scavenges,
            large_allocs: self.large_allocs,
            free_blocks: self.free.total_blocks(),
        }
    }

    /// Number of free blocks in `class`.
    ///
    /// # Panics
    ///
    /// Panics if `class >= NUM_CLASSES`.
    pub fn free_len(&self, class: usize) -> usize {
        assert!(class < NUM_CLASSES, "size class {class} out of range");
        self.free.len(class)
    }

    pub fn arena_remaining(&self) -> usize {
        self.arena.available()
    }

    #[cfg(test)]
    pub(crate) fn adopted_blocks(&self) -> Vec<NonNull<u8>> {
        self.adopted.iter().map(|&(ptr, _)| ptr).collect()
    }

    #[cfg(test)]
    pub(crate) fn free_blocks(&self, class: usize) -> Vec<NonNull<u8>> {
        self.free.blocks(class)
    }
}

impl<S: SystemAlloc> Drop for RawPool<S> {
    fn drop(&mut self) {
        self.arena.clear();
        for (ptr, layout) in self.regions.drain(..).chain(self.adopted.drain(..)) {
            // Safety: every region and adopted block came from `system` with
            // this layout; nothing in the pool refers to them any more.
            unsafe { self.system.dealloc(ptr, layout) };
        }
        stats::TOTAL_ARENA_BYTES.sub(self.total_grown);
    }
}

/// A [`RawPool`] behind a lock, shared by cloning.
pub struct SharedPool<S: SystemAlloc = PlatformSystem> {
    inner: Arc<Mutex<RawPool<S>>>,
}

impl<S: SystemAlloc> Clone for SharedPool<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl SharedPool<PlatformSystem> {
    #[must_use]
    pub fn new() -> Self {
        Self::from_raw(RawPool::new())
    }
}

impl Default for SharedPool<PlatformSystem> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: SystemAlloc> SharedPool<S> {
    pub fn from_raw(raw: RawPool<S>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(raw)),
        }
    }

    pub fn with_system(system: S) -> Self {
        Self::from_raw(RawPool::with_system(system))
    }

    /// # Errors
    ///
    /// Returns `PoolError::InvalidConfig` if `config` fails validation.
    pub fn with_config(config: PoolConfig, system: S) -> Result<Self, PoolError> {
        RawPool::with_config(config, system).map(Self::from_raw)
    }

    /// Lock the pool for a sequence of operations.
    pub fn lock(&self) -> MutexGuard<'_, RawPool<S>> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// # Errors
    ///
    /// See [`RawPool::allocate`].
    pub fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, PoolError> {
        self.lock().allocate(layout)
    }

    /// # Safety
    /// See [`RawPool::deallocate`].
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // Safety: upheld by caller.
        unsafe { self.lock().deallocate(ptr, layout) }
    }

    /// # Safety
    /// See [`RawPool::reallocate`].
    ///
    /// # Errors
    ///
    /// See [`RawPool::reallocate`].
    pub unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        old: Layout,
        new_size: usize,
    ) -> Result<NonNull<u8>, PoolError> {
        // Safety: upheld by caller.
        unsafe { self.lock().reallocate(ptr, old, new_size) }
    }

    pub fn stats(&self) -> PoolStats {
        self.lock().stats()
    }

    /// True if both handles refer to the same pool.
    pub fn same_pool(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Byte-level access for code written against [`GlobalAlloc`].
///
/// Reallocation keeps the trait's default, which copies the contents, so a
/// pooled block keeps its data here unlike [`SharedPool::reallocate`].
///
/// Not suitable for `#[global_allocator]`: the pool's own bookkeeping
/// allocates through the global allocator and would re-enter its lock.
// Safety: Implementation follows GlobalAlloc contract.
unsafe impl<S: SystemAlloc> GlobalAlloc for SharedPool<S> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match self.allocate(layout) {
            Ok(ptr) => ptr.as_ptr(),
            Err(_) => std::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            // Safety: Deallocating ptr with correct layout.
            unsafe { self.deallocate(ptr, layout) };
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::size_class::MAX_POOLED;
    use crate::memory::system::FaultySystem;
    use std::sync::atomic::{AtomicIsize, Ordering};

    fn layout(size: usize) -> Layout {
        Layout::from_size_align(size, ALIGN).unwrap()
    }

    fn small_growth() -> PoolConfig {
        PoolConfig {
            growth_factor: 1,
            ..PoolConfig::default()
        }
    }

    fn faulty_pool(config: PoolConfig) -> RawPool<FaultySystem> {
        RawPool::with_config(config, FaultySystem::new()).unwrap()
    }

    /// Forwards to the platform allocator and tracks outstanding bytes.
    struct TrackingSystem(Arc<AtomicIsize>);

    impl SystemAlloc for TrackingSystem {
        unsafe fn alloc(&self, layout: Layout) -> Option<NonNull<u8>> {
            self.0.fetch_add(layout.size().cast_signed(), Ordering::Relaxed);
            // Safety: Test code.
            unsafe { PlatformSystem.alloc(layout) }
        }

        unsafe fn dealloc(&self, ptr: NonNull<u8>, layout: Layout) {
            self.0.fetch_sub(layout.size().cast_signed(), Ordering::Relaxed);
            // Safety: Test code.
            unsafe { PlatformSystem.dealloc(ptr, layout) }
        }

        unsafe fn realloc(&self, ptr: NonNull<u8>, layout: Layout, new_size: usize) -> Option<NonNull<u8>> {
            self.0.fetch_add(
                new_size.cast_signed() - layout.size().cast_signed(),
                Ordering::Relaxed,
            );
            // Safety: Test code.
            unsafe { PlatformSystem.realloc(ptr, layout, new_size) }
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(PoolConfig::default().validate().is_ok());
        for bad in [
            PoolConfig { refill_batch: 0, ..PoolConfig::default() },
            PoolConfig { growth_factor: 0, ..PoolConfig::default() },
            PoolConfig { history_shift: 64, ..PoolConfig::default() },
        ] {
            assert!(matches!(bad.validate(), Err(PoolError::InvalidConfig(_))));
            assert!(RawPool::with_config(bad, PlatformSystem).is_err());
        }
    }

    #[test]
    fn test_growth_formula() {
        let config = PoolConfig::default();
        assert_eq!(config.growth_bytes(8, 50, 0), Some(8000));
        // 8000 >> 4 = 500, rounded up to 504.
        assert_eq!(config.growth_bytes(16, 50, 8000), Some(16_000 + 504));
        assert_eq!(config.growth_bytes(usize::MAX, 50, 0), None);
    }

    #[test]
    fn test_first_allocation_refills() {
        let mut pool = RawPool::new();
        let ptr = pool.allocate(layout(24)).unwrap();
        assert_eq!(ptr.as_ptr().addr() % ALIGN, 0);

        let stats = pool.stats();
        assert_eq!(stats.system_calls, 1);
        assert_eq!(stats.total_grown, 20 * 24 * 50);
        assert_eq!(stats.refills, 1);
        assert_eq!(pool.free_len(class_index(24)), 49);
        // Safety: Test code.
        unsafe { pool.deallocate(ptr, layout(24)) };
    }

    #[test]
    fn test_refill_blocks_are_disjoint_and_contiguous() {
        let mut pool = RawPool::new();
        let first = pool.allocate(layout(40)).unwrap();
        let blocks = pool.free_blocks(class_index(40));

        assert_eq!(blocks.len(), 49);
        for (i, block) in blocks.iter().enumerate() {
            assert_eq!(block.as_ptr().addr(), first.as_ptr().addr() + (i + 1) * 40);
        }
        // Safety: Test code.
        unsafe { pool.deallocate(first, layout(40)) };
    }

    #[test]
    fn test_lifo_reuse() {
        let mut pool = RawPool::new();
        let a = pool.allocate(layout(16)).unwrap();
        // Safety: Test code.
        unsafe { pool.deallocate(a, layout(16)) };
        let b = pool.allocate(layout(16)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_requests_in_same_class_share_blocks() {
        let mut pool = RawPool::new();
        let a = pool.allocate(layout(13)).unwrap();
        // Safety: Test code.
        unsafe { pool.deallocate(a, layout(13)) };
        let b = pool.allocate(layout(16)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_history_grows_later_requests() {
        let mut pool = RawPool::with_config(small_growth(), PlatformSystem).unwrap();
        pool.allocate(layout(8)).unwrap();
        assert_eq!(pool.stats().total_grown, 400);

        pool.allocate(layout(16)).unwrap();
        // 16 * 50 + round_up(400 >> 4 = 25) = 832
        assert_eq!(pool.stats().total_grown, 400 + 832);
        assert_eq!(pool.arena_remaining(), 32);
    }

    #[test]
    fn test_remainder_donated_to_its_own_class() {
        let mut pool = RawPool::with_config(small_growth(), PlatformSystem).unwrap();
        pool.allocate(layout(8)).unwrap();
        let p16 = pool.allocate(layout(16)).unwrap();
        assert_eq!(pool.arena_remaining(), 32);

        // 32 bytes left cannot hold a 40-byte block: grow and donate them.
        pool.allocate(layout(40)).unwrap();
        assert_eq!(pool.stats().system_calls, 3);
        assert_eq!(pool.free_len(class_index(32)), 1);

        let donated = pool.allocate(layout(32)).unwrap();
        assert_eq!(donated.as_ptr().addr(), p16.as_ptr().addr() + 16 * 50);
        assert_eq!(pool.free_len(class_index(32)), 0);
    }

    #[test]
    fn test_partial_carve_returns_single_block() {
        let mut pool = RawPool::with_config(small_growth(), PlatformSystem).unwrap();
        pool.allocate(layout(8)).unwrap();
        pool.allocate(layout(16)).unwrap();
        let calls = pool.stats().system_calls;

        // 32 bytes hold exactly one 24-byte block.
        pool.allocate(layout(24)).unwrap();
        assert_eq!(pool.stats().system_calls, calls);
        assert_eq!(pool.free_len(class_index(24)), 0);
        assert_eq!(pool.arena_remaining(), 8);
    }

    #[test]
    fn test_partial_carve_fills_list_with_what_fits() {
        let mut pool = RawPool::with_config(small_growth(), PlatformSystem).unwrap();
        pool.allocate(layout(8)).unwrap();
        pool.allocate(layout(16)).unwrap();

        // 32 bytes hold four 8-byte blocks after the 8-byte class drains.
        for _ in 0..49 {
            pool.allocate(layout(8)).unwrap();
        }
        assert_eq!(pool.free_len(0), 0);
        pool.allocate(layout(8)).unwrap();
        assert_eq!(pool.free_len(0), 3);
        assert_eq!(pool.arena_remaining(), 0);
    }

    #[test]
    fn test_scavenge_from_larger_class() {
        let mut pool = faulty_pool(small_growth());
        pool.allocate(layout(64)).unwrap();
        assert_eq!(pool.free_len(class_index(64)), 49);
        assert_eq!(pool.arena_remaining(), 0);

        pool.system().fail_next(1);
        let spare = pool.free_blocks(class_index(64))[0].as_ptr().addr();
        let ptr = pool.allocate(layout(16)).unwrap();
        // Carved from the head of the 64-byte list.
        assert_eq!(ptr.as_ptr().addr(), spare);
        assert_eq!(ptr.as_ptr().addr() % ALIGN, 0);

        // The 64-byte block became a 4-block arena for the 16-byte class.
        let stats = pool.stats();
        assert_eq!(stats.scavenges, 1);
        assert_eq!(stats.system_calls, 2);
        assert_eq!(pool.free_len(class_index(16)), 3);
        assert_eq!(pool.free_len(class_index(64)), 48);
        assert_eq!(pool.system().failures(), 1);
    }

    #[test]
    fn test_scavenge_ignores_smaller_classes() {
        let mut pool = faulty_pool(small_growth());
        pool.allocate(layout(8)).unwrap();
        pool.system().fail_always(true);

        let err = pool.allocate(layout(16)).unwrap_err();
        assert!(matches!(err, PoolError::ArenaExhausted { size: 16, .. }));
        assert!(err.is_out_of_memory());
        assert_eq!(pool.free_len(0), 49);
        assert_eq!(pool.stats().scavenges, 0);
    }

    #[test]
    fn test_scavenge_can_use_largest_class() {
        let mut pool = faulty_pool(small_growth());
        pool.allocate(layout(MAX_POOLED)).unwrap();
        pool.system().fail_always(true);

        pool.allocate(layout(2048)).unwrap();
        assert_eq!(pool.stats().scavenges, 1);
        assert_eq!(pool.free_len(class_index(2048)), 1);
        assert_eq!(pool.free_len(class_index(MAX_POOLED)), 48);
    }

    #[test]
    fn test_recovers_after_exhaustion() {
        let mut pool = faulty_pool(PoolConfig::default());
        pool.system().fail_always(true);
        assert!(pool.allocate(layout(32)).is_err());
        assert_eq!(pool.stats().total_grown, 0);

        pool.system().fail_always(false);
        assert!(pool.allocate(layout(32)).is_ok());
        assert_eq!(pool.stats().system_calls, 2);
    }

    #[test]
    fn test_large_path() {
        let mut pool = RawPool::new();
        let big = layout(MAX_POOLED + 1);
        let ptr = pool.allocate(big).unwrap();

        let stats = pool.stats();
        assert_eq!(stats.system_calls, 1);
        assert_eq!(stats.large_allocs, 1);
        assert_eq!(stats.total_grown, 0);
        assert_eq!(stats.free_blocks, 0);
        // Safety: Test code.
        unsafe { pool.deallocate(ptr, big) };
        assert_eq!(pool.stats().system_calls, 1);
    }

    #[test]
    fn test_large_failure_is_not_retried() {
        let mut pool = faulty_pool(PoolConfig::default());
        pool.allocate(layout(MAX_POOLED)).unwrap();
        pool.system().fail_next(1);

        let err = pool.allocate(layout(5000)).unwrap_err();
        assert_eq!(err, PoolError::LargeAllocFailed { bytes: 5000 });
        assert_eq!(pool.stats().scavenges, 0);
        assert_eq!(pool.free_len(class_index(MAX_POOLED)), 49);
    }

    #[test]
    fn test_over_aligned_goes_large() {
        let mut pool = RawPool::new();
        let wide = Layout::from_size_align(64, 64).unwrap();
        let ptr = pool.allocate(wide).unwrap();
        assert_eq!(ptr.as_ptr().addr() % 64, 0);
        assert_eq!(pool.stats().large_allocs, 1);
        assert_eq!(pool.stats().refills, 0);
        // Safety: Test code.
        unsafe { pool.deallocate(ptr, wide) };
    }

    #[test]
    fn test_zero_size_touches_nothing() {
        let mut pool = RawPool::new();
        let ptr = pool.allocate(layout(0)).unwrap();
        assert_eq!(ptr.as_ptr().addr(), ALIGN);
        // Safety: Test code.
        unsafe { pool.deallocate(ptr, layout(0)) };
        assert_eq!(pool.stats(), PoolStats::default());
    }

    #[test]
    fn test_pooled_reallocate_drops_contents() {
        let mut pool = RawPool::new();
        let ptr = pool.allocate(layout(24)).unwrap();
        // Safety: Test code.
        unsafe {
            ptr.as_ptr().write_bytes(0xAA, 24);
            let moved = pool.reallocate(ptr, layout(24), 24).unwrap();
            // Same class: the block comes straight back, but its first word
            // now holds a free-list link instead of the caller's bytes.
            assert_eq!(moved, ptr);
            assert_ne!(moved.cast::<u64>().as_ptr().read(), 0xAAAA_AAAA_AAAA_AAAA);
            pool.deallocate(moved, layout(24));
        }
    }

    #[test]
    fn test_pooled_reallocate_to_other_class() {
        let mut pool = RawPool::new();
        let ptr = pool.allocate(layout(16)).unwrap();
        // Safety: Test code.
        unsafe {
            let moved = pool.reallocate(ptr, layout(16), 48).unwrap();
            assert_ne!(moved, ptr);
            assert_eq!(pool.free_len(class_index(16)), 50);
            pool.deallocate(moved, layout(48));
        }
    }

    #[test]
    fn test_large_reallocate_preserves_contents() {
        let mut pool = RawPool::new();
        let ptr = pool.allocate(layout(5000)).unwrap();
        // Safety: Test code.
        unsafe {
            for i in 0..5000 {
                *ptr.as_ptr().add(i) = (i % 253) as u8;
            }
            let grown = pool.reallocate(ptr, layout(5000), 12_000).unwrap();
            for i in 0..5000 {
                assert_eq!(*grown.as_ptr().add(i), (i % 253) as u8);
            }
            assert_eq!(pool.stats().system_calls, 2);
            pool.deallocate(grown, layout(12_000));
        }
    }

    #[test]
    fn test_large_reallocate_into_pooled_range() {
        let mut pool = RawPool::new();
        let ptr = pool.allocate(layout(5000)).unwrap();
        // Safety: Test code.
        unsafe {
            ptr.as_ptr().write_bytes(0x3C, 5000);
            let shrunk = pool.reallocate(ptr, layout(5000), 100).unwrap();
            assert_eq!(*shrunk.as_ptr().add(99), 0x3C);

            // The shrunk block now belongs to the 104-byte class.
            pool.deallocate(shrunk, layout(100));
            assert_eq!(pool.free_len(class_index(104)), 1);
            assert_eq!(pool.allocate(layout(104)).unwrap(), shrunk);
        }
    }

    #[test]
    fn test_global_alloc_realloc_keeps_contents() {
        let pool = SharedPool::new();
        // Safety: Test code.
        unsafe {
            let ptr = pool.alloc(layout(128 * 4)).cast::<u32>();
            assert_eq!(ptr.addr() % ALIGN, 0);
            for i in 0..128 {
                ptr.add(i).write(i as u32);
            }

            let mut size = 128 * 4;
            let mut ptr = ptr;
            for next in [32 * 4, 64 * 4, 8192] {
                ptr = pool.realloc(ptr.cast(), layout(size), next).cast::<u32>();
                for i in 0..32 {
                    assert_eq!(*ptr.add(i), i as u32, "lost element {i} resizing to {next}");
                }
                size = next;
            }
            pool.dealloc(ptr.cast(), layout(size));
        }
        let stats = pool.stats();
        assert_eq!(stats.large_allocs, 1);
        assert_eq!(stats.system_calls, 2);
    }

    #[test]
    fn test_global_alloc_failure_is_null() {
        let pool = SharedPool::with_system(FaultySystem::new());
        pool.lock().system().fail_always(true);
        // Safety: Test code.
        unsafe {
            assert!(pool.alloc(layout(5000)).is_null());
            assert!(pool.alloc(layout(64)).is_null());
            pool.dealloc(std::ptr::null_mut(), layout(64));
        }
        assert_eq!(pool.stats().system_calls, 2);
    }

    #[test]
    fn test_adopted_blocks_are_distinct_and_recycled() {
        let mut pool = RawPool::new();
        for round in 0..3 {
            // Safety: Test code.
            unsafe {
                let big = pool.allocate(layout(5000)).unwrap();
                let shrunk = pool.reallocate(big, layout(5000), 200).unwrap();
                pool.deallocate(shrunk, layout(200));
            }
            // A shrunk block waits in the free list, so the next pooled
            // request reuses it instead of adopting another.
            assert_eq!(pool.adopted_blocks().len(), round + 1);
            let reused = pool.allocate(layout(200)).unwrap();
            assert!(pool.adopted_blocks().contains(&reused));
        }
        let mut addrs: Vec<_> = pool.adopted_blocks().iter().map(|p| p.as_ptr().addr()).collect();
        addrs.sort_unstable();
        addrs.dedup();
        assert_eq!(addrs.len(), 3);
    }

    #[test]
    fn test_large_reallocate_failure_keeps_block() {
        let mut pool = faulty_pool(PoolConfig::default());
        let ptr = pool.allocate(layout(5000)).unwrap();
        // Safety: Test code.
        unsafe {
            *ptr.as_ptr() = 0x77;
            pool.system().fail_next(1);
            let err = pool.reallocate(ptr, layout(5000), 20_000).unwrap_err();
            assert!(err.is_out_of_memory());
            assert_eq!(*ptr.as_ptr(), 0x77);
            pool.deallocate(ptr, layout(5000));
        }
    }

    #[test]
    fn test_counters_monotonic() {
        let mut pool = RawPool::new();
        let mut last = pool.stats();
        let mut held = Vec::new();

        for i in 0..300usize {
            let size = 8 + (i * 56) % 5000;
            if i % 3 == 2
                && let Some((ptr, size)) = held.pop()
            {
                // Safety: Test code.
                unsafe { pool.deallocate(ptr, layout(size)) };
            } else {
                held.push((pool.allocate(layout(size)).unwrap(), size));
            }
            let now = pool.stats();
            assert!(now.system_calls >= last.system_calls);
            assert!(now.total_grown >= last.total_grown);
            last = now;
        }
        for (ptr, size) in held {
            // Safety: Test code.
            unsafe { pool.deallocate(ptr, layout(size)) };
        }
    }

    #[test]
    fn test_free_list_hit_makes_no_system_call() {
        let mut pool = RawPool::new();
        let a = pool.allocate(layout(32)).unwrap();
        let calls = pool.stats().system_calls;
        for _ in 0..49 {
            pool.allocate(layout(32)).unwrap();
        }
        assert_eq!(pool.stats().system_calls, calls);
        // Safety: Test code.
        unsafe { pool.deallocate(a, layout(32)) };
    }

    #[test]
    fn test_drop_returns_everything() {
        let outstanding = Arc::new(AtomicIsize::new(0));
        {
            let mut pool = RawPool::with_system(TrackingSystem(Arc::clone(&outstanding)));
            for size in [8, 16, 24, 4096] {
                pool.allocate(layout(size)).unwrap();
            }
            let big = pool.allocate(layout(6000)).unwrap();
            // Safety: Test code.
            let shrunk = unsafe { pool.reallocate(big, layout(6000), 64) }.unwrap();
            // Safety: Test code.
            unsafe { pool.deallocate(shrunk, layout(64)) };
            assert!(outstanding.load(Ordering::Relaxed) > 0);
        }
        assert_eq!(outstanding.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_shared_pool_handles() {
        let a = SharedPool::new();
        let b = a.clone();
        let c = SharedPool::new();
        assert!(a.same_pool(&b));
        assert!(!a.same_pool(&c));

        let ptr = a.allocate(layout(16)).unwrap();
        // Safety: Test code.
        unsafe { b.deallocate(ptr, layout(16)) };
        assert_eq!(b.allocate(layout(16)).unwrap(), ptr);
        assert_eq!(a.stats(), b.stats());
    }

    #[test]
    fn test_shared_pool_across_threads() {
        let pool = SharedPool::new();
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    let size = 8 * (t + 1);
                    for _ in 0..200 {
                        let ptr = pool.allocate(layout(size)).unwrap();
                        // Safety: Test code.
                        unsafe {
                            ptr.as_ptr().write_bytes(t as u8, size);
                            assert_eq!(*ptr.as_ptr().add(size - 1), t as u8);
                            pool.deallocate(ptr, layout(size));
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.stats().refills, 4);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "contract violation")]
    fn test_size_mismatch_detected() {
        let mut pool = RawPool::new();
        let ptr = pool.allocate(layout(24)).unwrap();
        // Safety: Test code, deliberately wrong.
        unsafe { pool.deallocate(ptr, layout(40)) };
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_detected() {
        let mut pool = RawPool::new();
        let ptr = pool.allocate(layout(24)).unwrap();
        // Safety: Test code, deliberately wrong.
        unsafe {
            pool.deallocate(ptr, layout(24));
            pool.deallocate(ptr, layout(24));
        }
    }
}
