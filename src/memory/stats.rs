//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent; a snapshot taken while other threads allocate may
//! mix old and new values. Diagnostic display only, never allocation
//! decisions.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Readers use `load()`/`get()`, which clamp transient negative values to
/// zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    #[allow(dead_code)]
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0).cast_unsigned()
    }
}

// Every request sent to the system allocator (arena growth, large allocation,
// large reallocation), summed over every pool.
crate::sync::static_atomic! {
    pub static TOTAL_SYSTEM_CALLS: Counter = Counter::new();
}
// Bytes currently held in arena regions, summed over every live pool.
crate::sync::static_atomic! {
    pub static TOTAL_ARENA_BYTES: Counter = Counter::new();
}

/// Snapshot of one pool's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Every request sent to the system allocator, failed or not: arena
    /// growth, large allocation and large reallocation.
    pub system_calls: usize,
    /// Bytes ever obtained for arena growth.
    pub total_grown: usize,
    /// Bytes left between the arena cursor and its limit.
    pub arena_remaining: usize,
    /// Free-list refills served from the arena.
    pub refills: usize,
    /// Times growth failed and a spare block was taken over as the arena.
    pub scavenges: usize,
    /// Requests sent straight to the system allocator.
    pub large_allocs: usize,
    /// Blocks currently sitting in the free lists.
    pub free_blocks: usize,
}

/// Process-wide counters, see [`global_stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GlobalStats {
    pub total_system_calls: usize,
    pub total_arena_bytes: usize,
}

pub fn global_stats() -> GlobalStats {
    GlobalStats {
        total_system_calls: TOTAL_SYSTEM_CALLS.load(Ordering::Relaxed),
        total_arena_bytes: TOTAL_ARENA_BYTES.load(Ordering::Relaxed),
    }
}
