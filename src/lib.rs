#[cfg(not(target_pointer_width = "64"))]
compile_error!("binpool supports only 64-bit targets.");

pub(crate) mod sync;

pub mod logging;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// allocators/pools
pub use memory::allocator::{GlobalPool, PoolAllocator};
pub use memory::pool::{PoolConfig, RawPool, SharedPool};

// size classes
pub use memory::size_class::{ALIGN, MAX_POOLED, NUM_CLASSES, class_index, class_size, round_up};

// system allocator seam
pub use memory::system::{FaultySystem, PlatformSystem, SystemAlloc};

// stats
pub use memory::stats::{GlobalStats, PoolStats, global_stats};

// errors
pub use memory::error::PoolError;

pub use logging::init_logging;
