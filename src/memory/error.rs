use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The system allocator refused a request above the pooled range.
    /// Never retried.
    #[error("system allocation of {bytes} bytes failed")]
    LargeAllocFailed { bytes: usize },

    /// Arena growth failed and no free block of size `size` or larger was
    /// left to recover from.
    #[error("pool exhausted: arena growth of {bytes} bytes failed and no spare block of {size} bytes or more is free")]
    ArenaExhausted { bytes: usize, size: usize },

    #[error("capacity overflow: {count} elements of {elem_size} bytes")]
    CapacityOverflow { count: usize, elem_size: usize },

    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
}

impl PoolError {
    /// True for both flavours of out-of-memory.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(
            self,
            PoolError::LargeAllocFailed { .. } | PoolError::ArenaExhausted { .. }
        )
    }
}
