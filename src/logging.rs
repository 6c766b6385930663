//! Logging for pool operations.
//!
//! Events are emitted through `tracing` under the crate's module paths, so a
//! `binpool=...` directive controls all of them. Nothing is printed unless the
//! host installs a subscriber, either its own or the one from
//! [`init_logging`].

pub(crate) use tracing::{debug, error, trace, warn};

/// Install a compact fmt subscriber filtered by `RUST_LOG`.
///
/// Without `RUST_LOG`, debug builds log `binpool` at DEBUG and release builds
/// at INFO. Calling this when a global subscriber already exists does
/// nothing.
pub fn init_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        #[cfg(debug_assertions)]
        {
            EnvFilter::new("binpool=debug")
        }
        #[cfg(not(debug_assertions))]
        {
            EnvFilter::new("binpool=info")
        }
    });

    fmt()
        .with_env_filter(filter)
        .compact()
        .try_init()
        .ok(); // already initialised
}

#[inline]
pub(crate) fn log_growth(bytes: usize, total_grown: usize, system_calls: usize) {
    debug!(bytes, total_grown, system_calls, "arena grown");
}

#[inline]
pub(crate) fn log_refill(size: usize, count: usize) {
    trace!(size, count, "free list refilled");
}

#[inline]
pub(crate) fn log_donation(bytes: usize) {
    trace!(bytes, "arena remainder donated to its own class");
}

#[inline]
pub(crate) fn log_scavenge_start(bytes: usize, size: usize) {
    warn!(bytes, size, "system allocator failed during arena growth, scavenging");
}

#[inline]
pub(crate) fn log_scavenged(size: usize, block_size: usize) {
    debug!(size, block_size, "spare block taken over as arena");
}

#[inline]
pub(crate) fn log_exhausted(bytes: usize, size: usize) {
    error!(bytes, size, "pool exhausted, no spare block to scavenge");
}

#[inline]
pub(crate) fn log_large_failure(bytes: usize) {
    error!(bytes, "large allocation failed");
}
