//! The global monotone timestamp source.
//!
//! A single shared counter provides the engine's clock. Reading the clock is
//! a fetch-add, so every caller observes a strictly fresh value and the
//! values of any two calls are totally ordered consistently with
//! happens-before: a commit that finished before another operation began
//! published a strictly smaller timestamp.
//!
//! The top bit of the counter is reserved (orec lock words set it), and the
//! counter starts at zero, so the clock cannot reach [`END_OF_TIME`] within
//! the lifetime of a process.

use std::sync::atomic::{AtomicU64, Ordering};

use orestm_types::Timestamp;

static CLOCK: AtomicU64 = AtomicU64::new(0);

/// Read the clock with full ordering: all prior memory effects of this
/// thread are ordered before the read.
#[inline]
pub fn now_strong() -> Timestamp {
    CLOCK.fetch_add(1, Ordering::SeqCst) + 1
}

/// Read the clock without ordering beyond the counter's own atomicity.
///
/// Callers that need the value fenced against surrounding accesses (scope
/// begin/end paths) publish it through a sequentially consistent swap, which
/// supplies the ordering the raw read does not.
#[inline]
pub fn now_relaxed() -> Timestamp {
    CLOCK.fetch_add(1, Ordering::Relaxed) + 1
}
