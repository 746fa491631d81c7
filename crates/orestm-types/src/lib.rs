//! Shared plain types for the orestm engine and maps.
//!
//! This crate holds the leaf vocabulary of the workspace: timestamps and the
//! end-of-time sentinel, scalar width tags, the map configuration object,
//! the bit-mixing hash finaliser, the fast per-thread PRNG, and the
//! cache-line alignment wrapper. Nothing here performs synchronization.

pub mod cache_aligned;
pub mod config;
pub mod hash;
pub mod rng;
pub mod timestamp;

pub use cache_aligned::{CACHE_LINE_BYTES, CacheAligned};
pub use config::MapConfig;
pub use hash::mix13;
pub use rng::FastRand;
pub use timestamp::{END_OF_TIME, Timestamp, Width};
