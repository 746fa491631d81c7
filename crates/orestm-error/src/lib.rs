//! Error types for the orestm workspace.
//!
//! The engine's hot-path primitives never construct errors: acquisition and
//! validation report failure through sentinel return values, and scoped
//! operations recover by aborting and retrying internally. The variants here
//! cover the remaining, caller-visible failure class: invalid configuration
//! detected during construction.

use thiserror::Error;

/// Primary error type for orestm operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrestmError {
    /// Hash-map bucket counts must be nonzero powers of two so that bucket
    /// selection can mask instead of divide, and so that table doubling
    /// splits every bucket into exactly two.
    #[error("bucket count {got} is not a nonzero power of two")]
    BucketsNotPowerOfTwo {
        /// The rejected bucket count.
        got: u64,
    },

    /// The resize threshold must be nonzero or every insert would trigger
    /// a rehash.
    #[error("resize threshold must be nonzero")]
    ZeroResizeThreshold,

    /// Skip-list towers are bounded so that nodes can inline their level
    /// arrays; the bound must fit the configured ceiling.
    #[error("max_levels {got} exceeds the supported ceiling of {max}")]
    MaxLevelsTooLarge {
        /// The rejected level count.
        got: u32,
        /// The largest supported level count.
        max: u32,
    },

    /// Chunked hash tables need at least one slot per chunk.
    #[error("chunksize must be nonzero")]
    ZeroChunkSize,

    /// Snapshot cadence of zero would checkpoint before visiting any node.
    #[error("snapshot_freq must be nonzero")]
    ZeroSnapshotFreq,
}

/// Convenience alias used across the workspace.
pub type Result<T, E = OrestmError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::OrestmError;

    #[test]
    fn display_names_the_offending_value() {
        let err = OrestmError::BucketsNotPowerOfTwo { got: 12 };
        assert_eq!(err.to_string(), "bucket count 12 is not a nonzero power of two");

        let err = OrestmError::MaxLevelsTooLarge { got: 99, max: 32 };
        assert!(err.to_string().contains("99"));
        assert!(err.to_string().contains("32"));
    }
}
