//! Map construction parameters.

use orestm_error::{OrestmError, Result};
use serde::{Deserialize, Serialize};

/// The largest supported skip-list tower height.
///
/// Towers are allocated inline with the node, so an unbounded height would
/// let a pathological PRNG streak allocate absurd nodes.
pub const MAX_SKIPLIST_LEVELS: u32 = 32;

/// Construction parameters recognized by the maps.
///
/// Every map reads the subset of fields it cares about and ignores the rest:
/// hash maps use `buckets` and `resize_threshold`, chunked tables use
/// `chunksize`, skip lists use `max_levels`, and list traversals use
/// `snapshot_freq`. [`MapConfig::validate`] is called by every constructor;
/// an invalid combination is a fatal initialisation failure, never a
/// run-time one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapConfig {
    /// Number of buckets for hash maps. Must be a nonzero power of two.
    pub buckets: u64,
    /// Maximum bucket chain length before a hash map doubles its table.
    pub resize_threshold: u64,
    /// Number of key/value slots per chunk in chunked tables.
    pub chunksize: u64,
    /// Number of index layers in a skip-list tower (the data layer is not
    /// counted).
    pub max_levels: u32,
    /// List traversals take a resumption snapshot once per this many nodes.
    pub snapshot_freq: u32,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            buckets: 128,
            resize_threshold: 8,
            chunksize: 8,
            max_levels: 16,
            snapshot_freq: 64,
        }
    }
}

impl MapConfig {
    /// Check every field against its constraint.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint: non-power-of-two `buckets`,
    /// zero `resize_threshold`, zero `chunksize`, zero `snapshot_freq`, or
    /// `max_levels` above [`MAX_SKIPLIST_LEVELS`].
    pub fn validate(&self) -> Result<()> {
        if self.buckets == 0 || !self.buckets.is_power_of_two() {
            return Err(OrestmError::BucketsNotPowerOfTwo { got: self.buckets });
        }
        if self.resize_threshold == 0 {
            return Err(OrestmError::ZeroResizeThreshold);
        }
        if self.chunksize == 0 {
            return Err(OrestmError::ZeroChunkSize);
        }
        if self.snapshot_freq == 0 {
            return Err(OrestmError::ZeroSnapshotFreq);
        }
        if self.max_levels > MAX_SKIPLIST_LEVELS {
            return Err(OrestmError::MaxLevelsTooLarge {
                got: self.max_levels,
                max: MAX_SKIPLIST_LEVELS,
            });
        }
        Ok(())
    }

    /// Builder-style override of `buckets`.
    #[must_use]
    pub fn with_buckets(mut self, buckets: u64) -> Self {
        self.buckets = buckets;
        self
    }

    /// Builder-style override of `resize_threshold`.
    #[must_use]
    pub fn with_resize_threshold(mut self, resize_threshold: u64) -> Self {
        self.resize_threshold = resize_threshold;
        self
    }

    /// Builder-style override of `chunksize`.
    #[must_use]
    pub fn with_chunksize(mut self, chunksize: u64) -> Self {
        self.chunksize = chunksize;
        self
    }

    /// Builder-style override of `max_levels`.
    #[must_use]
    pub fn with_max_levels(mut self, max_levels: u32) -> Self {
        self.max_levels = max_levels;
        self
    }

    /// Builder-style override of `snapshot_freq`.
    #[must_use]
    pub fn with_snapshot_freq(mut self, snapshot_freq: u32) -> Self {
        self.snapshot_freq = snapshot_freq;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::{MAX_SKIPLIST_LEVELS, MapConfig};
    use orestm_error::OrestmError;

    #[test]
    fn default_config_is_valid() {
        assert!(MapConfig::default().validate().is_ok());
    }

    #[test]
    fn bucket_count_must_be_power_of_two() {
        let cfg = MapConfig::default().with_buckets(12);
        assert_eq!(
            cfg.validate(),
            Err(OrestmError::BucketsNotPowerOfTwo { got: 12 })
        );
        assert!(MapConfig::default().with_buckets(1).validate().is_ok());
        assert!(MapConfig::default().with_buckets(0).validate().is_err());
    }

    #[test]
    fn level_ceiling_is_enforced() {
        let cfg = MapConfig::default().with_max_levels(MAX_SKIPLIST_LEVELS + 1);
        assert!(matches!(
            cfg.validate(),
            Err(OrestmError::MaxLevelsTooLarge { .. })
        ));
    }

    #[test]
    fn zero_cadences_are_rejected() {
        assert!(MapConfig::default().with_snapshot_freq(0).validate().is_err());
        assert!(MapConfig::default().with_chunksize(0).validate().is_err());
        assert!(
            MapConfig::default()
                .with_resize_threshold(0)
                .validate()
                .is_err()
        );
    }

    proptest::proptest! {
        #[test]
        fn prop_validate_accepts_exactly_power_of_two_buckets(buckets in 0_u64..1 << 20) {
            let cfg = MapConfig::default().with_buckets(buckets);
            let ok = buckets != 0 && buckets.is_power_of_two();
            proptest::prop_assert_eq!(cfg.validate().is_ok(), ok);
        }
    }
}
