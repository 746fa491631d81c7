//! Engine-wide activity counters.
//!
//! Counters are lock-free `AtomicU64` with `Relaxed` ordering; readers may
//! observe slightly stale values but never torn ones. Snapshots are
//! serializable for test and diagnostic dumps.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Global engine metrics singleton.
pub static GLOBAL_ENGINE_METRICS: EngineMetrics = EngineMetrics::new();

/// Atomic counters for engine activity.
pub struct EngineMetrics {
    /// Write transactions committed.
    pub commits_total: AtomicU64,
    /// Transactions aborted (conflict or explicit).
    pub aborts_total: AtomicU64,
    /// Successful start-time extensions inside field accessors.
    pub extensions_total: AtomicU64,
    /// Transactions that entered irrevocable mode.
    pub irrevocable_total: AtomicU64,
    /// Objects handed to safe memory reclamation.
    pub retired_total: AtomicU64,
    /// Objects destroyed by reclamation sweeps.
    pub reclaimed_total: AtomicU64,
}

impl EngineMetrics {
    /// Create a metrics instance with all counters at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            commits_total: AtomicU64::new(0),
            aborts_total: AtomicU64::new(0),
            extensions_total: AtomicU64::new(0),
            irrevocable_total: AtomicU64::new(0),
            retired_total: AtomicU64::new(0),
            reclaimed_total: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_commit(&self) {
        self.commits_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_abort(&self) {
        self.aborts_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_extension(&self) {
        self.extensions_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_irrevocable(&self) {
        self.irrevocable_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retired(&self) {
        self.retired_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reclaimed(&self, n: u64) {
        self.reclaimed_total.fetch_add(n, Ordering::Relaxed);
    }

    /// Read a point-in-time snapshot.
    #[must_use]
    pub fn snapshot(&self) -> EngineMetricsSnapshot {
        EngineMetricsSnapshot {
            commits_total: self.commits_total.load(Ordering::Relaxed),
            aborts_total: self.aborts_total.load(Ordering::Relaxed),
            extensions_total: self.extensions_total.load(Ordering::Relaxed),
            irrevocable_total: self.irrevocable_total.load(Ordering::Relaxed),
            retired_total: self.retired_total.load(Ordering::Relaxed),
            reclaimed_total: self.reclaimed_total.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters to zero (tests/diagnostics).
    pub fn reset(&self) {
        self.commits_total.store(0, Ordering::Relaxed);
        self.aborts_total.store(0, Ordering::Relaxed);
        self.extensions_total.store(0, Ordering::Relaxed);
        self.irrevocable_total.store(0, Ordering::Relaxed);
        self.retired_total.store(0, Ordering::Relaxed);
        self.reclaimed_total.store(0, Ordering::Relaxed);
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable snapshot of engine metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineMetricsSnapshot {
    /// Write transactions committed.
    pub commits_total: u64,
    /// Transactions aborted.
    pub aborts_total: u64,
    /// Start-time extensions.
    pub extensions_total: u64,
    /// Irrevocable entries.
    pub irrevocable_total: u64,
    /// Objects retired.
    pub retired_total: u64,
    /// Objects reclaimed.
    pub reclaimed_total: u64,
}

impl std::fmt::Display for EngineMetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "engine(commits={} aborts={} extends={} irrevoc={} retired={} reclaimed={})",
            self.commits_total,
            self.aborts_total,
            self.extensions_total,
            self.irrevocable_total,
            self.retired_total,
            self.reclaimed_total,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::EngineMetrics;

    #[test]
    fn snapshot_reflects_recorded_events() {
        let m = EngineMetrics::new();
        m.record_commit();
        m.record_commit();
        m.record_abort();
        m.record_extension();
        m.record_retired();
        m.record_reclaimed(3);

        let snap = m.snapshot();
        assert_eq!(snap.commits_total, 2);
        assert_eq!(snap.aborts_total, 1);
        assert_eq!(snap.extensions_total, 1);
        assert_eq!(snap.retired_total, 1);
        assert_eq!(snap.reclaimed_total, 3);
    }

    #[test]
    fn reset_zeroes_everything() {
        let m = EngineMetrics::new();
        m.record_commit();
        m.reset();
        assert_eq!(m.snapshot().commits_total, 0);
    }

    #[test]
    fn snapshot_serializes_and_displays() {
        let m = EngineMetrics::new();
        m.record_abort();
        let snap = m.snapshot();
        let json = serde_json::to_string(&snap).expect("serialize snapshot");
        assert!(json.contains("\"aborts_total\":1"));
        assert!(format!("{snap}").contains("aborts=1"));
    }
}
