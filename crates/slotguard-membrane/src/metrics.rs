//! Atomic counters for arena observability.
//!
//! All counters use relaxed ordering; they are advisory/diagnostic,
//! not synchronization primitives. Each arena owns its own set.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Per-arena operation counters.
pub struct ArenaMetrics {
    /// Successful allocations (raw and handle-managed).
    pub allocations: AtomicU64,
    /// Allocation requests refused with `PoolExhausted`.
    pub exhaustions: AtomicU64,
    /// Successful releases.
    pub deallocations: AtomicU64,
    /// Double frees detected.
    pub double_frees: AtomicU64,
    /// Stale, foreign or handle-owned references rejected.
    pub invalid_handles: AtomicU64,
    /// Use-after-free accesses and poison violations detected.
    pub use_after_frees: AtomicU64,
    /// Canary failures and out-of-bounds raw writes.
    pub buffer_overflows: AtomicU64,
    /// Slots admitted to quarantine.
    pub quarantine_admissions: AtomicU64,
    /// Slots released from quarantine back to the free list.
    pub quarantine_releases: AtomicU64,
    /// Weak handles successfully upgraded.
    pub upgrades: AtomicU64,
    /// Weak upgrades refused because the referent was gone.
    pub failed_upgrades: AtomicU64,
    /// Integrity scans run.
    pub integrity_scans: AtomicU64,
}

impl ArenaMetrics {
    /// Create a new zeroed metrics instance.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            allocations: AtomicU64::new(0),
            exhaustions: AtomicU64::new(0),
            deallocations: AtomicU64::new(0),
            double_frees: AtomicU64::new(0),
            invalid_handles: AtomicU64::new(0),
            use_after_frees: AtomicU64::new(0),
            buffer_overflows: AtomicU64::new(0),
            quarantine_admissions: AtomicU64::new(0),
            quarantine_releases: AtomicU64::new(0),
            upgrades: AtomicU64::new(0),
            failed_upgrades: AtomicU64::new(0),
            integrity_scans: AtomicU64::new(0),
        }
    }

    /// Increment a counter by 1.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read a counter value.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Snapshot all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            allocations: Self::get(&self.allocations),
            exhaustions: Self::get(&self.exhaustions),
            deallocations: Self::get(&self.deallocations),
            double_frees: Self::get(&self.double_frees),
            invalid_handles: Self::get(&self.invalid_handles),
            use_after_frees: Self::get(&self.use_after_frees),
            buffer_overflows: Self::get(&self.buffer_overflows),
            quarantine_admissions: Self::get(&self.quarantine_admissions),
            quarantine_releases: Self::get(&self.quarantine_releases),
            upgrades: Self::get(&self.upgrades),
            failed_upgrades: Self::get(&self.failed_upgrades),
            integrity_scans: Self::get(&self.integrity_scans),
        }
    }
}

impl Default for ArenaMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of all arena counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub allocations: u64,
    pub exhaustions: u64,
    pub deallocations: u64,
    pub double_frees: u64,
    pub invalid_handles: u64,
    pub use_after_frees: u64,
    pub buffer_overflows: u64,
    pub quarantine_admissions: u64,
    pub quarantine_releases: u64,
    pub upgrades: u64,
    pub failed_upgrades: u64,
    pub integrity_scans: u64,
}

impl MetricsSnapshot {
    /// Total memory-safety findings counted.
    #[must_use]
    pub const fn violations(&self) -> u64 {
        self.double_frees + self.invalid_handles + self.use_after_frees + self.buffer_overflows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let m = ArenaMetrics::new();
        let snap = m.snapshot();
        assert_eq!(snap, MetricsSnapshot::default());
        assert_eq!(snap.violations(), 0);
    }

    #[test]
    fn increment_works() {
        let m = ArenaMetrics::new();
        ArenaMetrics::inc(&m.allocations);
        ArenaMetrics::inc(&m.allocations);
        ArenaMetrics::inc(&m.double_frees);
        ArenaMetrics::inc(&m.use_after_frees);
        let snap = m.snapshot();
        assert_eq!(snap.allocations, 2);
        assert_eq!(snap.double_frees, 1);
        assert_eq!(snap.violations(), 2);
    }
}
