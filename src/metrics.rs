use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-local lifecycle counters, monotonic since start.
///
/// The durable truth is always the store ([`queue_stats`] for depth); these
/// exist so operators can watch throughput without querying it.
///
/// [`queue_stats`]: crate::storage::JobStore::queue_stats
#[derive(Debug, Default)]
pub struct Metrics {
    completed: AtomicU64,
    failed_attempts: AtomicU64,
    dead_lettered: AtomicU64,
    leases_reaped: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub completed: u64,
    /// Failed attempts, wherever they were settled: worker reports and
    /// reaped leases both count.
    pub failed_attempts: u64,
    pub dead_lettered: u64,
    pub leases_reaped: u64,
}

impl Metrics {
    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_attempt(&self) {
        self.failed_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reaped(&self) {
        self.leases_reaped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            completed: self.completed.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            leases_reaped: self.leases_reaped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_independently() {
        let metrics = Metrics::default();
        metrics.record_completed();
        metrics.record_completed();
        metrics.record_failed_attempt();
        metrics.record_dead_lettered();
        metrics.record_reaped();

        let snap = metrics.snapshot();
        assert_eq!(snap.completed, 2);
        assert_eq!(snap.failed_attempts, 1);
        assert_eq!(snap.dead_lettered, 1);
        assert_eq!(snap.leases_reaped, 1);
    }
}
