//! Sweep queue counters, per strategy. Monotonic atomics with an immutable
//! snapshot for inspection, mirrored to the process metrics registry.

use std::sync::atomic::{AtomicU64, Ordering};

use kestrel_common::types::SweepStrategy;

#[derive(Debug, Default)]
struct StrategyCounters {
    enqueued_writes: AtomicU64,
    entries_read: AtomicU64,
    aborted_writes_deleted: AtomicU64,
}

#[derive(Debug, Default)]
pub struct SweepMetrics {
    conservative: StrategyCounters,
    thorough: StrategyCounters,
}

/// Immutable snapshot of one strategy's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepMetricsSnapshot {
    pub enqueued_writes: u64,
    pub entries_read: u64,
    pub aborted_writes_deleted: u64,
}

impl SweepMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes accepted into the queue, counted at enqueue time.
    pub fn record_enqueued_writes(&self, strategy: SweepStrategy, count: u64) {
        self.counters(strategy)
            .enqueued_writes
            .fetch_add(count, Ordering::Relaxed);
        metrics::counter!(
            "kestrel_sweep_enqueued_writes_total",
            "strategy" => strategy.label()
        )
        .increment(count);
    }

    /// Raw queue entries touched by a read, before latest-per-cell
    /// reduction.
    pub fn record_entries_read(&self, strategy: SweepStrategy, count: u64) {
        self.counters(strategy)
            .entries_read
            .fetch_add(count, Ordering::Relaxed);
        metrics::counter!(
            "kestrel_sweep_entries_read_total",
            "strategy" => strategy.label()
        )
        .increment(count);
    }

    /// User-table versions deleted because their transactions aborted.
    pub fn record_aborted_writes_deleted(&self, strategy: SweepStrategy, count: u64) {
        self.counters(strategy)
            .aborted_writes_deleted
            .fetch_add(count, Ordering::Relaxed);
        metrics::counter!(
            "kestrel_sweep_aborted_writes_deleted_total",
            "strategy" => strategy.label()
        )
        .increment(count);
    }

    pub fn snapshot(&self, strategy: SweepStrategy) -> SweepMetricsSnapshot {
        let counters = self.counters(strategy);
        SweepMetricsSnapshot {
            enqueued_writes: counters.enqueued_writes.load(Ordering::Relaxed),
            entries_read: counters.entries_read.load(Ordering::Relaxed),
            aborted_writes_deleted: counters.aborted_writes_deleted.load(Ordering::Relaxed),
        }
    }

    fn counters(&self, strategy: SweepStrategy) -> &StrategyCounters {
        match strategy {
            SweepStrategy::Conservative => &self.conservative,
            SweepStrategy::Thorough => &self.thorough,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate_per_strategy() {
        let metrics = SweepMetrics::new();
        metrics.record_enqueued_writes(SweepStrategy::Conservative, 10);
        metrics.record_enqueued_writes(SweepStrategy::Conservative, 5);
        metrics.record_entries_read(SweepStrategy::Thorough, 7);
        metrics.record_aborted_writes_deleted(SweepStrategy::Conservative, 2);

        let cons = metrics.snapshot(SweepStrategy::Conservative);
        assert_eq!(cons.enqueued_writes, 15);
        assert_eq!(cons.entries_read, 0);
        assert_eq!(cons.aborted_writes_deleted, 2);

        let thor = metrics.snapshot(SweepStrategy::Thorough);
        assert_eq!(thor.enqueued_writes, 0);
        assert_eq!(thor.entries_read, 7);
    }
}
