//! Running counters for client calls.

use std::time::Duration;

use serde::Serialize;

/// Accumulated call metrics. Counters only ever grow.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metrics {
    operation_count: u64,
    total_duration: Duration,
    snapshots_suppressed: u64,
    batch_operations: u64,
    /// Steps executed inside batches.
    batched_calls: u64,
    avg_latency: Duration,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed single call or batch.
    pub fn record(&mut self, duration: Duration, suppressed: bool, is_batch: bool) {
        self.operation_count += 1;
        self.total_duration += duration;
        if suppressed {
            self.snapshots_suppressed += 1;
        }
        if is_batch {
            self.batch_operations += 1;
        }
        self.recompute_average();
    }

    /// Count snapshots suppressed inside a batch.
    pub fn record_suppressed(&mut self, count: u64) {
        self.snapshots_suppressed += count;
    }

    /// Count steps dispatched inside a batch.
    pub fn record_batched_calls(&mut self, count: u64) {
        self.batched_calls += count;
    }

    fn recompute_average(&mut self) {
        self.avg_latency = if self.operation_count == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(self.total_duration.as_secs_f64() / self.operation_count as f64)
        };
    }

    pub fn operation_count(&self) -> u64 {
        self.operation_count
    }

    pub fn total_duration(&self) -> Duration {
        self.total_duration
    }

    pub fn snapshots_suppressed(&self) -> u64 {
        self.snapshots_suppressed
    }

    pub fn batch_operations(&self) -> u64 {
        self.batch_operations
    }

    pub fn avg_latency(&self) -> Duration {
        self.avg_latency
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            operation_count: self.operation_count,
            total_duration_secs: self.total_duration.as_secs_f64(),
            avg_latency_secs: self.avg_latency.as_secs_f64(),
            snapshots_suppressed: self.snapshots_suppressed,
            batch_operations: self.batch_operations,
            batched_calls: self.batched_calls,
            batch_efficiency: if self.operation_count == 0 {
                0.0
            } else {
                self.batch_operations as f64 / self.operation_count as f64
            },
        }
    }
}

/// Serializable metrics snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub operation_count: u64,
    pub total_duration_secs: f64,
    pub avg_latency_secs: f64,
    pub snapshots_suppressed: u64,
    pub batch_operations: u64,
    pub batched_calls: u64,
    /// Share of recorded operations that were batches; 0 when nothing ran.
    pub batch_efficiency: f64,
}
