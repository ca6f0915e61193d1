//! Engine metrics collection
//!
//! Counters are updated with relaxed atomics from any worker; `snapshot()`
//! gives a consistent-enough view for dashboards and tests.

use std::sync::atomic::{AtomicU64, Ordering};

/// Engine execution metrics
#[derive(Debug, Default)]
pub struct EngineMetrics {
    /// Node executions that moved QUEUED -> RUNNING
    pub nodes_started: AtomicU64,
    /// Resume jobs that passed the status guard
    pub nodes_resumed: AtomicU64,
    /// Node executions that reached a terminal status
    pub nodes_terminal: AtomicU64,
    /// Broker callbacks delivered to the engine
    pub callbacks_delivered: AtomicU64,
    /// Resume or continue attempts rejected by a status guard
    pub duplicate_resumes_rejected: AtomicU64,
    /// Timeout cleanup calls that failed (leaked timeout instances)
    pub timeout_cleanup_failures: AtomicU64,
    /// Execution-input waits that passed their validity window
    pub inputs_expired: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_started(&self) {
        self.nodes_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resumed(&self) {
        self.nodes_resumed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_terminal(&self) {
        self.nodes_terminal.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_callback(&self) {
        self.callbacks_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected_resume(&self) {
        self.duplicate_resumes_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout_cleanup_failure(&self) {
        self.timeout_cleanup_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_input_expired(&self) {
        self.inputs_expired.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            nodes_started: self.nodes_started.load(Ordering::Relaxed),
            nodes_resumed: self.nodes_resumed.load(Ordering::Relaxed),
            nodes_terminal: self.nodes_terminal.load(Ordering::Relaxed),
            callbacks_delivered: self.callbacks_delivered.load(Ordering::Relaxed),
            duplicate_resumes_rejected: self.duplicate_resumes_rejected.load(Ordering::Relaxed),
            timeout_cleanup_failures: self.timeout_cleanup_failures.load(Ordering::Relaxed),
            inputs_expired: self.inputs_expired.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub nodes_started: u64,
    pub nodes_resumed: u64,
    pub nodes_terminal: u64,
    pub callbacks_delivered: u64,
    pub duplicate_resumes_rejected: u64,
    pub timeout_cleanup_failures: u64,
    pub inputs_expired: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = EngineMetrics::new();
        metrics.record_started();
        metrics.record_started();
        metrics.record_terminal();
        metrics.record_timeout_cleanup_failure();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.nodes_started, 2);
        assert_eq!(snapshot.nodes_terminal, 1);
        assert_eq!(snapshot.timeout_cleanup_failures, 1);
        assert_eq!(snapshot.callbacks_delivered, 0);
    }
}
