//! Bus metrics: counters shared by every session a bus serves.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

/// Atomic counters updated from the dispatch and retry paths.
#[derive(Debug)]
pub struct BusMetrics {
    admitted: AtomicU64,
    denied: AtomicU64,
    stages_completed: AtomicU64,
    guardrail_rejections: AtomicU64,
    faults: AtomicU64,
    cancellations: AtomicU64,
    retries: AtomicU64,
    sessions_completed: AtomicU64,
    start_time: Instant,
}

impl Default for BusMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl BusMetrics {
    pub fn new() -> Self {
        Self {
            admitted: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            stages_completed: AtomicU64::new(0),
            guardrail_rejections: AtomicU64::new(0),
            faults: AtomicU64::new(0),
            cancellations: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            sessions_completed: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_admitted(&self) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_denied(&self) {
        self.denied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stage_completed(&self) {
        self.stages_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_guardrail_rejection(&self) {
        self.guardrail_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a session stopped by its cancellation token. Not a fault.
    pub fn record_cancelled(&self) {
        self.cancellations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one scheduled retry (not the first attempt).
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_completed(&self) {
        self.sessions_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            admitted: self.admitted.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            stages_completed: self.stages_completed.load(Ordering::Relaxed),
            guardrail_rejections: self.guardrail_rejections.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            sessions_completed: self.sessions_completed.load(Ordering::Relaxed),
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }
}

/// A serializable point-in-time copy of [`BusMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub admitted: u64,
    pub denied: u64,
    pub stages_completed: u64,
    pub guardrail_rejections: u64,
    pub faults: u64,
    pub cancellations: u64,
    pub retries: u64,
    pub sessions_completed: u64,
    pub uptime_secs: u64,
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "admitted={} denied={} stages={} rejections={} faults={} cancelled={} retries={} sessions={}",
            self.admitted,
            self.denied,
            self.stages_completed,
            self.guardrail_rejections,
            self.faults,
            self.cancellations,
            self.retries,
            self.sessions_completed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = BusMetrics::new();
        metrics.record_admitted();
        metrics.record_admitted();
        metrics.record_denied();
        metrics.record_retry();
        metrics.record_fault();
        metrics.record_cancelled();

        let snap = metrics.snapshot();
        assert_eq!(snap.admitted, 2);
        assert_eq!(snap.denied, 1);
        assert_eq!(snap.retries, 1);
        assert_eq!(snap.faults, 1);
        assert_eq!(snap.cancellations, 1);
        assert_eq!(snap.stages_completed, 0);
    }

    #[test]
    fn test_snapshot_display() {
        let snap = MetricsSnapshot {
            admitted: 9,
            ..Default::default()
        };
        assert!(snap.to_string().starts_with("admitted=9 denied=0"));
    }
}
