//! Queue health tracking.
//!
//! `StatusTracker` keeps the counters that cannot be recovered from the queue
//! contents (completions, attempt outcomes, latency). `QueueStatus` combines
//! them with a fresh scan of the queue; it is derived data and never
//! authoritative.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::operation::OperationStatus;
use super::store::{OperationQueue, QueueLimits};

/// How close the queue is to its capacity limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backpressure {
    Normal,
    Elevated,
    Critical,
}

impl Backpressure {
    fn from_utilization(utilization: f64) -> Self {
        if utilization < 0.75 {
            Backpressure::Normal
        } else if utilization < 0.90 {
            Backpressure::Elevated
        } else {
            Backpressure::Critical
        }
    }
}

/// Counters accumulated over the queue's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusCounters {
    pub completed: u64,
    pub attempts_succeeded: u64,
    pub attempts_failed: u64,
    pub expired: u64,
    pub evicted: u64,
    pub average_latency_ms: f64,
}

/// Aggregate view of the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: u64,
    pub failed: usize,
    /// Queued operations that have failed at least once
    pub retrying: usize,
    pub size_bytes: usize,
    pub average_latency_ms: f64,
    pub success_rate: f64,
    pub oldest_pending: Option<DateTime<Utc>>,
    pub backpressure: Backpressure,
}

impl QueueStatus {
    pub fn summary(&self) -> String {
        format!(
            "{} queued ({} pending, {} processing, {} retrying, {} failed), {} completed, {} bytes, {:.0}% success, {:.1}ms avg",
            self.total,
            self.pending,
            self.processing,
            self.retrying,
            self.failed,
            self.completed,
            self.size_bytes,
            self.success_rate * 100.0,
            self.average_latency_ms
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct StatusTracker {
    counters: StatusCounters,
    last_logged_completed: u64,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restore(counters: StatusCounters) -> Self {
        Self {
            last_logged_completed: counters.completed,
            counters,
        }
    }

    pub fn counters(&self) -> &StatusCounters {
        &self.counters
    }

    /// Record a completed operation and fold its latency into the running average.
    pub fn record_success(&mut self, latency: Duration) {
        self.counters.completed += 1;
        self.counters.attempts_succeeded += 1;

        let sample = latency.as_secs_f64() * 1000.0;
        let n = self.counters.attempts_succeeded as f64;
        self.counters.average_latency_ms += (sample - self.counters.average_latency_ms) / n;
    }

    pub fn record_failure(&mut self) {
        self.counters.attempts_failed += 1;
    }

    pub fn record_expired(&mut self, count: usize) {
        self.counters.expired += count as u64;
    }

    pub fn record_evicted(&mut self, count: usize) {
        self.counters.evicted += count as u64;
    }

    pub fn success_rate(&self) -> f64 {
        let attempts = self.counters.attempts_succeeded + self.counters.attempts_failed;
        if attempts == 0 {
            1.0
        } else {
            self.counters.attempts_succeeded as f64 / attempts as f64
        }
    }

    /// Recompute the aggregate status from the queue contents.
    pub fn snapshot(&self, queue: &OperationQueue, limits: &QueueLimits) -> QueueStatus {
        let mut pending = 0;
        let mut failed = 0;
        let mut retrying = 0;
        let mut oldest_pending: Option<DateTime<Utc>> = None;

        for op in queue.iter() {
            match op.status {
                OperationStatus::Queued => {
                    pending += 1;
                    if op.retry_count > 0 {
                        retrying += 1;
                    }
                    oldest_pending = Some(match oldest_pending {
                        Some(oldest) => oldest.min(op.timestamp),
                        None => op.timestamp,
                    });
                }
                OperationStatus::Failed => failed += 1,
                OperationStatus::Processing => {}
            }
        }

        let count_utilization = queue.len() as f64 / limits.max_items.max(1) as f64;
        let byte_utilization = queue.total_bytes() as f64 / limits.max_bytes.max(1) as f64;

        QueueStatus {
            total: queue.len(),
            pending,
            processing: queue.in_flight_count(),
            completed: self.counters.completed,
            failed,
            retrying,
            size_bytes: queue.total_bytes(),
            average_latency_ms: self.counters.average_latency_ms,
            success_rate: self.success_rate(),
            oldest_pending,
            backpressure: Backpressure::from_utilization(count_utilization.max(byte_utilization)),
        }
    }

    /// Log progress every 100 completions or when forced.
    pub fn log_progress(&mut self, status: &QueueStatus, force: bool) {
        let since_last = self.counters.completed.saturating_sub(self.last_logged_completed);
        if force || since_last >= 100 {
            info!("Queue progress: {}", status.summary());
            self.last_logged_completed = self.counters.completed;
        }
        if status.backpressure == Backpressure::Critical {
            warn!(
                "Queue near capacity: {} operations, {} bytes",
                status.total, status.size_bytes
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::store::tests::make_op;

    fn limits() -> QueueLimits {
        QueueLimits {
            max_items: 4,
            max_bytes: 1000,
            protected_priority: 3,
            retention: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_running_average_latency() {
        let mut tracker = StatusTracker::new();
        tracker.record_success(Duration::from_millis(10));
        tracker.record_success(Duration::from_millis(30));
        assert!((tracker.counters().average_latency_ms - 20.0).abs() < 1e-9);
        assert_eq!(tracker.counters().completed, 2);
    }

    #[test]
    fn test_success_rate() {
        let mut tracker = StatusTracker::new();
        assert_eq!(tracker.success_rate(), 1.0);
        tracker.record_success(Duration::from_millis(5));
        tracker.record_failure();
        tracker.record_failure();
        tracker.record_success(Duration::from_millis(5));
        assert!((tracker.success_rate() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_snapshot_counts() {
        let mut queue = OperationQueue::new();
        let now = Utc::now();
        let a = make_op(1, 100, now);
        let b = make_op(2, 100, now);
        let mut c = make_op(3, 100, now - chrono::Duration::seconds(5));
        c.retry_count = 1;
        let a_id = a.id;

        for op in [a, b, c] {
            queue.add(op, &limits(), now).unwrap();
        }
        assert!(queue.claim(&a_id));

        let status = StatusTracker::new().snapshot(&queue, &limits());
        assert_eq!(status.total, 3);
        assert_eq!(status.pending, 2);
        assert_eq!(status.processing, 1);
        assert_eq!(status.retrying, 1);
        assert_eq!(status.size_bytes, 300);
        assert_eq!(status.oldest_pending, Some(now - chrono::Duration::seconds(5)));
        assert_eq!(status.backpressure, Backpressure::Elevated);
    }
}
