//! In-memory operation queue store.
//!
//! Holds the authoritative set of pending operations together with the
//! dependency graph and the in-flight set. Callers serialize access through a
//! single async mutex, so every method here takes `&mut self` and never awaits.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::backoff::BackoffPolicy;
use super::graph::DependencyGraph;
use super::operation::{OperationId, OperationStatus, QueuedOperation};
use crate::config::QueueConfig;
use crate::error::SyncError;

/// Capacity and retention limits applied by the store.
#[derive(Debug, Clone, Copy)]
pub struct QueueLimits {
    pub max_items: usize,
    pub max_bytes: usize,
    pub protected_priority: u8,
    pub retention: Duration,
}

impl From<&QueueConfig> for QueueLimits {
    fn from(config: &QueueConfig) -> Self {
        Self {
            max_items: config.max_queue_size,
            max_bytes: config.max_queue_size_bytes,
            protected_priority: config.protected_priority,
            retention: config.retention,
        }
    }
}

/// Operations removed by a limit check, grouped by cause.
#[derive(Debug, Default)]
pub struct LimitReport {
    pub expired: Vec<QueuedOperation>,
    pub evicted: Vec<QueuedOperation>,
    pub purged: Vec<QueuedOperation>,
}

impl LimitReport {
    pub fn is_empty(&self) -> bool {
        self.expired.is_empty() && self.evicted.is_empty() && self.purged.is_empty()
    }
}

/// Result of recording a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Back in the queue once the backoff window closes
    Scheduled {
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
    },
    /// Terminally failed; excluded from dispatch until reset
    Exhausted { retry_count: u32 },
}

/// Serializable image of the queue contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub operations: Vec<QueuedOperation>,
    pub next_sequence: u64,
}

#[derive(Debug, Default)]
pub struct OperationQueue {
    operations: HashMap<OperationId, QueuedOperation>,
    graph: DependencyGraph,
    in_flight: HashSet<OperationId>,
    total_bytes: usize,
    next_sequence: u64,
}

impl OperationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a queue from a persisted snapshot.
    ///
    /// Operations that were executing when the snapshot was taken go back to
    /// `Queued`; nothing is in flight after a restart.
    pub fn restore(snapshot: QueueSnapshot) -> Self {
        let mut queue = Self {
            next_sequence: snapshot.next_sequence,
            ..Self::default()
        };

        let mut operations = snapshot.operations;
        operations.sort_by_key(|op| op.sequence);

        for mut op in operations {
            if op.status == OperationStatus::Processing {
                op.status = OperationStatus::Queued;
            }
            if queue.graph.insert(op.id, &op.dependencies).is_err() {
                debug!("Dropping restored operation {} with cyclic dependencies", op.id);
                continue;
            }
            queue.next_sequence = queue.next_sequence.max(op.sequence + 1);
            queue.total_bytes += op.metadata.size;
            queue.operations.insert(op.id, op);
        }

        queue
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let mut operations: Vec<QueuedOperation> = self.operations.values().cloned().collect();
        operations.sort_by_key(|op| op.sequence);
        QueueSnapshot {
            operations,
            next_sequence: self.next_sequence,
        }
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_in_flight(&self, id: &OperationId) -> bool {
        self.in_flight.contains(id)
    }

    pub fn has_outstanding_dependencies(&self, id: &OperationId) -> bool {
        self.graph.has_outstanding(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedOperation> {
        self.operations.values()
    }

    pub fn get(&self, id: &OperationId) -> Option<&QueuedOperation> {
        self.operations.get(id)
    }

    /// Queued operations (including those waiting out a backoff window),
    /// in dispatch order.
    pub fn list_pending(&self) -> Vec<QueuedOperation> {
        let mut pending: Vec<QueuedOperation> = self
            .operations
            .values()
            .filter(|op| op.status == OperationStatus::Queued)
            .cloned()
            .collect();
        pending.sort_by_key(QueuedOperation::order_key);
        pending
    }

    /// Terminally failed operations, most recent attempt first.
    pub fn failed_operations(&self) -> Vec<QueuedOperation> {
        let mut failed: Vec<QueuedOperation> = self
            .operations
            .values()
            .filter(|op| op.is_failed())
            .cloned()
            .collect();
        failed.sort_by(|a, b| b.last_attempt.cmp(&a.last_attempt));
        failed
    }

    /// Add an operation, evicting lower-value work if the queue is full.
    ///
    /// Returns everything the limit check removed to make room.
    pub fn add(
        &mut self,
        mut op: QueuedOperation,
        limits: &QueueLimits,
        now: DateTime<Utc>,
    ) -> Result<LimitReport, SyncError> {
        if self.operations.contains_key(&op.id) {
            return Err(SyncError::DuplicateOperation(op.id));
        }
        if op.metadata.size > limits.max_bytes {
            return Err(SyncError::CapacityExceeded(format!(
                "operation {} is {} bytes, queue limit is {} bytes",
                op.id, op.metadata.size, limits.max_bytes
            )));
        }
        if self.graph.would_cycle(op.id, &op.dependencies) {
            return Err(SyncError::DependencyCycle(op.id));
        }

        // In-flight work cannot be evicted, so refuse up front rather than
        // evicting victims and still failing.
        let pinned_bytes: usize = self
            .in_flight
            .iter()
            .filter_map(|id| self.operations.get(id))
            .map(|pinned| pinned.metadata.size)
            .sum();
        if self.in_flight.len() + 1 > limits.max_items
            || pinned_bytes + op.metadata.size > limits.max_bytes
        {
            return Err(SyncError::CapacityExceeded(format!(
                "no evictable operations to make room for {}",
                op.id
            )));
        }

        let mut report = LimitReport {
            expired: self.sweep_expired(now),
            purged: self.purge_failed(limits.retention, now),
            evicted: Vec::new(),
        };

        while self.operations.len() + 1 > limits.max_items
            || self.total_bytes + op.metadata.size > limits.max_bytes
        {
            match self.evict_one(limits.protected_priority) {
                Some(victim) => report.evicted.push(victim),
                None => {
                    return Err(SyncError::CapacityExceeded(format!(
                        "no evictable operations to make room for {}",
                        op.id
                    )));
                }
            }
        }

        self.graph
            .insert(op.id, &op.dependencies)
            .map_err(SyncError::DependencyCycle)?;

        op.sequence = self.next_sequence;
        op.status = OperationStatus::Queued;
        self.next_sequence += 1;
        self.total_bytes += op.metadata.size;
        self.operations.insert(op.id, op);

        Ok(report)
    }

    /// Remove an operation that is not currently executing.
    pub fn remove(&mut self, id: &OperationId) -> Result<QueuedOperation, SyncError> {
        if self.in_flight.contains(id) {
            return Err(SyncError::OperationInFlight(*id));
        }
        self.take(id).ok_or(SyncError::OperationNotFound(*id))
    }

    /// Sweep expired operations, purge stale failures and evict until the
    /// queue fits its limits again.
    pub fn enforce_limits(&mut self, limits: &QueueLimits, now: DateTime<Utc>) -> LimitReport {
        let mut report = LimitReport {
            expired: self.sweep_expired(now),
            purged: self.purge_failed(limits.retention, now),
            evicted: Vec::new(),
        };

        while self.operations.len() > limits.max_items || self.total_bytes > limits.max_bytes {
            match self.evict_one(limits.protected_priority) {
                Some(victim) => report.evicted.push(victim),
                None => break,
            }
        }

        report
    }

    /// Move an operation into the in-flight set.
    ///
    /// Returns false if it is already executing or not eligible.
    pub fn claim(&mut self, id: &OperationId) -> bool {
        let Some(op) = self.operations.get_mut(id) else {
            return false;
        };
        if op.status != OperationStatus::Queued || !self.in_flight.insert(*id) {
            return false;
        }
        op.status = OperationStatus::Processing;
        true
    }

    /// Withdraw the operations on one entity made at or before `up_to`.
    ///
    /// Idle ones are removed and returned. Executing ones cannot be recalled,
    /// so only their ids come back.
    pub fn supersede(
        &mut self,
        entity_type: &str,
        entity_id: &str,
        up_to: DateTime<Utc>,
    ) -> (Vec<QueuedOperation>, Vec<OperationId>) {
        let target = Some((entity_type, entity_id));
        let (executing, idle): (Vec<OperationId>, Vec<OperationId>) = self
            .operations
            .values()
            .filter(|op| op.timestamp <= up_to && op.entity_key() == target)
            .map(|op| op.id)
            .partition(|id| self.in_flight.contains(id));

        let removed = idle.iter().filter_map(|id| self.take(id)).collect();
        (removed, executing)
    }

    /// Finish a successful execution: release and remove.
    pub fn complete(&mut self, id: &OperationId) -> Option<QueuedOperation> {
        self.in_flight.remove(id);
        self.take(id)
    }

    /// Record a failed attempt and decide whether the operation retries.
    pub fn record_failure(
        &mut self,
        id: &OperationId,
        reason: &str,
        retryable: bool,
        policy: &BackoffPolicy,
        now: DateTime<Utc>,
    ) -> Option<RetryDecision> {
        self.in_flight.remove(id);
        let op = self.operations.get_mut(id)?;

        op.last_attempt = Some(now);
        op.failure_reason = Some(reason.to_string());

        let attempts = op.retry_count.saturating_add(1);
        if !retryable || attempts >= op.max_retries {
            op.retry_count = attempts.min(op.max_retries);
            op.status = OperationStatus::Failed;
            op.next_attempt_at = None;
            return Some(RetryDecision::Exhausted {
                retry_count: op.retry_count,
            });
        }

        op.retry_count = attempts;
        op.status = OperationStatus::Queued;
        let next_attempt_at = policy.next_attempt_at(now, attempts);
        op.next_attempt_at = Some(next_attempt_at);
        Some(RetryDecision::Scheduled {
            retry_count: attempts,
            next_attempt_at,
        })
    }

    /// Re-arm a terminally failed operation.
    pub fn reset(&mut self, id: &OperationId) -> Result<(), SyncError> {
        let op = self
            .operations
            .get_mut(id)
            .ok_or(SyncError::OperationNotFound(*id))?;
        if op.status != OperationStatus::Failed {
            return Err(SyncError::InvalidOperation(format!(
                "operation {id} is {} and cannot be reset",
                op.status
            )));
        }
        op.status = OperationStatus::Queued;
        op.retry_count = 0;
        op.failure_reason = None;
        op.next_attempt_at = None;
        Ok(())
    }

    fn take(&mut self, id: &OperationId) -> Option<QueuedOperation> {
        let op = self.operations.remove(id)?;
        self.total_bytes = self.total_bytes.saturating_sub(op.metadata.size);
        let released = self.graph.remove(id);
        if !released.is_empty() {
            debug!("Removing {} released {} dependent operations", id, released.len());
        }
        Some(op)
    }

    fn sweep_expired(&mut self, now: DateTime<Utc>) -> Vec<QueuedOperation> {
        let expired: Vec<OperationId> = self
            .operations
            .values()
            .filter(|op| !self.in_flight.contains(&op.id) && op.is_expired(now))
            .map(|op| op.id)
            .collect();

        let removed: Vec<QueuedOperation> = expired.iter().filter_map(|id| self.take(id)).collect();
        if !removed.is_empty() {
            info!("Swept {} expired operations", removed.len());
        }
        removed
    }

    fn purge_failed(&mut self, retention: Duration, now: DateTime<Utc>) -> Vec<QueuedOperation> {
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return Vec::new();
        };
        let stale: Vec<OperationId> = self
            .operations
            .values()
            .filter(|op| {
                op.is_failed() && op.last_attempt.is_some_and(|at| at + retention <= now)
            })
            .map(|op| op.id)
            .collect();

        stale.iter().filter_map(|id| self.take(id)).collect()
    }

    /// Pick and remove one victim: the oldest unprotected operation if any,
    /// otherwise the largest one. In-flight operations are never chosen.
    fn evict_one(&mut self, protected_priority: u8) -> Option<QueuedOperation> {
        let in_flight = &self.in_flight;
        let candidates: Vec<&QueuedOperation> = self
            .operations
            .values()
            .filter(|op| !in_flight.contains(&op.id))
            .collect();

        let victim = candidates
            .iter()
            .filter(|op| op.priority > protected_priority)
            .min_by_key(|op| (op.timestamp, op.sequence))
            .or_else(|| {
                candidates.iter().max_by(|a, b| {
                    a.metadata
                        .size
                        .cmp(&b.metadata.size)
                        .then_with(|| b.sequence.cmp(&a.sequence))
                })
            })
            .map(|op| op.id)?;

        let evicted = self.take(&victim);
        if let Some(op) = &evicted {
            info!(
                "Evicted operation {} ({}, priority {}, {} bytes)",
                op.id, op.op_type, op.priority, op.metadata.size
            );
        }
        evicted
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::queue::operation::{EntityKind, OperationCategory, OperationMetadata, OperationType};
    use std::collections::BTreeSet;
    use uuid::Uuid;

    pub(crate) fn make_op(priority: u8, size: usize, timestamp: DateTime<Utc>) -> QueuedOperation {
        QueuedOperation {
            id: Uuid::new_v4(),
            op_type: OperationType::Update(EntityKind::Subscription),
            entity_id: Some("sub-1".to_string()),
            payload: vec![0; size],
            user_id: "user-1".to_string(),
            device_id: "device-a".to_string(),
            timestamp,
            priority,
            retry_count: 0,
            max_retries: 3,
            last_attempt: None,
            failure_reason: None,
            dependencies: BTreeSet::new(),
            expires_at: None,
            next_attempt_at: None,
            status: OperationStatus::Queued,
            sequence: 0,
            metadata: OperationMetadata {
                size,
                compressed: false,
                encrypted: false,
                category: OperationCategory::Entity,
            },
        }
    }

    fn limits(max_items: usize, max_bytes: usize) -> QueueLimits {
        QueueLimits {
            max_items,
            max_bytes,
            protected_priority: 3,
            retention: Duration::from_secs(3600),
        }
    }

    #[test]
    fn test_add_and_get() {
        let mut queue = OperationQueue::new();
        let op = make_op(2, 10, Utc::now());
        let id = op.id;

        queue.add(op, &limits(10, 1000), Utc::now()).unwrap();

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.total_bytes(), 10);
        assert_eq!(queue.get(&id).unwrap().status, OperationStatus::Queued);
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut queue = OperationQueue::new();
        let op = make_op(2, 10, Utc::now());
        queue.add(op.clone(), &limits(10, 1000), Utc::now()).unwrap();

        let err = queue.add(op, &limits(10, 1000), Utc::now()).unwrap_err();
        assert!(matches!(err, SyncError::DuplicateOperation(_)));
    }

    #[test]
    fn test_oversized_operation_rejected() {
        let mut queue = OperationQueue::new();
        let err = queue
            .add(make_op(1, 2000, Utc::now()), &limits(10, 1000), Utc::now())
            .unwrap_err();
        assert!(matches!(err, SyncError::CapacityExceeded(_)));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_eviction_prefers_oldest_unprotected() {
        let mut queue = OperationQueue::new();
        let now = Utc::now();
        let old_low = make_op(5, 10, now - chrono::Duration::seconds(30));
        let new_low = make_op(4, 10, now - chrono::Duration::seconds(10));
        let urgent = make_op(1, 50, now - chrono::Duration::seconds(60));
        let old_low_id = old_low.id;

        queue.add(old_low, &limits(3, 1000), now).unwrap();
        queue.add(new_low, &limits(3, 1000), now).unwrap();
        queue.add(urgent, &limits(3, 1000), now).unwrap();

        let report = queue.add(make_op(2, 10, now), &limits(3, 1000), now).unwrap();
        assert_eq!(report.evicted.len(), 1);
        assert_eq!(report.evicted[0].id, old_low_id);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_eviction_falls_back_to_largest() {
        let mut queue = OperationQueue::new();
        let now = Utc::now();
        let small = make_op(1, 100, now);
        let large = make_op(2, 400, now);
        let large_id = large.id;

        queue.add(small, &limits(10, 600), now).unwrap();
        queue.add(large, &limits(10, 600), now).unwrap();

        let report = queue.add(make_op(1, 300, now), &limits(10, 600), now).unwrap();
        assert_eq!(report.evicted.len(), 1);
        assert_eq!(report.evicted[0].id, large_id);
        assert!(queue.total_bytes() <= 600);
    }

    #[test]
    fn test_in_flight_never_evicted() {
        let mut queue = OperationQueue::new();
        let now = Utc::now();
        let busy = make_op(5, 10, now);
        let busy_id = busy.id;
        queue.add(busy, &limits(1, 1000), now).unwrap();
        assert!(queue.claim(&busy_id));

        let err = queue.add(make_op(1, 10, now), &limits(1, 1000), now).unwrap_err();
        assert!(matches!(err, SyncError::CapacityExceeded(_)));
        assert!(queue.get(&busy_id).is_some());
    }

    #[test]
    fn test_limits_hold_after_mixed_add_remove() {
        let mut queue = OperationQueue::new();
        let lim = limits(5, 250);
        let now = Utc::now();
        let mut ids = Vec::new();

        for i in 0..40u8 {
            let op = make_op(i % 6, 20 + usize::from(i % 5) * 15, now + chrono::Duration::seconds(i64::from(i)));
            ids.push(op.id);
            let _ = queue.add(op, &lim, now);
            if i % 3 == 0 {
                let _ = queue.remove(&ids[usize::from(i / 2)]);
            }
            assert!(queue.len() <= lim.max_items);
            assert!(queue.total_bytes() <= lim.max_bytes);
        }
    }

    #[test]
    fn test_remove_in_flight_rejected() {
        let mut queue = OperationQueue::new();
        let op = make_op(2, 10, Utc::now());
        let id = op.id;
        queue.add(op, &limits(10, 1000), Utc::now()).unwrap();
        assert!(queue.claim(&id));

        assert!(matches!(queue.remove(&id), Err(SyncError::OperationInFlight(_))));
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(60));
        queue.record_failure(&id, "timeout", true, &policy, Utc::now());
        assert!(queue.remove(&id).is_ok());
    }

    #[test]
    fn test_supersede_withdraws_idle_operations_on_entity() {
        let mut queue = OperationQueue::new();
        let t0 = Utc::now();
        let lim = limits(10, 10_000);

        let executing = make_op(2, 10, t0);
        let older = make_op(2, 10, t0 + chrono::Duration::seconds(1));
        let later = make_op(2, 10, t0 + chrono::Duration::seconds(9));
        let mut other_entity = make_op(2, 10, t0 + chrono::Duration::seconds(1));
        other_entity.entity_id = Some("sub-2".to_string());
        let mut settings = make_op(2, 10, t0);
        settings.op_type = OperationType::SettingsUpdate;
        settings.entity_id = None;

        let ids: Vec<OperationId> = [&executing, &older, &later, &other_entity, &settings]
            .iter()
            .map(|op| op.id)
            .collect();
        for op in [executing, older, later, other_entity, settings] {
            queue.add(op, &lim, t0).unwrap();
        }
        assert!(queue.claim(&ids[0]));

        let (removed, in_flight) = queue.supersede("subscription", "sub-1", t0 + chrono::Duration::seconds(5));
        assert_eq!(removed.iter().map(|op| op.id).collect::<Vec<_>>(), vec![ids[1]]);
        assert_eq!(in_flight, vec![ids[0]]);
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.total_bytes(), 40);

        let (removed, _) = queue.supersede("settings", "preferences", t0);
        assert_eq!(removed.len(), 1);
        assert!(queue.get(&ids[4]).is_none());
    }

    #[test]
    fn test_claim_is_exclusive() {
        let mut queue = OperationQueue::new();
        let op = make_op(2, 10, Utc::now());
        let id = op.id;
        queue.add(op, &limits(10, 1000), Utc::now()).unwrap();

        assert!(queue.claim(&id));
        assert!(!queue.claim(&id));
        assert_eq!(queue.in_flight_count(), 1);
    }

    #[test]
    fn test_expired_swept_on_enforce() {
        let mut queue = OperationQueue::new();
        let now = Utc::now();
        let mut op = make_op(2, 10, now);
        op.expires_at = Some(now + chrono::Duration::seconds(5));
        queue.add(op, &limits(10, 1000), now).unwrap();

        assert!(queue.enforce_limits(&limits(10, 1000), now).is_empty());

        let report = queue.enforce_limits(&limits(10, 1000), now + chrono::Duration::seconds(6));
        assert_eq!(report.expired.len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_record_failure_exhausts_after_max_retries() {
        let mut queue = OperationQueue::new();
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(60));
        let now = Utc::now();
        let op = make_op(2, 10, now);
        let id = op.id;
        queue.add(op, &limits(10, 1000), now).unwrap();

        for expected in 1..3 {
            assert!(queue.claim(&id));
            let decision = queue.record_failure(&id, "timeout", true, &policy, now).unwrap();
            assert!(matches!(decision, RetryDecision::Scheduled { retry_count, .. } if retry_count == expected));
            queue.operations.get_mut(&id).unwrap().next_attempt_at = None;
        }

        assert!(queue.claim(&id));
        let decision = queue.record_failure(&id, "timeout", true, &policy, now).unwrap();
        assert_eq!(decision, RetryDecision::Exhausted { retry_count: 3 });
        assert_eq!(queue.failed_operations().len(), 1);
        assert!(!queue.claim(&id));

        queue.reset(&id).unwrap();
        assert_eq!(queue.get(&id).unwrap().retry_count, 0);
        assert!(queue.claim(&id));
    }

    #[test]
    fn test_snapshot_restore_requeues_processing() {
        let mut queue = OperationQueue::new();
        let now = Utc::now();
        let first = make_op(2, 10, now);
        let first_id = first.id;
        queue.add(first, &limits(10, 1000), now).unwrap();
        queue.add(make_op(3, 20, now), &limits(10, 1000), now).unwrap();
        assert!(queue.claim(&first_id));

        let restored = OperationQueue::restore(queue.snapshot());
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.total_bytes(), 30);
        assert_eq!(restored.in_flight_count(), 0);
        assert_eq!(restored.get(&first_id).unwrap().status, OperationStatus::Queued);
    }
}
