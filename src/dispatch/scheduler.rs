use chrono::{DateTime, Utc};

use crate::queue::{OperationId, OperationQueue, OperationStatus, QueuedOperation};

/// Whether an operation may be handed to a worker right now.
pub fn is_eligible(queue: &OperationQueue, op: &QueuedOperation, now: DateTime<Utc>) -> bool {
    op.status == OperationStatus::Queued
        && !queue.is_in_flight(&op.id)
        && !queue.has_outstanding_dependencies(&op.id)
        && !op.is_expired(now)
        && !op.is_backing_off(now)
}

/// Up to `limit` eligible operations in dispatch order: priority ascending,
/// then timestamp ascending, then insertion order.
pub fn select_batch(queue: &OperationQueue, limit: usize, now: DateTime<Utc>) -> Vec<OperationId> {
    let mut candidates: Vec<&QueuedOperation> = queue
        .iter()
        .filter(|op| is_eligible(queue, op, now))
        .collect();
    candidates.sort_by_key(|op| op.order_key());
    candidates.into_iter().take(limit).map(|op| op.id).collect()
}

/// Earliest future moment a queued operation leaves its backoff window.
pub fn next_wakeup(queue: &OperationQueue, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    queue
        .iter()
        .filter(|op| op.status == OperationStatus::Queued && !queue.is_in_flight(&op.id))
        .filter_map(|op| op.next_attempt_at)
        .filter(|at| *at > now)
        .min()
}
