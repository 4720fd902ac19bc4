//! Durable, priority-ordered operation queue.
//!
//! - `operation`: operation kinds, the `QueuedOperation` record and the request builder.
//! - `store`: the in-memory queue with capacity enforcement, eviction and expiry.
//! - `graph`: dependency graph validated for acyclicity on insertion.
//! - `backoff`: the retry schedule shared by every operation type.
//! - `persistence`: snapshotting the queue into the durable local store.
//! - `status`: aggregate counters derived from the queue contents.

pub mod backoff;
pub mod graph;
pub mod operation;
pub mod persistence;
pub mod status;
pub mod store;

pub use self::backoff::BackoffPolicy;
pub use graph::DependencyGraph;
pub use operation::{
    EntityKind, OperationCategory, OperationId, OperationMetadata, OperationRequest,
    OperationStatus, OperationType, QueuedOperation,
};
pub use persistence::QueuePersistence;
pub use status::{Backpressure, QueueStatus, StatusTracker};
pub use store::{LimitReport, OperationQueue, QueueLimits, QueueSnapshot, RetryDecision};
