//! Offline-first, multi-device synchronization core.
//!
//! Local mutations are queued durably while the device is offline and
//! replayed against a shared remote store once connectivity returns.
//! Completed mutations are broadcast to the account's other devices as sync
//! events, where they are checked for conflicts and applied.
//!
//! Start with [`SyncService::init`].

pub mod adapters;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod pipeline;
pub mod queue;
pub mod service;
pub mod sync;

pub use config::{DeviceContext, PriorityTable, QueueConfig};
pub use dispatch::{QueueEvent, QueueEventHandler};
pub use error::{ProcessError, RemoteError, StorageError, SyncError};
pub use queue::{
    EntityKind, OperationId, OperationRequest, OperationStatus, OperationType, QueueStatus,
    QueuedOperation,
};
pub use service::{SyncDependencies, SyncService};
pub use sync::{ConflictHandler, DeviceInfo, Resolution, SyncConflict, SyncEvent};
