//! Operation types for the offline queue.
//!
//! Defines the closed set of operation kinds, the durable `QueuedOperation`
//! record and the `OperationRequest` builder callers use to enqueue work.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::sync::events::{SETTINGS_ENTITY_ID, SETTINGS_ENTITY_TYPE};

/// Globally unique operation identity.
pub type OperationId = Uuid;

/// Kinds of synchronized entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Subscription,
    Category,
    Reminder,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [Self::Subscription, Self::Category, Self::Reminder];

    /// Name used for the entity type in sync events and conflict records.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subscription => "subscription",
            Self::Category => "category",
            Self::Reminder => "reminder",
        }
    }

    /// Remote collection holding entities of this kind.
    #[must_use]
    pub fn collection(&self) -> &'static str {
        match self {
            Self::Subscription => "subscriptions",
            Self::Category => "categories",
            Self::Reminder => "reminders",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == s)
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation types that can be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Create an entity
    Create(EntityKind),
    /// Update an entity
    Update(EntityKind),
    /// Delete an entity
    Delete(EntityKind),
    /// Replace the account settings blob
    SettingsUpdate,
    /// Upload a backup snapshot
    BackupCreate,
    /// Deliver a sync event that could not be published directly
    SyncEvent,
}

impl OperationType {
    #[must_use]
    pub fn entity_kind(&self) -> Option<EntityKind> {
        match self {
            Self::Create(kind) | Self::Update(kind) | Self::Delete(kind) => Some(*kind),
            _ => None,
        }
    }

    #[must_use]
    pub fn category(&self) -> OperationCategory {
        match self {
            Self::Create(_) | Self::Update(_) | Self::Delete(_) => OperationCategory::Entity,
            Self::SettingsUpdate => OperationCategory::Settings,
            Self::BackupCreate => OperationCategory::Backup,
            Self::SyncEvent => OperationCategory::Sync,
        }
    }

    /// Whether a successful execution should be broadcast to other devices.
    #[must_use]
    pub fn emits_sync_event(&self) -> bool {
        matches!(
            self,
            Self::Create(_) | Self::Update(_) | Self::Delete(_) | Self::SettingsUpdate
        )
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create(kind) => write!(f, "create_{kind}"),
            Self::Update(kind) => write!(f, "update_{kind}"),
            Self::Delete(kind) => write!(f, "delete_{kind}"),
            Self::SettingsUpdate => f.write_str("settings_update"),
            Self::BackupCreate => f.write_str("backup_create"),
            Self::SyncEvent => f.write_str("sync_event"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationCategory {
    Entity,
    Settings,
    Backup,
    Sync,
}

/// Status of a queued operation.
///
/// Completed and expired operations leave the queue, so they have no
/// variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Waiting to be dispatched (possibly inside a backoff window)
    Queued,
    /// Claimed by a worker
    Processing,
    /// Exhausted its retries or hit a non-retryable error
    Failed,
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Pipeline bookkeeping attached to every operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationMetadata {
    /// Encoded payload length in bytes
    pub size: usize,
    pub compressed: bool,
    pub encrypted: bool,
    pub category: OperationCategory,
}

/// A durable, retryable unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub id: OperationId,
    pub op_type: OperationType,
    /// Target entity, required for entity operations
    pub entity_id: Option<String>,
    /// Pipeline-encoded payload
    pub payload: Vec<u8>,
    pub user_id: String,
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    /// Lower dispatches first
    pub priority: u8,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    /// Operations that must leave the queue before this one may dispatch
    pub dependencies: BTreeSet<OperationId>,
    pub expires_at: Option<DateTime<Utc>>,
    /// End of the current backoff window
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub status: OperationStatus,
    /// Insertion order, assigned by the queue store
    pub sequence: u64,
    pub metadata: OperationMetadata,
}

impl QueuedOperation {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    #[must_use]
    pub fn is_backing_off(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.is_some_and(|at| at > now)
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.status == OperationStatus::Failed
    }

    /// Dispatch order key: priority, then age, then insertion order.
    #[must_use]
    pub fn order_key(&self) -> (u8, DateTime<Utc>, u64) {
        (self.priority, self.timestamp, self.sequence)
    }

    /// The `(entity_type, entity_id)` this operation mutates, if any.
    pub fn entity_key(&self) -> Option<(&str, &str)> {
        match self.op_type {
            OperationType::Create(kind) | OperationType::Update(kind) | OperationType::Delete(kind) => {
                Some((kind.as_str(), self.entity_id.as_deref()?))
            }
            OperationType::SettingsUpdate => Some((SETTINGS_ENTITY_TYPE, SETTINGS_ENTITY_ID)),
            OperationType::BackupCreate | OperationType::SyncEvent => None,
        }
    }
}

/// Caller-facing description of a mutation to enqueue.
#[derive(Debug, Clone)]
pub struct OperationRequest {
    pub op_type: OperationType,
    pub entity_id: Option<String>,
    pub payload: serde_json::Value,
    pub priority: Option<u8>,
    pub max_retries: Option<u32>,
    pub dependencies: BTreeSet<OperationId>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl OperationRequest {
    #[must_use]
    pub fn new(op_type: OperationType, payload: serde_json::Value) -> Self {
        Self {
            op_type,
            entity_id: None,
            payload,
            priority: None,
            max_retries: None,
            dependencies: BTreeSet::new(),
            expires_at: None,
        }
    }

    #[must_use]
    pub fn create(kind: EntityKind, entity_id: impl Into<String>, record: serde_json::Value) -> Self {
        Self::new(OperationType::Create(kind), record).for_entity(entity_id)
    }

    #[must_use]
    pub fn update(kind: EntityKind, entity_id: impl Into<String>, record: serde_json::Value) -> Self {
        Self::new(OperationType::Update(kind), record).for_entity(entity_id)
    }

    #[must_use]
    pub fn delete(kind: EntityKind, entity_id: impl Into<String>) -> Self {
        Self::new(OperationType::Delete(kind), serde_json::Value::Null).for_entity(entity_id)
    }

    #[must_use]
    pub fn settings(settings: serde_json::Value) -> Self {
        Self::new(OperationType::SettingsUpdate, settings)
    }

    #[must_use]
    pub fn backup(snapshot: serde_json::Value) -> Self {
        Self::new(OperationType::BackupCreate, snapshot)
    }

    #[must_use]
    pub fn for_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    #[must_use]
    pub fn depends_on(mut self, id: OperationId) -> Self {
        self.dependencies.insert(id);
        self
    }

    #[must_use]
    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operation_type_display() {
        assert_eq!(
            OperationType::Create(EntityKind::Subscription).to_string(),
            "create_subscription"
        );
        assert_eq!(OperationType::SettingsUpdate.to_string(), "settings_update");
    }

    #[test]
    fn test_operation_type_category() {
        assert_eq!(
            OperationType::Delete(EntityKind::Reminder).category(),
            OperationCategory::Entity
        );
        assert_eq!(OperationType::BackupCreate.category(), OperationCategory::Backup);
        assert!(OperationType::SettingsUpdate.emits_sync_event());
        assert!(!OperationType::SyncEvent.emits_sync_event());
    }

    #[test]
    fn test_entity_kind_parse() {
        assert_eq!(EntityKind::parse("category"), Some(EntityKind::Category));
        assert_eq!(EntityKind::parse("unknown"), None);
    }

    #[test]
    fn test_request_builder() {
        let dep = Uuid::new_v4();
        let request = OperationRequest::update(EntityKind::Subscription, "sub-1", json!({"price": 9}))
            .with_priority(1)
            .depends_on(dep);

        assert_eq!(request.entity_id.as_deref(), Some("sub-1"));
        assert_eq!(request.priority, Some(1));
        assert!(request.dependencies.contains(&dep));
    }
}
