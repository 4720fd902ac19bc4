use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::queue::{OperationType, QueuedOperation};

pub const SYNC_EVENTS_COLLECTION: &str = "sync_events";
pub const SETTINGS_ENTITY_TYPE: &str = "settings";
pub const SETTINGS_ENTITY_ID: &str = "preferences";

/// Kind of mutation carried by a sync event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Add,
    Update,
    Delete,
}

/// Notification of a local mutation, broadcast to the account's other devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    pub id: Uuid,
    /// Originating device
    pub device_id: String,
    #[serde(rename = "type")]
    pub kind: MutationKind,
    pub entity_type: String,
    pub entity_id: String,
    pub payload: Option<Value>,
    /// When the mutation was made on the originating device
    #[serde(with = "chrono::serde::ts_microseconds")]
    pub timestamp: DateTime<Utc>,
    /// When the event reached the remote store; assigned by the publisher
    #[serde(default, with = "chrono::serde::ts_microseconds_option")]
    pub published_at: Option<DateTime<Utc>>,
    /// Set once a receiving device has applied the event
    #[serde(default)]
    pub synced: bool,
}

impl SyncEvent {
    /// Build the event describing a successfully executed operation.
    ///
    /// Returns None for operations that are not broadcast.
    pub fn from_operation(op: &QueuedOperation, payload: Value) -> Option<Self> {
        if !op.op_type.emits_sync_event() {
            return None;
        }

        let (kind, entity_type, entity_id) = match op.op_type {
            OperationType::Create(kind) => (MutationKind::Add, kind.as_str(), op.entity_id.clone()?),
            OperationType::Update(kind) => (MutationKind::Update, kind.as_str(), op.entity_id.clone()?),
            OperationType::Delete(kind) => (MutationKind::Delete, kind.as_str(), op.entity_id.clone()?),
            OperationType::SettingsUpdate => (
                MutationKind::Update,
                SETTINGS_ENTITY_TYPE,
                SETTINGS_ENTITY_ID.to_string(),
            ),
            OperationType::BackupCreate | OperationType::SyncEvent => return None,
        };

        Some(Self {
            id: Uuid::new_v4(),
            device_id: op.device_id.clone(),
            kind,
            entity_type: entity_type.to_string(),
            entity_id,
            payload: (kind != MutationKind::Delete).then_some(payload),
            timestamp: op.timestamp,
            published_at: None,
            synced: false,
        })
    }

    pub fn to_document(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_document(document: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::EntityKind;
    use crate::queue::store::tests::make_op;
    use chrono::SubsecRound;
    use serde_json::json;

    #[test]
    fn test_event_from_update() {
        let mut op = make_op(2, 10, Utc::now());
        op.op_type = OperationType::Update(EntityKind::Category);
        op.entity_id = Some("c1".to_string());

        let event = SyncEvent::from_operation(&op, json!({"name": "Home"})).unwrap();
        assert_eq!(event.kind, MutationKind::Update);
        assert_eq!(event.entity_type, "category");
        assert_eq!(event.entity_id, "c1");
        assert_eq!(event.device_id, "device-a");
        assert_eq!(event.timestamp, op.timestamp);
    }

    #[test]
    fn test_delete_carries_no_payload_and_backups_are_silent() {
        let mut op = make_op(1, 10, Utc::now());
        op.op_type = OperationType::Delete(EntityKind::Reminder);
        op.entity_id = Some("r1".to_string());
        assert_eq!(SyncEvent::from_operation(&op, Value::Null).unwrap().payload, None);

        op.op_type = OperationType::BackupCreate;
        assert!(SyncEvent::from_operation(&op, json!({})).is_none());
    }

    #[test]
    fn test_document_uses_numeric_timestamps() {
        let mut op = make_op(3, 10, Utc::now().trunc_subsecs(6));
        op.op_type = OperationType::SettingsUpdate;
        let event = SyncEvent::from_operation(&op, json!({"theme": "dark"})).unwrap();

        let doc = event.to_document();
        assert!(doc["timestamp"].is_i64());
        assert_eq!(doc["type"], "update");
        assert_eq!(SyncEvent::from_document(doc).unwrap(), event);
    }
}
