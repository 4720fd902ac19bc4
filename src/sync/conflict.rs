//! Detection and resolution of concurrent edits to the same entity.
//!
//! A conflict exists when the local copy carries modifications that have not
//! reached the remote store yet, and the incoming remote event was made after
//! the last point both sides agreed on (`synced_at`). Resolution policy is
//! pluggable per entity type; the fallback is last-write-wins.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use super::events::{MutationKind, SyncEvent};
use crate::adapters::EntityRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSide {
    Local,
    Remote,
}

/// Outcome chosen for a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Resolution {
    KeepLocal,
    AcceptRemote,
    /// Caller-defined combination of both sides
    Merge(Value),
}

impl Resolution {
    /// The side whose update loses, if one does.
    pub fn superseded(&self) -> Option<ConflictSide> {
        match self {
            Resolution::KeepLocal => Some(ConflictSide::Remote),
            Resolution::AcceptRemote => Some(ConflictSide::Local),
            Resolution::Merge(_) => None,
        }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resolution::KeepLocal => write!(f, "local"),
            Resolution::AcceptRemote => write!(f, "remote"),
            Resolution::Merge(_) => write!(f, "merge"),
        }
    }
}

/// One side of a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictSnapshot {
    /// None when this side deleted the entity
    pub data: Option<Value>,
    pub modified_at: DateTime<Utc>,
    pub device_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    pub id: Uuid,
    pub entity_type: String,
    pub entity_id: String,
    pub local: ConflictSnapshot,
    pub remote: ConflictSnapshot,
    /// Sync event that triggered detection
    pub remote_event_id: Uuid,
    pub detected_at: DateTime<Utc>,
    pub resolved: bool,
    pub resolution: Option<Resolution>,
    pub superseded: Option<ConflictSide>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Per-entity-type resolution policy.
pub trait ConflictHandler: Send + Sync {
    fn resolve(&self, conflict: &SyncConflict) -> Resolution;
}

/// Newer modification wins; equal timestamps are broken by device id so every
/// device picks the same winner.
#[derive(Debug, Default, Clone, Copy)]
pub struct LastWriteWins;

impl ConflictHandler for LastWriteWins {
    fn resolve(&self, conflict: &SyncConflict) -> Resolution {
        let local = (conflict.local.modified_at, conflict.local.device_id.as_str());
        let remote = (conflict.remote.modified_at, conflict.remote.device_id.as_str());
        if remote > local {
            Resolution::AcceptRemote
        } else {
            Resolution::KeepLocal
        }
    }
}

pub struct ConflictResolver {
    handlers: HashMap<String, Arc<dyn ConflictHandler>>,
    fallback: Arc<dyn ConflictHandler>,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
            fallback: Arc::new(LastWriteWins),
        }
    }
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_handler(&mut self, entity_type: impl Into<String>, handler: Arc<dyn ConflictHandler>) {
        self.handlers.insert(entity_type.into(), handler);
    }

    /// Compare the local copy with an incoming remote event.
    ///
    /// An unsynced tombstone counts as a local edit whose data is gone.
    pub fn detect(
        &self,
        local: Option<&EntityRecord>,
        event: &SyncEvent,
        now: DateTime<Utc>,
    ) -> Option<SyncConflict> {
        let local = local?;
        if !local.has_unsynced_changes() {
            return None;
        }
        if local.synced_at.is_some_and(|synced| event.timestamp <= synced) {
            return None;
        }

        Some(SyncConflict {
            id: Uuid::new_v4(),
            entity_type: event.entity_type.clone(),
            entity_id: event.entity_id.clone(),
            local: ConflictSnapshot {
                data: local.live_data().cloned(),
                modified_at: local.modified_at,
                device_id: local.modified_by.clone(),
            },
            remote: ConflictSnapshot {
                data: match event.kind {
                    MutationKind::Delete => None,
                    _ => Some(event.payload.clone().unwrap_or(Value::Null)),
                },
                modified_at: event.timestamp,
                device_id: event.device_id.clone(),
            },
            remote_event_id: event.id,
            detected_at: now,
            resolved: false,
            resolution: None,
            superseded: None,
            resolved_at: None,
        })
    }

    /// Choose a resolution and record it on the conflict.
    pub fn resolve(&self, conflict: &mut SyncConflict, now: DateTime<Utc>) -> Resolution {
        let handler = self
            .handlers
            .get(&conflict.entity_type)
            .unwrap_or(&self.fallback);
        let resolution = handler.resolve(conflict);

        conflict.superseded = resolution.superseded();
        conflict.resolution = Some(resolution.clone());
        conflict.resolved = true;
        conflict.resolved_at = Some(now);

        info!(
            "Resolved conflict on {}/{}: {} (local {} @ {}, remote {} @ {})",
            conflict.entity_type,
            conflict.entity_id,
            resolution,
            conflict.local.device_id,
            conflict.local.modified_at,
            conflict.remote.device_id,
            conflict.remote.modified_at
        );

        resolution
    }
}
