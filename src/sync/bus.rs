//! Propagation of applied mutations between the devices of one account.
//!
//! Outbound, every completed local mutation is written as a `SyncEvent`
//! under `users/{user_id}/sync_events`. Inbound, events from other devices
//! arrive through a catch-up query and the live subscription; each one is
//! filtered for echo and duplicates, checked for conflicts, and applied to
//! the local entity store.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::conflict::{ConflictResolver, Resolution, SyncConflict};
use super::events::{MutationKind, SYNC_EVENTS_COLLECTION, SyncEvent};
use crate::adapters::{
    BatchWrite, ChangeKind, ChangeStream, Clock, EntityRecord, EntityStore, FilterOp, Query,
    RemoteChange, RemoteStore, user_collection,
};
use crate::config::DeviceContext;
use crate::error::{RemoteError, SyncError};

const DELIVERY_GRACE_SECS: i64 = 60;

/// How far behind its watermark an origin device's events may still arrive.
///
/// Publishers run concurrently, so publish times from one device can land
/// slightly out of order.
pub fn delivery_grace() -> chrono::Duration {
    chrono::Duration::seconds(DELIVERY_GRACE_SECS)
}

/// Delivery position for one origin device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceCursor {
    /// Latest publish time seen from this device
    #[serde(with = "chrono::serde::ts_microseconds_option")]
    pub last_timestamp: Option<DateTime<Utc>>,
    /// Events seen within the grace window, keyed by publish time in microseconds
    pub recent: BTreeMap<i64, BTreeSet<Uuid>>,
}

/// Delivery positions for every origin device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CursorBook {
    pub devices: BTreeMap<String, DeviceCursor>,
}

impl CursorBook {
    pub fn is_delivered(&self, event: &SyncEvent) -> bool {
        let Some(cursor) = self.devices.get(&event.device_id) else {
            return false;
        };
        let at = Self::position(event);
        if cursor
            .recent
            .get(&at.timestamp_micros())
            .is_some_and(|ids| ids.contains(&event.id))
        {
            return true;
        }
        cursor
            .last_timestamp
            .is_some_and(|last| at < last - delivery_grace())
    }

    pub fn advance(&mut self, event: &SyncEvent) {
        let at = Self::position(event);
        let cursor = self.devices.entry(event.device_id.clone()).or_default();
        cursor
            .recent
            .entry(at.timestamp_micros())
            .or_default()
            .insert(event.id);

        if cursor.last_timestamp.is_none_or(|last| at > last) {
            cursor.last_timestamp = Some(at);
            let floor = (at - delivery_grace()).timestamp_micros();
            cursor.recent = cursor.recent.split_off(&floor);
        }
    }

    /// Where a catch-up query has to start to see every undelivered event.
    pub fn resume_from(&self) -> Option<DateTime<Utc>> {
        self.devices
            .values()
            .filter_map(|cursor| cursor.last_timestamp)
            .min()
            .map(|last| last - delivery_grace())
    }

    fn position(event: &SyncEvent) -> DateTime<Utc> {
        event.published_at.unwrap_or(event.timestamp)
    }
}

/// What happened to an inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// Published by this device
    Echo,
    /// Already applied earlier
    Duplicate,
    /// Applied without conflict
    Applied,
    /// Older than the local copy and not in conflict with it
    Stale,
    /// Conflict detected and resolved; the caller persists it, then calls
    /// `SyncBus::apply_resolution`
    Conflict(SyncConflict),
}

pub struct SyncBus {
    remote: Arc<dyn RemoteStore>,
    entities: Arc<dyn EntityStore>,
    clock: Arc<dyn Clock>,
    device_id: String,
    path: String,
    cursors: Mutex<CursorBook>,
    /// Delivered events still waiting for their `synced` flag
    unflagged: Mutex<Vec<Uuid>>,
}

impl SyncBus {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        entities: Arc<dyn EntityStore>,
        clock: Arc<dyn Clock>,
        context: &DeviceContext,
    ) -> Self {
        Self {
            remote,
            entities,
            clock,
            device_id: context.device_id.clone(),
            path: user_collection(&context.user_id, SYNC_EVENTS_COLLECTION),
            cursors: Mutex::new(CursorBook::default()),
            unflagged: Mutex::new(Vec::new()),
        }
    }

    pub async fn restore_cursors(&self, book: CursorBook) {
        *self.cursors.lock().await = book;
    }

    pub async fn cursors(&self) -> CursorBook {
        self.cursors.lock().await.clone()
    }

    /// Write an event to the shared event log.
    pub async fn publish(&self, event: &SyncEvent) -> Result<(), RemoteError> {
        let mut event = event.clone();
        event.published_at = Some(self.clock.now());
        self.remote
            .create(&self.path, &event.id.to_string(), event.to_document())
            .await?;
        debug!(
            "Published sync event {} ({:?} {}/{})",
            event.id, event.kind, event.entity_type, event.entity_id
        );
        Ok(())
    }

    pub async fn subscribe(&self) -> Result<ChangeStream, RemoteError> {
        self.remote.subscribe(&self.path).await
    }

    /// Events from other devices published since the earliest cursor position.
    pub async fn catch_up(&self) -> Result<Vec<SyncEvent>, RemoteError> {
        let mut query = Query::all()
            .filter("device_id", FilterOp::Ne, self.device_id.clone())
            .order_by("published_at");
        if let Some(from) = self.cursors.lock().await.resume_from() {
            query = query.filter("published_at", FilterOp::Gte, from.timestamp_micros());
        }

        let documents = self.remote.query(&self.path, &query).await?;
        Ok(documents
            .into_iter()
            .filter_map(|(id, document)| Self::parse(&id, document))
            .collect())
    }

    /// Extract a sync event from a subscription change.
    pub fn parse_change(&self, change: RemoteChange) -> Option<SyncEvent> {
        if change.kind == ChangeKind::Removed {
            return None;
        }
        Self::parse(&change.id, change.document?)
    }

    /// Run an inbound event through echo, duplicate and conflict checks,
    /// applying it when it is safe to do so.
    pub async fn receive(
        &self,
        event: &SyncEvent,
        resolver: &ConflictResolver,
    ) -> Result<Delivery, SyncError> {
        if event.device_id == self.device_id {
            debug!("Filtered echo of sync event {}", event.id);
            return Ok(Delivery::Echo);
        }
        if self.cursors.lock().await.is_delivered(event) {
            debug!("Dropped duplicate sync event {}", event.id);
            return Ok(Delivery::Duplicate);
        }

        let local = self.entities.get(&event.entity_type, &event.entity_id).await?;

        if let Some(mut conflict) = resolver.detect(local.as_ref(), event, self.clock.now()) {
            resolver.resolve(&mut conflict, self.clock.now());
            return Ok(Delivery::Conflict(conflict));
        }

        let delivery = match &local {
            Some(record) if record.modified_at > event.timestamp => {
                debug!(
                    "Skipping stale sync event {} for {}/{}",
                    event.id, event.entity_type, event.entity_id
                );
                Delivery::Stale
            }
            _ => {
                self.apply_remote(event, local).await?;
                Delivery::Applied
            }
        };

        self.mark_delivered(event).await;
        Ok(delivery)
    }

    /// Commit a resolution that has already been persisted.
    ///
    /// Returns the merged record when the resolution is a merge; the caller
    /// queues it so the merge propagates back to the other devices.
    pub async fn apply_resolution(
        &self,
        conflict: &SyncConflict,
        event: &SyncEvent,
    ) -> Result<Option<Value>, SyncError> {
        let merged = match &conflict.resolution {
            Some(Resolution::AcceptRemote) => {
                self.entities.delete(&event.entity_type, &event.entity_id).await?;
                self.apply_remote(event, None).await?;
                None
            }
            Some(Resolution::Merge(value)) => {
                let synced_at = self
                    .entities
                    .get(&event.entity_type, &event.entity_id)
                    .await?
                    .and_then(|record| record.synced_at);
                self.entities
                    .put(EntityRecord {
                        entity_type: event.entity_type.clone(),
                        entity_id: event.entity_id.clone(),
                        data: value.clone(),
                        modified_at: self.clock.now(),
                        modified_by: self.device_id.clone(),
                        synced_at,
                        deleted: false,
                    })
                    .await?;
                Some(value.clone())
            }
            Some(Resolution::KeepLocal) | None => None,
        };

        self.mark_delivered(event).await;
        Ok(merged)
    }

    async fn apply_remote(&self, event: &SyncEvent, local: Option<EntityRecord>) -> Result<(), SyncError> {
        match event.kind {
            MutationKind::Delete => {
                self.entities.delete(&event.entity_type, &event.entity_id).await?;
            }
            MutationKind::Add | MutationKind::Update => {
                let incoming = event.payload.clone().unwrap_or(Value::Null);
                let existing = local.filter(|record| !record.deleted).map(|record| record.data);
                let data = match (event.kind, existing, incoming) {
                    (MutationKind::Update, Some(Value::Object(mut existing)), Value::Object(fields)) => {
                        existing.extend(fields);
                        Value::Object(existing)
                    }
                    (_, _, incoming) => incoming,
                };
                self.entities
                    .put(EntityRecord {
                        entity_type: event.entity_type.clone(),
                        entity_id: event.entity_id.clone(),
                        data,
                        modified_at: event.timestamp,
                        modified_by: event.device_id.clone(),
                        synced_at: Some(event.timestamp),
                        deleted: false,
                    })
                    .await?;
            }
        }
        debug!(
            "Applied {:?} of {}/{} from {}",
            event.kind, event.entity_type, event.entity_id, event.device_id
        );
        Ok(())
    }

    /// Write the `synced` flag of every delivered event in one batch.
    ///
    /// Flags that fail to write stay pending for the next flush.
    pub async fn flush_synced_flags(&self) -> Result<usize, RemoteError> {
        let ids = std::mem::take(&mut *self.unflagged.lock().await);
        if ids.is_empty() {
            return Ok(0);
        }

        let writes = ids
            .iter()
            .map(|id| BatchWrite::Update {
                path: self.path.clone(),
                id: id.to_string(),
                document: json!({ "synced": true }),
            })
            .collect();
        match self.remote.batch_write(writes).await {
            Ok(()) => {
                debug!("Flagged {} sync events as synced", ids.len());
                Ok(ids.len())
            }
            Err(e) => {
                self.unflagged.lock().await.extend(ids);
                Err(e)
            }
        }
    }

    async fn mark_delivered(&self, event: &SyncEvent) {
        self.cursors.lock().await.advance(event);
        if !event.synced {
            self.unflagged.lock().await.push(event.id);
        }
    }

    fn parse(id: &str, document: Value) -> Option<SyncEvent> {
        match SyncEvent::from_document(document) {
            Ok(event) => Some(event),
            Err(e) => {
                warn!("Ignoring malformed sync event {}: {}", id, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{ManualClock, MemoryEntityStore, MemoryRemoteStore};
    use serde_json::json;

    struct Fixture {
        bus: SyncBus,
        entities: Arc<MemoryEntityStore>,
        clock: Arc<ManualClock>,
    }

    fn fixture(remote: Arc<MemoryRemoteStore>, device: &str) -> Fixture {
        let entities = Arc::new(MemoryEntityStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let bus = SyncBus::new(
            remote,
            entities.clone(),
            clock.clone(),
            &DeviceContext::new("user-1", device),
        );
        Fixture { bus, entities, clock }
    }

    fn event(device: &str, kind: MutationKind, timestamp: DateTime<Utc>, payload: Option<Value>) -> SyncEvent {
        SyncEvent {
            id: Uuid::new_v4(),
            device_id: device.to_string(),
            kind,
            entity_type: "subscription".to_string(),
            entity_id: "s1".to_string(),
            payload,
            timestamp,
            published_at: Some(timestamp),
            synced: false,
        }
    }

    #[tokio::test]
    async fn test_echo_and_duplicates_are_dropped() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let f = fixture(remote, "device-a");
        let resolver = ConflictResolver::new();
        let now = f.clock.now();

        let own = event("device-a", MutationKind::Add, now, Some(json!({"price": 1})));
        assert_eq!(f.bus.receive(&own, &resolver).await.unwrap(), Delivery::Echo);

        let theirs = event("device-b", MutationKind::Add, now, Some(json!({"price": 2})));
        assert_eq!(f.bus.receive(&theirs, &resolver).await.unwrap(), Delivery::Applied);
        assert_eq!(f.bus.receive(&theirs, &resolver).await.unwrap(), Delivery::Duplicate);

        let record = f.entities.get("subscription", "s1").await.unwrap().unwrap();
        assert_eq!(record.data, json!({"price": 2}));
        assert_eq!(record.synced_at, Some(now));
    }

    #[tokio::test]
    async fn test_out_of_order_within_grace_is_delivered() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let f = fixture(remote, "device-a");
        let resolver = ConflictResolver::new();
        let now = f.clock.now();

        let later = event("device-b", MutationKind::Add, now + chrono::Duration::seconds(5), Some(json!({"v": 2})));
        let mut earlier = event("device-b", MutationKind::Update, now, Some(json!({"w": 1})));
        earlier.entity_id = "s2".to_string();

        f.bus.receive(&later, &resolver).await.unwrap();
        assert_eq!(f.bus.receive(&earlier, &resolver).await.unwrap(), Delivery::Applied);

        let ancient = event("device-b", MutationKind::Update, now - chrono::Duration::minutes(10), None);
        assert_eq!(f.bus.receive(&ancient, &resolver).await.unwrap(), Delivery::Duplicate);
    }

    #[tokio::test]
    async fn test_update_merges_and_delete_removes() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let f = fixture(remote, "device-a");
        let resolver = ConflictResolver::new();
        let now = f.clock.now();

        f.bus
            .receive(&event("device-b", MutationKind::Add, now, Some(json!({"name": "News", "price": 4}))), &resolver)
            .await
            .unwrap();
        f.bus
            .receive(
                &event("device-b", MutationKind::Update, now + chrono::Duration::seconds(1), Some(json!({"price": 6}))),
                &resolver,
            )
            .await
            .unwrap();
        let record = f.entities.get("subscription", "s1").await.unwrap().unwrap();
        assert_eq!(record.data, json!({"name": "News", "price": 6}));

        f.bus
            .receive(&event("device-b", MutationKind::Delete, now + chrono::Duration::seconds(2), None), &resolver)
            .await
            .unwrap();
        assert!(f.entities.get("subscription", "s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_conflict_is_reported_before_apply() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let f = fixture(remote, "device-a");
        let resolver = ConflictResolver::new();
        let now = f.clock.now();

        f.entities
            .record_local_edit("subscription", "s1", json!({"price": 9}), now, "device-a")
            .await;
        let remote_edit = event("device-b", MutationKind::Update, now + chrono::Duration::seconds(1), Some(json!({"price": 7})));

        let Delivery::Conflict(conflict) = f.bus.receive(&remote_edit, &resolver).await.unwrap() else {
            panic!("expected a conflict");
        };
        assert_eq!(conflict.resolution, Some(Resolution::AcceptRemote));
        // Nothing applied until the resolution is committed
        assert_eq!(
            f.entities.get("subscription", "s1").await.unwrap().unwrap().data,
            json!({"price": 9})
        );

        assert_eq!(f.bus.apply_resolution(&conflict, &remote_edit).await.unwrap(), None);
        assert_eq!(
            f.entities.get("subscription", "s1").await.unwrap().unwrap().data,
            json!({"price": 7})
        );
        assert_eq!(f.bus.receive(&remote_edit, &resolver).await.unwrap(), Delivery::Duplicate);
    }

    #[tokio::test]
    async fn test_catch_up_skips_own_events_and_resumes() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let a = fixture(remote.clone(), "device-a");
        let b = fixture(remote.clone(), "device-b");
        let resolver = ConflictResolver::new();
        let now = b.clock.now();

        b.bus
            .publish(&event("device-b", MutationKind::Add, now, Some(json!({"price": 1}))))
            .await
            .unwrap();
        a.bus
            .publish(&event("device-a", MutationKind::Add, now, Some(json!({"price": 2}))))
            .await
            .unwrap();

        let pending = a.bus.catch_up().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].device_id, "device-b");

        a.bus.receive(&pending[0], &resolver).await.unwrap();
        let cursors = a.bus.cursors().await;
        assert!(cursors.devices.contains_key("device-b"));
        assert_eq!(cursors.resume_from(), pending[0].published_at.map(|at| at - delivery_grace()));
    }

    #[tokio::test]
    async fn test_synced_flags_are_written_in_one_batch() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let a = fixture(remote.clone(), "device-a");
        let b = fixture(remote.clone(), "device-b");
        let resolver = ConflictResolver::new();
        let now = b.clock.now();

        let mut second = event("device-b", MutationKind::Add, now, Some(json!({"price": 3})));
        second.entity_id = "s2".to_string();
        b.bus
            .publish(&event("device-b", MutationKind::Add, now, Some(json!({"price": 1}))))
            .await
            .unwrap();
        b.bus.publish(&second).await.unwrap();

        let pending = a.bus.catch_up().await.unwrap();
        assert_eq!(pending.len(), 2);
        for event in &pending {
            a.bus.receive(event, &resolver).await.unwrap();
        }
        // Delivery alone leaves the remote documents untouched
        let path = user_collection("user-1", SYNC_EVENTS_COLLECTION);
        let before = remote.read(&path, &pending[0].id.to_string()).await.unwrap().unwrap();
        assert_eq!(before["synced"], json!(false));

        assert_eq!(a.bus.flush_synced_flags().await.unwrap(), 2);
        for event in &pending {
            let document = remote.read(&path, &event.id.to_string()).await.unwrap().unwrap();
            assert_eq!(document["synced"], json!(true));
        }
        assert_eq!(a.bus.flush_synced_flags().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_flag_batch_is_retried() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let a = fixture(remote.clone(), "device-a");
        let resolver = ConflictResolver::new();
        let now = a.clock.now();

        let incoming = event("device-b", MutationKind::Add, now, Some(json!({"price": 1})));
        a.bus.receive(&incoming, &resolver).await.unwrap();

        remote.set_reachable(false);
        assert!(a.bus.flush_synced_flags().await.is_err());
        remote.set_reachable(true);
        assert_eq!(a.bus.flush_synced_flags().await.unwrap(), 1);
    }
}
