use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::StorageError;

/// Local copy of a synchronized entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
	pub entity_type: String,
	pub entity_id: String,
	pub data: Value,
	/// Last local or applied modification
	pub modified_at: DateTime<Utc>,
	/// Device that made the last modification
	pub modified_by: String,
	/// Last point at which this record was known to match the remote store
	pub synced_at: Option<DateTime<Utc>>,
	/// Tombstone for a local delete that has not reached the remote store yet
	#[serde(default)]
	pub deleted: bool,
}

impl EntityRecord {
	/// Whether the record carries modifications that have not reached the remote store.
	pub fn has_unsynced_changes(&self) -> bool {
		self.synced_at.is_none_or(|synced| self.modified_at > synced)
	}

	/// Live data, or `None` for a tombstone.
	pub fn live_data(&self) -> Option<&Value> {
		(!self.deleted).then_some(&self.data)
	}
}

/// Local entity storage consulted by the conflict resolver.
#[async_trait::async_trait]
pub trait EntityStore: Send + Sync {
	async fn get(&self, entity_type: &str, entity_id: &str) -> Result<Option<EntityRecord>, StorageError>;

	async fn put(&self, record: EntityRecord) -> Result<(), StorageError>;

	async fn delete(&self, entity_type: &str, entity_id: &str) -> Result<Option<EntityRecord>, StorageError>;

	/// Advance `synced_at` to `at` if it moves forward. A tombstone whose
	/// delete is now synced is dropped.
	async fn mark_synced(
		&self,
		entity_type: &str,
		entity_id: &str,
		at: DateTime<Utc>,
	) -> Result<(), StorageError>;
}

#[derive(Debug, Default)]
pub struct MemoryEntityStore {
	records: Mutex<HashMap<(String, String), EntityRecord>>,
}

impl MemoryEntityStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Record a local edit made by `device_id`, leaving `synced_at` untouched.
	pub async fn record_local_edit(
		&self,
		entity_type: &str,
		entity_id: &str,
		data: Value,
		at: DateTime<Utc>,
		device_id: &str,
	) {
		let mut records = self.records.lock().await;
		let key = (entity_type.to_string(), entity_id.to_string());
		let synced_at = records.get(&key).and_then(|r| r.synced_at);
		records.insert(
			key,
			EntityRecord {
				entity_type: entity_type.to_string(),
				entity_id: entity_id.to_string(),
				data,
				modified_at: at,
				modified_by: device_id.to_string(),
				synced_at,
				deleted: false,
			},
		);
	}

	pub async fn len(&self) -> usize {
		self.records.lock().await.len()
	}
}

#[async_trait::async_trait]
impl EntityStore for MemoryEntityStore {
	async fn get(&self, entity_type: &str, entity_id: &str) -> Result<Option<EntityRecord>, StorageError> {
		Ok(self
			.records
			.lock()
			.await
			.get(&(entity_type.to_string(), entity_id.to_string()))
			.cloned())
	}

	async fn put(&self, record: EntityRecord) -> Result<(), StorageError> {
		self.records
			.lock()
			.await
			.insert((record.entity_type.clone(), record.entity_id.clone()), record);
		Ok(())
	}

	async fn delete(&self, entity_type: &str, entity_id: &str) -> Result<Option<EntityRecord>, StorageError> {
		Ok(self
			.records
			.lock()
			.await
			.remove(&(entity_type.to_string(), entity_id.to_string())))
	}

	async fn mark_synced(
		&self,
		entity_type: &str,
		entity_id: &str,
		at: DateTime<Utc>,
	) -> Result<(), StorageError> {
		let mut records = self.records.lock().await;
		let key = (entity_type.to_string(), entity_id.to_string());
		let Some(record) = records.get_mut(&key) else {
			return Ok(());
		};
		if record.synced_at.is_none_or(|synced| at > synced) {
			record.synced_at = Some(at);
		}
		if record.deleted && !record.has_unsynced_changes() {
			records.remove(&key);
		}
		Ok(())
	}
}
