//! Saving and restoring sync state through the durable local store.
//!
//! The queue snapshot is stored with bincode; status counters, sync cursors
//! and conflict records are stored as JSON. Writes are retried for a short
//! window and then dropped with a warning: the in-memory state stays
//! authoritative for the lifetime of the process.

use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoffBuilder;
use backoff::future::retry;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::status::StatusCounters;
use super::store::QueueSnapshot;
use crate::adapters::DurableStore;
use crate::error::StorageError;

/// Status record written next to the queue snapshot.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct PersistedStatus {
    pub counters: StatusCounters,
}

pub struct QueuePersistence {
    store: Arc<dyn DurableStore>,
    prefix: String,
    retry_window: Duration,
}

impl QueuePersistence {
    /// Create a persistence handle scoped to one user and device.
    pub fn new(
        store: Arc<dyn DurableStore>,
        user_id: &str,
        device_id: &str,
        retry_window: Duration,
    ) -> Self {
        let scope = blake3::hash(format!("{}/{}", user_id, device_id).as_bytes());
        Self {
            store,
            prefix: format!("sync-{}", hex::encode(&scope.as_bytes()[..8])),
            retry_window,
        }
    }

    pub fn key(&self, name: &str) -> String {
        format!("{}.{}", self.prefix, name)
    }

    pub async fn save_queue(&self, snapshot: &QueueSnapshot) -> bool {
        let bytes = match bincode::serialize(snapshot) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to serialize queue snapshot: {}", e);
                return false;
            }
        };
        let saved = self.write(&self.key("queue"), bytes).await;
        if saved {
            debug!("Persisted {} queued operations", snapshot.operations.len());
        }
        saved
    }

    pub async fn load_queue(&self) -> Result<Option<QueueSnapshot>, StorageError> {
        let Some(bytes) = self.store.get(&self.key("queue")).await? else {
            return Ok(None);
        };
        let snapshot: QueueSnapshot = bincode::deserialize(&bytes).map_err(|e| {
            StorageError::Serialization(format!("Failed to deserialize queue snapshot: {}", e))
        })?;
        info!(
            "Loaded queue snapshot with {} operations",
            snapshot.operations.len()
        );
        Ok(Some(snapshot))
    }

    pub async fn save_status(&self, counters: &StatusCounters) -> bool {
        let record = PersistedStatus {
            counters: counters.clone(),
        };
        self.save_record("status", &record).await
    }

    pub async fn load_status(&self) -> Result<Option<PersistedStatus>, StorageError> {
        self.load_record("status").await
    }

    /// Persist any JSON-serializable record under `name`.
    pub async fn save_record<T: Serialize + Sync>(&self, name: &str, record: &T) -> bool {
        match serde_json::to_vec(record) {
            Ok(bytes) => self.write(&self.key(name), bytes).await,
            Err(e) => {
                warn!("Failed to serialize {}: {}", name, e);
                false
            }
        }
    }

    pub async fn load_record<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, StorageError> {
        let Some(bytes) = self.store.get(&self.key(name)).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StorageError::Serialization(format!("Failed to deserialize {}: {}", name, e)))
    }

    /// Write with exponential backoff bounded by the retry window.
    ///
    /// Returns false once the window is exhausted or the error is permanent.
    async fn write(&self, key: &str, bytes: Vec<u8>) -> bool {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(50))
            .with_max_interval(Duration::from_millis(500))
            .with_max_elapsed_time(Some(self.retry_window))
            .build();

        let store = &self.store;
        let bytes = &bytes;
        let result = retry(policy, || async move {
            store.set(key, bytes).await.map_err(|e| match e {
                StorageError::InvalidKey(_) | StorageError::Serialization(_) => {
                    backoff::Error::permanent(e)
                }
                _ => {
                    debug!("Durable write to {} failed, retrying: {}", key, e);
                    backoff::Error::transient(e)
                }
            })
        })
        .await;

        match result {
            Ok(()) => true,
            Err(e) => {
                warn!("Giving up persisting {}: {}", key, e);
                false
            }
        }
    }
}
