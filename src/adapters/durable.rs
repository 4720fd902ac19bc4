use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Mutex;
use tracing::debug;

use crate::error::StorageError;

/// Key/value store that survives process restarts.
#[async_trait::async_trait]
pub trait DurableStore: Send + Sync {
	async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
	async fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;
	async fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// In-memory implementation of DurableStore
#[derive(Debug, Default)]
pub struct MemoryDurableStore {
	entries: Mutex<HashMap<String, Vec<u8>>>,
	failing_writes: AtomicUsize,
}

impl MemoryDurableStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Make the next `count` writes fail with `StorageError::Unavailable`.
	pub fn fail_next_writes(&self, count: usize) {
		self.failing_writes.store(count, Ordering::SeqCst);
	}

	pub async fn keys(&self) -> Vec<String> {
		let mut keys: Vec<String> = self.entries.lock().await.keys().cloned().collect();
		keys.sort();
		keys
	}

	fn take_failure(&self) -> bool {
		self.failing_writes
			.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
			.is_ok()
	}
}

#[async_trait::async_trait]
impl DurableStore for MemoryDurableStore {
	async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
		Ok(self.entries.lock().await.get(key).cloned())
	}

	async fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
		if self.take_failure() {
			return Err(StorageError::Unavailable(format!(
				"injected write failure for {}",
				key
			)));
		}
		self.entries
			.lock()
			.await
			.insert(key.to_string(), value.to_vec());
		Ok(())
	}

	async fn remove(&self, key: &str) -> Result<(), StorageError> {
		self.entries.lock().await.remove(key);
		Ok(())
	}
}

/// File-based implementation of DurableStore, one file per key
#[derive(Debug, Clone)]
pub struct FileDurableStore {
	data_dir: PathBuf,
}

impl FileDurableStore {
	pub fn new(data_dir: PathBuf) -> Self {
		Self { data_dir }
	}

	fn get_filename(&self, key: &str) -> Result<PathBuf, StorageError> {
		let valid = !key.is_empty()
			&& key
				.chars()
				.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
			&& !key.starts_with('.');
		if !valid {
			return Err(StorageError::InvalidKey(key.to_string()));
		}
		Ok(self.data_dir.join(format!("{}.bin", key)))
	}
}

#[async_trait::async_trait]
impl DurableStore for FileDurableStore {
	async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
		let filename = self.get_filename(key)?;
		match tokio::fs::read(&filename).await {
			Ok(bytes) => Ok(Some(bytes)),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
			Err(e) => Err(e.into()),
		}
	}

	async fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
		let filename = self.get_filename(key)?;
		tokio::fs::create_dir_all(&self.data_dir).await?;

		// Write then rename so readers never see a torn file
		let tmp = filename.with_extension("bin.tmp");
		tokio::fs::write(&tmp, value).await?;
		tokio::fs::rename(&tmp, &filename).await?;

		debug!("Saved {} bytes to {:?}", value.len(), filename);
		Ok(())
	}

	async fn remove(&self, key: &str) -> Result<(), StorageError> {
		let filename = self.get_filename(key)?;
		match tokio::fs::remove_file(&filename).await {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(e.into()),
		}
	}
}
