use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::adapters::{Clock, Query, RemoteStore, user_collection};
use crate::config::DeviceContext;
use crate::error::{RemoteError, SyncError};

pub const DEVICES_COLLECTION: &str = "devices";

/// A device known to the account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
	pub id: String,
	pub name: String,
	pub platform: String,
	pub last_seen: DateTime<Utc>,
	pub registered_at: DateTime<Utc>,
	pub trusted: bool,
}

/// Account-wide device list stored in the remote store.
#[derive(Clone)]
pub struct DeviceRegistry {
	remote: Arc<dyn RemoteStore>,
	clock: Arc<dyn Clock>,
	path: String,
}

impl DeviceRegistry {
	pub fn new(remote: Arc<dyn RemoteStore>, clock: Arc<dyn Clock>, user_id: &str) -> Self {
		Self {
			remote,
			clock,
			path: user_collection(user_id, DEVICES_COLLECTION),
		}
	}

	/// Upsert a device and touch its `last_seen`.
	///
	/// Re-registering keeps the original registration time and trust flag.
	pub async fn register_device(&self, device: &DeviceContext) -> Result<DeviceInfo, SyncError> {
		let now = self.clock.now();
		let existing = self.get(&device.device_id).await?;

		let info = DeviceInfo {
			id: device.device_id.clone(),
			name: device.device_name.clone(),
			platform: device.platform.clone(),
			last_seen: now,
			registered_at: existing.as_ref().map_or(now, |d| d.registered_at),
			trusted: existing.as_ref().is_some_and(|d| d.trusted),
		};
		self.remote
			.create(&self.path, &info.id, Self::to_document(&info)?)
			.await?;

		if existing.is_none() {
			info!("Registered new device {} ({})", info.name, info.platform);
		}
		Ok(info)
	}

	pub async fn get(&self, device_id: &str) -> Result<Option<DeviceInfo>, SyncError> {
		match self.remote.read(&self.path, device_id).await? {
			Some(document) => Ok(Some(Self::from_document(device_id, document)?)),
			None => Ok(None),
		}
	}

	/// Known devices, most recently seen first.
	pub async fn list_devices(&self) -> Result<Vec<DeviceInfo>, SyncError> {
		let documents = self.remote.query(&self.path, &Query::all()).await?;
		let mut devices = Vec::with_capacity(documents.len());
		for (id, document) in documents {
			match Self::from_document(&id, document) {
				Ok(device) => devices.push(device),
				Err(e) => warn!("Skipping unreadable device record {}: {}", id, e),
			}
		}
		devices.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then_with(|| a.id.cmp(&b.id)));
		Ok(devices)
	}

	/// Devices seen within `window` of now.
	pub async fn active_devices(&self, window: Duration) -> Result<Vec<DeviceInfo>, SyncError> {
		let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
		let cutoff = self
			.clock
			.now()
			.checked_sub_signed(window)
			.unwrap_or(DateTime::<Utc>::MIN_UTC);
		let mut devices = self.list_devices().await?;
		devices.retain(|d| d.last_seen >= cutoff);
		Ok(devices)
	}

	pub async fn heartbeat(&self, device_id: &str) -> Result<(), SyncError> {
		self.require(device_id).await?;
		self.remote
			.update(&self.path, device_id, json!({ "last_seen": self.clock.now() }))
			.await?;
		Ok(())
	}

	pub async fn set_trusted(&self, device_id: &str, trusted: bool) -> Result<(), SyncError> {
		self.require(device_id).await?;
		self.remote
			.update(&self.path, device_id, json!({ "trusted": trusted }))
			.await?;
		info!("Device {} trusted: {}", device_id, trusted);
		Ok(())
	}

	/// Revoke a device. This is the only way a device record is deleted.
	pub async fn remove_device(&self, device_id: &str) -> Result<(), SyncError> {
		self.require(device_id).await?;
		self.remote.delete(&self.path, device_id).await?;
		info!("Removed device {}", device_id);
		Ok(())
	}

	async fn require(&self, device_id: &str) -> Result<(), SyncError> {
		if self.remote.read(&self.path, device_id).await?.is_none() {
			return Err(RemoteError::NotFound {
				path: self.path.clone(),
				id: device_id.to_string(),
			}
			.into());
		}
		Ok(())
	}

	fn to_document(info: &DeviceInfo) -> Result<serde_json::Value, SyncError> {
		serde_json::to_value(info)
			.map_err(|e| RemoteError::Rejected(format!("unserializable device {}: {}", info.id, e)).into())
	}

	fn from_document(id: &str, document: serde_json::Value) -> Result<DeviceInfo, SyncError> {
		serde_json::from_value(document)
			.map_err(|e| RemoteError::Rejected(format!("malformed device record {}: {}", id, e)).into())
	}
}
