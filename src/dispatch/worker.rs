use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, error};

use crate::adapters::{Clock, RemoteStore, user_collection};
use crate::error::ProcessError;
use crate::pipeline::PayloadPipeline;
use crate::queue::{OperationType, QueuedOperation};
use crate::sync::events::{SYNC_EVENTS_COLLECTION, SyncEvent};

pub const SETTINGS_COLLECTION: &str = "settings";
pub const SETTINGS_DOCUMENT: &str = "preferences";
pub const BACKUPS_COLLECTION: &str = "backups";

/// Executes one operation's side effect against the remote store.
#[derive(Clone)]
pub struct OperationProcessor {
	remote: Arc<dyn RemoteStore>,
	pipeline: PayloadPipeline,
	clock: Arc<dyn Clock>,
}

impl OperationProcessor {
	pub fn new(remote: Arc<dyn RemoteStore>, pipeline: PayloadPipeline, clock: Arc<dyn Clock>) -> Self {
		Self {
			remote,
			pipeline,
			clock,
		}
	}

	/// Decode the payload and apply it remotely.
	///
	/// Returns the decoded payload so the caller can broadcast it. Pipeline
	/// failures are permanent; remote failures are classified by the store.
	pub async fn process(&self, op: &QueuedOperation) -> Result<Value, ProcessError> {
		let payload = self.pipeline.decode(&op.payload).await.map_err(|e| {
			error!("[PROCESS_OPERATION] Failed to decode payload of {}: {}", op.id, e);
			ProcessError::from(e)
		})?;

		debug!("Processing operation {} ({})", op.id, op.op_type);

		match op.op_type {
			OperationType::Create(kind) => {
				let id = Self::entity_id(op)?;
				let path = user_collection(&op.user_id, kind.collection());
				self.remote
					.create(&path, id, Self::stamp(payload.clone(), op)?)
					.await?;
			}
			OperationType::Update(kind) => {
				let id = Self::entity_id(op)?;
				let path = user_collection(&op.user_id, kind.collection());
				self.remote
					.update(&path, id, Self::stamp(payload.clone(), op)?)
					.await?;
			}
			OperationType::Delete(kind) => {
				let id = Self::entity_id(op)?;
				let path = user_collection(&op.user_id, kind.collection());
				self.remote.delete(&path, id).await?;
			}
			OperationType::SettingsUpdate => {
				let path = user_collection(&op.user_id, SETTINGS_COLLECTION);
				self.remote
					.update(&path, SETTINGS_DOCUMENT, Self::stamp(payload.clone(), op)?)
					.await?;
			}
			OperationType::BackupCreate => {
				let path = user_collection(&op.user_id, BACKUPS_COLLECTION);
				let document = json!({
					"data": payload,
					"device_id": op.device_id,
					"created_at": op.timestamp,
					"uploaded_at": self.clock.now(),
				});
				self.remote.create(&path, &op.id.to_string(), document).await?;
			}
			OperationType::SyncEvent => {
				let mut event: SyncEvent = serde_json::from_value(payload.clone()).map_err(|e| {
					ProcessError::Permanent(format!("malformed sync event payload: {}", e))
				})?;
				event.published_at = Some(self.clock.now());
				let path = user_collection(&op.user_id, SYNC_EVENTS_COLLECTION);
				self.remote
					.create(&path, &event.id.to_string(), event.to_document())
					.await?;
			}
		}

		Ok(payload)
	}

	fn entity_id(op: &QueuedOperation) -> Result<&str, ProcessError> {
		op.entity_id.as_deref().ok_or_else(|| {
			ProcessError::Permanent(format!("{} operation {} has no entity id", op.op_type, op.id))
		})
	}

	/// Attach modification metadata to an entity document.
	fn stamp(payload: Value, op: &QueuedOperation) -> Result<Value, ProcessError> {
		let Value::Object(mut fields) = payload else {
			return Err(ProcessError::Permanent(format!(
				"{} payload for {} is not an object",
				op.op_type, op.id
			)));
		};
		fields.insert("updated_at".to_string(), json!(op.timestamp));
		fields.insert("updated_by".to_string(), json!(op.device_id));
		Ok(Value::Object(fields))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::adapters::{MemoryRemoteStore, SystemClock};
	use crate::pipeline::PipelineSettings;
	use crate::queue::EntityKind;
	use crate::queue::store::tests::make_op;
	use chrono::Utc;

	fn settings() -> PipelineSettings {
		PipelineSettings {
			compression_enabled: true,
			compression_threshold: 16,
			compression_level: 3,
			encryption_enabled: false,
			encryption_key_id: String::new(),
		}
	}

	async fn op_with(op_type: OperationType, entity_id: Option<&str>, payload: Value) -> QueuedOperation {
		let mut op = make_op(2, 0, Utc::now());
		op.op_type = op_type;
		op.entity_id = entity_id.map(str::to_string);
		op.payload = PayloadPipeline::default()
			.encode(&payload, &settings())
			.await
			.unwrap()
			.bytes;
		op
	}

	#[tokio::test]
	async fn test_create_then_delete_entity() {
		let remote = Arc::new(MemoryRemoteStore::new());
		let processor = OperationProcessor::new(remote.clone(), PayloadPipeline::default(), Arc::new(SystemClock));
		let path = user_collection("user-1", "subscriptions");

		let create = op_with(
			OperationType::Create(EntityKind::Subscription),
			Some("s1"),
			json!({"name": "News", "price": 4}),
		)
		.await;
		processor.process(&create).await.unwrap();

		let doc = remote.read(&path, "s1").await.unwrap().unwrap();
		assert_eq!(doc["name"], "News");
		assert_eq!(doc["updated_by"], "device-a");

		let delete = op_with(OperationType::Delete(EntityKind::Subscription), Some("s1"), Value::Null).await;
		processor.process(&delete).await.unwrap();
		assert!(remote.read(&path, "s1").await.unwrap().is_none());
	}

	#[tokio::test]
	async fn test_remote_outage_is_transient() {
		let remote = Arc::new(MemoryRemoteStore::new());
		remote.set_reachable(false);
		let processor = OperationProcessor::new(remote, PayloadPipeline::default(), Arc::new(SystemClock));

		let op = op_with(OperationType::SettingsUpdate, None, json!({"theme": "dark"})).await;
		assert!(matches!(processor.process(&op).await, Err(ProcessError::Transient(_))));
	}

	#[tokio::test]
	async fn test_corrupt_payload_is_permanent() {
		let processor = OperationProcessor::new(
			Arc::new(MemoryRemoteStore::new()),
			PayloadPipeline::default(),
			Arc::new(SystemClock),
		);
		let mut op = op_with(OperationType::SettingsUpdate, None, json!({})).await;
		op.payload = vec![0x00, b'{'];

		assert!(matches!(processor.process(&op).await, Err(ProcessError::Permanent(_))));
	}

	#[tokio::test]
	async fn test_entity_operation_without_id_is_permanent() {
		let processor = OperationProcessor::new(
			Arc::new(MemoryRemoteStore::new()),
			PayloadPipeline::default(),
			Arc::new(SystemClock),
		);
		let op = op_with(OperationType::Update(EntityKind::Category), None, json!({"name": "x"})).await;

		assert!(matches!(processor.process(&op).await, Err(ProcessError::Permanent(_))));
	}
}
