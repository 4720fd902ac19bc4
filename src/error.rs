use crate::queue::OperationId;

/// Errors raised by the remote shared store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RemoteError {
	#[error("Remote store unreachable: {0}")]
	Unavailable(String),

	#[error("Document not found: {path}/{id}")]
	NotFound { path: String, id: String },

	#[error("Remote store rejected the request: {0}")]
	Rejected(String),

	#[error("Subscription closed: {0}")]
	SubscriptionClosed(String),
}

impl RemoteError {
	/// Whether retrying the same request later can succeed.
	pub fn is_transient(&self) -> bool {
		matches!(
			self,
			RemoteError::Unavailable(_) | RemoteError::SubscriptionClosed(_)
		)
	}
}

/// Errors raised by the durable local store.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),

	#[error("Invalid storage key: {0}")]
	InvalidKey(String),

	#[error("Serialization error: {0}")]
	Serialization(String),

	#[error("Storage unavailable: {0}")]
	Unavailable(String),
}

/// Errors raised by the cryptographic service.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CryptoError {
	#[error("Encryption failed: {0}")]
	Encrypt(String),

	#[error("Decryption failed: {0}")]
	Decrypt(String),

	#[error("Unknown key: {0}")]
	UnknownKey(String),
}

/// Errors raised while transforming operation payloads.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
	#[error("Crypto error: {0}")]
	Crypto(#[from] CryptoError),

	#[error("Compression error: {0}")]
	Compression(String),

	#[error("Payload serialization error: {0}")]
	Serialization(#[from] serde_json::Error),

	#[error("Corrupt payload: {0}")]
	Corrupt(String),

	#[error("Payload is encrypted but no crypto service is configured")]
	MissingCrypto,
}

/// Raised by a telemetry sink; always swallowed by the caller.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Telemetry error: {0}")]
pub struct TelemetryError(pub String);

/// Invalid queue configuration.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Invalid configuration: {0}")]
pub struct ConfigError(pub String);

/// Crate-wide error type.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
	#[error("Remote error: {0}")]
	Remote(#[from] RemoteError),

	#[error("Storage error: {0}")]
	Storage(#[from] StorageError),

	#[error("Pipeline error: {0}")]
	Pipeline(#[from] PipelineError),

	#[error(transparent)]
	Config(#[from] ConfigError),

	#[error("Queue capacity exceeded: {0}")]
	CapacityExceeded(String),

	#[error("Operation {0} would introduce a dependency cycle")]
	DependencyCycle(OperationId),

	#[error("Operation {0} is already queued")]
	DuplicateOperation(OperationId),

	#[error("Operation {0} is in flight and cannot be cancelled")]
	OperationInFlight(OperationId),

	#[error("Operation {0} not found")]
	OperationNotFound(OperationId),

	#[error("Invalid operation: {0}")]
	InvalidOperation(String),

	#[error("Sync service is already running")]
	AlreadyRunning,
}

/// Outcome classification of a failed execution attempt.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
	/// Network or remote-store failure; retried per backoff policy.
	#[error("{0}")]
	Transient(String),

	/// Corrupt payload, bad key or malformed operation; never retried.
	#[error("{0}")]
	Permanent(String),
}

impl From<RemoteError> for ProcessError {
	fn from(err: RemoteError) -> Self {
		if err.is_transient() {
			ProcessError::Transient(err.to_string())
		} else {
			ProcessError::Permanent(err.to_string())
		}
	}
}

impl From<PipelineError> for ProcessError {
	fn from(err: PipelineError) -> Self {
		ProcessError::Permanent(err.to_string())
	}
}
