//! Queue tunables and local device identity.

use std::time::Duration;

use crate::error::ConfigError;
use crate::queue::{BackoffPolicy, OperationType};

/// Default dispatch priority per operation type (lower = more urgent).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorityTable {
    pub delete: u8,
    pub update: u8,
    pub create: u8,
    pub settings: u8,
    pub sync_event: u8,
    pub backup: u8,
}

impl Default for PriorityTable {
    fn default() -> Self {
        Self {
            delete: 1,
            update: 2,
            create: 2,
            settings: 3,
            sync_event: 4,
            backup: 5,
        }
    }
}

impl PriorityTable {
    #[must_use]
    pub fn for_type(&self, op_type: OperationType) -> u8 {
        match op_type {
            OperationType::Delete(_) => self.delete,
            OperationType::Update(_) => self.update,
            OperationType::Create(_) => self.create,
            OperationType::SettingsUpdate => self.settings,
            OperationType::SyncEvent => self.sync_event,
            OperationType::BackupCreate => self.backup,
        }
    }
}

/// Queue configuration.
///
/// Read once at the start of every dispatch pass; changes made through
/// `SyncService::update_config` apply from the next pass on.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of operations held in the queue
    pub max_queue_size: usize,
    /// Maximum total encoded payload bytes held in the queue
    pub max_queue_size_bytes: usize,
    /// Default attempt budget for new operations
    pub max_retries: u32,
    pub base_retry_delay: Duration,
    pub max_retry_delay: Duration,
    /// Upper bound on operations selected per dispatch pass
    pub batch_size: usize,
    /// Maximum concurrently executing workers
    pub processing_concurrency: usize,
    /// How long terminally failed operations are kept around
    pub retention: Duration,
    /// Operations with a priority above this are evicted first
    pub protected_priority: u8,
    pub priorities: PriorityTable,
    pub compression_enabled: bool,
    /// Payloads at or below this size are stored uncompressed
    pub compression_threshold: usize,
    pub compression_level: i32,
    pub encryption_enabled: bool,
    pub encryption_key_id: String,
    /// Longest the dispatch loop sleeps when there is nothing eligible
    pub idle_poll_interval: Duration,
    /// Time budget for retrying a failed durable-store write
    pub persist_retry_window: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            max_queue_size_bytes: 10 * 1024 * 1024,
            max_retries: 3,
            base_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(300),
            batch_size: 10,
            processing_concurrency: 3,
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            protected_priority: 3,
            priorities: PriorityTable::default(),
            compression_enabled: true,
            compression_threshold: 1024,
            compression_level: 3,
            encryption_enabled: true,
            encryption_key_id: "queue-payload".to_string(),
            idle_poll_interval: Duration::from_secs(5),
            persist_retry_window: Duration::from_secs(2),
        }
    }
}

impl QueueConfig {
    /// Reject configurations the queue cannot operate under.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_queue_size == 0 {
            return Err(ConfigError("max_queue_size must be positive".to_string()));
        }
        if self.max_queue_size_bytes == 0 {
            return Err(ConfigError(
                "max_queue_size_bytes must be positive".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigError("batch_size must be positive".to_string()));
        }
        if self.processing_concurrency == 0 {
            return Err(ConfigError(
                "processing_concurrency must be positive".to_string(),
            ));
        }
        if self.base_retry_delay > self.max_retry_delay {
            return Err(ConfigError(format!(
                "base_retry_delay ({:?}) exceeds max_retry_delay ({:?})",
                self.base_retry_delay, self.max_retry_delay
            )));
        }
        if !(-7..=22).contains(&self.compression_level) {
            return Err(ConfigError(format!(
                "compression_level {} outside zstd range",
                self.compression_level
            )));
        }
        if self.encryption_enabled && self.encryption_key_id.is_empty() {
            return Err(ConfigError(
                "encryption_key_id is required when encryption is enabled".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.base_retry_delay, self.max_retry_delay)
    }
}

/// Identity of the local device within the account.
#[derive(Debug, Clone)]
pub struct DeviceContext {
    pub user_id: String,
    pub device_id: String,
    pub device_name: String,
    pub platform: String,
}

impl DeviceContext {
    pub fn new(user_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        let device_id = device_id.into();
        Self {
            user_id: user_id.into(),
            device_name: device_id.clone(),
            device_id,
            platform: std::env::consts::OS.to_string(),
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = name.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::EntityKind;

    #[test]
    fn test_default_config_is_valid() {
        assert!(QueueConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let config = QueueConfig {
            processing_concurrency: 0,
            ..QueueConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_delays() {
        let config = QueueConfig {
            base_retry_delay: Duration::from_secs(10),
            max_retry_delay: Duration::from_secs(1),
            ..QueueConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_priority_table() {
        let table = PriorityTable::default();
        assert!(
            table.for_type(OperationType::Delete(EntityKind::Category))
                < table.for_type(OperationType::BackupCreate)
        );
        assert!(table.for_type(OperationType::SyncEvent) > 3);
    }
}
