//! Queue lifecycle events.
//!
//! Callers observe eventual completion through these events rather than
//! through synchronous results. Every event goes to the registered handlers
//! (telemetry among them) and to a broadcast channel that any number of
//! subscribers can follow.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, error};

use crate::adapters::TelemetrySink;
use crate::error::SyncError;
use crate::queue::{OperationId, OperationType};
use crate::sync::Resolution;

/// Events emitted over the lifetime of queued operations
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    /// An operation was accepted into the queue
    Added {
        id: OperationId,
        op_type: OperationType,
        priority: u8,
        size: usize,
    },
    /// An operation executed successfully and left the queue
    Completed {
        id: OperationId,
        op_type: OperationType,
        latency_ms: u64,
    },
    /// An operation failed terminally
    Failed {
        id: OperationId,
        op_type: OperationType,
        retry_count: u32,
        reason: String,
    },
    /// A failed attempt will be retried after a backoff window
    RetryScheduled {
        id: OperationId,
        op_type: OperationType,
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
        reason: String,
    },
    /// An operation expired before it could be dispatched
    Expired { id: OperationId, op_type: OperationType },
    /// An operation was evicted to make room
    Evicted {
        id: OperationId,
        op_type: OperationType,
        priority: u8,
        size: usize,
    },
    /// A concurrent remote edit was reconciled
    ConflictResolved {
        conflict_id: uuid::Uuid,
        entity_type: String,
        entity_id: String,
        resolution: Resolution,
    },
}

impl QueueEvent {
    pub fn name(&self) -> &'static str {
        match self {
            QueueEvent::Added { .. } => "added",
            QueueEvent::Completed { .. } => "completed",
            QueueEvent::Failed { .. } => "failed",
            QueueEvent::RetryScheduled { .. } => "retry_scheduled",
            QueueEvent::Expired { .. } => "expired",
            QueueEvent::Evicted { .. } => "evicted",
            QueueEvent::ConflictResolved { .. } => "conflict_resolved",
        }
    }
}

/// Trait for handling queue events.
#[async_trait::async_trait]
pub trait QueueEventHandler: Send + Sync {
    async fn handle(&mut self, event: &QueueEvent) -> Result<(), SyncError>;

    /// Get the name of this handler for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// Fans events out to registered handlers and broadcast subscribers.
///
/// A failing handler is logged and skipped; it never stops the others.
pub struct EventDispatcher {
    handlers: Mutex<Vec<Box<dyn QueueEventHandler>>>,
    sender: broadcast::Sender<QueueEvent>,
}

impl EventDispatcher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            handlers: Mutex::new(Vec::new()),
            sender,
        }
    }

    /// Handlers are called in the order they are registered.
    pub async fn register_handler(&self, handler: Box<dyn QueueEventHandler>) {
        debug!("Registered queue event handler {}", handler.name());
        self.handlers.lock().await.push(handler);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }

    pub async fn dispatch(&self, event: QueueEvent) {
        {
            let mut handlers = self.handlers.lock().await;
            for handler in handlers.iter_mut() {
                if let Err(e) = handler.handle(&event).await {
                    error!("Handler {} failed to process event: {}", handler.name(), e);
                }
            }
        }
        // Nobody listening is fine
        let _ = self.sender.send(event);
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Forwards every event to a telemetry sink, swallowing sink errors.
pub struct TelemetryHandler {
    sink: Arc<dyn TelemetrySink>,
}

impl TelemetryHandler {
    pub fn new(sink: Arc<dyn TelemetrySink>) -> Self {
        Self { sink }
    }
}

#[async_trait::async_trait]
impl QueueEventHandler for TelemetryHandler {
    async fn handle(&mut self, event: &QueueEvent) -> Result<(), SyncError> {
        let properties = serde_json::to_value(event).unwrap_or(serde_json::Value::Null);
        if let Err(e) = self.sink.track(&format!("queue_{}", event.name()), &properties) {
            debug!("Telemetry dropped {}: {}", event.name(), e);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "telemetry"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{StorageError, TelemetryError};
    use crate::queue::EntityKind;
    use std::sync::Mutex as StdMutex;
    use tracing_test::traced_test;

    struct FailingHandler;

    #[async_trait::async_trait]
    impl QueueEventHandler for FailingHandler {
        async fn handle(&mut self, _event: &QueueEvent) -> Result<(), SyncError> {
            Err(StorageError::Unavailable("disk full".to_string()).into())
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        events: StdMutex<Vec<String>>,
        fail: bool,
    }

    impl TelemetrySink for RecordingSink {
        fn track(&self, event: &str, _properties: &serde_json::Value) -> Result<(), TelemetryError> {
            self.events.lock().unwrap().push(event.to_string());
            if self.fail {
                return Err(TelemetryError("sink offline".to_string()));
            }
            Ok(())
        }
    }

    fn added() -> QueueEvent {
        QueueEvent::Added {
            id: uuid::Uuid::new_v4(),
            op_type: OperationType::Create(EntityKind::Subscription),
            priority: 2,
            size: 64,
        }
    }

    #[traced_test]
    #[tokio::test]
    async fn test_failing_handler_does_not_stop_others() {
        let dispatcher = EventDispatcher::default();
        let sink = Arc::new(RecordingSink::default());
        dispatcher.register_handler(Box::new(FailingHandler)).await;
        dispatcher
            .register_handler(Box::new(TelemetryHandler::new(sink.clone())))
            .await;
        let mut rx = dispatcher.subscribe();

        let event = added();
        dispatcher.dispatch(event.clone()).await;

        assert_eq!(rx.recv().await.unwrap(), event);
        assert_eq!(*sink.events.lock().unwrap(), vec!["queue_added".to_string()]);
        assert!(logs_contain("Handler failing failed to process event"));
    }

    #[tokio::test]
    async fn test_telemetry_errors_are_swallowed() {
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..RecordingSink::default()
        });
        let mut handler = TelemetryHandler::new(sink.clone());
        assert!(handler.handle(&added()).await.is_ok());
        assert_eq!(sink.events.lock().unwrap().len(), 1);
    }
}
