//! Sync service and integration point for every sync component.
//!
//! `SyncService` owns the operation queue and wires together the payload
//! pipeline, the dispatcher and its workers, the sync event bus, the conflict
//! resolver and the device registry. All external collaborators are injected
//! through `SyncDependencies`, so isolated instances can run side by side
//! (two devices sharing one in-memory remote store, for instance).
//!
//! The service is responsible for:
//! - Restoring queue, status counters, delivery cursors and conflicts on `init`
//! - Accepting, cancelling and re-arming operations
//! - Running the background dispatch loop and the inbound sync-event listener
//! - Persisting every queue mutation before reporting it to the caller

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use itertools::Itertools;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{Mutex, Notify, RwLock, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::adapters::{
    Clock, Connectivity, DurableStore, EntityRecord, EntityStore, MemoryEntityStore, NoopBridge,
    PlatformBridge, RemoteStore, SystemClock, TelemetrySink, TracingTelemetry,
};
use crate::config::{DeviceContext, QueueConfig};
use crate::dispatch::{
    Dispatcher, EventDispatcher, OperationProcessor, QueueEvent, QueueEventHandler,
    TelemetryHandler,
};
use crate::error::{ConfigError, SyncError};
use crate::pipeline::{CryptoService, PayloadPipeline, PipelineSettings};
use crate::queue::{
    EntityKind, LimitReport, OperationId, OperationMetadata, OperationQueue, OperationRequest,
    OperationStatus, OperationType, QueueLimits, QueuePersistence, QueueStatus, QueuedOperation,
    StatusTracker,
};
use crate::sync::events::{SETTINGS_ENTITY_ID, SETTINGS_ENTITY_TYPE};
use crate::sync::{
    ConflictHandler, ConflictResolver, ConflictSide, CursorBook, Delivery, DeviceRegistry,
    SyncBus, SyncConflict, SyncEvent,
};

const CURSORS_RECORD: &str = "cursors";
const CONFLICTS_RECORD: &str = "conflicts";

/// External collaborators injected at initialization.
#[derive(Clone)]
pub struct SyncDependencies {
    pub remote: Arc<dyn RemoteStore>,
    pub durable: Arc<dyn DurableStore>,
    pub entities: Arc<dyn EntityStore>,
    pub crypto: Option<Arc<dyn CryptoService>>,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub platform: Arc<dyn PlatformBridge>,
    pub clock: Arc<dyn Clock>,
    pub connectivity: Connectivity,
}

impl SyncDependencies {
    /// Everything besides the two stores gets a default: in-memory entities,
    /// no crypto, tracing telemetry, no platform bridge, the system clock and
    /// an online connectivity signal.
    pub fn new(remote: Arc<dyn RemoteStore>, durable: Arc<dyn DurableStore>) -> Self {
        Self {
            remote,
            durable,
            entities: Arc::new(MemoryEntityStore::new()),
            crypto: None,
            telemetry: Arc::new(TracingTelemetry),
            platform: Arc::new(NoopBridge),
            clock: Arc::new(SystemClock),
            connectivity: Connectivity::default(),
        }
    }

    #[must_use]
    pub fn with_entities(mut self, entities: Arc<dyn EntityStore>) -> Self {
        self.entities = entities;
        self
    }

    #[must_use]
    pub fn with_crypto(mut self, crypto: Arc<dyn CryptoService>) -> Self {
        self.crypto = Some(crypto);
        self
    }

    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    #[must_use]
    pub fn with_platform(mut self, platform: Arc<dyn PlatformBridge>) -> Self {
        self.platform = platform;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = connectivity;
        self
    }
}

/// State shared between the service handle, the dispatch loop, its workers
/// and the inbound listener.
///
/// Lock order is `queue` before `status`.
pub(crate) struct ServiceState {
    pub(crate) context: DeviceContext,
    pub(crate) config: RwLock<QueueConfig>,
    pub(crate) queue: Mutex<OperationQueue>,
    pub(crate) status: Mutex<StatusTracker>,
    pub(crate) conflicts: Mutex<Vec<SyncConflict>>,
    pub(crate) resolver: RwLock<ConflictResolver>,
    pub(crate) pipeline: PayloadPipeline,
    pub(crate) processor: OperationProcessor,
    pub(crate) persistence: QueuePersistence,
    pub(crate) events: EventDispatcher,
    pub(crate) bus: SyncBus,
    pub(crate) registry: DeviceRegistry,
    pub(crate) entities: Arc<dyn EntityStore>,
    pub(crate) platform: Arc<dyn PlatformBridge>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) connectivity: Connectivity,
    /// Signalled whenever new work may be eligible
    pub(crate) wake: Notify,
}

impl ServiceState {
    /// Encode, queue and persist a new operation.
    pub(crate) async fn enqueue(&self, request: OperationRequest) -> Result<OperationId, SyncError> {
        if request.op_type.entity_kind().is_some() && request.entity_id.is_none() {
            return Err(SyncError::InvalidOperation(format!(
                "{} requires an entity id",
                request.op_type
            )));
        }

        let config = self.config.read().await.clone();
        let encoded = self
            .pipeline
            .encode(&request.payload, &PipelineSettings::from(&config))
            .await?;
        let now = self.clock.now();

        let op = QueuedOperation {
            id: Uuid::new_v4(),
            op_type: request.op_type,
            entity_id: request.entity_id.clone(),
            user_id: self.context.user_id.clone(),
            device_id: self.context.device_id.clone(),
            timestamp: now,
            priority: request
                .priority
                .unwrap_or_else(|| config.priorities.for_type(request.op_type)),
            retry_count: 0,
            max_retries: request.max_retries.unwrap_or(config.max_retries),
            last_attempt: None,
            failure_reason: None,
            dependencies: request.dependencies.clone(),
            expires_at: request.expires_at,
            next_attempt_at: None,
            status: OperationStatus::Queued,
            sequence: 0,
            metadata: OperationMetadata {
                size: encoded.bytes.len(),
                compressed: encoded.compressed,
                encrypted: encoded.encrypted,
                category: request.op_type.category(),
            },
            payload: encoded.bytes,
        };
        let (id, op_type, priority, size) = (op.id, op.op_type, op.priority, op.metadata.size);

        let report = self
            .queue
            .lock()
            .await
            .add(op, &QueueLimits::from(&config), now)?;
        self.record_limit_report(report).await;
        self.apply_local(&request, now).await;
        self.persist().await;

        debug!("Queued {} ({}, priority {}, {} bytes)", id, op_type, priority, size);
        self.events
            .dispatch(QueueEvent::Added {
                id,
                op_type,
                priority,
                size,
            })
            .await;
        self.wake.notify_one();

        Ok(id)
    }

    /// Mirror a queued mutation into the local entity store so it is visible
    /// offline and takes part in conflict detection. A delete leaves a
    /// tombstone until it syncs.
    async fn apply_local(&self, request: &OperationRequest, at: DateTime<Utc>) {
        let (entity_type, entity_id) = match (request.op_type, request.entity_id.as_deref()) {
            (
                OperationType::Create(kind) | OperationType::Update(kind) | OperationType::Delete(kind),
                Some(id),
            ) => (kind.as_str(), id),
            (OperationType::SettingsUpdate, _) => (SETTINGS_ENTITY_TYPE, SETTINGS_ENTITY_ID),
            _ => return,
        };

        let deleted = matches!(request.op_type, OperationType::Delete(_));
        let result = match self.entities.get(entity_type, entity_id).await {
            Ok(existing) => {
                let synced_at = existing.as_ref().and_then(|record| record.synced_at);
                let data = match (
                    request.op_type,
                    existing.filter(|record| !record.deleted).map(|record| record.data),
                    request.payload.clone(),
                ) {
                    (OperationType::Delete(_), _, _) => Value::Null,
                    (
                        OperationType::Update(_) | OperationType::SettingsUpdate,
                        Some(Value::Object(mut current)),
                        Value::Object(fields),
                    ) => {
                        current.extend(fields);
                        Value::Object(current)
                    }
                    (_, _, payload) => payload,
                };
                self.entities
                    .put(EntityRecord {
                        entity_type: entity_type.to_string(),
                        entity_id: entity_id.to_string(),
                        data,
                        modified_at: at,
                        modified_by: self.context.device_id.clone(),
                        synced_at,
                        deleted,
                    })
                    .await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            warn!("Failed to record local edit of {}/{}: {}", entity_type, entity_id, e);
        }
    }

    /// Fold the outcome of a limit check into counters and lifecycle events.
    pub(crate) async fn record_limit_report(&self, report: LimitReport) {
        if report.is_empty() {
            return;
        }
        {
            let mut tracker = self.status.lock().await;
            tracker.record_expired(report.expired.len());
            tracker.record_evicted(report.evicted.len());
        }

        if !report.purged.is_empty() {
            info!(
                "Purged failed operations past retention: {}",
                report.purged.iter().map(|op| op.id).join(", ")
            );
        }
        for op in report.expired {
            warn!("Operation {} ({}) expired before dispatch", op.id, op.op_type);
            self.events
                .dispatch(QueueEvent::Expired {
                    id: op.id,
                    op_type: op.op_type,
                })
                .await;
        }
        for op in report.evicted {
            warn!(
                "Evicted {} ({}, priority {}, {} bytes) to make room",
                op.id, op.op_type, op.priority, op.metadata.size
            );
            self.events
                .dispatch(QueueEvent::Evicted {
                    id: op.id,
                    op_type: op.op_type,
                    priority: op.priority,
                    size: op.metadata.size,
                })
                .await;
        }
    }

    /// Recompute the aggregate status.
    pub(crate) async fn current_status(&self) -> QueueStatus {
        let limits = QueueLimits::from(&*self.config.read().await);
        let queue = self.queue.lock().await;
        let mut tracker = self.status.lock().await;
        let status = tracker.snapshot(&queue, &limits);
        tracker.log_progress(&status, false);
        status
    }

    /// Write the queue snapshot and status, then push the status to the
    /// platform. Failures are logged and otherwise ignored.
    pub(crate) async fn persist(&self) {
        let snapshot = self.queue.lock().await.snapshot();
        self.persistence.save_queue(&snapshot).await;

        let status = self.current_status().await;
        let counters = self.status.lock().await.counters().clone();
        self.persistence.save_status(&counters).await;
        self.platform.publish_status(&status);
    }

    async fn persist_cursors(&self) {
        let cursors = self.bus.cursors().await;
        self.persistence.save_record(CURSORS_RECORD, &cursors).await;
    }

    /// Store a resolved conflict, pruning resolved ones past retention.
    ///
    /// A redelivered event replaces the record of its earlier conflict.
    pub(crate) async fn record_conflict(&self, conflict: SyncConflict) {
        let retention = self.config.read().await.retention;
        let cutoff = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| self.clock.now().checked_sub_signed(retention));

        let mut conflicts = self.conflicts.lock().await;
        if let Some(cutoff) = cutoff {
            conflicts.retain(|c| !c.resolved || c.resolved_at.is_none_or(|at| at > cutoff));
        }
        match conflicts
            .iter_mut()
            .find(|c| c.remote_event_id == conflict.remote_event_id)
        {
            Some(existing) => *existing = conflict,
            None => conflicts.push(conflict),
        }
        self.persistence
            .save_record(CONFLICTS_RECORD, &*conflicts)
            .await;
    }

    /// Run one inbound event through the bus and commit its outcome.
    pub(crate) async fn handle_inbound(&self, event: SyncEvent) -> Result<Delivery, SyncError> {
        let delivery = {
            let resolver = self.resolver.read().await;
            self.bus.receive(&event, &resolver).await?
        };

        if matches!(delivery, Delivery::Echo | Delivery::Duplicate) {
            return Ok(delivery);
        }

        if let Delivery::Conflict(conflict) = &delivery {
            // The resolution is on record before it touches local state
            self.record_conflict(conflict.clone()).await;
            if let Some(merged) = self.bus.apply_resolution(conflict, &event).await? {
                self.enqueue_merge(conflict, merged).await;
            }
            if conflict.superseded == Some(ConflictSide::Local) {
                self.withdraw_superseded(conflict).await;
            }
            if let Some(resolution) = conflict.resolution.clone() {
                self.events
                    .dispatch(QueueEvent::ConflictResolved {
                        conflict_id: conflict.id,
                        entity_type: conflict.entity_type.clone(),
                        entity_id: conflict.entity_id.clone(),
                        resolution,
                    })
                    .await;
            }
        }

        self.persist_cursors().await;
        Ok(delivery)
    }

    /// Send a merged record back out so the other devices converge on it.
    async fn enqueue_merge(&self, conflict: &SyncConflict, merged: Value) {
        let request = if conflict.entity_type == SETTINGS_ENTITY_TYPE {
            OperationRequest::settings(merged)
        } else if let Some(kind) = EntityKind::parse(&conflict.entity_type) {
            OperationRequest::update(kind, conflict.entity_id.clone(), merged)
        } else {
            warn!(
                "Cannot propagate merge for unknown entity type {}",
                conflict.entity_type
            );
            return;
        };

        if let Err(e) = self.enqueue(request).await {
            error!(
                "Failed to queue merged {}/{}: {}",
                conflict.entity_type, conflict.entity_id, e
            );
        }
    }

    /// Drop the local operations that lost a conflict so they never replay
    /// over the remote winner.
    ///
    /// Operations already executing cannot be recalled; the winning value is
    /// queued behind them instead.
    async fn withdraw_superseded(&self, conflict: &SyncConflict) {
        let (removed, executing) = self.queue.lock().await.supersede(
            &conflict.entity_type,
            &conflict.entity_id,
            conflict.local.modified_at,
        );

        if !removed.is_empty() {
            info!(
                "Withdrew operations superseded on {}/{}: {}",
                conflict.entity_type,
                conflict.entity_id,
                removed.iter().map(|op| op.id).join(", ")
            );
            self.persist().await;
        }
        if executing.is_empty() {
            return;
        }

        let request = if conflict.entity_type == SETTINGS_ENTITY_TYPE {
            conflict.remote.data.clone().map(OperationRequest::settings)
        } else {
            EntityKind::parse(&conflict.entity_type).map(|kind| match &conflict.remote.data {
                Some(data) => OperationRequest::update(kind, conflict.entity_id.clone(), data.clone()),
                None => OperationRequest::delete(kind, conflict.entity_id.clone()),
            })
        };
        let Some(mut request) = request else {
            warn!(
                "Cannot restore remote winner for {}/{}",
                conflict.entity_type, conflict.entity_id
            );
            return;
        };
        request.dependencies.extend(executing);

        if let Err(e) = self.enqueue(request).await {
            error!(
                "Failed to queue remote winner for {}/{}: {}",
                conflict.entity_type, conflict.entity_id, e
            );
        }
    }

    /// Write the `synced` flags collected since the last flush.
    pub(crate) async fn flush_synced_flags(&self) {
        if let Err(e) = self.bus.flush_synced_flags().await {
            debug!("Could not flag delivered sync events: {}", e);
        }
    }

    /// Upsert this device in the registry, which also refreshes `last_seen`.
    pub(crate) async fn announce_device(&self) {
        if let Err(e) = self.registry.register_device(&self.context).await {
            warn!("Device registration failed: {}", e);
        }
    }

    /// Fetch and apply every sync event this device has not seen yet.
    pub(crate) async fn catch_up(&self) -> Result<usize, SyncError> {
        let events = self.bus.catch_up().await?;
        let mut applied = 0;
        for event in events {
            let id = event.id;
            match self.handle_inbound(event).await {
                Ok(Delivery::Applied | Delivery::Conflict(_)) => applied += 1,
                Ok(_) => {}
                Err(e) => warn!("Failed to apply sync event {}: {}", id, e),
            }
        }
        self.flush_synced_flags().await;
        if applied > 0 {
            info!("Caught up on {} sync events", applied);
        }
        Ok(applied)
    }
}

struct Background {
    shutdown: watch::Sender<bool>,
    dispatch: JoinHandle<()>,
    inbound: JoinHandle<()>,
}

/// Offline-first sync core for one device of one account.
pub struct SyncService {
    state: Arc<ServiceState>,
    background: Mutex<Option<Background>>,
}

impl SyncService {
    /// Build a service and restore whatever the durable store holds for this
    /// user and device.
    pub async fn init(
        config: QueueConfig,
        context: DeviceContext,
        deps: SyncDependencies,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        if config.encryption_enabled && deps.crypto.is_none() {
            return Err(ConfigError(
                "encryption is enabled but no crypto service was provided".to_string(),
            )
            .into());
        }

        let persistence = QueuePersistence::new(
            deps.durable.clone(),
            &context.user_id,
            &context.device_id,
            config.persist_retry_window,
        );

        let queue = match persistence.load_queue().await {
            Ok(Some(snapshot)) => OperationQueue::restore(snapshot),
            Ok(None) => OperationQueue::new(),
            Err(e) => {
                warn!("Failed to load queue snapshot, starting empty: {}", e);
                OperationQueue::new()
            }
        };
        let status = match persistence.load_status().await {
            Ok(Some(persisted)) => StatusTracker::restore(persisted.counters),
            Ok(None) => StatusTracker::new(),
            Err(e) => {
                warn!("Failed to load status counters: {}", e);
                StatusTracker::new()
            }
        };
        let cursors: CursorBook = load_or_default(&persistence, CURSORS_RECORD).await;
        let conflicts: Vec<SyncConflict> = load_or_default(&persistence, CONFLICTS_RECORD).await;

        let pipeline = PayloadPipeline::new(deps.crypto.clone());
        let processor =
            OperationProcessor::new(deps.remote.clone(), pipeline.clone(), deps.clock.clone());
        let bus = SyncBus::new(
            deps.remote.clone(),
            deps.entities.clone(),
            deps.clock.clone(),
            &context,
        );
        bus.restore_cursors(cursors).await;
        let registry = DeviceRegistry::new(deps.remote.clone(), deps.clock.clone(), &context.user_id);

        let events = EventDispatcher::default();
        events
            .register_handler(Box::new(TelemetryHandler::new(deps.telemetry.clone())))
            .await;

        if deps.connectivity.is_online() {
            if let Err(e) = registry.register_device(&context).await {
                warn!("Device registration failed, retrying once online: {}", e);
            }
        }

        info!(
            "Sync service initialized for {}/{}: {} queued operations, {} conflicts on record, platform {}",
            context.user_id,
            context.device_id,
            queue.len(),
            conflicts.len(),
            deps.platform.name()
        );

        let state = Arc::new(ServiceState {
            context,
            config: RwLock::new(config),
            queue: Mutex::new(queue),
            status: Mutex::new(status),
            conflicts: Mutex::new(conflicts),
            resolver: RwLock::new(ConflictResolver::new()),
            pipeline,
            processor,
            persistence,
            events,
            bus,
            registry,
            entities: deps.entities,
            platform: deps.platform,
            clock: deps.clock,
            connectivity: deps.connectivity,
            wake: Notify::new(),
        });

        Ok(Self {
            state,
            background: Mutex::new(None),
        })
    }

    /// Spawn the dispatch loop and the inbound sync-event listener.
    pub async fn start(&self) -> Result<(), SyncError> {
        let mut background = self.background.lock().await;
        if background.is_some() {
            return Err(SyncError::AlreadyRunning);
        }

        let (shutdown, receiver) = watch::channel(false);
        let dispatch = tokio::spawn(Dispatcher::new(self.state.clone()).run(receiver.clone()));
        let inbound = tokio::spawn(run_inbound(self.state.clone(), receiver));
        *background = Some(Background {
            shutdown,
            dispatch,
            inbound,
        });

        info!("Sync service started for device {}", self.state.context.device_id);
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.background.lock().await.is_some()
    }

    /// Stop selecting new work, wait for in-flight operations, and write a
    /// final snapshot.
    pub async fn shutdown(&self) {
        if let Some(background) = self.background.lock().await.take() {
            let _ = background.shutdown.send(true);
            if let Err(e) = background.dispatch.await {
                error!("Dispatch loop ended abnormally: {}", e);
            }
            if let Err(e) = background.inbound.await {
                error!("Sync listener ended abnormally: {}", e);
            }
        }

        self.state.persist().await;
        self.state.persist_cursors().await;
        let status = self.state.current_status().await;
        info!("Sync service shut down: {}", status.summary());
    }

    /// Run dispatch passes until nothing is eligible ("sync now").
    ///
    /// Returns the number of executions that finished. Operations waiting out
    /// a backoff window stay queued.
    pub async fn process_pending(&self) -> usize {
        Dispatcher::new(self.state.clone()).drain().await
    }

    /// Pull and apply sync events published by other devices.
    pub async fn sync_inbound(&self) -> Result<usize, SyncError> {
        self.state.catch_up().await
    }

    /// Queue a mutation. It is persisted before this returns.
    pub async fn enqueue(&self, request: OperationRequest) -> Result<OperationId, SyncError> {
        self.state.enqueue(request).await
    }

    /// Remove an operation that has not started executing.
    pub async fn cancel(&self, id: &OperationId) -> Result<QueuedOperation, SyncError> {
        let removed = self.state.queue.lock().await.remove(id)?;
        self.state.persist().await;
        info!("Cancelled {} ({})", removed.id, removed.op_type);
        self.state.wake.notify_one();
        Ok(removed)
    }

    pub async fn get(&self, id: &OperationId) -> Option<QueuedOperation> {
        self.state.queue.lock().await.get(id).cloned()
    }

    pub async fn list_pending(&self) -> Vec<QueuedOperation> {
        self.state.queue.lock().await.list_pending()
    }

    pub async fn failed_operations(&self) -> Vec<QueuedOperation> {
        self.state.queue.lock().await.failed_operations()
    }

    /// Give a terminally failed operation a fresh retry budget.
    pub async fn reset_operation(&self, id: &OperationId) -> Result<(), SyncError> {
        self.state.queue.lock().await.reset(id)?;
        self.state.persist().await;
        info!("Reset failed operation {}", id);
        self.state.wake.notify_one();
        Ok(())
    }

    pub async fn status(&self) -> QueueStatus {
        let status = self.state.current_status().await;
        self.state.platform.publish_status(&status);
        status
    }

    /// Every conflict on record, oldest first.
    pub async fn conflicts(&self) -> Vec<SyncConflict> {
        self.state.conflicts.lock().await.clone()
    }

    pub fn devices(&self) -> &DeviceRegistry {
        &self.state.registry
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.state.connectivity
    }

    pub fn context(&self) -> &DeviceContext {
        &self.state.context
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<QueueEvent> {
        self.state.events.subscribe()
    }

    pub async fn register_event_handler(&self, handler: Box<dyn QueueEventHandler>) {
        self.state.events.register_handler(handler).await;
    }

    pub async fn register_conflict_handler(
        &self,
        entity_type: impl Into<String>,
        handler: Arc<dyn ConflictHandler>,
    ) {
        self.state
            .resolver
            .write()
            .await
            .register_handler(entity_type, handler);
    }

    /// Replace the configuration; it applies from the next dispatch pass.
    ///
    /// The durable-store retry window is fixed at `init`.
    pub async fn update_config(&self, config: QueueConfig) -> Result<(), SyncError> {
        config.validate()?;
        if config.encryption_enabled && !self.state.pipeline.has_crypto() {
            return Err(ConfigError(
                "encryption is enabled but no crypto service was provided".to_string(),
            )
            .into());
        }
        *self.state.config.write().await = config;
        info!("Queue configuration updated");
        self.state.wake.notify_one();
        Ok(())
    }
}

async fn load_or_default<T: DeserializeOwned + Default>(persistence: &QueuePersistence, name: &str) -> T {
    match persistence.load_record(name).await {
        Ok(Some(record)) => record,
        Ok(None) => T::default(),
        Err(e) => {
            warn!("Failed to load {} record: {}", name, e);
            T::default()
        }
    }
}

/// Follow the live sync-event feed while online, catching up after every
/// (re)subscription.
async fn run_inbound(state: Arc<ServiceState>, mut shutdown: watch::Receiver<bool>) {
    let mut online = state.connectivity.subscribe();
    info!("Sync listener started");

    'outer: loop {
        if *shutdown.borrow() {
            break;
        }

        let is_online = *online.borrow_and_update();
        if !is_online {
            tokio::select! {
                changed = online.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = shutdown.changed() => break,
            }
            continue;
        }

        let retry_after = state.config.read().await.idle_poll_interval;
        let mut changes = match state.bus.subscribe().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Sync event subscription failed: {}", e);
                tokio::select! {
                    _ = tokio::time::sleep(retry_after) => {}
                    _ = shutdown.changed() => break,
                }
                continue;
            }
        };
        state.announce_device().await;
        if let Err(e) = state.catch_up().await {
            warn!("Sync event catch-up failed: {}", e);
        }

        loop {
            tokio::select! {
                change = changes.next() => match change {
                    Some(Ok(change)) => {
                        if let Some(event) = state.bus.parse_change(change) {
                            let id = event.id;
                            if let Err(e) = state.handle_inbound(event).await {
                                warn!("Failed to apply sync event {}: {}", id, e);
                            }
                            state.flush_synced_flags().await;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("Sync event subscription interrupted: {}", e);
                        break;
                    }
                    None => {
                        debug!("Sync event subscription ended");
                        break;
                    }
                },
                changed = online.changed() => {
                    if changed.is_err() {
                        break 'outer;
                    }
                    if !*online.borrow_and_update() {
                        debug!("Offline, pausing sync listener");
                        continue 'outer;
                    }
                }
                _ = shutdown.changed() => break 'outer,
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(retry_after) => {}
            _ = shutdown.changed() => break,
        }
    }

    info!("Sync listener stopped");
}
