//! Dispatch loop and worker bookkeeping.
//!
//! A single loop owns batch selection. Each pass sweeps expired work, claims
//! up to `processing_concurrency` eligible operations and spawns one worker
//! per claim. Workers report back through the queue store, which is the only
//! state they share.

pub mod events;
pub mod scheduler;
pub mod worker;

pub use events::{EventDispatcher, QueueEvent, QueueEventHandler, TelemetryHandler};
pub use scheduler::{is_eligible, next_wakeup, select_batch};
pub use worker::OperationProcessor;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::ProcessError;
use crate::queue::{
	BackoffPolicy, OperationCategory, OperationRequest, OperationType, QueueLimits,
	QueuedOperation, RetryDecision,
};
use crate::service::ServiceState;
use crate::sync::SyncEvent;

pub(crate) struct Dispatcher {
	state: Arc<ServiceState>,
}

impl Dispatcher {
	pub(crate) fn new(state: Arc<ServiceState>) -> Self {
		Self { state }
	}

	/// Run one dispatch pass: sweep, select, claim and spawn.
	///
	/// Returns the number of workers started. The concurrency bound is checked
	/// against the queue's in-flight set, so it holds across concurrent passes.
	pub(crate) async fn fill(&self, workers: &mut JoinSet<()>) -> usize {
		let config = self.state.config.read().await.clone();
		let limits = QueueLimits::from(&config);
		let now = self.state.clock.now();

		let (report, claimed) = {
			let mut queue = self.state.queue.lock().await;
			let report = queue.enforce_limits(&limits, now);
			let slots = config
				.processing_concurrency
				.saturating_sub(queue.in_flight_count());
			let batch = scheduler::select_batch(&queue, config.batch_size.min(slots), now);

			let mut claimed = Vec::with_capacity(batch.len());
			for id in batch {
				if !queue.claim(&id) {
					continue;
				}
				if let Some(op) = queue.get(&id) {
					claimed.push(op.clone());
				}
			}
			(report, claimed)
		};

		if !report.is_empty() {
			self.state.record_limit_report(report).await;
			self.state.persist().await;
		}

		let started = claimed.len();
		if started > 0 {
			debug!("Dispatching {} operations", started);
		}
		let policy = config.backoff_policy();
		for op in claimed {
			workers.spawn(execute(self.state.clone(), op, policy));
		}
		started
	}

	/// Dispatch until nothing is eligible and every worker has finished.
	///
	/// Operations waiting out a backoff window are left for a later pass.
	pub(crate) async fn drain(&self) -> usize {
		let mut workers = JoinSet::new();
		let mut handled = 0;

		loop {
			if self.state.connectivity.is_online() {
				self.fill(&mut workers).await;
			}
			match workers.join_next().await {
				Some(joined) => {
					if let Err(e) = joined {
						error!("Worker task failed: {}", e);
					}
					handled += 1;
				}
				None => break,
			}
		}

		handled
	}

	/// Background loop; returns after shutdown once in-flight work is done.
	pub(crate) async fn run(self, mut shutdown: watch::Receiver<bool>) {
		let mut online = self.state.connectivity.subscribe();
		let mut workers = JoinSet::new();
		info!("Dispatch loop started");

		loop {
			if *shutdown.borrow() {
				break;
			}

			let is_online = *online.borrow_and_update();
			if is_online {
				self.fill(&mut workers).await;
			}

			let wait = self.idle_wait().await;
			tokio::select! {
				Some(joined) = workers.join_next(), if !workers.is_empty() => {
					if let Err(e) = joined {
						error!("Worker task failed: {}", e);
					}
				}
				_ = self.state.wake.notified() => {}
				changed = online.changed() => {
					if changed.is_err() {
						break;
					}
				}
				_ = shutdown.changed() => break,
				_ = tokio::time::sleep(wait) => {}
			}
		}

		if !workers.is_empty() {
			info!("Waiting for {} in-flight operations", workers.len());
		}
		while let Some(joined) = workers.join_next().await {
			if let Err(e) = joined {
				error!("Worker task failed: {}", e);
			}
		}
		info!("Dispatch loop stopped");
	}

	/// Sleep until the next backoff window closes, capped by the idle poll interval.
	async fn idle_wait(&self) -> Duration {
		let idle = self.state.config.read().await.idle_poll_interval;
		let now = self.state.clock.now();
		let next = scheduler::next_wakeup(&*self.state.queue.lock().await, now);
		match next {
			Some(at) => (at - now).to_std().unwrap_or(Duration::ZERO).min(idle),
			None => idle,
		}
	}
}

/// Execute one claimed operation and record the outcome.
///
/// Every path leaves the in-flight set, including a panicking processor.
async fn execute(state: Arc<ServiceState>, op: QueuedOperation, policy: BackoffPolicy) {
	let started = Instant::now();
	let outcome = AssertUnwindSafe(state.processor.process(&op))
		.catch_unwind()
		.await;

	match outcome {
		Ok(Ok(payload)) => on_success(&state, &op, payload, started.elapsed()).await,
		Ok(Err(e)) => on_failure(&state, &op, e, &policy).await,
		Err(_) => {
			error!("Worker panicked while processing {}", op.id);
			let e = ProcessError::Permanent("worker panicked".to_string());
			on_failure(&state, &op, e, &policy).await;
		}
	}
}

async fn on_success(state: &ServiceState, op: &QueuedOperation, payload: Value, latency: Duration) {
	state.queue.lock().await.complete(&op.id);
	state.status.lock().await.record_success(latency);
	info!("Completed {} ({}) in {:?}", op.id, op.op_type, latency);

	if let Some(event) = SyncEvent::from_operation(op, payload) {
		if matches!(
			op.op_type.category(),
			OperationCategory::Entity | OperationCategory::Settings
		) {
			if let Err(e) = state
				.entities
				.mark_synced(&event.entity_type, &event.entity_id, op.timestamp)
				.await
			{
				warn!(
					"Failed to mark {}/{} as synced: {}",
					event.entity_type, event.entity_id, e
				);
			}
		}
		publish_or_defer(state, &event).await;
	}

	state.persist().await;
	state
		.events
		.dispatch(events::QueueEvent::Completed {
			id: op.id,
			op_type: op.op_type,
			latency_ms: u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
		})
		.await;
}

/// Publish a sync event now, or queue it for delivery once the remote store
/// is reachable again.
async fn publish_or_defer(state: &ServiceState, event: &SyncEvent) {
	let Err(e) = state.bus.publish(event).await else {
		return;
	};
	warn!("Could not publish sync event {}, queueing it: {}", event.id, e);

	let payload = match serde_json::to_value(event) {
		Ok(payload) => payload,
		Err(e) => {
			error!("Failed to serialize sync event {}: {}", event.id, e);
			return;
		}
	};
	if let Err(e) = state
		.enqueue(OperationRequest::new(OperationType::SyncEvent, payload))
		.await
	{
		error!("Dropping sync event {}: {}", event.id, e);
	}
}

async fn on_failure(
	state: &ServiceState,
	op: &QueuedOperation,
	error: ProcessError,
	policy: &BackoffPolicy,
) {
	let (reason, retryable) = match &error {
		ProcessError::Transient(reason) => (reason.clone(), true),
		ProcessError::Permanent(reason) => (reason.clone(), false),
	};
	let now = state.clock.now();

	let decision = state
		.queue
		.lock()
		.await
		.record_failure(&op.id, &reason, retryable, policy, now);
	state.status.lock().await.record_failure();
	state.persist().await;

	match decision {
		Some(RetryDecision::Scheduled {
			retry_count,
			next_attempt_at,
		}) => {
			warn!(
				"Operation {} ({}) failed, retry {} at {}: {}",
				op.id, op.op_type, retry_count, next_attempt_at, reason
			);
			state
				.events
				.dispatch(events::QueueEvent::RetryScheduled {
					id: op.id,
					op_type: op.op_type,
					retry_count,
					next_attempt_at,
					reason,
				})
				.await;
		}
		Some(RetryDecision::Exhausted { retry_count }) => {
			error!(
				"[PROCESS_OPERATION] Operation {} ({}) failed after {} attempts: {}",
				op.id, op.op_type, retry_count, reason
			);
			state
				.platform
				.notify("Sync failed", &format!("{} could not be synchronized", op.op_type));
			state
				.events
				.dispatch(events::QueueEvent::Failed {
					id: op.id,
					op_type: op.op_type,
					retry_count,
					reason,
				})
				.await;
		}
		None => debug!("Operation {} left the queue while executing", op.id),
	}
}
