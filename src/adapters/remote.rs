//! Remote shared store contract and an in-memory implementation.
//!
//! Documents are JSON objects addressed by a collection path and an id. The
//! sync core needs create/read/update/delete, filtered queries, batched writes
//! and a live change feed; nothing else about the backing store is assumed.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};

use futures_util::Stream;
use serde_json::Value;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, warn};

use crate::error::RemoteError;

pub type Document = Value;

/// Path of a per-account collection, e.g. `users/{user_id}/subscriptions`.
pub fn user_collection(user_id: &str, collection: &str) -> String {
	format!("users/{}/{}", user_id, collection)
}

pub type ChangeStream = Pin<Box<dyn Stream<Item = Result<RemoteChange, RemoteError>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
	Added,
	Modified,
	Removed,
}

/// A change notification delivered by `RemoteStore::subscribe`.
#[derive(Debug, Clone)]
pub struct RemoteChange {
	pub path: String,
	pub id: String,
	pub kind: ChangeKind,
	pub document: Option<Document>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
	Eq,
	Ne,
	Gt,
	Gte,
	Lt,
}

#[derive(Debug, Clone)]
pub struct Condition {
	pub field: String,
	pub op: FilterOp,
	pub value: Value,
}

/// Filtered collection query.
#[derive(Debug, Clone, Default)]
pub struct Query {
	pub conditions: Vec<Condition>,
	pub order_by: Option<String>,
	pub limit: Option<usize>,
}

impl Query {
	pub fn all() -> Self {
		Self::default()
	}

	pub fn filter(mut self, field: &str, op: FilterOp, value: impl Into<Value>) -> Self {
		self.conditions.push(Condition {
			field: field.to_string(),
			op,
			value: value.into(),
		});
		self
	}

	pub fn order_by(mut self, field: &str) -> Self {
		self.order_by = Some(field.to_string());
		self
	}

	pub fn limit(mut self, limit: usize) -> Self {
		self.limit = Some(limit);
		self
	}

	pub fn matches(&self, document: &Document) -> bool {
		self.conditions.iter().all(|condition| {
			let Some(field) = document.get(&condition.field) else {
				return condition.op == FilterOp::Ne;
			};
			let ordering = compare_values(field, &condition.value);
			match condition.op {
				FilterOp::Eq => field == &condition.value,
				FilterOp::Ne => field != &condition.value,
				FilterOp::Gt => ordering == Some(Ordering::Greater),
				FilterOp::Gte => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
				FilterOp::Lt => ordering == Some(Ordering::Less),
			}
		})
	}
}

/// Order numbers numerically and strings lexically; other pairs are unordered.
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
	match (a, b) {
		(Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
		(Value::String(x), Value::String(y)) => Some(x.cmp(y)),
		(Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
		_ => None,
	}
}

/// One write inside an atomic batch.
#[derive(Debug, Clone)]
pub enum BatchWrite {
	Set {
		path: String,
		id: String,
		document: Document,
	},
	Update {
		path: String,
		id: String,
		document: Document,
	},
	Delete {
		path: String,
		id: String,
	},
}

/// Remote shared store used by every device of an account.
#[async_trait::async_trait]
pub trait RemoteStore: Send + Sync {
	/// Write a document, replacing any existing one with the same id.
	async fn create(&self, path: &str, id: &str, document: Document) -> Result<(), RemoteError>;

	async fn read(&self, path: &str, id: &str) -> Result<Option<Document>, RemoteError>;

	/// Merge top-level fields into a document, creating it if absent.
	async fn update(&self, path: &str, id: &str, document: Document) -> Result<(), RemoteError>;

	/// Delete a document. Deleting a missing document succeeds.
	async fn delete(&self, path: &str, id: &str) -> Result<(), RemoteError>;

	async fn query(&self, path: &str, query: &Query) -> Result<Vec<(String, Document)>, RemoteError>;

	/// Apply every write or none of them.
	async fn batch_write(&self, writes: Vec<BatchWrite>) -> Result<(), RemoteError>;

	/// Live feed of changes to documents under `path`, in commit order.
	async fn subscribe(&self, path: &str) -> Result<ChangeStream, RemoteError>;
}

/// In-memory RemoteStore with injectable failures.
///
/// Several services can share one instance (behind an `Arc`) to simulate
/// devices talking to the same backend.
#[derive(Debug)]
pub struct MemoryRemoteStore {
	collections: Mutex<HashMap<String, BTreeMap<String, Document>>>,
	changes: broadcast::Sender<RemoteChange>,
	reachable: AtomicBool,
	failing_requests: AtomicUsize,
}

impl Default for MemoryRemoteStore {
	fn default() -> Self {
		let (changes, _) = broadcast::channel(1024);
		Self {
			collections: Mutex::new(HashMap::new()),
			changes,
			reachable: AtomicBool::new(true),
			failing_requests: AtomicUsize::new(0),
		}
	}
}

impl MemoryRemoteStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// While unreachable every request fails with `RemoteError::Unavailable`.
	pub fn set_reachable(&self, reachable: bool) {
		self.reachable.store(reachable, AtomicOrdering::SeqCst);
	}

	/// Fail the next `count` requests with a transient error.
	pub fn fail_next(&self, count: usize) {
		self.failing_requests.store(count, AtomicOrdering::SeqCst);
	}

	/// Snapshot of a collection, for inspection.
	pub async fn documents(&self, path: &str) -> BTreeMap<String, Document> {
		self.collections
			.lock()
			.await
			.get(path)
			.cloned()
			.unwrap_or_default()
	}

	fn check(&self) -> Result<(), RemoteError> {
		if !self.reachable.load(AtomicOrdering::SeqCst) {
			return Err(RemoteError::Unavailable("remote store unreachable".to_string()));
		}
		let injected = self
			.failing_requests
			.fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |n| {
				n.checked_sub(1)
			})
			.is_ok();
		if injected {
			return Err(RemoteError::Unavailable("injected failure".to_string()));
		}
		Ok(())
	}

	fn notify(&self, change: RemoteChange) {
		// No receivers is fine
		let _ = self.changes.send(change);
	}

	fn apply(
		collections: &mut HashMap<String, BTreeMap<String, Document>>,
		write: BatchWrite,
	) -> Result<Option<RemoteChange>, RemoteError> {
		match write {
			BatchWrite::Set { path, id, document } => {
				if !document.is_object() {
					return Err(RemoteError::Rejected(format!(
						"document {}/{} is not an object",
						path, id
					)));
				}
				let collection = collections.entry(path.clone()).or_default();
				let kind = if collection.contains_key(&id) {
					ChangeKind::Modified
				} else {
					ChangeKind::Added
				};
				collection.insert(id.clone(), document.clone());
				Ok(Some(RemoteChange {
					path,
					id,
					kind,
					document: Some(document),
				}))
			}
			BatchWrite::Update { path, id, document } => {
				let Value::Object(fields) = document else {
					return Err(RemoteError::Rejected(format!(
						"update for {}/{} is not an object",
						path, id
					)));
				};
				let collection = collections.entry(path.clone()).or_default();
				let kind = if collection.contains_key(&id) {
					ChangeKind::Modified
				} else {
					ChangeKind::Added
				};
				let entry = collection
					.entry(id.clone())
					.or_insert_with(|| Value::Object(serde_json::Map::new()));
				if let Value::Object(existing) = entry {
					existing.extend(fields);
				}
				Ok(Some(RemoteChange {
					path,
					id,
					kind,
					document: Some(entry.clone()),
				}))
			}
			BatchWrite::Delete { path, id } => {
				let removed = collections
					.get_mut(&path)
					.and_then(|collection| collection.remove(&id));
				Ok(removed.map(|_| RemoteChange {
					path,
					id,
					kind: ChangeKind::Removed,
					document: None,
				}))
			}
		}
	}

	async fn write_one(&self, write: BatchWrite) -> Result<(), RemoteError> {
		self.check()?;
		let change = {
			let mut collections = self.collections.lock().await;
			Self::apply(&mut collections, write)?
		};
		if let Some(change) = change {
			self.notify(change);
		}
		Ok(())
	}
}

#[async_trait::async_trait]
impl RemoteStore for MemoryRemoteStore {
	async fn create(&self, path: &str, id: &str, document: Document) -> Result<(), RemoteError> {
		self.write_one(BatchWrite::Set {
			path: path.to_string(),
			id: id.to_string(),
			document,
		})
		.await
	}

	async fn read(&self, path: &str, id: &str) -> Result<Option<Document>, RemoteError> {
		self.check()?;
		Ok(self
			.collections
			.lock()
			.await
			.get(path)
			.and_then(|collection| collection.get(id))
			.cloned())
	}

	async fn update(&self, path: &str, id: &str, document: Document) -> Result<(), RemoteError> {
		self.write_one(BatchWrite::Update {
			path: path.to_string(),
			id: id.to_string(),
			document,
		})
		.await
	}

	async fn delete(&self, path: &str, id: &str) -> Result<(), RemoteError> {
		self.write_one(BatchWrite::Delete {
			path: path.to_string(),
			id: id.to_string(),
		})
		.await
	}

	async fn query(&self, path: &str, query: &Query) -> Result<Vec<(String, Document)>, RemoteError> {
		self.check()?;
		let collections = self.collections.lock().await;
		let Some(collection) = collections.get(path) else {
			return Ok(Vec::new());
		};

		let mut results: Vec<(String, Document)> = collection
			.iter()
			.filter(|(_, document)| query.matches(document))
			.map(|(id, document)| (id.clone(), document.clone()))
			.collect();

		if let Some(field) = &query.order_by {
			results.sort_by(|(_, a), (_, b)| {
				match (a.get(field), b.get(field)) {
					(Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
					(Some(_), None) => Ordering::Less,
					(None, Some(_)) => Ordering::Greater,
					(None, None) => Ordering::Equal,
				}
			});
		}
		if let Some(limit) = query.limit {
			results.truncate(limit);
		}

		Ok(results)
	}

	async fn batch_write(&self, writes: Vec<BatchWrite>) -> Result<(), RemoteError> {
		self.check()?;
		let changes = {
			let mut collections = self.collections.lock().await;
			// Apply against a scratch copy so a rejected write leaves nothing behind
			let mut scratch = collections.clone();
			let mut changes = Vec::with_capacity(writes.len());
			for write in writes {
				if let Some(change) = Self::apply(&mut scratch, write)? {
					changes.push(change);
				}
			}
			*collections = scratch;
			changes
		};
		debug!("Committed batch of {} changes", changes.len());
		for change in changes {
			self.notify(change);
		}
		Ok(())
	}

	async fn subscribe(&self, path: &str) -> Result<ChangeStream, RemoteError> {
		self.check()?;
		let receiver = self.changes.subscribe();
		let path = path.to_string();

		let stream = futures_util::stream::unfold((receiver, path), |(mut receiver, path)| async move {
			loop {
				match receiver.recv().await {
					Ok(change) if change.path == path => {
						return Some((Ok(change), (receiver, path)));
					}
					Ok(_) => continue,
					Err(broadcast::error::RecvError::Lagged(skipped)) => {
						warn!("Subscription to {} lagged by {} changes", path, skipped);
						let err = RemoteError::SubscriptionClosed(format!(
							"lagged by {} changes",
							skipped
						));
						return Some((Err(err), (receiver, path)));
					}
					Err(broadcast::error::RecvError::Closed) => return None,
				}
			}
		});

		Ok(Box::pin(stream))
	}
}
