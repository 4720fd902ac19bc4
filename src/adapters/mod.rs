//! Collaborators the sync core talks to, with in-memory implementations
//! that double as test fixtures.

pub mod clock;
pub mod connectivity;
pub mod durable;
pub mod entities;
pub mod platform;
pub mod remote;
pub mod telemetry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use connectivity::Connectivity;
pub use durable::{DurableStore, FileDurableStore, MemoryDurableStore};
pub use entities::{EntityRecord, EntityStore, MemoryEntityStore};
pub use platform::{NoopBridge, PlatformBridge};
pub use remote::{
	BatchWrite, ChangeKind, ChangeStream, Document, FilterOp, MemoryRemoteStore, Query,
	RemoteChange, RemoteStore, user_collection,
};
pub use telemetry::{NoopTelemetry, TelemetrySink, TracingTelemetry};
