//! Multi-device propagation: device registry, sync event bus and conflict
//! resolution.

pub mod bus;
pub mod conflict;
pub mod devices;
pub mod events;

pub use bus::{CursorBook, Delivery, DeviceCursor, SyncBus};
pub use conflict::{
    ConflictHandler, ConflictResolver, ConflictSide, ConflictSnapshot, LastWriteWins, Resolution,
    SyncConflict,
};
pub use devices::{DeviceInfo, DeviceRegistry};
pub use events::{MutationKind, SyncEvent};
