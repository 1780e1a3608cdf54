//! Multi-device sync
//!
//! Local mutations are tracked per entity with strictly increasing versions
//! ([`ChangeTracker`]), exchanged between devices as checksummed batches
//! through the active provider ([`transport`]), and reconciled by the
//! [`SyncCoordinator`]. Divergence becomes a durable conflict that stays
//! open until resolved explicitly.

pub mod conflict;
mod coordinator;
mod tracker;
pub mod transport;

pub use conflict::{ConflictResolver, ConflictStore, Disposition, FieldMerge, Resolution};
pub use coordinator::SyncCoordinator;
pub use tracker::{ChangeTracker, LocalChange};
pub use transport::CursorStore;
