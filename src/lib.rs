//! Keepsake - backup and multi-device sync engine
//!
//! Packages app-defined data snapshots with compression, encryption and
//! integrity checks, moves them through pluggable storage providers, and
//! keeps entity-level changes in step across devices with explicit,
//! durable conflict handling.

pub mod backup;
pub mod codec;
pub mod error;
pub mod kv;
pub mod scheduler;
pub mod service;
pub mod source;
pub mod storage;
pub mod sync;
pub mod types;

pub use backup::{BackupManager, IntegrityVerifier};
pub use error::{KeepsakeError, Result};
pub use service::{KeepsakeService, ServiceOptions};
pub use sync::SyncCoordinator;
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
