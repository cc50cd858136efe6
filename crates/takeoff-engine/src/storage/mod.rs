//! Durable run registry
//!
//! The registry is the only shared mutable state between executors, the timeout monitor and the
//! recovery sweep. All access goes through single-record guarded updates.

pub mod codec;
mod registry;
mod sqlite;

pub use registry::{RegistryScan, RunRegistry, ScanFilter, DEFAULT_SCAN_PAGE_SIZE};
pub use sqlite::SqliteRunRegistry;
