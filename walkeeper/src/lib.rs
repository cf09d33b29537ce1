//! walkeeper library
//!
//! Archives a database's WAL segments and base backups to object storage
//! and restores them. Base backups are split into size-bounded tar
//! partitions moved in parallel and committed by a completion marker;
//! WAL segments are pushed and fetched one by one with a local prefetch
//! cache in front of the store.

pub mod archive;
pub mod backup;
pub mod config;
pub mod fs;
pub mod partition;
pub mod retention;
pub mod store;
pub mod transfer;
pub mod utils;
pub mod wal;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::{ArchiveError, Result};
