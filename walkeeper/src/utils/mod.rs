//! Utility modules shared by every command.

pub mod errors;
pub mod logger;
pub mod shutdown;

pub use errors::{ArchiveError, Result};
