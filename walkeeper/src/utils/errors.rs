//! Error types for archiving and restore operations.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Network, timeout or server-side failure that may succeed on retry.
    #[error("Transient storage error: {0}")]
    TransientStorage(String),

    /// Permission or request failure that will not succeed on retry.
    #[error("Storage error: {0}")]
    PermanentStorage(String),

    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    #[error("Backup not found or incomplete: {0}")]
    BackupNotFound(String),

    #[error("Corrupt archive {key}: {reason}")]
    CorruptArchive { key: String, reason: String },

    #[error("WAL segment {segment} is not ready for archiving (no .ready marker)")]
    NotReady { segment: String },

    #[error("Verification of {} failed with {count} discrepancies", dir.display())]
    Verification { dir: PathBuf, count: usize },

    #[error("Refusing to delete without --confirm")]
    ConfirmationRequired,

    #[error("Invalid object name: {0}")]
    InvalidName(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl ArchiveError {
    pub fn corrupt(key: impl Into<String>, reason: impl Into<String>) -> Self {
        ArchiveError::CorruptArchive {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Whether the transfer that produced this error should be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, ArchiveError::TransientStorage(_))
    }

    /// Process exit status for a command that failed with this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            ArchiveError::ConfirmationRequired
            | ArchiveError::Config(_)
            | ArchiveError::InvalidName(_) => 2,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, ArchiveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_errors_retry() {
        assert!(ArchiveError::TransientStorage("503".into()).is_transient());
        assert!(!ArchiveError::PermanentStorage("403".into()).is_transient());
        assert!(!ArchiveError::ObjectNotFound("wal/x".into()).is_transient());
        assert!(!ArchiveError::corrupt("k", "short read").is_transient());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ArchiveError::ObjectNotFound("wal/x".into()).exit_code(), 1);
        assert_eq!(
            ArchiveError::NotReady { segment: "x".into() }.exit_code(),
            1
        );
        assert_eq!(ArchiveError::ConfirmationRequired.exit_code(), 2);
        assert_eq!(ArchiveError::Config("missing".into()).exit_code(), 2);
    }
}
