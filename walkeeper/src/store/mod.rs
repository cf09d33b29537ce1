//! Object storage boundary.
//!
//! The archiver only needs put, get, list and delete. Backends classify their
//! failures into transient (retried) and permanent errors; a missing object
//! is always [`ArchiveError::ObjectNotFound`].

pub mod http;
pub mod layout;
pub mod local;

use crate::utils::errors::{ArchiveError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use http::HttpStore;
pub use layout::KeyLayout;
pub use local::LocalStore;

/// Trait for object storage backends
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload a local file as one object; the object appears only once the
    /// whole body has been accepted.
    async fn put_file(&self, key: &str, src: &Path) -> Result<()>;

    async fn put_bytes(&self, key: &str, data: Bytes) -> Result<()>;

    /// Download an object into a local file, returning its size.
    async fn get_to_file(&self, key: &str, dest: &Path) -> Result<u64>;

    async fn get_bytes(&self, key: &str) -> Result<Bytes>;

    /// Keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Delete a key. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Open the backend named by a store URL.
pub fn open_store(url: &str) -> Result<Arc<dyn ObjectStore>> {
    if url.starts_with("http://") || url.starts_with("https://") {
        return Ok(Arc::new(HttpStore::new(url)?));
    }

    let path = url.strip_prefix("file://").unwrap_or(url);
    if path.is_empty() {
        return Err(ArchiveError::Config(format!("invalid store url '{}'", url)));
    }
    Ok(Arc::new(LocalStore::new(PathBuf::from(path))?))
}

/// Reject keys that could escape a backend's namespace.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\0')
        || key.contains('\\')
        || key.split('/').any(|part| part.is_empty() || part == "." || part == "..");
    if bad {
        return Err(ArchiveError::InvalidName(key.to_string()));
    }
    Ok(())
}
