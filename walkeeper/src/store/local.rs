//! A local directory used as an object store.
//!
//! Objects are files under the root, keyed by their `/`-separated relative
//! path. Writes go to a hidden temporary sibling that is fsynced and renamed
//! into place, so a reader never sees a partial object.

use super::{validate_key, ObjectStore};
use crate::fs::durability::sync_directory;
use crate::utils::errors::{ArchiveError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const TEMP_MARKER: &str = ".tmp-";

#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

fn map_io(key: &str, e: io::Error) -> ArchiveError {
    match e.kind() {
        io::ErrorKind::NotFound => ArchiveError::ObjectNotFound(key.to_string()),
        io::ErrorKind::PermissionDenied => {
            ArchiveError::PermanentStorage(format!("{}: {}", key, e))
        }
        io::ErrorKind::Interrupted | io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            ArchiveError::TransientStorage(format!("{}: {}", key, e))
        }
        _ => ArchiveError::Io(e),
    }
}

/// Write through a temp sibling and rename into place.
fn write_atomically<F>(path: &Path, fill: F) -> io::Result<()>
where
    F: FnOnce(&mut File) -> io::Result<()>,
{
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "object path has no parent"))?;
    fs::create_dir_all(parent)?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = parent.join(format!(
        ".{}{}{}",
        name,
        TEMP_MARKER,
        uuid::Uuid::new_v4().simple()
    ));

    let result = (|| {
        let mut file = File::create(&temp)?;
        fill(&mut file)?;
        file.sync_all()?;
        fs::rename(&temp, path)?;
        sync_directory(parent)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp);
    }
    result
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ArchiveError::Io(io::Error::new(io::ErrorKind::Other, e)))?
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn put_file(&self, key: &str, src: &Path) -> Result<()> {
        let path = self.object_path(key)?;
        let src = src.to_path_buf();
        let key = key.to_string();
        blocking(move || {
            write_atomically(&path, |out| {
                let mut input = File::open(&src)?;
                io::copy(&mut input, out)?;
                Ok(())
            })
            .map_err(|e| map_io(&key, e))
        })
        .await
    }

    async fn put_bytes(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.object_path(key)?;
        let key = key.to_string();
        blocking(move || {
            write_atomically(&path, |out| out.write_all(&data)).map_err(|e| map_io(&key, e))
        })
        .await
    }

    async fn get_to_file(&self, key: &str, dest: &Path) -> Result<u64> {
        let path = self.object_path(key)?;
        let dest = dest.to_path_buf();
        let key = key.to_string();
        blocking(move || {
            let mut input = File::open(&path).map_err(|e| map_io(&key, e))?;
            let mut out = File::create(&dest)?;
            let copied = io::copy(&mut input, &mut out)?;
            out.sync_all()?;
            Ok(copied)
        })
        .await
    }

    async fn get_bytes(&self, key: &str) -> Result<Bytes> {
        let path = self.object_path(key)?;
        let key = key.to_string();
        blocking(move || {
            fs::read(&path)
                .map(Bytes::from)
                .map_err(|e| map_io(&key, e))
        })
        .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        blocking(move || {
            let mut keys = Vec::new();
            for entry in WalkDir::new(&root).follow_links(false) {
                let entry = match entry {
                    Ok(entry) => entry,
                    // Concurrent deletes remove directories mid-walk
                    Err(e) if e.io_error().map(|e| e.kind()) == Some(io::ErrorKind::NotFound) => {
                        continue
                    }
                    Err(e) => return Err(ArchiveError::Io(e.into())),
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                if entry.file_name().to_string_lossy().contains(TEMP_MARKER) {
                    continue;
                }
                let Ok(relative) = entry.path().strip_prefix(&root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(&prefix) {
                    keys.push(key);
                }
            }
            keys.sort();
            Ok(keys)
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.object_path(key)?;
        let root = self.root.clone();
        let key = key.to_string();
        blocking(move || {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(map_io(&key, e)),
            }
            // Prune now-empty directories up to the root
            let mut dir = path.parent();
            while let Some(d) = dir {
                if d == root || fs::remove_dir(d).is_err() {
                    break;
                }
                dir = d.parent();
            }
            Ok(())
        })
        .await
    }
}
