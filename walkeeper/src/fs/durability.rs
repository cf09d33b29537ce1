//! Crash durability for restored files.
//!
//! Extracted regular files are fsynced first, then every directory that
//! contains one, so a completed restore survives a crash that happens right
//! after it is reported. Symlinks are never passed in and never synced.

use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Makes a set of freshly written regular files durable.
pub trait FileSyncer: Send + Sync {
    fn fsync_paths(&self, paths: &[PathBuf]) -> std::io::Result<()>;
}

/// Syncs with `fsync(2)` on the files and their parent directories.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsyncEnforcer;

impl FileSyncer for FsyncEnforcer {
    fn fsync_paths(&self, paths: &[PathBuf]) -> std::io::Result<()> {
        let mut parents = BTreeSet::new();

        for path in paths {
            open_for_sync(path)?.sync_all()?;
            if let Some(parent) = path.parent() {
                parents.insert(parent.to_path_buf());
            }
        }

        for dir in &parents {
            sync_directory(dir)?;
        }

        tracing::debug!(
            "fsynced {} files in {} directories",
            paths.len(),
            parents.len()
        );
        Ok(())
    }
}

/// Open a restored file for fsync. The archived mode may deny the owner
/// read access, so it is lifted for the open and put back afterwards.
#[cfg(unix)]
fn open_for_sync(path: &Path) -> std::io::Result<File> {
    use std::os::unix::fs::PermissionsExt;

    match File::open(path) {
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            let original = std::fs::metadata(path)?.permissions();
            let mode = original.mode();
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode | 0o400))?;
            let opened = File::open(path);
            std::fs::set_permissions(path, original)?;
            opened
        }
        other => other,
    }
}

#[cfg(not(unix))]
fn open_for_sync(path: &Path) -> std::io::Result<File> {
    File::open(path)
}

/// Fsync a directory so entries created or renamed in it are durable.
#[cfg(unix)]
pub fn sync_directory(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
pub fn sync_directory(_dir: &Path) -> std::io::Result<()> {
    // NTFS journals directory metadata; there is no directory fsync
    Ok(())
}
