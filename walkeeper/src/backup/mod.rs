//! Base backup push and fetch.
//!
//! A push is a two-phase commit: every partition object is uploaded, then
//! the manifest, then the completion marker. A fetch only considers backups
//! whose marker exists and reports success only once every partition has
//! been extracted and fsynced.

pub mod manifest;
pub mod verify;

use crate::config::BackupConfig;
use crate::fs::walker::{classify_tree, total_size, WalkOptions};
use crate::fs::FileSyncer;
use crate::partition::partition_entries;
use crate::transfer::progress::format_bytes;
use crate::transfer::{join_error, TransferEngine};
use crate::utils::errors::{ArchiveError, Result};
use chrono::Utc;
use manifest::{new_backup_id, BackupManifest, CompletionMarker, MANIFEST_FILE_NAME, MANIFEST_VERSION};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

pub use verify::{verify, verify_restored, Discrepancy, VerificationReport};

/// Alias resolved to the most recently completed backup.
pub const LATEST: &str = "LATEST";

pub struct BaseBackups {
    engine: TransferEngine,
    config: BackupConfig,
    state_dir: String,
}

impl BaseBackups {
    pub fn new(engine: TransferEngine, config: BackupConfig, state_dir: &str) -> Self {
        Self {
            engine,
            config,
            state_dir: state_dir.to_string(),
        }
    }

    fn walk_options(&self) -> WalkOptions {
        let mut exclude_names = self.config.exclude_names.clone();
        exclude_names.push(self.state_dir.clone());
        exclude_names.push(MANIFEST_FILE_NAME.to_string());
        WalkOptions {
            exclude_names,
            skip_contents_of: self
                .config
                .skip_contents_of
                .iter()
                .map(PathBuf::from)
                .collect(),
        }
    }

    /// Archive `source` as a new base backup and commit it.
    pub async fn push(&self, source: &Path) -> Result<BackupManifest> {
        let started = Instant::now();
        if !tokio::fs::metadata(source).await?.is_dir() {
            return Err(ArchiveError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a directory", source.display()),
            )));
        }

        let created_at = Utc::now();
        let backup_id = new_backup_id(created_at);

        let root = source.to_path_buf();
        let options = self.walk_options();
        let entries = tokio::task::spawn_blocking(move || classify_tree(&root, &options))
            .await
            .map_err(join_error)??;
        info!(
            "Starting backup {} of {}: {} entries, {}",
            backup_id,
            source.display(),
            entries.len(),
            format_bytes(total_size(&entries))
        );

        let partitions = partition_entries(entries, self.config.partition_budget);
        let partition_count = partitions.len();
        let descriptors = self.engine.upload_partitions(&backup_id, partitions).await?;

        let layout = self.engine.layout();
        let mut manifest = BackupManifest {
            version: MANIFEST_VERSION,
            backup_id: backup_id.clone(),
            created_at,
            partition_budget: self.config.partition_budget,
            codec: self.engine.codec().suffix(),
            partitions: descriptors,
            completed_at: None,
        };
        self.engine
            .put_json(&layout.manifest_key(&backup_id), &manifest)
            .await?;

        // Commit point
        let marker = CompletionMarker {
            backup_id: backup_id.clone(),
            completed_at: Utc::now(),
            partition_count,
        };
        self.engine
            .put_json(&layout.marker_key(&backup_id), &marker)
            .await?;
        manifest.completed_at = Some(marker.completed_at);

        info!(
            "Backup {} complete: {} partitions, {} files, {} in {:.2?}",
            backup_id,
            partition_count,
            manifest.file_count(),
            format_bytes(manifest.total_bytes()),
            started.elapsed()
        );
        Ok(manifest)
    }

    /// Resolve a backup id or [`LATEST`] to a completed backup.
    pub async fn resolve(&self, which: &str) -> Result<BackupManifest> {
        if which == LATEST {
            return self
                .engine
                .list_backups()
                .await?
                .pop()
                .ok_or_else(|| ArchiveError::BackupNotFound("no completed backups".into()));
        }
        if which.is_empty() || which.contains('/') || which.contains("..") {
            return Err(ArchiveError::InvalidName(which.to_string()));
        }
        self.engine.load_completed(which).await
    }

    pub async fn list(&self) -> Result<Vec<BackupManifest>> {
        self.engine.list_backups().await
    }

    /// Restore backup `which` into `dest`.
    pub async fn fetch(
        &self,
        dest: &Path,
        which: &str,
        syncer: Arc<dyn FileSyncer>,
    ) -> Result<BackupManifest> {
        let started = Instant::now();
        let manifest = self.resolve(which).await?;

        let suffix = self.engine.codec().suffix();
        if manifest.codec != suffix {
            return Err(ArchiveError::Config(format!(
                "backup {} was written with codec suffix '{}' but '{}' is configured",
                manifest.backup_id, manifest.codec, suffix
            )));
        }

        info!(
            "Restoring backup {} into {} ({} partitions)",
            manifest.backup_id,
            dest.display(),
            manifest.partitions.len()
        );
        tokio::fs::create_dir_all(dest).await?;
        let extracted = self
            .engine
            .download_partitions(&manifest, dest, syncer)
            .await?;

        let dest_owned = dest.to_path_buf();
        let copy = manifest.clone();
        tokio::task::spawn_blocking(move || copy.write_to_dir(&dest_owned))
            .await
            .map_err(join_error)??;

        let files: usize = extracted.iter().map(|p| p.files.len()).sum();
        let bytes: u64 = extracted.iter().map(|p| p.bytes_written()).sum();
        info!(
            "Restored backup {}: {} files, {} in {:.2?}",
            manifest.backup_id,
            files,
            format_bytes(bytes),
            started.elapsed()
        );
        Ok(manifest)
    }
}
