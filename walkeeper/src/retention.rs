//! Deleting backups and WAL segments from the store.
//!
//! Every operation requires explicit confirmation. Completion markers are
//! deleted before anything else of their backup, so an interrupted delete
//! leaves an incomplete backup (ignored by listing) rather than a complete
//! one with missing partitions.

use crate::store::layout::MARKER_EXT;
use crate::store::KeyLayout;
use crate::transfer::{BackupObjects, TransferEngine};
use crate::utils::errors::{ArchiveError, Result};
use tracing::{info, warn};

/// Which backups a delete command removes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteTarget {
    /// All backups and all WAL segments
    Everything,
    /// Keep the newest N completed backups
    Retain(usize),
    /// Completed backups older than the named one
    Before(String),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeletionReport {
    /// Completed backups removed
    pub backups: Vec<String>,
    /// Ids of incomplete backups whose leftovers were removed
    pub incomplete: Vec<String>,
    pub wal_segments: usize,
    pub objects: usize,
}

pub struct RetentionManager {
    engine: TransferEngine,
}

impl RetentionManager {
    pub fn new(engine: TransferEngine) -> Self {
        Self { engine }
    }

    pub async fn delete(&self, target: &DeleteTarget, confirm: bool) -> Result<DeletionReport> {
        match target {
            DeleteTarget::Everything => self.delete_everything(confirm).await,
            DeleteTarget::Retain(count) => self.retain(*count, confirm).await,
            DeleteTarget::Before(backup_id) => self.delete_before(backup_id, confirm).await,
        }
    }

    /// Remove every backup object and every WAL segment.
    pub async fn delete_everything(&self, confirm: bool) -> Result<DeletionReport> {
        if !confirm {
            return Err(ArchiveError::ConfirmationRequired);
        }

        let layout = self.engine.layout().clone();
        let scanned = self.engine.scan_backups().await?;
        let mut report = DeletionReport::default();
        for (id, objects) in &scanned {
            if objects.has_marker {
                report.backups.push(id.clone());
            } else {
                report.incomplete.push(id.clone());
            }
        }

        let keys = self.engine.list_all().await?;
        let (markers, rest): (Vec<String>, Vec<String>) = keys
            .into_iter()
            .partition(|k| matches!(layout.parse_manifest_key(k), Some((_, MARKER_EXT))));
        let wal_prefix = layout.wal_prefix();
        report.wal_segments = rest.iter().filter(|k| k.starts_with(&wal_prefix)).count();

        report.objects += self.engine.delete_objects(markers).await?;
        report.objects += self.engine.delete_objects(rest).await?;

        info!(
            "Deleted everything: {} backups, {} incomplete backups, {} WAL segments ({} objects)",
            report.backups.len(),
            report.incomplete.len(),
            report.wal_segments,
            report.objects
        );
        Ok(report)
    }

    /// Keep the newest `count` completed backups, delete the older ones.
    pub async fn retain(&self, count: usize, confirm: bool) -> Result<DeletionReport> {
        if !confirm {
            return Err(ArchiveError::ConfirmationRequired);
        }
        if count == 0 {
            return Err(ArchiveError::Config(
                "retain needs at least 1 backup; use 'delete everything' to remove all".into(),
            ));
        }

        let completed: Vec<String> = self
            .engine
            .list_backups()
            .await?
            .into_iter()
            .map(|m| m.backup_id)
            .collect();
        if completed.len() <= count {
            info!("{} completed backups, nothing to delete", completed.len());
            return Ok(DeletionReport::default());
        }

        let split = completed.len() - count;
        let oldest_kept = completed[split].clone();
        self.delete_backups(&completed[..split], &oldest_kept).await
    }

    /// Delete completed backups older than `backup_id`.
    pub async fn delete_before(&self, backup_id: &str, confirm: bool) -> Result<DeletionReport> {
        if !confirm {
            return Err(ArchiveError::ConfirmationRequired);
        }

        let completed: Vec<String> = self
            .engine
            .list_backups()
            .await?
            .into_iter()
            .map(|m| m.backup_id)
            .collect();
        let position = completed
            .iter()
            .position(|id| id == backup_id)
            .ok_or_else(|| ArchiveError::BackupNotFound(backup_id.to_string()))?;

        self.delete_backups(&completed[..position], backup_id).await
    }

    /// Delete `victims` plus incomplete backups created before `oldest_kept`.
    async fn delete_backups(&self, victims: &[String], oldest_kept: &str) -> Result<DeletionReport> {
        let layout = self.engine.layout().clone();
        let scanned = self.engine.scan_backups().await?;
        let mut report = DeletionReport::default();

        let mut markers = Vec::new();
        let mut rest = Vec::new();
        for id in victims {
            if let Some(objects) = scanned.get(id) {
                collect_keys(&layout, id, objects, &mut markers, &mut rest);
            }
            report.backups.push(id.clone());
        }

        // Backup ids sort by creation time
        for (id, objects) in &scanned {
            if !objects.has_marker && id.as_str() < oldest_kept {
                collect_keys(&layout, id, objects, &mut markers, &mut rest);
                report.incomplete.push(id.clone());
            }
        }

        if report.backups.is_empty() && report.incomplete.is_empty() {
            info!("Nothing older than {} to delete", oldest_kept);
            return Ok(report);
        }
        if !report.incomplete.is_empty() {
            warn!(
                "Removing leftovers of {} incomplete backups",
                report.incomplete.len()
            );
        }

        report.objects += self.engine.delete_objects(markers).await?;
        report.objects += self.engine.delete_objects(rest).await?;

        info!(
            "Deleted {} backups older than {} ({} objects)",
            report.backups.len(),
            oldest_kept,
            report.objects
        );
        Ok(report)
    }
}

fn collect_keys(
    layout: &KeyLayout,
    id: &str,
    objects: &BackupObjects,
    markers: &mut Vec<String>,
    rest: &mut Vec<String>,
) {
    if objects.has_marker {
        markers.push(layout.marker_key(id));
    }
    if objects.has_manifest {
        rest.push(layout.manifest_key(id));
    }
    rest.extend(objects.data_keys.iter().cloned());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::manifest::{BackupManifest, CompletionMarker};
    use crate::store::{LocalStore, ObjectStore};
    use crate::transfer::tests::test_engine;
    use bytes::Bytes;
    use chrono::{Duration, TimeZone, Utc};
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn seed_backup(engine: &TransferEngine, id: &str, minute: i64, complete: bool) -> Result<()> {
        let layout = engine.layout().clone();
        let at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(minute);
        let manifest = BackupManifest {
            version: 1,
            backup_id: id.into(),
            created_at: at,
            partition_budget: 1,
            codec: ".zst".into(),
            partitions: Vec::new(),
            completed_at: None,
        };
        engine.put_json(&layout.manifest_key(id), &manifest).await?;
        engine
            .put_json(&layout.partition_key(id, 0, ".zst"), &"data")
            .await?;
        if complete {
            let marker = CompletionMarker {
                backup_id: id.into(),
                completed_at: at,
                partition_count: 1,
            };
            engine.put_json(&layout.marker_key(id), &marker).await?;
        }
        Ok(())
    }

    async fn seeded() -> Result<(TempDir, Arc<LocalStore>, RetentionManager)> {
        let temp_dir = TempDir::new()?;
        let store = Arc::new(LocalStore::new(temp_dir.path().join("bucket"))?);
        let engine = test_engine(store.clone());
        seed_backup(&engine, "base_20260101T000000.000Z_aaaaaaaa", 0, true).await?;
        seed_backup(&engine, "base_20260101T000100.000Z_bbbbbbbb", 1, false).await?;
        seed_backup(&engine, "base_20260101T000200.000Z_cccccccc", 2, true).await?;
        seed_backup(&engine, "base_20260101T000300.000Z_dddddddd", 3, true).await?;
        seed_backup(&engine, "base_20260101T000400.000Z_eeeeeeee", 4, false).await?;
        store
            .put_bytes("wal/000000010000000000000001.zst", Bytes::from_static(b"w"))
            .await?;
        Ok((temp_dir, store, RetentionManager::new(engine)))
    }

    #[tokio::test]
    async fn test_every_form_requires_confirmation() -> Result<()> {
        let (_temp_dir, store, retention) = seeded().await?;
        let before = store.list("").await?;

        for target in [
            DeleteTarget::Everything,
            DeleteTarget::Retain(1),
            DeleteTarget::Before("base_20260101T000300.000Z_dddddddd".into()),
        ] {
            let err = retention.delete(&target, false).await.unwrap_err();
            assert!(matches!(err, ArchiveError::ConfirmationRequired));
        }
        assert_eq!(store.list("").await?, before);
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_everything() -> Result<()> {
        let (_temp_dir, store, retention) = seeded().await?;

        let report = retention.delete_everything(true).await?;
        assert_eq!(report.backups.len(), 3);
        assert_eq!(report.incomplete.len(), 2);
        assert_eq!(report.wal_segments, 1);
        assert!(store.list("").await?.is_empty());
        assert!(retention.engine.list_backups().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_retain_keeps_newest() -> Result<()> {
        let (_temp_dir, store, retention) = seeded().await?;

        let report = retention.retain(2, true).await?;
        assert_eq!(report.backups, vec!["base_20260101T000000.000Z_aaaaaaaa"]);
        // Debris older than the oldest kept backup goes too; newer debris may
        // be a push still in progress
        assert_eq!(report.incomplete, vec!["base_20260101T000100.000Z_bbbbbbbb"]);

        let left: Vec<_> = retention
            .engine
            .list_backups()
            .await?
            .into_iter()
            .map(|m| m.backup_id)
            .collect();
        assert_eq!(
            left,
            vec![
                "base_20260101T000200.000Z_cccccccc",
                "base_20260101T000300.000Z_dddddddd"
            ]
        );
        assert!(!store
            .list("basebackups/data/base_20260101T000400.000Z_eeeeeeee/")
            .await?
            .is_empty());
        assert_eq!(store.list("wal/").await?.len(), 1);

        // Nothing more to do
        assert_eq!(retention.retain(2, true).await?, DeletionReport::default());
        assert!(matches!(
            retention.retain(0, true).await,
            Err(ArchiveError::Config(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_before() -> Result<()> {
        let (_temp_dir, _store, retention) = seeded().await?;

        let report = retention
            .delete_before("base_20260101T000300.000Z_dddddddd", true)
            .await?;
        assert_eq!(
            report.backups,
            vec![
                "base_20260101T000000.000Z_aaaaaaaa",
                "base_20260101T000200.000Z_cccccccc"
            ]
        );
        assert_eq!(report.incomplete.len(), 1);
        assert_eq!(retention.engine.list_backups().await?.len(), 1);

        let err = retention
            .delete_before("base_19990101T000000.000Z_ffffffff", true)
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::BackupNotFound(_)));
        Ok(())
    }
}
