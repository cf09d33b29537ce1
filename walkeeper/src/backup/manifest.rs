//! Backup manifest and completion marker.
//!
//! The manifest lists every partition of a base backup with its member
//! entries. It is uploaded after all partitions, and a separate completion
//! marker object is uploaded after the manifest. Without the marker the
//! backup does not exist as far as listing and restore are concerned.

use crate::fs::durability::sync_directory;
use crate::utils::errors::{ArchiveError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Component, Path};

/// Manifest copy written into every restored directory.
pub const MANIFEST_FILE_NAME: &str = ".backup-manifest.json";

pub const MANIFEST_VERSION: u32 = 1;

/// One archived entry. Paths are relative and `/`-separated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ManifestEntry {
    Regular {
        path: String,
        size: u64,
        mode: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sha256: Option<String>,
    },
    Symlink {
        path: String,
        target: String,
    },
    Directory {
        path: String,
        mode: u32,
    },
}

impl ManifestEntry {
    pub fn path(&self) -> &str {
        match self {
            ManifestEntry::Regular { path, .. }
            | ManifestEntry::Symlink { path, .. }
            | ManifestEntry::Directory { path, .. } => path,
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            ManifestEntry::Regular { size, .. } => *size,
            _ => 0,
        }
    }
}

/// Where one partition lives and what it holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionDescriptor {
    pub index: u32,
    pub key: String,
    pub total_bytes: u64,
    pub entries: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub version: u32,
    pub backup_id: String,
    pub created_at: DateTime<Utc>,
    pub partition_budget: u64,
    /// Object suffix of the transform chain the partitions were written with
    pub codec: String,
    pub partitions: Vec<PartitionDescriptor>,
    /// Set from the completion marker; `None` means incomplete
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Terminal object whose presence makes a backup restorable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionMarker {
    pub backup_id: String,
    pub completed_at: DateTime<Utc>,
    pub partition_count: usize,
}

impl BackupManifest {
    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn entries(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.partitions.iter().flat_map(|p| p.entries.iter())
    }

    pub fn file_count(&self) -> usize {
        self.entries()
            .filter(|e| matches!(e, ManifestEntry::Regular { .. }))
            .count()
    }

    pub fn total_bytes(&self) -> u64 {
        self.partitions.iter().map(|p| p.total_bytes).sum()
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        let manifest: BackupManifest = serde_json::from_slice(data)?;
        if manifest.version > MANIFEST_VERSION {
            return Err(ArchiveError::Config(format!(
                "manifest version {} is newer than supported version {}",
                manifest.version, MANIFEST_VERSION
            )));
        }
        Ok(manifest)
    }

    /// Read the manifest copy left in a restored directory.
    pub fn read_from_dir(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE_NAME);
        let data = std::fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ArchiveError::BackupNotFound(format!("{} has no manifest", dir.display()))
            } else {
                ArchiveError::Io(e)
            }
        })?;
        Self::from_json(&data)
    }

    /// Durably write the manifest copy into a restored directory.
    pub fn write_to_dir(&self, dir: &Path) -> Result<()> {
        let data = self.to_json()?;
        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        temp.write_all(&data)?;
        temp.as_file().sync_all()?;
        temp.persist(dir.join(MANIFEST_FILE_NAME))
            .map_err(|e| ArchiveError::Io(e.error))?;
        sync_directory(dir)?;
        Ok(())
    }
}

/// New, time-sortable backup identifier.
pub fn new_backup_id(now: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("base_{}_{}", now.format("%Y%m%dT%H%M%S%.3fZ"), &suffix[..8])
}

/// Relative path as a `/`-separated manifest/tar path.
pub fn manifest_path(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
