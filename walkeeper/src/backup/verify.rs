//! Checking a restored directory against its manifest.
//!
//! Every entry is checked and every problem is collected; verification
//! never stops at the first discrepancy. Sizes are always compared, content
//! digests only on request.

use super::manifest::{BackupManifest, ManifestEntry};
use crate::archive::writer::sha256_file;
use crate::utils::errors::{ArchiveError, Result};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discrepancy {
    Missing {
        path: String,
    },
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },
    WrongKind {
        path: String,
        expected: &'static str,
        actual: &'static str,
    },
    TargetMismatch {
        path: String,
        expected: String,
        actual: String,
    },
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },
    /// Content check requested but the backup recorded no digest
    NoChecksum {
        path: String,
    },
    Unreadable {
        path: String,
        error: String,
    },
}

impl Discrepancy {
    pub fn path(&self) -> &str {
        match self {
            Discrepancy::Missing { path }
            | Discrepancy::SizeMismatch { path, .. }
            | Discrepancy::WrongKind { path, .. }
            | Discrepancy::TargetMismatch { path, .. }
            | Discrepancy::ChecksumMismatch { path, .. }
            | Discrepancy::NoChecksum { path }
            | Discrepancy::Unreadable { path, .. } => path,
        }
    }
}

impl fmt::Display for Discrepancy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Discrepancy::Missing { path } => write!(f, "missing: {}", path),
            Discrepancy::SizeMismatch {
                path,
                expected,
                actual,
            } => write!(
                f,
                "size mismatch: {} (expected {} bytes, found {})",
                path, expected, actual
            ),
            Discrepancy::WrongKind {
                path,
                expected,
                actual,
            } => write!(f, "wrong type: {} (expected {}, found {})", path, expected, actual),
            Discrepancy::TargetMismatch {
                path,
                expected,
                actual,
            } => write!(
                f,
                "symlink target mismatch: {} (expected {}, found {})",
                path, expected, actual
            ),
            Discrepancy::ChecksumMismatch { path, .. } => write!(f, "checksum mismatch: {}", path),
            Discrepancy::NoChecksum { path } => write!(f, "no recorded checksum: {}", path),
            Discrepancy::Unreadable { path, error } => write!(f, "unreadable: {} ({})", path, error),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VerificationReport {
    pub dir: PathBuf,
    pub checked: usize,
    pub discrepancies: Vec<Discrepancy>,
}

impl VerificationReport {
    pub fn is_ok(&self) -> bool {
        self.discrepancies.is_empty()
    }

    pub fn into_result(self) -> Result<Self> {
        if self.is_ok() {
            Ok(self)
        } else {
            Err(ArchiveError::Verification {
                dir: self.dir,
                count: self.discrepancies.len(),
            })
        }
    }
}

fn kind_name(meta: &fs::Metadata) -> &'static str {
    let file_type = meta.file_type();
    if file_type.is_symlink() {
        "symlink"
    } else if file_type.is_dir() {
        "directory"
    } else if file_type.is_file() {
        "regular file"
    } else {
        "special file"
    }
}

fn local_path(dir: &Path, manifest_path: &str) -> PathBuf {
    manifest_path
        .split('/')
        .fold(dir.to_path_buf(), |acc, part| acc.join(part))
}

fn check_entry(dir: &Path, entry: &ManifestEntry, check_content: bool) -> Option<Discrepancy> {
    let path = entry.path().to_string();
    let local = local_path(dir, &path);

    let meta = match fs::symlink_metadata(&local) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Some(Discrepancy::Missing { path }),
        Err(e) => {
            return Some(Discrepancy::Unreadable {
                path,
                error: e.to_string(),
            })
        }
    };

    match entry {
        ManifestEntry::Regular { size, sha256, .. } => {
            if !meta.file_type().is_file() {
                return Some(Discrepancy::WrongKind {
                    path,
                    expected: "regular file",
                    actual: kind_name(&meta),
                });
            }
            if meta.len() != *size {
                return Some(Discrepancy::SizeMismatch {
                    path,
                    expected: *size,
                    actual: meta.len(),
                });
            }
            if !check_content {
                return None;
            }
            let Some(expected) = sha256 else {
                return Some(Discrepancy::NoChecksum { path });
            };
            match sha256_file(&local) {
                Ok(actual) if actual == *expected => None,
                Ok(actual) => Some(Discrepancy::ChecksumMismatch {
                    path,
                    expected: expected.clone(),
                    actual,
                }),
                Err(e) => Some(Discrepancy::Unreadable {
                    path,
                    error: e.to_string(),
                }),
            }
        }
        ManifestEntry::Symlink { target, .. } => {
            if !meta.file_type().is_symlink() {
                return Some(Discrepancy::WrongKind {
                    path,
                    expected: "symlink",
                    actual: kind_name(&meta),
                });
            }
            match fs::read_link(&local) {
                Ok(actual) if actual == Path::new(target) => None,
                Ok(actual) => Some(Discrepancy::TargetMismatch {
                    path,
                    expected: target.clone(),
                    actual: actual.display().to_string(),
                }),
                Err(e) => Some(Discrepancy::Unreadable {
                    path,
                    error: e.to_string(),
                }),
            }
        }
        ManifestEntry::Directory { .. } => (!meta.is_dir()).then(|| Discrepancy::WrongKind {
            path,
            expected: "directory",
            actual: kind_name(&meta),
        }),
    }
}

/// Compare `dir` against `manifest`, collecting every discrepancy.
pub fn verify(dir: &Path, manifest: &BackupManifest, check_content: bool) -> VerificationReport {
    let mut report = VerificationReport {
        dir: dir.to_path_buf(),
        checked: 0,
        discrepancies: Vec::new(),
    };

    for entry in manifest.entries() {
        report.checked += 1;
        if let Some(discrepancy) = check_entry(dir, entry, check_content) {
            report.discrepancies.push(discrepancy);
        }
    }

    tracing::debug!(
        "Verified {} entries in {}: {} discrepancies",
        report.checked,
        dir.display(),
        report.discrepancies.len()
    );
    report
}

/// Verify a directory restored by backup-fetch using the manifest it carries.
pub fn verify_restored(dir: &Path, check_content: bool) -> Result<VerificationReport> {
    let manifest = BackupManifest::read_from_dir(dir)?;
    Ok(verify(dir, &manifest, check_content))
}
