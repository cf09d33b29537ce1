//! Extracting a partition archive onto local disk.
//!
//! Every failure to read the stream (bad header, short record, codec error)
//! is reported as a corrupt archive. Failures writing to the destination are
//! plain I/O errors.

use crate::backup::manifest::{manifest_path, ManifestEntry};
use crate::utils::errors::{ArchiveError, Result};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, EntryType};

/// A regular file written during extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedFile {
    pub path: PathBuf,
    pub bytes: u64,
}

/// Everything one partition put on disk.
#[derive(Debug, Clone, Default)]
pub struct ExtractedPartition {
    pub files: Vec<ExtractedFile>,
    pub symlinks: Vec<PathBuf>,
    pub directories: Vec<PathBuf>,
}

impl ExtractedPartition {
    /// Paths of extracted regular files, the set that needs fsync
    pub fn regular_paths(&self) -> Vec<PathBuf> {
        self.files.iter().map(|f| f.path.clone()).collect()
    }

    pub fn bytes_written(&self) -> u64 {
        self.files.iter().map(|f| f.bytes).sum()
    }
}

/// Turn a tar path into a safe relative path, rejecting absolute paths and
/// any `..` component.
fn safe_relative(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    (!out.as_os_str().is_empty()).then_some(out)
}

/// Remove a non-directory entry that is in the way of extraction.
fn clear_existing(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if !meta.is_dir() => fs::remove_file(path),
        _ => Ok(()),
    }
}

fn ensure_parent(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn make_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}

/// Copy a record's content, counting bytes; read errors mean corruption.
fn copy_counted<R: Read>(reader: &mut R, out: &mut File, key: &str) -> Result<u64> {
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ArchiveError::corrupt(key, format!("read failed: {}", e))),
        };
        out.write_all(&buf[..n])?;
        total += n as u64;
    }
    Ok(total)
}

/// Extract a decoded tar stream under `dest`.
///
/// `expected` lists the entries the manifest says this partition holds;
/// any of them missing from the stream means the archive was truncated.
pub fn extract_partition<R: Read>(
    reader: R,
    dest: &Path,
    key: &str,
    expected: &[ManifestEntry],
) -> Result<ExtractedPartition> {
    let corrupt = |e: io::Error| ArchiveError::corrupt(key, e.to_string());

    let mut archive = Archive::new(reader);
    let mut extracted = ExtractedPartition::default();
    let mut seen = HashSet::new();

    for entry in archive.entries().map_err(corrupt)? {
        let mut entry = entry.map_err(corrupt)?;
        let raw_path = entry.path().map_err(corrupt)?.into_owned();
        let relative = safe_relative(&raw_path).ok_or_else(|| {
            ArchiveError::corrupt(key, format!("unsafe path {}", raw_path.display()))
        })?;
        let target = dest.join(&relative);
        let header_size = entry.header().size().map_err(corrupt)?;
        let mode = entry.header().mode().map_err(corrupt)?;

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&target)?;
                // Keep directories writable by the owner so later
                // partitions can populate them
                set_mode(&target, mode | 0o700)?;
                extracted.directories.push(target);
            }
            EntryType::Symlink => {
                let link = entry
                    .link_name()
                    .map_err(corrupt)?
                    .ok_or_else(|| ArchiveError::corrupt(key, "symlink record without target"))?
                    .into_owned();
                ensure_parent(&target)?;
                clear_existing(&target)?;
                make_symlink(&link, &target)?;
                extracted.symlinks.push(target);
            }
            EntryType::Regular | EntryType::Continuous => {
                ensure_parent(&target)?;
                clear_existing(&target)?;
                let mut file = File::create(&target)?;
                let written = copy_counted(&mut entry, &mut file, key)?;
                if written != header_size {
                    return Err(ArchiveError::corrupt(
                        key,
                        format!(
                            "{} declares {} bytes but only {} are present",
                            relative.display(),
                            header_size,
                            written
                        ),
                    ));
                }
                drop(file);
                set_mode(&target, mode)?;
                extracted.files.push(ExtractedFile {
                    path: target,
                    bytes: written,
                });
            }
            other => {
                return Err(ArchiveError::corrupt(
                    key,
                    format!("unexpected record type {:?} for {}", other, relative.display()),
                ));
            }
        }

        seen.insert(manifest_path(&relative));
    }

    if let Some(missing) = expected.iter().find(|e| !seen.contains(e.path())) {
        return Err(ArchiveError::corrupt(
            key,
            format!("archive ends before record {}", missing.path()),
        ));
    }

    Ok(extracted)
}
