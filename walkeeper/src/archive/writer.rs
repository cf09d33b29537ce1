//! Streaming a partition into a tar archive.
//!
//! The source tree belongs to a running database and may change while it is
//! being read. Each regular file is archived at the size it had when it was
//! classified: a file that shrank is zero-padded, a file that grew is cut
//! off, and a file that disappeared is left out of the archive.

use crate::backup::manifest::{manifest_path, ManifestEntry};
use crate::fs::walker::{EntryKind, FileEntry};
use crate::partition::Partition;
use crate::utils::errors::Result;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use tar::{Builder, EntryType, Header};
use tracing::warn;

/// What actually went into one partition archive.
#[derive(Debug, Clone, Default)]
pub struct ArchivedPartition {
    pub entries: Vec<ManifestEntry>,
    pub total_bytes: u64,
    /// Regular files that disappeared before they could be read
    pub vanished: Vec<PathBuf>,
}

/// Reads exactly `remaining` bytes from a file, padding with zeros if the
/// file ends early, and optionally hashes what it hands out.
struct SnapshotReader {
    file: File,
    remaining: u64,
    padded: u64,
    hasher: Option<Sha256>,
}

impl SnapshotReader {
    fn new(file: File, size: u64, hash: bool) -> Self {
        Self {
            file,
            remaining: size,
            padded: 0,
            hasher: hash.then(Sha256::new),
        }
    }

    fn digest(self) -> Option<String> {
        self.hasher.map(|h| hex::encode(h.finalize()))
    }
}

impl Read for SnapshotReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let max = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);

        let n = match self.file.read(&mut buf[..max])? {
            0 => {
                buf[..max].fill(0);
                self.padded += max as u64;
                max
            }
            n => n,
        };

        self.remaining -= n as u64;
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(&buf[..n]);
        }
        Ok(n)
    }
}

fn mtime_of(metadata: &std::fs::Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn base_header(kind: EntryType, mode: u32, mtime: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(kind);
    header.set_size(0);
    header.set_mode(mode);
    header.set_mtime(mtime);
    header
}

/// Write one partition as a tar stream into `sink`.
pub fn write_partition<W: Write>(
    partition: &Partition,
    sink: W,
    record_checksums: bool,
) -> Result<(ArchivedPartition, W)> {
    let mut builder = Builder::new(sink);
    builder.follow_symlinks(false);

    let mut archived = ArchivedPartition::default();

    for entry in &partition.entries {
        if let Some(record) = append_entry(&mut builder, entry, record_checksums)? {
            archived.total_bytes += record.size();
            archived.entries.push(record);
        } else {
            archived.vanished.push(entry.relative_path.clone());
        }
    }

    let sink = builder.into_inner()?;
    Ok((archived, sink))
}

/// Append one entry; `None` means the file vanished and was skipped.
fn append_entry<W: Write>(
    builder: &mut Builder<W>,
    entry: &FileEntry,
    record_checksums: bool,
) -> Result<Option<ManifestEntry>> {
    let path = manifest_path(&entry.relative_path);

    match &entry.kind {
        EntryKind::Directory { mode } => {
            let mtime = std::fs::symlink_metadata(&entry.path)
                .map(|m| mtime_of(&m))
                .unwrap_or(0);
            let mut header = base_header(EntryType::Directory, *mode, mtime);
            builder.append_data(&mut header, &path, io::empty())?;
            Ok(Some(ManifestEntry::Directory { path, mode: *mode }))
        }
        EntryKind::Symlink { target } => {
            let mtime = std::fs::symlink_metadata(&entry.path)
                .map(|m| mtime_of(&m))
                .unwrap_or(0);
            let mut header = base_header(EntryType::Symlink, 0o777, mtime);
            builder.append_link(&mut header, &path, target)?;
            Ok(Some(ManifestEntry::Symlink {
                path,
                target: target.to_string_lossy().into_owned(),
            }))
        }
        EntryKind::Regular { size, mode } => {
            let file = match File::open(&entry.path) {
                Ok(file) => file,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!("File vanished before archiving: {}", entry.path.display());
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            };

            let metadata = file.metadata()?;
            if metadata.len() > *size {
                tracing::debug!(
                    "{} grew from {} to {} bytes; archiving the first {}",
                    entry.path.display(),
                    size,
                    metadata.len(),
                    size
                );
            }

            let mut header = base_header(EntryType::Regular, *mode, mtime_of(&metadata));
            header.set_size(*size);

            let mut reader = SnapshotReader::new(file, *size, record_checksums);
            builder.append_data(&mut header, &path, &mut reader)?;

            if reader.padded > 0 {
                warn!(
                    "{} shrank while archiving; zero-padded {} bytes",
                    entry.path.display(),
                    reader.padded
                );
            }

            Ok(Some(ManifestEntry::Regular {
                path,
                size: *size,
                mode: *mode,
                sha256: reader.digest(),
            }))
        }
    }
}

/// SHA-256 of a file's full contents, hex encoded.
pub fn sha256_file(path: &std::path::Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
