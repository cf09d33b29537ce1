//! Directory traversal and entry classification.
//!
//! Walks a source tree without following symlinks and produces an immutable,
//! path-sorted snapshot of its regular files, symlinks and directories.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Entry names skipped wherever they appear
    pub exclude_names: Vec<String>,

    /// Directories (relative to the root) kept as empty markers; their
    /// contents are not walked
    pub skip_contents_of: Vec<PathBuf>,
}

/// What a classified entry is, with the data needed to recreate it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EntryKind {
    Regular { size: u64, mode: u32 },
    Symlink { target: PathBuf },
    Directory { mode: u32 },
}

/// One entry of the source tree at classification time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Full path on the local filesystem
    pub path: PathBuf,

    /// Path relative to the walked root
    pub relative_path: PathBuf,

    pub kind: EntryKind,
}

impl FileEntry {
    /// Bytes of archive content this entry contributes.
    pub fn size_bytes(&self) -> u64 {
        match self.kind {
            EntryKind::Regular { size, .. } => size,
            EntryKind::Symlink { .. } | EntryKind::Directory { .. } => 0,
        }
    }

    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Option<Self>> {
        let path = entry.path().to_path_buf();
        let relative_path = match path.strip_prefix(root) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel.to_path_buf(),
            _ => return Ok(None),
        };

        let file_type = entry.file_type();
        let kind = if file_type.is_symlink() {
            EntryKind::Symlink {
                target: std::fs::read_link(&path)?,
            }
        } else if file_type.is_dir() {
            let metadata = entry.metadata()?;
            EntryKind::Directory {
                mode: mode_of(&metadata),
            }
        } else if file_type.is_file() {
            let metadata = entry.metadata()?;
            EntryKind::Regular {
                size: metadata.len(),
                mode: mode_of(&metadata),
            }
        } else {
            // Sockets, fifos and device nodes have no archivable content
            return Ok(None);
        };

        Ok(Some(Self {
            path,
            relative_path,
            kind,
        }))
    }
}

#[cfg(unix)]
fn mode_of(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(metadata: &std::fs::Metadata) -> u32 {
    if metadata.is_dir() {
        0o755
    } else {
        0o644
    }
}

/// Walk a directory tree and classify every entry below `root`.
///
/// The result is sorted by relative path so that partitioning a fixed
/// snapshot is deterministic. Parents always sort before their children.
///
/// # Example
/// ```no_run
/// use walkeeper::fs::walker::{classify_tree, WalkOptions};
/// use std::path::Path;
///
/// let entries = classify_tree(Path::new("/var/lib/postgresql/data"), &WalkOptions::default()).unwrap();
/// println!("Found {} entries", entries.len());
/// ```
pub fn classify_tree(root: &Path, options: &WalkOptions) -> std::io::Result<Vec<FileEntry>> {
    let mut entries = Vec::new();

    let walker = WalkDir::new(root).follow_links(false).into_iter();
    // Pruned here so excluded directories are never descended into
    let walker = walker.filter_entry(|entry| {
        !should_exclude(entry, &options.exclude_names) && !in_skipped_contents(entry, root, options)
    });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if is_vanished(&e) => {
                // Files come and go under a running database
                tracing::debug!("Entry vanished during walk: {}", e);
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        match FileEntry::from_entry(&entry, root) {
            Ok(Some(file_entry)) => entries.push(file_entry),
            Ok(None) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("Entry vanished during walk: {}", entry.path().display());
            }
            Err(e) => return Err(e),
        }
    }

    entries.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(entries)
}

/// Total content bytes of a classified tree
pub fn total_size(entries: &[FileEntry]) -> u64 {
    entries.iter().map(FileEntry::size_bytes).sum()
}

fn is_vanished(error: &walkdir::Error) -> bool {
    error
        .io_error()
        .map(|e| e.kind() == std::io::ErrorKind::NotFound)
        .unwrap_or(false)
}

/// True for entries whose parent directory is in `skip_contents_of`.
fn in_skipped_contents(entry: &DirEntry, root: &Path, options: &WalkOptions) -> bool {
    let Some(parent) = entry.path().parent() else {
        return false;
    };
    let Ok(parent_rel) = parent.strip_prefix(root) else {
        return false;
    };
    options.skip_contents_of.iter().any(|dir| dir == parent_rel)
}

/// Check if a directory entry should be excluded based on its name
fn should_exclude(entry: &DirEntry, names: &[String]) -> bool {
    if entry.depth() == 0 {
        return false;
    }
    let file_name = entry.file_name().to_string_lossy();
    names.iter().any(|name| file_name == name.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_walk_empty_directory() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let entries = classify_tree(temp_dir.path(), &WalkOptions::default())?;
        assert!(entries.is_empty());
        Ok(())
    }

    #[test]
    fn test_classifies_all_three_kinds() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir(temp_dir.path().join("subdir"))?;
        fs::write(temp_dir.path().join("subdir/file.txt"), b"content1")?;
        #[cfg(unix)]
        std::os::unix::fs::symlink("subdir/file.txt", temp_dir.path().join("link"))?;

        let entries = classify_tree(temp_dir.path(), &WalkOptions::default())?;
        let names: Vec<_> = entries
            .iter()
            .map(|e| e.relative_path.to_string_lossy().to_string())
            .collect();

        #[cfg(unix)]
        assert_eq!(names, vec!["link", "subdir", "subdir/file.txt"]);

        let file = entries
            .iter()
            .find(|e| e.relative_path == Path::new("subdir/file.txt"))
            .unwrap();
        assert!(matches!(file.kind, EntryKind::Regular { size: 8, .. }));

        let dir = entries
            .iter()
            .find(|e| e.relative_path == Path::new("subdir"))
            .unwrap();
        assert!(matches!(dir.kind, EntryKind::Directory { .. }));

        #[cfg(unix)]
        {
            let link = entries
                .iter()
                .find(|e| e.relative_path == Path::new("link"))
                .unwrap();
            assert_eq!(
                link.kind,
                EntryKind::Symlink {
                    target: PathBuf::from("subdir/file.txt")
                }
            );
            assert_eq!(link.size_bytes(), 0);
        }

        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_symlink_to_directory_not_followed() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir(temp_dir.path().join("real"))?;
        fs::write(temp_dir.path().join("real/inner"), b"x")?;
        std::os::unix::fs::symlink("real", temp_dir.path().join("alias"))?;

        let entries = classify_tree(temp_dir.path(), &WalkOptions::default())?;
        assert!(!entries
            .iter()
            .any(|e| e.relative_path == Path::new("alias/inner")));
        let alias = entries
            .iter()
            .find(|e| e.relative_path == Path::new("alias"))
            .unwrap();
        assert!(matches!(alias.kind, EntryKind::Symlink { .. }));
        Ok(())
    }

    #[test]
    fn test_sorted_by_relative_path() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        for name in ["c", "a", "b"] {
            fs::write(temp_dir.path().join(name), name)?;
        }

        let entries = classify_tree(temp_dir.path(), &WalkOptions::default())?;
        let names: Vec<_> = entries.iter().map(|e| e.relative_path.clone()).collect();
        assert_eq!(
            names,
            vec![PathBuf::from("a"), PathBuf::from("b"), PathBuf::from("c")]
        );
        Ok(())
    }

    #[test]
    fn test_calculate_total_size() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("file1.txt"), b"12345")?; // 5 bytes
        fs::write(temp_dir.path().join("file2.txt"), b"1234567")?; // 7 bytes
        fs::create_dir(temp_dir.path().join("empty"))?;

        let entries = classify_tree(temp_dir.path(), &WalkOptions::default())?;
        assert_eq!(total_size(&entries), 12);
        Ok(())
    }

    #[test]
    fn test_exclude_names_and_skip_contents() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("postmaster.pid"), b"1234")?;
        fs::write(temp_dir.path().join("PG_VERSION"), b"16")?;
        fs::create_dir(temp_dir.path().join("pg_wal"))?;
        fs::write(
            temp_dir.path().join("pg_wal/000000010000000000000001"),
            b"segment",
        )?;

        let options = WalkOptions {
            exclude_names: vec!["postmaster.pid".to_string()],
            skip_contents_of: vec![PathBuf::from("pg_wal")],
        };
        let entries = classify_tree(temp_dir.path(), &options)?;
        let names: Vec<_> = entries.iter().map(|e| e.relative_path.clone()).collect();
        assert_eq!(
            names,
            vec![PathBuf::from("PG_VERSION"), PathBuf::from("pg_wal")]
        );
        Ok(())
    }

    #[test]
    fn test_excluded_directory_is_pruned() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir_all(temp_dir.path().join(".walkeeper/prefetch/running"))?;
        fs::write(
            temp_dir.path().join(".walkeeper/prefetch/000000010000000000000001"),
            b"cached",
        )?;
        fs::create_dir(temp_dir.path().join("base"))?;
        fs::create_dir(temp_dir.path().join("base/.walkeeper"))?;
        fs::write(temp_dir.path().join("base/.walkeeper/x"), b"nested")?;
        fs::write(temp_dir.path().join("base/1"), b"data")?;

        let options = WalkOptions {
            exclude_names: vec![".walkeeper".to_string()],
            skip_contents_of: Vec::new(),
        };
        let entries = classify_tree(temp_dir.path(), &options)?;
        let names: Vec<_> = entries.iter().map(|e| e.relative_path.clone()).collect();
        assert_eq!(names, vec![PathBuf::from("base"), PathBuf::from("base/1")]);
        Ok(())
    }
}
