//! Local cache of speculatively downloaded WAL segments.
//!
//! Layout under the state directory:
//!
//! ```text
//! <state_dir>/prefetch/<segment>          ready segments
//! <state_dir>/prefetch/running/<segment>  downloads in progress
//! ```
//!
//! A download is written under `running/` and renamed into place when it is
//! complete, so a file directly under `prefetch/` is always whole. Running
//! files are claimed with `O_EXCL` so two processes never download the same
//! segment at once. The owner touches its running file while the download
//! is in progress; a running file left untouched longer than the stale limit
//! belongs to a dead process and may be reclaimed. Within one process,
//! [`InFlightRegistry`] lets a fetch wait for a download of the same segment.

use crate::fs::durability::sync_directory;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fs::{self, OpenOptions};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tracing::{debug, warn};

const PREFETCH_DIR: &str = "prefetch";
const RUNNING_DIR: &str = "running";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Pending,
    Ready,
    Failed,
}

/// Per-segment completion handles for downloads in flight in this process.
#[derive(Debug, Clone, Default)]
pub struct InFlightRegistry {
    map: Arc<DashMap<PathBuf, watch::Receiver<FetchState>>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a key. `None` means someone else already holds it.
    pub fn register(&self, key: PathBuf) -> Option<InFlightGuard> {
        match self.map.entry(key.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let (tx, rx) = watch::channel(FetchState::Pending);
                slot.insert(rx);
                Some(InFlightGuard {
                    key,
                    map: Arc::clone(&self.map),
                    tx,
                    finished: false,
                })
            }
        }
    }

    /// Completion handle of an in-flight download, if any.
    pub fn waiter(&self, key: &Path) -> Option<watch::Receiver<FetchState>> {
        self.map.get(key).map(|rx| rx.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Held by the task doing a download. Dropping it without calling
/// [`InFlightGuard::complete`] reports failure to every waiter.
#[derive(Debug)]
pub struct InFlightGuard {
    key: PathBuf,
    map: Arc<DashMap<PathBuf, watch::Receiver<FetchState>>>,
    tx: watch::Sender<FetchState>,
    finished: bool,
}

impl InFlightGuard {
    pub fn complete(mut self) {
        self.finished = true;
        self.tx.send_replace(FetchState::Ready);
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.tx.send_replace(FetchState::Failed);
        }
        self.map.remove(&self.key);
    }
}

#[derive(Debug, Clone)]
pub struct PrefetchCache {
    root: PathBuf,
    running: PathBuf,
    stale_after: Duration,
}

impl PrefetchCache {
    pub fn new(state_dir: &Path, stale_after: Duration) -> Self {
        let root = state_dir.join(PREFETCH_DIR);
        let running = root.join(RUNNING_DIR);
        Self {
            root,
            running,
            stale_after,
        }
    }

    pub fn ensure_dirs(&self) -> io::Result<()> {
        fs::create_dir_all(&self.running)
    }

    pub fn ready_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn running_path(&self, name: &str) -> PathBuf {
        self.running.join(name)
    }

    pub fn is_ready(&self, name: &str) -> bool {
        self.ready_path(name).is_file()
    }

    /// Whether another download of `name` is actively writing.
    pub fn running_is_fresh(&self, name: &str) -> bool {
        match fs::metadata(self.running_path(name)).and_then(|m| m.modified()) {
            Ok(modified) => !is_stale(modified, self.stale_after),
            Err(_) => false,
        }
    }

    /// Mark the running file of `name` as still owned.
    pub fn touch_running(&self, name: &str) {
        let touched = OpenOptions::new()
            .write(true)
            .open(self.running_path(name))
            .and_then(|file| file.set_modified(SystemTime::now()));
        if let Err(e) = touched {
            warn!("Failed to refresh running download of {}: {}", name, e);
        }
    }

    /// Create the running file for `name`. Returns `false` when a live
    /// download already owns it; a stale leftover is replaced.
    pub fn claim_running(&self, name: &str) -> io::Result<bool> {
        let path = self.running_path(name);
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(true),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if self.running_is_fresh(name) {
                        return Ok(false);
                    }
                    debug!("Removing stale prefetch download {}", path.display());
                    match fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(false)
    }

    /// Publish a finished download.
    pub fn promote(&self, name: &str) -> io::Result<()> {
        fs::rename(self.running_path(name), self.ready_path(name))?;
        sync_directory(&self.root)
    }

    pub fn discard_running(&self, name: &str) {
        let _ = fs::remove_file(self.running_path(name));
    }

    /// Move a ready segment to `dest`. `None` if the cache does not hold it.
    pub fn take(&self, name: &str, dest: &Path) -> io::Result<Option<u64>> {
        move_into(&self.ready_path(name), dest)
    }

    /// Move a finished download of `name` straight to `dest`, bypassing
    /// the ready area.
    pub fn take_running(&self, name: &str, dest: &Path) -> io::Result<Option<u64>> {
        move_into(&self.running_path(name), dest)
    }

    /// Ready segment names, oldest completion first.
    pub fn entries(&self) -> io::Result<Vec<(String, SystemTime)>> {
        let read_dir = match fs::read_dir(&self.root) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut entries = Vec::new();
        for entry in read_dir {
            let entry = entry?;
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            if !meta.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            entries.push((name, meta.modified()?));
        }
        entries.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(entries)
    }

    /// Drop the oldest ready segments until at most `capacity` remain.
    pub fn evict(&self, capacity: usize) -> io::Result<Vec<String>> {
        let entries = self.entries()?;
        let excess = entries.len().saturating_sub(capacity);
        let mut evicted = Vec::with_capacity(excess);
        for (name, _) in entries.into_iter().take(excess) {
            match fs::remove_file(self.ready_path(&name)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            }
            debug!("Evicted {} from prefetch cache", name);
            evicted.push(name);
        }
        Ok(evicted)
    }
}

/// Drive `download` while touching the running file of `name` often enough
/// that other processes never see it as stale.
pub async fn with_heartbeat<F: Future>(cache: &PrefetchCache, name: &str, download: F) -> F::Output {
    let period = (cache.stale_after / 3).max(Duration::from_millis(10));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    tokio::pin!(download);
    loop {
        tokio::select! {
            output = &mut download => return output,
            _ = ticker.tick() => cache.touch_running(name),
        }
    }
}

fn move_into(src: &Path, dest: &Path) -> io::Result<Option<u64>> {
    let size = match fs::metadata(src) {
        Ok(meta) if meta.is_file() => meta.len(),
        Ok(_) => return Ok(None),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    match fs::rename(src, dest) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(_) => {
            // Cache and destination on different filesystems
            fs::copy(src, dest)?;
            fs::File::open(dest)?.sync_all()?;
            let _ = fs::remove_file(src);
        }
    }

    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        sync_directory(parent)?;
    }
    Ok(Some(size))
}

fn is_stale(modified: SystemTime, stale_after: Duration) -> bool {
    SystemTime::now()
        .duration_since(modified)
        .map(|age| age > stale_after)
        .unwrap_or(false)
}
