//! WAL segment push, fetch and prefetch.
//!
//! Segments are opaque blobs stored under their name. Names of real
//! segments are 24 uppercase hex digits (timeline, log id, segment number)
//! so that lexicographic order is chronological order.

pub mod prefetch;

use crate::config::WalConfig;
use crate::fs::durability::sync_directory;
use crate::transfer::TransferEngine;
use crate::utils::errors::{ArchiveError, Result};
use prefetch::{with_heartbeat, FetchState, InFlightRegistry, PrefetchCache};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const SEGMENT_NAME_LEN: usize = 24;
const ARCHIVE_STATUS_DIR: &str = "archive_status";
const READY_SUFFIX: &str = ".ready";

const FOREIGN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Reject names that could escape the key namespace or the cache directory.
pub fn validate_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name == "."
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
        || name.contains('\0');
    if bad {
        return Err(ArchiveError::InvalidName(name.to_string()));
    }
    Ok(())
}

pub fn is_segment_name(name: &str) -> bool {
    name.len() == SEGMENT_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b))
}

/// Name of the segment following `name`, or `None` for non-segment names.
pub fn next_segment(name: &str, segment_size: u64) -> Option<String> {
    if !is_segment_name(name) || segment_size == 0 {
        return None;
    }
    let timeline = u32::from_str_radix(&name[0..8], 16).ok()?;
    let log = u32::from_str_radix(&name[8..16], 16).ok()?;
    let seg = u32::from_str_radix(&name[16..24], 16).ok()?;

    let segments_per_log = 0x1_0000_0000u64 / segment_size;
    let (log, seg) = if u64::from(seg) + 1 >= segments_per_log {
        (log.checked_add(1)?, 0)
    } else {
        (log, seg + 1)
    };
    Some(format!("{:08X}{:08X}{:08X}", timeline, log, seg))
}

/// `from` followed by its successors, `window` names in total.
pub fn segment_window(from: &str, window: usize, segment_size: u64) -> Vec<String> {
    if window == 0 || !is_segment_name(from) {
        return Vec::new();
    }
    let mut names = Vec::with_capacity(window);
    let mut current = Some(from.to_string());
    while let Some(name) = current {
        if names.len() == window {
            break;
        }
        current = next_segment(&name, segment_size);
        names.push(name);
    }
    names
}

/// Whether the database has marked `segment_path` as ready for archiving.
pub fn is_ready(segment_path: &Path, name: &str) -> bool {
    let marker = format!("{}{}", name, READY_SUFFIX);
    let dir = segment_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    dir.join(ARCHIVE_STATUS_DIR).join(&marker).exists() || dir.join(&marker).exists()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
    Cache,
    Store,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOutcome {
    pub source: FetchSource,
    pub bytes: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PrefetchReport {
    pub fetched: usize,
    pub already_cached: usize,
    pub in_flight: usize,
    pub missing: usize,
    pub failed: usize,
    pub evicted: usize,
}

pub struct WalArchiver {
    engine: TransferEngine,
    config: WalConfig,
    inflight: InFlightRegistry,
}

impl WalArchiver {
    pub fn new(engine: TransferEngine, config: WalConfig) -> Self {
        Self {
            engine,
            config,
            inflight: InFlightRegistry::new(),
        }
    }

    /// Cache living beside the WAL directory `base_dir`.
    pub fn cache_for(&self, base_dir: &Path) -> PrefetchCache {
        PrefetchCache::new(
            &base_dir.join(&self.config.state_dir),
            self.config.stale_running_after(),
        )
    }

    pub fn next_segment(&self, name: &str) -> Option<String> {
        next_segment(name, self.config.segment_size)
    }

    /// Upload the segment at `segment_path` under its file name.
    pub async fn push(&self, segment_path: &Path) -> Result<u64> {
        let name = segment_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ArchiveError::InvalidName(segment_path.display().to_string()))?;
        validate_name(name)?;

        if !is_ready(segment_path, name) {
            return Err(ArchiveError::NotReady {
                segment: name.to_string(),
            });
        }

        let started = Instant::now();
        let size = self.engine.upload_wal(name, segment_path).await?;
        info!(
            "Archived WAL segment {} ({} bytes stored) in {:.2?}",
            name,
            size,
            started.elapsed()
        );
        Ok(size)
    }

    /// Restore segment `name` to `dest`, from the prefetch cache when it
    /// holds the segment and from the store otherwise.
    ///
    /// A direct download claims the segment the same way a prefetch does,
    /// so a prefetch started meanwhile (in this process or another) skips
    /// it instead of downloading it a second time.
    pub async fn fetch(&self, name: &str, dest: &Path) -> Result<FetchOutcome> {
        validate_name(name)?;
        let base_dir = parent_dir(dest);
        let cache = self.cache_for(&base_dir);
        let key = cache.ready_path(name);
        let deadline = Instant::now() + self.config.foreign_wait_limit();

        loop {
            if let Some(bytes) = cache.take(name, dest)? {
                debug!("Served {} from prefetch cache", name);
                return Ok(FetchOutcome {
                    source: FetchSource::Cache,
                    bytes,
                });
            }

            if let Some(mut rx) = self.inflight.waiter(&key) {
                debug!("Waiting for in-flight download of {}", name);
                let state = rx
                    .wait_for(|s| *s != FetchState::Pending)
                    .await
                    .map(|s| *s)
                    .unwrap_or(FetchState::Failed);
                if state == FetchState::Failed {
                    debug!("Concurrent download of {} failed", name);
                }
                continue;
            }

            let Some(guard) = self.inflight.register(key.clone()) else {
                continue;
            };
            cache.ensure_dirs()?;
            if cache.claim_running(name)? {
                let outcome = self.download_claimed(&cache, name, dest).await;
                drop(guard);
                return outcome;
            }
            drop(guard);

            if Instant::now() >= deadline {
                warn!("Gave up waiting for prefetch of {}, fetching directly", name);
                return self.download_unclaimed(&base_dir, name, dest).await;
            }
            self.wait_for_foreign(&cache, name, deadline).await?;
        }
    }

    /// Download into our claimed running file, then move it to `dest`.
    async fn download_claimed(&self, cache: &PrefetchCache, name: &str, dest: &Path) -> Result<FetchOutcome> {
        let running = cache.running_path(name);
        let downloaded = with_heartbeat(cache, name, self.engine.download_wal(name, &running)).await;
        let moved = downloaded.and_then(|_| {
            cache.take_running(name, dest)?.ok_or_else(|| {
                ArchiveError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("download of {} vanished before it was moved", name),
                ))
            })
        });

        match moved {
            Ok(bytes) => {
                info!("Fetched WAL segment {} ({} bytes)", name, bytes);
                Ok(FetchOutcome {
                    source: FetchSource::Store,
                    bytes,
                })
            }
            Err(e) => {
                cache.discard_running(name);
                Err(e)
            }
        }
    }

    /// Download next to `dest` without a claim, when another process holds
    /// the running file for too long.
    async fn download_unclaimed(&self, base_dir: &Path, name: &str, dest: &Path) -> Result<FetchOutcome> {
        let temp = tempfile::Builder::new()
            .prefix(".walkeeper-fetch-")
            .tempfile_in(base_dir)?;
        let bytes = self.engine.download_wal(name, temp.path()).await?;
        temp.persist(dest).map_err(|e| ArchiveError::Io(e.error))?;
        sync_directory(base_dir)?;

        info!("Fetched WAL segment {} ({} bytes)", name, bytes);
        Ok(FetchOutcome {
            source: FetchSource::Store,
            bytes,
        })
    }

    /// Another process is downloading `name`; wait until it finishes, its
    /// running file goes stale, or `deadline` passes.
    async fn wait_for_foreign(&self, cache: &PrefetchCache, name: &str, deadline: Instant) -> Result<()> {
        debug!("Waiting for another process downloading {}", name);
        while cache.running_is_fresh(name) && !cache.is_ready(name) && Instant::now() < deadline {
            tokio::select! {
                _ = tokio::time::sleep(FOREIGN_POLL_INTERVAL) => {}
                _ = self.engine.cancel_token().cancelled() => return Err(ArchiveError::Cancelled),
            }
        }
        Ok(())
    }

    /// Warm the cache under `base_dir` with `from` and the segments after it.
    ///
    /// Segments missing from the store are normal at the end of the WAL
    /// stream and only counted.
    pub async fn prefetch(&self, base_dir: &Path, from: &str) -> Result<PrefetchReport> {
        validate_name(from)?;
        let names = segment_window(from, self.config.prefetch_window, self.config.segment_size);
        let mut report = PrefetchReport::default();
        if names.is_empty() {
            debug!("{} has no prefetch window", from);
            return Ok(report);
        }

        let cache = self.cache_for(base_dir);
        cache.ensure_dirs()?;

        let mut handles = Vec::with_capacity(names.len());
        for name in names {
            if cache.is_ready(&name) {
                report.already_cached += 1;
                continue;
            }
            let Some(guard) = self.inflight.register(cache.ready_path(&name)) else {
                report.in_flight += 1;
                continue;
            };
            if !cache.claim_running(&name)? {
                report.in_flight += 1;
                continue;
            }

            let engine = self.engine.clone();
            let cache = cache.clone();
            let task_name = name.clone();
            let handle = tokio::spawn(async move {
                let name = task_name;
                let downloaded = async {
                    let _permit = engine.acquire().await?;
                    let running = cache.running_path(&name);
                    with_heartbeat(&cache, &name, engine.download_wal(&name, &running)).await
                }
                .await;

                match downloaded.and_then(|bytes| cache.promote(&name).map(|_| bytes).map_err(Into::into)) {
                    Ok(bytes) => {
                        guard.complete();
                        Ok(bytes)
                    }
                    Err(e) => {
                        cache.discard_running(&name);
                        Err(e)
                    }
                }
            });
            handles.push((name, handle));
        }

        for (name, handle) in handles {
            match handle.await {
                Ok(Ok(bytes)) => {
                    debug!("Prefetched {} ({} bytes)", name, bytes);
                    report.fetched += 1;
                }
                Ok(Err(ArchiveError::ObjectNotFound(_))) => {
                    debug!("{} is not archived yet", name);
                    report.missing += 1;
                }
                Ok(Err(e)) => {
                    warn!("Prefetch of {} failed: {}", name, e);
                    report.failed += 1;
                }
                Err(e) => {
                    warn!("Prefetch task for {} panicked: {}", name, e);
                    report.failed += 1;
                }
            }
        }

        report.evicted = cache.evict(self.config.cache_capacity)?.len();
        info!(
            "Prefetch from {}: {} fetched, {} cached, {} missing, {} failed, {} evicted",
            from, report.fetched, report.already_cached, report.missing, report.failed, report.evicted
        );
        Ok(report)
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LocalStore, ObjectStore};
    use crate::transfer::tests::test_engine;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::fs;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Local store whose downloads take a while and are counted.
    struct SlowStore {
        inner: LocalStore,
        delay: Duration,
        gets: AtomicU32,
    }

    #[async_trait]
    impl ObjectStore for SlowStore {
        async fn put_file(&self, key: &str, src: &Path) -> Result<()> {
            self.inner.put_file(key, src).await
        }

        async fn put_bytes(&self, key: &str, data: Bytes) -> Result<()> {
            self.inner.put_bytes(key, data).await
        }

        async fn get_to_file(&self, key: &str, dest: &Path) -> Result<u64> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.inner.get_to_file(key, dest).await
        }

        async fn get_bytes(&self, key: &str) -> Result<Bytes> {
            self.inner.get_bytes(key).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<String>> {
            self.inner.list(prefix).await
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.inner.delete(key).await
        }
    }

    const SEG: &str = "000000010000000000000001";
    const SIXTEEN_MIB: u64 = 16 * 1024 * 1024;

    fn archiver(bucket: &Path, window: usize, capacity: usize) -> Result<WalArchiver> {
        let store: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(bucket.to_path_buf())?);
        let config = WalConfig {
            prefetch_window: window,
            cache_capacity: capacity,
            ..WalConfig::default()
        };
        Ok(WalArchiver::new(test_engine(store), config))
    }

    fn ready_segment(pg_wal: &Path, name: &str, contents: &[u8]) -> std::io::Result<PathBuf> {
        fs::create_dir_all(pg_wal.join(ARCHIVE_STATUS_DIR))?;
        let path = pg_wal.join(name);
        fs::write(&path, contents)?;
        fs::write(pg_wal.join(ARCHIVE_STATUS_DIR).join(format!("{}.ready", name)), b"")?;
        Ok(path)
    }

    #[test]
    fn test_successor_rule() {
        assert_eq!(
            next_segment("000000010000000000000001", SIXTEEN_MIB).as_deref(),
            Some("000000010000000000000002")
        );
        assert_eq!(
            next_segment("0000000100000000000000FF", SIXTEEN_MIB).as_deref(),
            Some("000000010000000100000000")
        );
        // 64MiB segments: 64 per log id
        assert_eq!(
            next_segment("00000002000000030000003F", 64 * 1024 * 1024).as_deref(),
            Some("000000020000000400000000")
        );
        assert_eq!(next_segment("00000001.history", SIXTEEN_MIB), None);
        assert_eq!(next_segment("000000010000000000000001.partial", SIXTEEN_MIB), None);
        assert_eq!(next_segment("0000000100000000000000ff", SIXTEEN_MIB), None);
    }

    #[test]
    fn test_window_includes_start() {
        let window = segment_window(SEG, 3, SIXTEEN_MIB);
        assert_eq!(
            window,
            vec![
                "000000010000000000000001",
                "000000010000000000000002",
                "000000010000000000000003"
            ]
        );
        assert!(segment_window(SEG, 0, SIXTEEN_MIB).is_empty());
        assert!(segment_window("00000002.history", 4, SIXTEEN_MIB).is_empty());
    }

    #[test]
    fn test_name_validation() {
        assert!(validate_name(SEG).is_ok());
        assert!(validate_name("00000002.history").is_ok());
        for bad in ["", "../x", "a/b", "a\\b", "..", "a\0b"] {
            assert!(matches!(validate_name(bad), Err(ArchiveError::InvalidName(_))), "{:?}", bad);
        }
    }

    #[tokio::test]
    async fn test_push_requires_ready_marker() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let archiver = archiver(&temp_dir.path().join("bucket"), 0, 4)?;
        let pg_wal = temp_dir.path().join("pg_wal");
        fs::create_dir_all(&pg_wal)?;
        fs::write(pg_wal.join(SEG), b"wal")?;

        let err = archiver.push(&pg_wal.join(SEG)).await.unwrap_err();
        assert!(matches!(err, ArchiveError::NotReady { .. }));

        // A marker beside the segment also counts
        fs::write(pg_wal.join(format!("{}.ready", SEG)), b"")?;
        archiver.push(&pg_wal.join(SEG)).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_push_fetch_round_trip() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let archiver = archiver(&temp_dir.path().join("bucket"), 0, 4)?;
        let contents = b"the quick brown fox jumps over the lazy dog\n".repeat(10_000);
        let segment = ready_segment(&temp_dir.path().join("pg_wal"), SEG, &contents)?;
        archiver.push(&segment).await?;

        let restore = temp_dir.path().join("restore");
        fs::create_dir(&restore)?;
        let dest = restore.join("RECOVERYXLOG");
        let outcome = archiver.fetch(SEG, &dest).await?;

        assert_eq!(outcome.source, FetchSource::Store);
        assert_eq!(outcome.bytes, contents.len() as u64);
        assert_eq!(fs::read(&dest)?, contents);
        Ok(())
    }

    #[tokio::test]
    async fn test_fetch_missing_segment() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let archiver = archiver(&temp_dir.path().join("bucket"), 0, 4)?;
        let dest = temp_dir.path().join("RECOVERYXLOG");

        let err = archiver.fetch(SEG, &dest).await.unwrap_err();
        assert!(matches!(err, ArchiveError::ObjectNotFound(_)));
        assert!(!dest.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_prefetch_then_fetch_from_cache() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let archiver = archiver(&temp_dir.path().join("bucket"), 4, 8)?;
        let pg_wal = temp_dir.path().join("pg_wal");
        for (i, name) in segment_window(SEG, 3, SIXTEEN_MIB).iter().enumerate() {
            let segment = ready_segment(&pg_wal, name, &vec![i as u8; 1024])?;
            archiver.push(&segment).await?;
        }

        let restore = temp_dir.path().join("restore");
        fs::create_dir(&restore)?;
        let report = archiver.prefetch(&restore, SEG).await?;
        assert_eq!(report.fetched, 3);
        assert_eq!(report.missing, 1);
        assert!(restore.join(".walkeeper/prefetch").join(SEG).is_file());
        assert!(!restore.join(".walkeeper/prefetch/running").join(SEG).exists());

        let again = archiver.prefetch(&restore, SEG).await?;
        assert_eq!(again.already_cached, 3);
        assert_eq!(again.fetched, 0);

        let dest = restore.join("RECOVERYXLOG");
        let outcome = archiver.fetch("000000010000000000000002", &dest).await?;
        assert_eq!(outcome.source, FetchSource::Cache);
        assert_eq!(fs::read(&dest)?, vec![1u8; 1024]);
        assert!(!restore.join(".walkeeper/prefetch/000000010000000000000002").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_prefetch_respects_capacity() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let archiver = archiver(&temp_dir.path().join("bucket"), 4, 2)?;
        let pg_wal = temp_dir.path().join("pg_wal");
        for name in segment_window(SEG, 4, SIXTEEN_MIB) {
            let segment = ready_segment(&pg_wal, &name, name.as_bytes())?;
            archiver.push(&segment).await?;
        }

        let restore = temp_dir.path().join("restore");
        fs::create_dir(&restore)?;
        let report = archiver.prefetch(&restore, SEG).await?;
        assert_eq!(report.fetched, 4);
        assert_eq!(report.evicted, 2);
        assert_eq!(archiver.cache_for(&restore).entries()?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_fetch_waits_for_in_flight_prefetch() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let archiver = Arc::new(archiver(&temp_dir.path().join("bucket"), 1, 4)?);
        let restore = temp_dir.path().join("restore");
        fs::create_dir(&restore)?;
        let cache = archiver.cache_for(&restore);
        cache.ensure_dirs()?;

        // Simulate a prefetch that owns the segment and finishes later
        let guard = archiver.inflight.register(cache.ready_path(SEG)).unwrap();
        let fetcher = {
            let archiver = Arc::clone(&archiver);
            let dest = restore.join("RECOVERYXLOG");
            tokio::spawn(async move { archiver.fetch(SEG, &dest).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        fs::write(cache.ready_path(SEG), b"prefetched")?;
        guard.complete();

        let outcome = fetcher.await.unwrap()?;
        assert_eq!(outcome.source, FetchSource::Cache);
        assert_eq!(fs::read(restore.join("RECOVERYXLOG"))?, b"prefetched");
        Ok(())
    }

    #[tokio::test]
    async fn test_direct_fetch_is_not_downloaded_again_by_prefetch() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = Arc::new(SlowStore {
            inner: LocalStore::new(temp_dir.path().join("bucket"))?,
            delay: Duration::from_millis(300),
            gets: AtomicU32::new(0),
        });
        let config = WalConfig {
            prefetch_window: 1,
            ..WalConfig::default()
        };
        let archiver = Arc::new(WalArchiver::new(test_engine(store.clone()), config.clone()));
        // A second archiver stands in for another process sharing the cache
        let other = WalArchiver::new(test_engine(store.clone()), config);

        let segment = ready_segment(&temp_dir.path().join("pg_wal"), SEG, b"direct")?;
        archiver.push(&segment).await?;

        let restore = temp_dir.path().join("restore");
        fs::create_dir(&restore)?;
        let fetcher = {
            let archiver = Arc::clone(&archiver);
            let dest = restore.join("RECOVERYXLOG");
            tokio::spawn(async move { archiver.fetch(SEG, &dest).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let report = archiver.prefetch(&restore, SEG).await?;
        assert_eq!(report.in_flight, 1);
        assert_eq!(report.fetched, 0);
        let report = other.prefetch(&restore, SEG).await?;
        assert_eq!(report.in_flight, 1);
        assert_eq!(report.fetched, 0);

        let outcome = fetcher.await.unwrap()?;
        assert_eq!(outcome.source, FetchSource::Store);
        assert_eq!(fs::read(restore.join("RECOVERYXLOG"))?, b"direct");
        assert_eq!(store.gets.load(Ordering::SeqCst), 1);
        assert!(!archiver.cache_for(&restore).running_path(SEG).exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_fetch_waits_for_other_process_download() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let archiver = archiver(&temp_dir.path().join("bucket"), 1, 4)?;
        let restore = temp_dir.path().join("restore");
        fs::create_dir(&restore)?;

        // Another process owns the running file and publishes later
        let cache = archiver.cache_for(&restore);
        cache.ensure_dirs()?;
        assert!(cache.claim_running(SEG)?);
        let publisher = {
            let cache = cache.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                fs::write(cache.running_path(SEG), b"from elsewhere")?;
                cache.promote(SEG)
            })
        };

        let dest = restore.join("RECOVERYXLOG");
        let outcome = archiver.fetch(SEG, &dest).await?;
        publisher.await.unwrap()?;
        assert_eq!(outcome.source, FetchSource::Cache);
        assert_eq!(fs::read(&dest)?, b"from elsewhere");
        Ok(())
    }
}
