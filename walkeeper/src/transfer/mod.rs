//! Transfer engine: moves partitions, manifests and WAL segments between
//! local disk and the object store.
//!
//! Parallel work goes through one shared semaphore sized by
//! `transfer.concurrency`. Every batch runs under a child cancellation token
//! that is cancelled on the first fatal error, so siblings stop early and the
//! first real error is what the caller sees.

pub mod progress;
pub mod retry;

use crate::archive::{ArchiveCodec, ExtractedPartition, TransformChain};
use crate::backup::manifest::{BackupManifest, CompletionMarker, PartitionDescriptor};
use crate::config::{Config, TransferConfig};
use crate::fs::FileSyncer;
use crate::partition::Partition;
use crate::store::layout::{MANIFEST_EXT, MARKER_EXT};
use crate::store::{open_store, KeyLayout, ObjectStore};
use crate::utils::errors::{ArchiveError, Result};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use progress::TransferStats;
pub use retry::{with_retry, RetryPolicy};

#[derive(Clone)]
pub struct TransferEngine {
    store: Arc<dyn ObjectStore>,
    layout: KeyLayout,
    codec: Arc<ArchiveCodec>,
    retry: RetryPolicy,
    semaphore: Arc<Semaphore>,
    stats: Arc<TransferStats>,
    cancel: CancellationToken,
}

/// What a store listing says about one backup id.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BackupObjects {
    pub has_manifest: bool,
    pub has_marker: bool,
    pub data_keys: Vec<String>,
}

pub(crate) fn join_error(e: tokio::task::JoinError) -> ArchiveError {
    ArchiveError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
}

/// A real error always wins over a cancellation it caused.
fn keep_first_failure(failure: &mut Option<ArchiveError>, e: ArchiveError) {
    let replace = match failure {
        None => true,
        Some(ArchiveError::Cancelled) => !matches!(e, ArchiveError::Cancelled),
        Some(_) => false,
    };
    if replace {
        *failure = Some(e);
    }
}

impl TransferEngine {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        layout: KeyLayout,
        codec: ArchiveCodec,
        config: &TransferConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            layout,
            codec: Arc::new(codec),
            retry: RetryPolicy::from_config(config),
            semaphore: Arc::new(Semaphore::new(config.concurrency.max(1))),
            stats: Arc::new(TransferStats::new()),
            cancel,
        }
    }

    /// Engine for the store, key prefix and codec named by `config`.
    pub fn from_config(config: &Config, cancel: CancellationToken) -> Result<Self> {
        let store = open_store(config.store_url()?)?;
        let chain = TransformChain::from_config(&config.codec)?;
        Ok(Self::new(
            store,
            KeyLayout::new(&config.store.prefix),
            ArchiveCodec::new(chain, config.backup.record_checksums),
            &config.transfer,
            cancel,
        ))
    }

    pub fn layout(&self) -> &KeyLayout {
        &self.layout
    }

    pub fn codec(&self) -> &ArchiveCodec {
        &self.codec
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Same engine, driven by a different cancellation token.
    fn scoped(&self, cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..self.clone()
        }
    }

    /// Wait for a worker slot, giving up when cancelled.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        tokio::select! {
            permit = Arc::clone(&self.semaphore).acquire_owned() => {
                permit.map_err(|_| ArchiveError::Cancelled)
            }
            _ = self.cancel.cancelled() => Err(ArchiveError::Cancelled),
        }
    }

    /// Run `work` for every item on the shared pool.
    ///
    /// Results keep input order. The first non-cancellation error cancels
    /// the remaining items and is returned.
    async fn run_pool<I, T, F, Fut>(&self, what: &'static str, items: Vec<I>, work: F) -> Result<Vec<T>>
    where
        I: Send + 'static,
        T: Send + 'static,
        F: Fn(TransferEngine, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let batch = self.cancel.child_token();
        let work = Arc::new(work);
        let mut handles = Vec::with_capacity(items.len());

        for item in items {
            let engine = self.scoped(batch.clone());
            let work = Arc::clone(&work);
            let batch = batch.clone();

            handles.push(tokio::spawn(async move {
                let permit = engine.acquire().await?;

                // Check cancellation after acquiring permit
                if batch.is_cancelled() {
                    drop(permit);
                    return Err(ArchiveError::Cancelled);
                }

                let result = work(engine, item).await;
                drop(permit);

                if let Err(e) = &result {
                    if !matches!(e, ArchiveError::Cancelled) {
                        warn!("{} failed, cancelling the rest of the batch: {}", what, e);
                        batch.cancel();
                    }
                }
                result
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        let mut failure: Option<ArchiveError> = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(value)) => results.push(value),
                Ok(Err(e)) => keep_first_failure(&mut failure, e),
                Err(e) => {
                    warn!("{} task panicked: {}", what, e);
                    batch.cancel();
                    keep_first_failure(&mut failure, join_error(e));
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(results),
        }
    }

    // ---- Base backup partitions ----

    /// Archive one partition into a spool file and upload it.
    pub async fn upload_partition(
        &self,
        backup_id: &str,
        partition: Partition,
    ) -> Result<PartitionDescriptor> {
        let index = partition.index;
        let key = self
            .layout
            .partition_key(backup_id, index, &self.codec.suffix());

        let codec = Arc::clone(&self.codec);
        let (archived, spool) = tokio::task::spawn_blocking(move || -> Result<_> {
            let spool = tempfile::NamedTempFile::new()?;
            let archived = codec.encode_partition(&partition, spool.reopen()?)?;
            Ok((archived, spool))
        })
        .await
        .map_err(join_error)??;

        for path in &archived.vanished {
            warn!("{} vanished during backup, skipped", path.display());
        }

        let object_size = spool.as_file().metadata()?.len();
        let spool_path = spool.path().to_path_buf();
        with_retry(&self.retry, &self.cancel, &key, || {
            self.store.put_file(&key, &spool_path)
        })
        .await?;
        self.stats.record_upload(object_size);

        debug!(
            "Uploaded partition {} ({} content bytes, {} object bytes)",
            key, archived.total_bytes, object_size
        );
        Ok(PartitionDescriptor {
            index,
            key,
            total_bytes: archived.total_bytes,
            entries: archived.entries,
        })
    }

    /// Upload every partition in parallel, returning descriptors by index.
    pub async fn upload_partitions(
        &self,
        backup_id: &str,
        partitions: Vec<Partition>,
    ) -> Result<Vec<PartitionDescriptor>> {
        info!(
            "Uploading {} partitions with concurrency {}",
            partitions.len(),
            self.semaphore.available_permits()
        );
        let backup_id = backup_id.to_string();
        let mut descriptors = self
            .run_pool("partition upload", partitions, move |engine, partition| {
                let backup_id = backup_id.clone();
                async move { engine.upload_partition(&backup_id, partition).await }
            })
            .await?;
        descriptors.sort_by_key(|d| d.index);
        Ok(descriptors)
    }

    /// Download one partition object and extract it under `dest`.
    pub async fn download_partition(
        &self,
        descriptor: &PartitionDescriptor,
        dest: &Path,
    ) -> Result<ExtractedPartition> {
        let spool = tempfile::NamedTempFile::new()?;
        let spool_path = spool.path().to_path_buf();
        let key = descriptor.key.clone();

        let size = with_retry(&self.retry, &self.cancel, &key, || {
            self.store.get_to_file(&key, &spool_path)
        })
        .await?;
        self.stats.record_download(size);

        let codec = Arc::clone(&self.codec);
        let dest = dest.to_path_buf();
        let expected = descriptor.entries.clone();
        tokio::task::spawn_blocking(move || -> Result<ExtractedPartition> {
            let input = spool.reopen()?;
            codec.decode_partition(input, &dest, &key, &expected)
        })
        .await
        .map_err(join_error)?
    }

    /// Download and extract every partition of a manifest, making each
    /// partition's files durable before it counts as done.
    pub async fn download_partitions(
        &self,
        manifest: &BackupManifest,
        dest: &Path,
        syncer: Arc<dyn FileSyncer>,
    ) -> Result<Vec<ExtractedPartition>> {
        let dest = dest.to_path_buf();
        self.run_pool(
            "partition download",
            manifest.partitions.clone(),
            move |engine, descriptor| {
                let dest = dest.clone();
                let syncer = Arc::clone(&syncer);
                async move {
                    let extracted = engine.download_partition(&descriptor, &dest).await?;
                    let paths = extracted.regular_paths();
                    tokio::task::spawn_blocking(move || syncer.fsync_paths(&paths))
                        .await
                        .map_err(join_error)??;
                    debug!(
                        "Restored partition {} ({} files)",
                        descriptor.index,
                        extracted.files.len()
                    );
                    Ok(extracted)
                }
            },
        )
        .await
    }

    // ---- Single objects ----

    pub async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let data = Bytes::from(serde_json::to_vec_pretty(value)?);
        let size = data.len() as u64;
        with_retry(&self.retry, &self.cancel, key, || {
            self.store.put_bytes(key, data.clone())
        })
        .await?;
        self.stats.record_upload(size);
        Ok(())
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let data = with_retry(&self.retry, &self.cancel, key, || self.store.get_bytes(key)).await?;
        self.stats.record_download(data.len() as u64);
        Ok(serde_json::from_slice(&data)?)
    }

    /// Encode a WAL segment and upload it under its name.
    pub async fn upload_wal(&self, name: &str, src: &Path) -> Result<u64> {
        let key = self.layout.wal_key(name, &self.codec.suffix());
        let codec = Arc::clone(&self.codec);
        let src = src.to_path_buf();
        let spool = tokio::task::spawn_blocking(move || -> Result<_> {
            let spool = tempfile::NamedTempFile::new()?;
            codec.encode_file(&src, spool.reopen()?)?;
            Ok(spool)
        })
        .await
        .map_err(join_error)??;

        let object_size = spool.as_file().metadata()?.len();
        let spool_path = spool.path().to_path_buf();
        with_retry(&self.retry, &self.cancel, &key, || {
            self.store.put_file(&key, &spool_path)
        })
        .await?;
        self.stats.record_upload(object_size);
        Ok(object_size)
    }

    /// Download a WAL segment and decode it into `out`.
    pub async fn download_wal(&self, name: &str, out: &Path) -> Result<u64> {
        let key = self.layout.wal_key(name, &self.codec.suffix());
        let spool = tempfile::NamedTempFile::new()?;
        let spool_path = spool.path().to_path_buf();

        let size = with_retry(&self.retry, &self.cancel, &key, || {
            self.store.get_to_file(&key, &spool_path)
        })
        .await?;
        self.stats.record_download(size);

        let codec = Arc::clone(&self.codec);
        let out = out.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<u64> {
            let output = std::fs::File::create(&out)?;
            codec.decode_file(spool.reopen()?, output, &key)
        })
        .await
        .map_err(join_error)?
    }

    // ---- Listing and deletion ----

    /// Every backup id the store knows about, with the objects it owns.
    pub async fn scan_backups(&self) -> Result<BTreeMap<String, BackupObjects>> {
        let mut backups: BTreeMap<String, BackupObjects> = BTreeMap::new();

        let manifests_prefix = self.layout.manifests_prefix();
        let keys = with_retry(&self.retry, &self.cancel, &manifests_prefix, || {
            self.store.list(&manifests_prefix)
        })
        .await?;
        for key in &keys {
            match self.layout.parse_manifest_key(key) {
                Some((id, MANIFEST_EXT)) => backups.entry(id.to_string()).or_default().has_manifest = true,
                Some((id, MARKER_EXT)) => backups.entry(id.to_string()).or_default().has_marker = true,
                _ => debug!("Ignoring unexpected key {}", key),
            }
        }

        let data_prefix = self.layout.all_backup_data_prefix();
        let keys = with_retry(&self.retry, &self.cancel, &data_prefix, || {
            self.store.list(&data_prefix)
        })
        .await?;
        for key in keys {
            if let Some(id) = self.layout.parse_data_key(&key) {
                backups.entry(id.to_string()).or_default().data_keys.push(key);
            }
        }

        Ok(backups)
    }

    /// Completed backups, oldest first by completion time.
    pub async fn list_backups(&self) -> Result<Vec<BackupManifest>> {
        let scanned = self.scan_backups().await?;
        let mut manifests = Vec::new();

        for (id, objects) in scanned {
            if !objects.has_marker {
                debug!("Skipping incomplete backup {}", id);
                continue;
            }
            if !objects.has_manifest {
                warn!("Backup {} has a completion marker but no manifest", id);
                continue;
            }
            manifests.push(self.load_completed(&id).await?);
        }

        manifests.sort_by(|a, b| {
            a.completed_at
                .cmp(&b.completed_at)
                .then_with(|| a.backup_id.cmp(&b.backup_id))
        });
        Ok(manifests)
    }

    /// Load a completed backup's manifest. No marker means no backup.
    pub async fn load_completed(&self, backup_id: &str) -> Result<BackupManifest> {
        let marker: CompletionMarker = match self.get_json(&self.layout.marker_key(backup_id)).await {
            Ok(marker) => marker,
            Err(ArchiveError::ObjectNotFound(_)) => {
                return Err(ArchiveError::BackupNotFound(backup_id.to_string()))
            }
            Err(e) => return Err(e),
        };
        let mut manifest: BackupManifest =
            match self.get_json(&self.layout.manifest_key(backup_id)).await {
                Ok(manifest) => manifest,
                Err(ArchiveError::ObjectNotFound(_)) => {
                    return Err(ArchiveError::BackupNotFound(backup_id.to_string()))
                }
                Err(e) => return Err(e),
            };
        manifest.completed_at = Some(marker.completed_at);
        Ok(manifest)
    }

    /// Delete keys in parallel. Missing keys count as deleted.
    pub async fn delete_objects(&self, keys: Vec<String>) -> Result<usize> {
        let count = keys.len();
        self.run_pool("delete", keys, |engine, key| async move {
            with_retry(&engine.retry, &engine.cancel, &key, || engine.store.delete(&key)).await
        })
        .await?;
        Ok(count)
    }

    /// WAL segment names present in the store, sorted.
    pub async fn list_wal(&self) -> Result<BTreeSet<String>> {
        let prefix = self.layout.wal_prefix();
        let suffix = self.codec.suffix();
        let keys = with_retry(&self.retry, &self.cancel, &prefix, || self.store.list(&prefix)).await?;
        Ok(keys
            .iter()
            .filter_map(|k| k.strip_prefix(prefix.as_str()))
            .map(|name| name.strip_suffix(suffix.as_str()).unwrap_or(name).to_string())
            .collect())
    }

    /// Keys of every object under the store prefix.
    pub async fn list_all(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for prefix in [
            self.layout.all_backup_data_prefix(),
            self.layout.manifests_prefix(),
            self.layout.wal_prefix(),
        ] {
            let listed = with_retry(&self.retry, &self.cancel, &prefix, || self.store.list(&prefix)).await?;
            keys.extend(listed);
        }
        Ok(keys)
    }
}
