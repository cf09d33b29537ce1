//! Archive codec: tar partitions and single WAL objects through the
//! transform chain, in both directions.

pub mod reader;
pub mod transform;
pub mod writer;

use crate::backup::manifest::ManifestEntry;
use crate::partition::Partition;
use crate::utils::errors::{ArchiveError, Result};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

pub use reader::{ExtractedFile, ExtractedPartition};
pub use transform::{StreamTransform, TransformChain, ZstdTransform};
pub use writer::ArchivedPartition;

#[derive(Debug, Clone)]
pub struct ArchiveCodec {
    chain: TransformChain,
    record_checksums: bool,
}

impl ArchiveCodec {
    pub fn new(chain: TransformChain, record_checksums: bool) -> Self {
        Self {
            chain,
            record_checksums,
        }
    }

    /// Key suffix for objects written by this codec, e.g. `.zst`
    pub fn suffix(&self) -> String {
        self.chain.suffix()
    }

    /// Encode a partition as tar through the chain into `out`.
    pub fn encode_partition(&self, partition: &Partition, out: File) -> Result<ArchivedPartition> {
        let sink = self.chain.encoder(out)?;
        let (archived, sink) = writer::write_partition(partition, sink, self.record_checksums)?;
        sink.finish()?;
        Ok(archived)
    }

    /// Decode a downloaded partition object and extract it under `dest`.
    pub fn decode_partition(
        &self,
        input: File,
        dest: &Path,
        key: &str,
        expected: &[ManifestEntry],
    ) -> Result<ExtractedPartition> {
        let reader = self
            .chain
            .decoder(Box::new(io::BufReader::new(input)))
            .map_err(|e| ArchiveError::corrupt(key, e.to_string()))?;
        reader::extract_partition(reader, dest, key, expected)
    }

    /// Encode one opaque file (a WAL segment) through the chain.
    pub fn encode_file(&self, src: &Path, out: File) -> Result<u64> {
        let mut input = File::open(src)?;
        let mut sink = self.chain.encoder(out)?;
        let copied = io::copy(&mut input, &mut sink)?;
        sink.finish()?;
        Ok(copied)
    }

    /// Decode one downloaded object into `out`, returning the decoded size.
    pub fn decode_file(&self, input: File, mut out: File, key: &str) -> Result<u64> {
        let mut reader = self
            .chain
            .decoder(Box::new(io::BufReader::new(input)))
            .map_err(|e| ArchiveError::corrupt(key, e.to_string()))?;

        let mut buf = vec![0u8; 64 * 1024];
        let mut total = 0u64;
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ArchiveError::corrupt(key, e.to_string())),
            };
            out.write_all(&buf[..n])?;
            total += n as u64;
        }
        out.sync_all()?;
        Ok(total)
    }
}
