//! Byte-stream transforms applied around archives and WAL segments.
//!
//! A chain runs its transforms in order on the way out (compression, then
//! encryption) and in reverse order on the way back in. Every stage is
//! streaming; nothing is buffered beyond the codec's own window.

use crate::config::CodecConfig;
use crate::utils::errors::{ArchiveError, Result};
use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::sync::Arc;

/// A writer that must be explicitly finished to flush trailing frames.
pub trait EncodeSink: Write + Send {
    fn finish(self: Box<Self>) -> io::Result<()>;
}

/// One stage of the chain, e.g. compression or encryption.
pub trait StreamTransform: Send + Sync + fmt::Debug {
    /// Suffix appended to object keys written through this stage
    fn suffix(&self) -> &str;

    fn encoder(&self, inner: Box<dyn EncodeSink>) -> io::Result<Box<dyn EncodeSink>>;

    fn decoder(&self, inner: Box<dyn Read + Send>) -> io::Result<Box<dyn Read + Send>>;
}

/// Terminal sink: a buffered file that is fsynced on finish.
pub struct FileSink {
    inner: BufWriter<File>,
}

impl FileSink {
    pub fn new(file: File) -> Self {
        Self {
            inner: BufWriter::with_capacity(256 * 1024, file),
        }
    }
}

impl Write for FileSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl EncodeSink for FileSink {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let file = self.inner.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()
    }
}

/// zstd compression stage.
#[derive(Debug, Clone)]
pub struct ZstdTransform {
    level: i32,
}

impl ZstdTransform {
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

struct ZstdSink {
    encoder: zstd::stream::write::Encoder<'static, Box<dyn EncodeSink>>,
}

impl Write for ZstdSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.encoder.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.encoder.flush()
    }
}

impl EncodeSink for ZstdSink {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let inner = self.encoder.finish()?;
        inner.finish()
    }
}

impl StreamTransform for ZstdTransform {
    fn suffix(&self) -> &str {
        ".zst"
    }

    fn encoder(&self, inner: Box<dyn EncodeSink>) -> io::Result<Box<dyn EncodeSink>> {
        let encoder = zstd::stream::write::Encoder::new(inner, self.level)?;
        Ok(Box::new(ZstdSink { encoder }))
    }

    fn decoder(&self, inner: Box<dyn Read + Send>) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(zstd::stream::read::Decoder::new(inner)?))
    }
}

/// Ordered list of transforms applied to every stored object.
#[derive(Debug, Clone, Default)]
pub struct TransformChain {
    transforms: Vec<Arc<dyn StreamTransform>>,
}

impl TransformChain {
    /// A chain that stores bytes as-is.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn from_config(config: &CodecConfig) -> Result<Self> {
        match config.compression.as_str() {
            "zstd" => Ok(Self::none().with(ZstdTransform::new(config.level))),
            "none" => Ok(Self::none()),
            other => Err(ArchiveError::Config(format!(
                "unknown compression '{}' (expected zstd or none)",
                other
            ))),
        }
    }

    /// Append a stage, e.g. an encryption transform after compression.
    pub fn with(mut self, transform: impl StreamTransform + 'static) -> Self {
        self.transforms.push(Arc::new(transform));
        self
    }

    /// Combined key suffix, e.g. `.zst`
    pub fn suffix(&self) -> String {
        self.transforms.iter().map(|t| t.suffix()).collect()
    }

    /// Wrap an output file so writes pass through every stage in order.
    pub fn encoder(&self, out: File) -> io::Result<Box<dyn EncodeSink>> {
        let mut sink: Box<dyn EncodeSink> = Box::new(FileSink::new(out));
        for transform in self.transforms.iter().rev() {
            sink = transform.encoder(sink)?;
        }
        Ok(sink)
    }

    /// Wrap an input so reads undo every stage in reverse order.
    pub fn decoder(&self, input: Box<dyn Read + Send>) -> io::Result<Box<dyn Read + Send>> {
        let mut reader = input;
        for transform in self.transforms.iter().rev() {
            reader = transform.decoder(reader)?;
        }
        Ok(reader)
    }
}
