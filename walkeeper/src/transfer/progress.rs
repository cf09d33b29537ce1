//! Transfer accounting and human-readable formatting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Counters shared by every worker of one command.
#[derive(Debug)]
pub struct TransferStats {
    started: Instant,
    uploaded_bytes: AtomicU64,
    uploaded_objects: AtomicU64,
    downloaded_bytes: AtomicU64,
    downloaded_objects: AtomicU64,
}

impl TransferStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            uploaded_bytes: AtomicU64::new(0),
            uploaded_objects: AtomicU64::new(0),
            downloaded_bytes: AtomicU64::new(0),
            downloaded_objects: AtomicU64::new(0),
        }
    }

    pub fn record_upload(&self, bytes: u64) {
        self.uploaded_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.uploaded_objects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_download(&self, bytes: u64) {
        self.downloaded_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.downloaded_objects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uploaded_bytes(&self) -> u64 {
        self.uploaded_bytes.load(Ordering::Relaxed)
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded_bytes.load(Ordering::Relaxed)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// One-line summary for the end of a command
    pub fn summary(&self) -> String {
        let elapsed = self.elapsed();
        let secs = elapsed.as_secs_f64();
        let moved = self.uploaded_bytes() + self.downloaded_bytes();
        let speed = if secs > 0.0 {
            (moved as f64 / secs) as u64
        } else {
            0
        };
        format!(
            "uploaded {} in {} objects, downloaded {} in {} objects, {} at {}",
            format_bytes(self.uploaded_bytes()),
            self.uploaded_objects.load(Ordering::Relaxed),
            format_bytes(self.downloaded_bytes()),
            self.downloaded_objects.load(Ordering::Relaxed),
            format_duration(elapsed.as_secs()),
            format_speed(speed),
        )
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed as human-readable string
pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

/// Format duration as human-readable string
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_accumulate() {
        let stats = TransferStats::new();
        stats.record_upload(100);
        stats.record_upload(50);
        stats.record_download(7);
        assert_eq!(stats.uploaded_bytes(), 150);
        assert_eq!(stats.downloaded_bytes(), 7);
        assert!(stats.summary().contains("in 2 objects"));
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1023), "1023.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.00 GB");
    }

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(1024), "1.00 KB/s");
        assert_eq!(format_speed(1024 * 1024), "1.00 MB/s");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(30), "30s");
        assert_eq!(format_duration(90), "1m 30s");
        assert_eq!(format_duration(3665), "1h 1m");
    }
}
