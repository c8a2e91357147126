//! Progress reporting for download jobs.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Error;

/// The step of a job a [`ProgressEvent`] belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessingStage {
    DownloadingCentralDirectory,
    CreatingDirectory,
    VerifyingExistingFile,
    DownloadingFile,
    StreamExtractingFile,
    ExtractingFile,
    CrcVerifyingFile,
    Committing,
}

/// One progress notification.
///
/// `bytes_completed` is cumulative for the entry within its stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub stage: ProcessingStage,
    /// Entry name; `None` for job-wide stages
    pub entry: Option<String>,
    /// The stage finished for this entry (successfully or not)
    pub completed: bool,
    pub bytes_completed: u64,
    pub bytes_total: u64,
    /// Rendered error when the stage failed
    pub error: Option<String>,
}

impl ProgressEvent {
    pub fn started(stage: ProcessingStage, entry: Option<&str>, bytes_total: u64) -> Self {
        Self {
            stage,
            entry: entry.map(str::to_string),
            completed: false,
            bytes_completed: 0,
            bytes_total,
            error: None,
        }
    }

    pub fn progress(stage: ProcessingStage, entry: &str, done: u64, total: u64) -> Self {
        Self {
            bytes_completed: done,
            ..Self::started(stage, Some(entry), total)
        }
    }

    pub fn finished(stage: ProcessingStage, entry: Option<&str>, done: u64, total: u64) -> Self {
        Self {
            completed: true,
            bytes_completed: done,
            ..Self::started(stage, entry, total)
        }
    }

    pub fn failed(stage: ProcessingStage, entry: Option<&str>, error: &Error) -> Self {
        Self {
            completed: true,
            error: Some(error.to_string()),
            ..Self::started(stage, entry, 0)
        }
    }
}

/// Receives progress events from every pipeline worker.
///
/// Called from many tasks at once; implementations must not block.
pub trait ProgressObserver: Send + Sync {
    fn on_event(&self, event: &ProgressEvent);
}

/// Observer that drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ProgressObserver for NoopObserver {
    fn on_event(&self, _event: &ProgressEvent) {}
}

/// Running totals of a job, updated from progress events
#[derive(Debug, Default)]
pub struct TransferStats {
    downloaded_bytes: AtomicU64,
    extracted_bytes: AtomicU64,
    committed: AtomicU64,
    failed: AtomicU64,
    directories: AtomicU64,
}

/// Point-in-time copy of [`TransferStats`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Bytes copied into sidecar archives
    pub downloaded_bytes: u64,
    /// Uncompressed bytes written to staging files
    pub extracted_bytes: u64,
    pub committed: u64,
    pub failed: u64,
    pub directories: u64,
}

impl TransferStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            downloaded_bytes: self.downloaded_bytes.load(Ordering::Relaxed),
            extracted_bytes: self.extracted_bytes.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            directories: self.directories.load(Ordering::Relaxed),
        }
    }
}

impl ProgressObserver for TransferStats {
    fn on_event(&self, event: &ProgressEvent) {
        if !event.completed {
            return;
        }
        if event.error.is_some() {
            self.failed.fetch_add(1, Ordering::Relaxed);
            return;
        }
        match event.stage {
            ProcessingStage::DownloadingFile => {
                self.downloaded_bytes
                    .fetch_add(event.bytes_completed, Ordering::Relaxed);
            }
            ProcessingStage::StreamExtractingFile | ProcessingStage::ExtractingFile => {
                self.extracted_bytes
                    .fetch_add(event.bytes_completed, Ordering::Relaxed);
            }
            ProcessingStage::Committing => {
                self.committed.fetch_add(1, Ordering::Relaxed);
            }
            ProcessingStage::CreatingDirectory => {
                self.directories.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_count_completed_events_only() {
        let stats = TransferStats::new();
        stats.on_event(&ProgressEvent::progress(
            ProcessingStage::DownloadingFile,
            "a.bin",
            10,
            100,
        ));
        stats.on_event(&ProgressEvent::finished(
            ProcessingStage::DownloadingFile,
            Some("a.bin"),
            100,
            100,
        ));
        stats.on_event(&ProgressEvent::finished(
            ProcessingStage::ExtractingFile,
            Some("a.bin"),
            250,
            250,
        ));
        stats.on_event(&ProgressEvent::finished(
            ProcessingStage::Committing,
            Some("a.bin"),
            0,
            0,
        ));
        stats.on_event(&ProgressEvent::failed(
            ProcessingStage::ExtractingFile,
            Some("b.bin"),
            &Error::Cancelled,
        ));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.downloaded_bytes, 100);
        assert_eq!(snapshot.extracted_bytes, 250);
        assert_eq!(snapshot.committed, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.directories, 0);
    }
}
