//! The worker loops of the pipeline.
//!
//! Every stage is a free function that pops [`EntryTask`]s from a shared
//! receiver and pushes survivors to the next stage's sender. A stage ends
//! when its input channel is closed and drained, which happens once every
//! worker of the previous stage has returned and dropped its sender.
//!
//! Per-entry failures are recorded in the shared failure map and the loop
//! moves on. Fatal errors are returned so the orchestrator can cancel the
//! remaining workers.

use flate2::Crc;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::progress::{ProcessingStage, ProgressEvent, ProgressObserver};
use super::task::{EntryTask, Staged};
use crate::config::{DeliveryMode, JobConfig};
use crate::error::{Error, Result};
use crate::io::{RangeStream, ReadAt, copy_cancellable};
use crate::retry::download_with_retry;
use crate::zip::{
    RehydratedEntry, check_integrity, fetch_entry_archive, locate_entry, open_entry_archive,
    open_entry_stream,
};

/// DOS timestamps have a two second resolution
const TIMESTAMP_TOLERANCE: Duration = Duration::from_secs(2);

pub(crate) type TaskSender = mpsc::UnboundedSender<EntryTask>;
pub(crate) type TaskReceiver = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<EntryTask>>>;

/// Entry name to the error that stopped it
pub(crate) type FailureMap = Arc<Mutex<HashMap<String, Error>>>;

/// Everything a stage worker needs, shared by all workers of a job
pub(crate) struct StageContext<R: ReadAt + ?Sized> {
    pub reader: Arc<R>,
    pub config: Arc<JobConfig>,
    pub observer: Arc<dyn ProgressObserver>,
    pub cancel: CancellationToken,
    pub failures: FailureMap,
    pub committed: AtomicUsize,
    pub skipped: AtomicUsize,
}

impl<R: ReadAt + ?Sized> StageContext<R> {
    fn strict(&self) -> bool {
        !self.config.skip_local_header_checks
    }

    fn report(&self, event: ProgressEvent) {
        self.observer.on_event(&event);
    }

    /// Record a per-entry failure and clean up its artifacts.
    ///
    /// Fatal errors are handed back to the caller instead.
    async fn fail(&self, task: &EntryTask, stage: ProcessingStage, error: Error) -> Result<()> {
        if error.is_fatal() {
            return Err(error);
        }
        tracing::warn!(entry = %task.name(), ?stage, error = %error, "entry failed");
        self.report(ProgressEvent::failed(stage, Some(task.name()), &error));
        task.discard().await;
        record_failure(&self.failures, task.name(), error);
        Ok(())
    }
}

pub(crate) fn record_failure(failures: &FailureMap, name: &str, error: Error) {
    let mut failures = failures.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    failures.insert(name.to_string(), error);
}

pub(crate) fn shared_receiver(rx: mpsc::UnboundedReceiver<EntryTask>) -> TaskReceiver {
    Arc::new(tokio::sync::Mutex::new(rx))
}

/// Pop the next task, or `None` once the channel is drained or the job
/// is cancelled.
async fn next_task(input: &TaskReceiver, cancel: &CancellationToken) -> Option<EntryTask> {
    let mut rx = tokio::select! {
        _ = cancel.cancelled() => return None,
        rx = input.lock() => rx,
    };
    tokio::select! {
        _ = cancel.cancelled() => None,
        task = rx.recv() => task,
    }
}

/// Skip entries whose target file is already correct.
pub(crate) async fn verify_stage<R: ReadAt + ?Sized>(
    ctx: Arc<StageContext<R>>,
    input: TaskReceiver,
    output: TaskSender,
) -> Result<()> {
    while let Some(task) = next_task(&input, &ctx.cancel).await {
        if !ctx.config.verify_existing {
            if output.send(task).is_err() {
                break;
            }
            continue;
        }

        ctx.report(ProgressEvent::started(
            ProcessingStage::VerifyingExistingFile,
            Some(task.name()),
            task.entry.uncompressed_size,
        ));
        match verify_existing(&ctx, &task).await {
            Ok(true) => {
                tracing::debug!(entry = %task.name(), "existing file is up to date");
                ctx.skipped.fetch_add(1, Ordering::Relaxed);
                ctx.report(ProgressEvent::finished(
                    ProcessingStage::VerifyingExistingFile,
                    Some(task.name()),
                    task.entry.uncompressed_size,
                    task.entry.uncompressed_size,
                ));
            }
            Ok(false) => {
                if output.send(task).is_err() {
                    break;
                }
            }
            Err(e) => ctx.fail(&task, ProcessingStage::VerifyingExistingFile, e).await?,
        }
    }
    Ok(())
}

/// Returns true if the target matches the entry. A mismatching target is
/// deleted.
async fn verify_existing<R: ReadAt + ?Sized>(
    ctx: &StageContext<R>,
    task: &EntryTask,
) -> Result<bool> {
    let metadata = match tokio::fs::metadata(&task.target_path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    if !metadata.is_file() {
        return Ok(false);
    }

    let reason = if metadata.len() != task.entry.uncompressed_size {
        Some("size")
    } else if ctx.config.verify_existing_timestamps
        && !timestamps_match(metadata.modified().ok(), task.entry.modified())
    {
        Some("modification time")
    } else if ctx.config.verify_existing_crc
        && file_crc(&task.target_path, &ctx.cancel).await? != task.entry.crc32
    {
        Some("crc32")
    } else {
        None
    };

    match reason {
        None => Ok(true),
        Some(reason) => {
            tracing::debug!(entry = %task.name(), reason, "existing file differs, removing");
            tokio::fs::remove_file(&task.target_path).await?;
            Ok(false)
        }
    }
}

fn timestamps_match(actual: Option<SystemTime>, expected: Option<SystemTime>) -> bool {
    match (actual, expected) {
        (Some(actual), Some(expected)) => {
            let delta = actual
                .duration_since(expected)
                .or_else(|_| expected.duration_since(actual))
                .unwrap_or_default();
            delta <= TIMESTAMP_TOLERANCE
        }
        (_, None) => true,
        (None, Some(_)) => false,
    }
}

async fn file_crc(path: &Path, cancel: &CancellationToken) -> Result<u32> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut crc = Crc::new();
    copy_cancellable(&mut file, &mut tokio::io::sink(), cancel, |chunk| {
        crc.update(chunk)
    })
    .await?;
    Ok(crc.sum())
}

/// Fetch entry data, retrying network-class failures in place.
pub(crate) async fn download_stage<R: ReadAt + ?Sized>(
    ctx: Arc<StageContext<R>>,
    input: TaskReceiver,
    output: TaskSender,
) -> Result<()> {
    while let Some(mut task) = next_task(&input, &ctx.cancel).await {
        let stage = match ctx.config.delivery {
            DeliveryMode::CompressedFile => ProcessingStage::DownloadingFile,
            DeliveryMode::Streaming => ProcessingStage::StreamExtractingFile,
        };
        ctx.report(ProgressEvent::started(
            stage,
            Some(task.name()),
            task.entry.compressed_size,
        ));

        let ctx_ref = ctx.as_ref();
        let task_ref = &task;
        let staged = download_with_retry(&ctx.config.retry, &ctx.cancel, move || {
            download_entry(ctx_ref, task_ref, stage)
        })
        .await;

        match staged {
            Ok(staged) => {
                task.staged = staged;
                if output.send(task).is_err() {
                    break;
                }
            }
            Err(e) => ctx.fail(&task, stage, e).await?,
        }
    }
    Ok(())
}

async fn download_entry<R: ReadAt + ?Sized>(
    ctx: &StageContext<R>,
    task: &EntryTask,
    stage: ProcessingStage,
) -> Result<Staged> {
    match &task.sidecar_path {
        Some(sidecar) => {
            let rehydrated = fetch_sidecar(ctx, task, sidecar).await?;
            ctx.report(ProgressEvent::finished(
                stage,
                Some(task.name()),
                rehydrated.fetched,
                task.entry.compressed_size,
            ));
            Ok(Staged::Sidecar(rehydrated))
        }
        None => {
            let located = locate_entry(ctx.reader.as_ref(), &task.entry, ctx.strict()).await?;
            let mut stream = open_entry_stream(ctx.reader.as_ref(), &task.entry, &located).await?;
            let (crc, len) = write_staging(ctx, task, &mut stream, stage).await?;
            ctx.report(ProgressEvent::finished(
                stage,
                Some(task.name()),
                len,
                task.entry.uncompressed_size,
            ));
            Ok(Staged::Extracted { crc, len })
        }
    }
}

async fn fetch_sidecar<R: ReadAt + ?Sized>(
    ctx: &StageContext<R>,
    task: &EntryTask,
    sidecar: &Path,
) -> Result<RehydratedEntry> {
    let total = task.entry.compressed_size;
    let mut done = 0;
    fetch_entry_archive(
        ctx.reader.as_ref(),
        &task.entry,
        sidecar,
        ctx.strict(),
        &ctx.cancel,
        |n| {
            done += n;
            ctx.report(ProgressEvent::progress(
                ProcessingStage::DownloadingFile,
                task.name(),
                done,
                total,
            ));
        },
    )
    .await
}

/// Decompress `src` into the staging file, hashing on the way.
///
/// The staging file is stamped with the entry's modification time before
/// it is closed.
async fn write_staging<R: ReadAt + ?Sized>(
    ctx: &StageContext<R>,
    task: &EntryTask,
    src: &mut RangeStream,
    stage: ProcessingStage,
) -> Result<(Crc, u64)> {
    if let Some(parent) = task.staging_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(&task.staging_path).await?;
    let total = task.entry.uncompressed_size;
    let mut crc = Crc::new();
    let mut done = 0;
    let len = copy_cancellable(src, &mut file, &ctx.cancel, |chunk| {
        crc.update(chunk);
        done += chunk.len() as u64;
        ctx.report(ProgressEvent::progress(stage, task.name(), done, total));
    })
    .await?;

    if let Some(modified) = task.entry.modified() {
        file.into_std().await.set_modified(modified)?;
    }
    Ok((crc, len))
}

/// Extract sidecars into staging files and check CRC32 and size.
pub(crate) async fn extract_stage<R: ReadAt + ?Sized>(
    ctx: Arc<StageContext<R>>,
    input: TaskReceiver,
    output: TaskSender,
) -> Result<()> {
    while let Some(mut task) = next_task(&input, &ctx.cancel).await {
        match extract_entry(&ctx, &mut task).await {
            Ok(()) => {
                if output.send(task).is_err() {
                    break;
                }
            }
            Err(e) => ctx.fail(&task, ProcessingStage::ExtractingFile, e).await?,
        }
    }
    Ok(())
}

async fn extract_entry<R: ReadAt + ?Sized>(
    ctx: &StageContext<R>,
    task: &mut EntryTask,
) -> Result<()> {
    let (crc, len) = match std::mem::take(&mut task.staged) {
        Staged::Extracted { crc, len } => (crc, len),
        Staged::Sidecar(rehydrated) => {
            ctx.report(ProgressEvent::started(
                ProcessingStage::ExtractingFile,
                Some(task.name()),
                task.entry.uncompressed_size,
            ));
            let sidecar = open_entry_archive(&rehydrated.path, ctx.strict()).await?;
            let mut stream = sidecar.open_stream().await?;
            let extracted =
                write_staging(ctx, task, &mut stream, ProcessingStage::ExtractingFile).await?;
            ctx.report(ProgressEvent::finished(
                ProcessingStage::ExtractingFile,
                Some(task.name()),
                extracted.1,
                task.entry.uncompressed_size,
            ));
            extracted
        }
        Staged::Pending => {
            return Err(Error::Io(std::io::Error::other(format!(
                "{} reached extraction without data",
                task.name()
            ))));
        }
    };

    if ctx.config.verify_extracted {
        ctx.report(ProgressEvent::started(
            ProcessingStage::CrcVerifyingFile,
            Some(task.name()),
            len,
        ));
        check_integrity(&task.entry, &crc, len)?;
        ctx.report(ProgressEvent::finished(
            ProcessingStage::CrcVerifyingFile,
            Some(task.name()),
            len,
            len,
        ));
    }
    Ok(())
}

/// Rename staging files onto their final paths.
pub(crate) async fn commit_stage<R: ReadAt + ?Sized>(
    ctx: Arc<StageContext<R>>,
    input: TaskReceiver,
) -> Result<()> {
    while let Some(task) = next_task(&input, &ctx.cancel).await {
        match commit_entry(&ctx, &task).await {
            Ok(()) => {
                tracing::debug!(entry = %task.name(), "committed");
                ctx.committed.fetch_add(1, Ordering::Relaxed);
                ctx.report(ProgressEvent::finished(
                    ProcessingStage::Committing,
                    Some(task.name()),
                    task.entry.uncompressed_size,
                    task.entry.uncompressed_size,
                ));
            }
            Err(e) => ctx.fail(&task, ProcessingStage::Committing, e).await?,
        }
    }
    Ok(())
}

async fn commit_entry<R: ReadAt + ?Sized>(ctx: &StageContext<R>, task: &EntryTask) -> Result<()> {
    // Last chance to stop before a final path appears
    if ctx.cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    tokio::fs::rename(&task.staging_path, &task.target_path).await?;

    if !ctx.config.keep_sidecars
        && let Some(sidecar) = &task.sidecar_path
    {
        match tokio::fs::remove_file(sidecar).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
