//! Download jobs: selected entries of a remote archive, committed to disk.
//!
//! ## Architecture
//!
//! A job fetches the central directory once, creates directory entries up
//! front, then pushes every selected file entry through four stages joined
//! by channels:
//!
//! 1. verify: skip entries whose target already matches
//! 2. download: sidecar archive or direct decompressing stream
//! 3. extract: sidecar to staging file, CRC32 and size check
//! 4. commit: rename the staging file onto the final path
//!
//! Each stage runs its own pool of workers. Failures of one entry are
//! collected in [`JobResult::failures`] while the other entries carry on.

mod progress;
mod stages;
mod task;

pub use progress::{
    NoopObserver, ProcessingStage, ProgressEvent, ProgressObserver, StatsSnapshot, TransferStats,
};
pub use task::{
    EntryTask, SIDECAR_SUFFIX, STAGING_SUFFIX, Staged, purge_sidecars, sanitize_entry_path,
};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{DeliveryMode, JobConfig};
use crate::error::{Error, Result};
use crate::io::ReadAt;
use crate::zip::{ArchiveEntry, CacheOutcome, CentralDirectoryImage, cache_path};
use stages::{
    FailureMap, StageContext, commit_stage, download_stage, extract_stage, record_failure,
    shared_receiver, verify_stage,
};

/// Outcome of a job that ran to the end.
///
/// Every selected entry missing from `failures` is present and verified
/// on disk.
#[derive(Debug, Default)]
pub struct JobResult {
    /// Entry name to the error that stopped it
    pub failures: HashMap<String, Error>,
    /// Files renamed onto their final path by this job
    pub committed: usize,
    /// Files that were already correct
    pub skipped: usize,
    /// Directory entries created
    pub directories: usize,
}

impl JobResult {
    /// Returns true if no entry failed
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Drives download jobs for one archive source.
///
/// One job at a time: a second concurrent [`run`](Self::run) fails with
/// [`Error::JobInProgress`].
///
/// ## Example
///
/// ```no_run
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
/// use zipstream::{HttpRangeReader, JobConfig, StreamDownloader};
///
/// # async fn example() -> zipstream::Result<()> {
/// let reader = Arc::new(HttpRangeReader::new("https://example.com/game.zip".into()).await?);
/// let config = JobConfig::new("./game", "./staging");
/// let downloader = StreamDownloader::new(reader, "game.zip", config)?;
///
/// let result = downloader.run(CancellationToken::new()).await?;
/// for (name, error) in &result.failures {
///     eprintln!("{name}: {error}");
/// }
/// # Ok(())
/// # }
/// ```
pub struct StreamDownloader<R: ReadAt + ?Sized> {
    reader: Arc<R>,
    archive_name: String,
    config: Arc<JobConfig>,
    observer: Arc<dyn ProgressObserver>,
    running: AtomicBool,
}

/// Clears the running flag when a job ends, however it ends
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<R: ReadAt + ?Sized + 'static> StreamDownloader<R> {
    /// Create a downloader for `reader`.
    ///
    /// `archive_name` names the central directory cache file.
    pub fn new(reader: Arc<R>, archive_name: impl Into<String>, config: JobConfig) -> Result<Self> {
        config.validate()?;
        let archive_name = archive_name.into();
        if archive_name.is_empty() || archive_name.contains(['/', '\\']) {
            return Err(Error::config(
                "archive_name",
                format!("archive name {archive_name:?} is not a plain file name"),
            ));
        }
        Ok(Self {
            reader,
            archive_name,
            config: Arc::new(config),
            observer: Arc::new(NoopObserver),
            running: AtomicBool::new(false),
        })
    }

    /// Send progress events to `observer`.
    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Location of the central directory cache
    pub fn cache_path(&self) -> PathBuf {
        cache_path(self.config.cache_dir(), &self.archive_name)
    }

    /// Run one job to completion.
    ///
    /// Per-entry failures end up in the returned [`JobResult`]. Fatal errors
    /// (a changed remote, an unreadable archive trailer, cancellation) are
    /// returned as `Err`; entries committed before that stay on disk.
    pub async fn run(&self, cancel: CancellationToken) -> Result<JobResult> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::JobInProgress);
        }
        let _guard = RunningGuard(&self.running);

        self.config.prepare_dirs().await?;
        let cache = self.cache_path();

        let image = match self.load_central_directory(&cache, &cancel).await {
            Ok((image, CacheOutcome::Hit)) => image,
            Ok((image, CacheOutcome::Fetched)) => {
                // Sidecars only survive while the cache vouches for their source
                let removed = purge_sidecars(&self.config.staging_dir).await?;
                if removed > 0 {
                    tracing::info!(removed, "deleted sidecars of an unverified source version");
                }
                image
            }
            Err(e) => {
                if matches!(e, Error::RemoteContentChanged) {
                    self.discard_source_state(&cache).await;
                }
                tracing::error!(error = %e, "failed to read central directory");
                return Err(e);
            }
        };

        let failures: FailureMap = Arc::new(Mutex::new(HashMap::new()));
        let (directories, files): (Vec<_>, Vec<_>) = image
            .into_entries()
            .into_iter()
            .filter(|entry| self.config.filter.matches(&entry.name))
            .partition(ArchiveEntry::is_directory);

        let created = self.create_directories(&directories, &failures, &cancel).await?;

        let mut tasks = Vec::with_capacity(files.len());
        for entry in files {
            let name = entry.name.clone();
            match EntryTask::new(entry, &self.config) {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    tracing::warn!(entry = %name, error = %e, "skipping entry");
                    record_failure(&failures, &name, e);
                }
            }
        }
        tracing::info!(
            files = tasks.len(),
            directories = created,
            "starting download job"
        );

        let job_cancel = cancel.child_token();
        let ctx = Arc::new(StageContext {
            reader: self.reader.clone(),
            config: self.config.clone(),
            observer: self.observer.clone(),
            cancel: job_cancel.clone(),
            failures: failures.clone(),
            committed: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
        });
        let outcome = run_stages(ctx.clone(), tasks).await;

        if cancel.is_cancelled() {
            tracing::info!("download job cancelled");
            return Err(Error::Cancelled);
        }
        if let Err(e) = outcome {
            tracing::error!(error = %e, "download job aborted");
            if matches!(e, Error::RemoteContentChanged) {
                self.discard_source_state(&cache).await;
            }
            return Err(e);
        }

        let failures = std::mem::take(
            &mut *failures
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        if failures.is_empty() && !self.config.keep_central_directory_cache {
            invalidate_cache(&cache).await;
        }

        let result = JobResult {
            failures,
            committed: ctx.committed.load(Ordering::Relaxed),
            skipped: ctx.skipped.load(Ordering::Relaxed),
            directories: created,
        };
        tracing::info!(
            committed = result.committed,
            skipped = result.skipped,
            failed = result.failures.len(),
            "download job finished"
        );
        Ok(result)
    }

    async fn load_central_directory(
        &self,
        cache: &Path,
        cancel: &CancellationToken,
    ) -> Result<(CentralDirectoryImage, CacheOutcome)> {
        self.observer.on_event(&ProgressEvent::started(
            ProcessingStage::DownloadingCentralDirectory,
            None,
            0,
        ));
        let (image, outcome) = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            loaded = CentralDirectoryImage::load_or_fetch(self.reader.as_ref(), cache) => loaded?,
        };
        let len = image.as_bytes().len() as u64;
        self.observer.on_event(&ProgressEvent::finished(
            ProcessingStage::DownloadingCentralDirectory,
            None,
            len,
            len,
        ));
        Ok((image, outcome))
    }

    /// Forget everything fetched from a source version that is gone.
    async fn discard_source_state(&self, cache: &Path) {
        invalidate_cache(cache).await;
        if let Err(e) = purge_sidecars(&self.config.staging_dir).await {
            tracing::warn!(
                path = %self.config.staging_dir.display(),
                error = %e,
                "failed to delete sidecars"
            );
        }
    }

    /// Create directory entries in the target tree, and in the staging tree
    /// when sidecars are used.
    async fn create_directories(
        &self,
        directories: &[ArchiveEntry],
        failures: &FailureMap,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let mut created = 0;
        for entry in directories {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.observer.on_event(&ProgressEvent::started(
                ProcessingStage::CreatingDirectory,
                Some(&entry.name),
                0,
            ));
            match self.create_directory(entry).await {
                Ok(()) => {
                    created += 1;
                    self.observer.on_event(&ProgressEvent::finished(
                        ProcessingStage::CreatingDirectory,
                        Some(&entry.name),
                        0,
                        0,
                    ));
                }
                Err(e) => {
                    tracing::warn!(entry = %entry.name, error = %e, "failed to create directory");
                    self.observer.on_event(&ProgressEvent::failed(
                        ProcessingStage::CreatingDirectory,
                        Some(&entry.name),
                        &e,
                    ));
                    record_failure(failures, &entry.name, e);
                }
            }
        }
        Ok(created)
    }

    async fn create_directory(&self, entry: &ArchiveEntry) -> Result<()> {
        let relative = sanitize_entry_path(&entry.name)?;
        let mut dirs = vec![self.config.target_dir.join(&relative)];
        if self.config.delivery == DeliveryMode::CompressedFile {
            dirs.push(self.config.staging_dir.join(&relative));
        }
        for dir in dirs {
            tokio::fs::create_dir_all(&dir).await?;
            if let Some(modified) = entry.modified() {
                stamp_directory(dir, modified).await;
            }
        }
        Ok(())
    }
}

/// Wire the stage workers together and wait for all of them.
///
/// The first non-cancellation error cancels the remaining workers and is
/// returned once they have all stopped.
async fn run_stages<R: ReadAt + ?Sized + 'static>(
    ctx: Arc<StageContext<R>>,
    tasks: Vec<EntryTask>,
) -> Result<()> {
    let total = tasks.len();
    let workers = |configured: usize| configured.min(total).max(1);

    let (verify_tx, verify_rx) = mpsc::unbounded_channel();
    let (download_tx, download_rx) = mpsc::unbounded_channel();
    let (extract_tx, extract_rx) = mpsc::unbounded_channel();
    let (commit_tx, commit_rx) = mpsc::unbounded_channel();

    for task in tasks {
        // The receiver is alive until the verify workers are spawned
        let _ = verify_tx.send(task);
    }
    drop(verify_tx);

    let verify_rx = shared_receiver(verify_rx);
    let download_rx = shared_receiver(download_rx);
    let extract_rx = shared_receiver(extract_rx);
    let commit_rx = shared_receiver(commit_rx);

    let mut set = JoinSet::new();
    for _ in 0..workers(ctx.config.verify_workers) {
        set.spawn(verify_stage(
            ctx.clone(),
            verify_rx.clone(),
            download_tx.clone(),
        ));
    }
    for _ in 0..workers(ctx.config.download_workers) {
        set.spawn(download_stage(
            ctx.clone(),
            download_rx.clone(),
            extract_tx.clone(),
        ));
    }
    for _ in 0..workers(ctx.config.extract_workers) {
        set.spawn(extract_stage(
            ctx.clone(),
            extract_rx.clone(),
            commit_tx.clone(),
        ));
    }
    set.spawn(commit_stage(ctx.clone(), commit_rx));
    // Only workers hold senders now, so each channel closes with its producers
    drop(download_tx);
    drop(extract_tx);
    drop(commit_tx);

    let mut first_error = None;
    while let Some(joined) = set.join_next().await {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => continue,
        };
        match outcome {
            Ok(()) => {}
            Err(Error::Cancelled) => ctx.cancel.cancel(),
            Err(e) => {
                ctx.cancel.cancel();
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None if ctx.cancel.is_cancelled() => Err(Error::Cancelled),
        None => Ok(()),
    }
}

async fn stamp_directory(dir: PathBuf, modified: SystemTime) {
    let stamped = tokio::task::spawn_blocking(move || {
        std::fs::File::open(&dir).and_then(|handle| handle.set_modified(modified))
    })
    .await;
    match stamped {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!(error = %e, "could not stamp directory time"),
        Err(e) => tracing::debug!(error = %e, "directory stamping task failed"),
    }
}

async fn invalidate_cache(cache: &Path) {
    if let Err(e) = CentralDirectoryImage::invalidate(cache).await {
        tracing::warn!(path = %cache.display(), error = %e, "failed to delete central directory cache");
    }
}
