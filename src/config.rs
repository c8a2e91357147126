//! Configuration of a download job.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::filter::EntryFilter;

/// Upper bound for the verify and extract worker pools
pub const MAX_CPU_WORKERS: usize = 30;
/// Upper bound for the download worker pool
pub const MAX_DOWNLOAD_WORKERS: usize = 20;
/// Upper bound for retry attempts
pub const MAX_RETRY_ATTEMPTS: u32 = 20;

/// How entry data travels from the source to the target directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Copy the compressed entry into a sidecar archive in the staging
    /// directory, then extract from it
    #[default]
    CompressedFile,
    /// Decompress straight from the range stream
    Streaming,
}

/// Retry behaviour for network-class failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first failure (default: 10)
    pub max_attempts: u32,
    /// Delay between attempts (default: 1 second)
    pub delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay: Duration::from_secs(1),
        }
    }
}

/// Parameters of one download job
#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Where entries are committed
    pub target_dir: PathBuf,
    /// Where sidecar archives are kept
    pub staging_dir: PathBuf,
    /// Where the central directory cache lives (default: staging directory)
    pub cache_dir: Option<PathBuf>,
    /// Workers checking existing files (1..=30)
    pub verify_workers: usize,
    /// Workers fetching entries (1..=20, default 10)
    pub download_workers: usize,
    /// Workers extracting and checksumming (1..=30)
    pub extract_workers: usize,
    /// Skip entries whose target file is already correct
    pub verify_existing: bool,
    /// Include the CRC32 in the existing-file check
    pub verify_existing_crc: bool,
    /// Include the modification time in the existing-file check
    pub verify_existing_timestamps: bool,
    /// Check CRC32 and size of every extracted file
    pub verify_extracted: bool,
    /// Sidecar archives or direct streaming
    pub delivery: DeliveryMode,
    /// Which entries take part in the job
    pub filter: EntryFilter,
    /// Retry policy for the download stage
    pub retry: RetryConfig,
    /// Keep sidecar archives after their entry is committed
    pub keep_sidecars: bool,
    /// Keep the central directory cache after a job without failures
    pub keep_central_directory_cache: bool,
    /// Only run the structural local header checks
    pub skip_local_header_checks: bool,
}

impl Default for JobConfig {
    fn default() -> Self {
        let cpus = default_cpu_workers();
        Self {
            target_dir: PathBuf::from("."),
            staging_dir: std::env::temp_dir().join("zipstream"),
            cache_dir: None,
            verify_workers: cpus,
            download_workers: 10,
            extract_workers: cpus,
            verify_existing: true,
            verify_existing_crc: true,
            verify_existing_timestamps: false,
            verify_extracted: true,
            delivery: DeliveryMode::default(),
            filter: EntryFilter::default(),
            retry: RetryConfig::default(),
            keep_sidecars: false,
            keep_central_directory_cache: false,
            skip_local_header_checks: false,
        }
    }
}

impl JobConfig {
    /// Configuration extracting into `target_dir` with sidecars under `staging_dir`
    pub fn new(target_dir: impl Into<PathBuf>, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            target_dir: target_dir.into(),
            staging_dir: staging_dir.into(),
            ..Self::default()
        }
    }

    /// Directory holding the central directory cache
    pub fn cache_dir(&self) -> &PathBuf {
        self.cache_dir.as_ref().unwrap_or(&self.staging_dir)
    }

    /// Check ranges of all numeric settings.
    pub fn validate(&self) -> Result<()> {
        check_range("verify_workers", self.verify_workers, MAX_CPU_WORKERS)?;
        check_range("download_workers", self.download_workers, MAX_DOWNLOAD_WORKERS)?;
        check_range("extract_workers", self.extract_workers, MAX_CPU_WORKERS)?;
        check_range(
            "retry.max_attempts",
            self.retry.max_attempts as usize,
            MAX_RETRY_ATTEMPTS as usize,
        )?;
        if self.target_dir.as_os_str().is_empty() {
            return Err(Error::config("target_dir", "target directory must be set"));
        }
        if self.staging_dir.as_os_str().is_empty() {
            return Err(Error::config("staging_dir", "staging directory must be set"));
        }
        // Sidecar purges walk the staging tree
        if self.target_dir.starts_with(&self.staging_dir) {
            return Err(Error::config(
                "staging_dir",
                "staging directory must not contain the target directory",
            ));
        }
        Ok(())
    }

    /// Create the target, staging and cache directories.
    pub async fn prepare_dirs(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.target_dir).await?;
        tokio::fs::create_dir_all(&self.staging_dir).await?;
        tokio::fs::create_dir_all(self.cache_dir()).await?;
        Ok(())
    }
}

fn check_range(key: &str, value: usize, max: usize) -> Result<()> {
    if value == 0 || value > max {
        return Err(Error::config(
            key,
            format!("{key} must be between 1 and {max}, got {value}"),
        ));
    }
    Ok(())
}

fn default_cpu_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .clamp(1, MAX_CPU_WORKERS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = JobConfig::default();
        config.validate().unwrap();
        assert_eq!(config.download_workers, 10);
        assert_eq!(config.retry.max_attempts, 10);
        assert_eq!(config.retry.delay, Duration::from_secs(1));
        assert_eq!(config.delivery, DeliveryMode::CompressedFile);
        assert!(config.verify_existing && config.verify_existing_crc);
        assert!(!config.verify_existing_timestamps);
        assert_eq!(config.cache_dir(), &config.staging_dir);
    }

    #[test]
    fn test_out_of_range_values() {
        let config = JobConfig {
            download_workers: 21,
            ..JobConfig::default()
        };
        match config.validate() {
            Err(Error::Config { key, .. }) => assert_eq!(key.as_deref(), Some("download_workers")),
            other => panic!("unexpected {other:?}"),
        }

        let config = JobConfig {
            verify_workers: 0,
            ..JobConfig::default()
        };
        assert!(config.validate().is_err());

        let mut config = JobConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        // Staging inside the target is fine, the other way round is not
        JobConfig::new("/game", "/game/.zipstream").validate().unwrap();
        for (target, staging) in [("/game", "/game"), ("/stage/out", "/stage")] {
            match JobConfig::new(target, staging).validate() {
                Err(Error::Config { key, .. }) => assert_eq!(key.as_deref(), Some("staging_dir")),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_prepare_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = JobConfig::new(dir.path().join("out"), dir.path().join("tmp"));
        config.cache_dir = Some(dir.path().join("cache"));
        config.prepare_dirs().await.unwrap();
        assert!(dir.path().join("out").is_dir());
        assert!(dir.path().join("tmp").is_dir());
        assert!(dir.path().join("cache").is_dir());
    }
}
