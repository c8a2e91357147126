use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{DeliveryMode, JobConfig, RetryConfig};
use crate::filter::EntryFilter;

#[derive(Parser, Debug)]
#[command(name = "zipstream")]
#[command(version)]
#[command(
    about = "Download and extract entries of a remote ZIP archive using HTTP Range requests",
    long_about = None
)]
#[command(after_help = "Examples:\n  \
  zipstream https://example.com/game.zip -d game          fetch everything into ./game\n  \
  zipstream https://example.com/game.zip '*.pck' -x cache  only .pck files, nothing from cache\n  \
  zipstream -l https://example.com/game.zip               list files from remote ZIP")]
pub struct Cli {
    /// ZIP file path or HTTP URL
    #[arg(value_name = "SOURCE")]
    pub source: String,

    /// Entries to extract, by name or glob (default: all)
    #[arg(value_name = "PATTERNS")]
    pub patterns: Vec<String>,

    /// Extract files into DIR
    #[arg(short = 'd', value_name = "DIR", default_value = ".")]
    pub extract_dir: PathBuf,

    /// Directory for sidecar archives and the central directory cache
    /// (default: <DIR>/.zipstream)
    #[arg(long, value_name = "DIR")]
    pub staging: Option<PathBuf>,

    /// Directory for the central directory cache (default: staging directory)
    #[arg(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Decompress straight from the network instead of through sidecar archives
    #[arg(long)]
    pub stream: bool,

    /// Exclude entries that follow
    #[arg(short = 'x', value_name = "PATTERN", num_args = 1..)]
    pub exclude: Vec<String>,

    /// List files
    #[arg(short = 'l')]
    pub list: bool,

    /// Verbose listing and progress logging
    #[arg(short = 'v')]
    pub verbose: bool,

    /// Re-download files even if they already exist
    #[arg(long)]
    pub no_verify_existing: bool,

    /// Skip the CRC32 check of existing files (size only)
    #[arg(long)]
    pub no_verify_existing_crc: bool,

    /// Skip the CRC32 check of extracted files
    #[arg(long)]
    pub no_verify_extracted: bool,

    /// Also compare modification times of existing files
    #[arg(long)]
    pub check_time: bool,

    /// Workers checking existing files
    #[arg(long, value_name = "N")]
    pub verify_jobs: Option<usize>,

    /// Workers downloading entries
    #[arg(long, value_name = "N")]
    pub download_jobs: Option<usize>,

    /// Workers extracting entries
    #[arg(long, value_name = "N")]
    pub extract_jobs: Option<usize>,

    /// Retries per entry after a network failure
    #[arg(long, value_name = "N")]
    pub retries: Option<u32>,

    /// Delay between retries in milliseconds
    #[arg(long, value_name = "MS")]
    pub retry_delay_ms: Option<u64>,

    /// Keep sidecar archives after extraction
    #[arg(long)]
    pub keep_sidecars: bool,

    /// Keep the central directory cache after a successful run
    #[arg(long)]
    pub keep_cache: bool,

    /// Only run structural checks on local headers
    #[arg(long)]
    pub skip_header_checks: bool,
}

impl Cli {
    pub fn is_http_url(&self) -> bool {
        self.source.starts_with("http://") || self.source.starts_with("https://")
    }

    /// File name used for the central directory cache
    pub fn archive_name(&self) -> String {
        let path = self
            .source
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .trim_end_matches('/');
        Path::new(path)
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .filter(|s| !s.is_empty() && !s.contains(':'))
            .unwrap_or_else(|| "archive.zip".to_string())
    }

    /// Build the job configuration. Unset options keep their defaults.
    pub fn to_job_config(&self) -> JobConfig {
        let defaults = JobConfig::default();
        let staging = self
            .staging
            .clone()
            .unwrap_or_else(|| self.extract_dir.join(".zipstream"));
        let retry_defaults = RetryConfig::default();

        JobConfig {
            target_dir: self.extract_dir.clone(),
            staging_dir: staging,
            cache_dir: self.cache_dir.clone(),
            verify_workers: self.verify_jobs.unwrap_or(defaults.verify_workers),
            download_workers: self.download_jobs.unwrap_or(defaults.download_workers),
            extract_workers: self.extract_jobs.unwrap_or(defaults.extract_workers),
            verify_existing: !self.no_verify_existing,
            verify_existing_crc: !self.no_verify_existing_crc,
            verify_existing_timestamps: self.check_time,
            verify_extracted: !self.no_verify_extracted,
            delivery: if self.stream {
                DeliveryMode::Streaming
            } else {
                DeliveryMode::CompressedFile
            },
            filter: EntryFilter::new(self.patterns.clone(), self.exclude.clone()),
            retry: RetryConfig {
                max_attempts: self.retries.unwrap_or(retry_defaults.max_attempts),
                delay: self
                    .retry_delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or(retry_defaults.delay),
            },
            keep_sidecars: self.keep_sidecars,
            keep_central_directory_cache: self.keep_cache,
            skip_local_header_checks: self.skip_header_checks,
        }
    }
}
