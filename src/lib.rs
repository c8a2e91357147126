//! # zipstream
//!
//! Download and extract selected entries of very large remote ZIP archives
//! over HTTP Range requests.
//!
//! Only the archive trailer, the central directory and the records of the
//! selected entries are ever fetched. Entries that are already present and
//! correct on disk are skipped, network failures are retried per entry, and
//! a failing entry never stops its siblings.
//!
//! ## Features
//!
//! - Central directory reconstruction from the archive tail, cached on disk
//! - Support for ZIP64 format (archives larger than 4GB)
//! - Support for STORED, DEFLATE and BZIP2 compression methods
//! - Sidecar archives with resume, or direct decompression from the network
//! - CRC32 and size verification of existing and extracted files
//! - Selective extraction with glob pattern matching
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use zipstream::{HttpRangeReader, JobConfig, RemoteArchive, StreamDownloader};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // Create a reader for a remote ZIP file
//!     let reader = Arc::new(HttpRangeReader::new("https://example.com/archive.zip".to_string()).await?);
//!
//!     // List all files in the archive
//!     let files = RemoteArchive::new(reader.clone()).list_files().await?;
//!     for file in &files {
//!         println!("{}", file.name);
//!     }
//!
//!     // Fetch everything into ./out
//!     let downloader = StreamDownloader::new(reader, "archive.zip", JobConfig::new("out", "out/.staging"))?;
//!     let result = downloader.run(CancellationToken::new()).await?;
//!     println!("{} committed, {} failed", result.committed, result.failures.len());
//!
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod filter;
pub mod io;
pub mod pipeline;
pub mod retry;
pub mod zip;

pub use cli::Cli;
pub use config::{DeliveryMode, JobConfig, RetryConfig};
pub use error::{Error, Result};
pub use filter::EntryFilter;
pub use io::{HttpRangeReader, LocalFileReader, MemoryReader, RangeStream, ReadAt};
pub use pipeline::{
    JobResult, ProcessingStage, ProgressEvent, ProgressObserver, StreamDownloader, TransferStats,
};
pub use zip::{ArchiveEntry, CentralDirectoryImage, CompressionMethod, RemoteArchive};
