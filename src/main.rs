//! Main entry point for the zipstream CLI application.
//!
//! Lists or extracts a ZIP archive given as a local path or an HTTP URL.
//! Extraction runs a download job and exits non-zero if any entry failed.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use zipstream::{
    Cli, HttpRangeReader, LocalFileReader, ReadAt, RemoteArchive, StreamDownloader, TransferStats,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let succeeded = if cli.is_http_url() {
        let reader = Arc::new(HttpRangeReader::new(cli.source.clone()).await?);
        let succeeded = process_zip(reader.clone(), &cli).await?;

        // Display network transfer statistics for HTTP sources
        eprintln!(
            "\nTotal bytes transferred: {}",
            format_size(reader.transferred_bytes())
        );
        succeeded
    } else {
        let reader = Arc::new(
            LocalFileReader::new(Path::new(&cli.source))
                .with_context(|| format!("cannot open {}", cli.source))?,
        );
        process_zip(reader, &cli).await?
    };

    if !succeeded {
        std::process::exit(1);
    }
    Ok(())
}

/// `-v` raises the default level from warn to info; `RUST_LOG` wins.
fn init_tracing(verbose: bool) {
    let default = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// List or extract. Returns false if any entry failed.
async fn process_zip<R: ReadAt + 'static>(reader: Arc<R>, cli: &Cli) -> Result<bool> {
    if cli.list {
        list_files(&RemoteArchive::new(reader), cli.verbose).await?;
        return Ok(true);
    }

    let stats = Arc::new(TransferStats::new());
    let downloader = StreamDownloader::new(reader, cli.archive_name(), cli.to_job_config())?
        .with_observer(stats.clone());

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted, stopping...");
            on_signal.cancel();
        }
    });

    let result = downloader.run(cancel).await?;
    let snapshot = stats.snapshot();

    println!(
        "{} extracted, {} up to date, {} directories, {} failed",
        result.committed,
        result.skipped,
        result.directories,
        result.failures.len()
    );
    if cli.verbose {
        println!(
            "Sidecar bytes: {}, extracted bytes: {}",
            format_size(snapshot.downloaded_bytes),
            format_size(snapshot.extracted_bytes)
        );
    }

    let mut failures: Vec<_> = result.failures.iter().collect();
    failures.sort_by(|a, b| a.0.cmp(b.0));
    for (name, error) in failures {
        eprintln!("  failed: {name}: {error}");
    }

    Ok(result.is_success())
}

/// List files in the ZIP archive.
///
/// Supports two output formats:
/// - Simple format (`-l`): Just file names, one per line
/// - Verbose format (`-l -v`): Detailed table with size, compression ratio, and timestamps
async fn list_files<R: ReadAt + 'static>(archive: &RemoteArchive<R>, verbose: bool) -> Result<()> {
    let entries = archive.list_files().await?;

    if !verbose {
        for entry in &entries {
            println!("{}", entry.name);
        }
        return Ok(());
    }

    println!(
        "{:>10}  {:>10}  {:>5}  {:>6}  {:>10}  {:>5}  {:>8}  Name",
        "Length", "Size", "Cmpr", "Method", "Date", "Time", "CRC-32"
    );
    println!("{}", "-".repeat(80));

    let mut total_uncompressed = 0u64;
    let mut total_compressed = 0u64;
    let mut file_count = 0usize;

    for entry in &entries {
        let (year, month, day) = entry.mod_date();
        let (hour, minute, _second) = entry.mod_time();
        println!(
            "{:>10}  {:>10}  {}  {:>6}  {:04}-{:02}-{:02}  {:02}:{:02}  {:08x}  {}",
            entry.uncompressed_size,
            entry.compressed_size,
            ratio(entry.compressed_size, entry.uncompressed_size),
            method_label(entry.compression_method),
            year,
            month,
            day,
            hour,
            minute,
            entry.crc32,
            entry.name
        );

        if !entry.is_directory() {
            total_uncompressed += entry.uncompressed_size;
            total_compressed += entry.compressed_size;
            file_count += 1;
        }
    }

    println!("{}", "-".repeat(80));
    println!(
        "{:>10}  {:>10}  {}  {:>43}  {} files",
        total_uncompressed,
        total_compressed,
        ratio(total_compressed, total_uncompressed),
        "",
        file_count
    );

    Ok(())
}

/// Percentage saved by compression
fn ratio(compressed: u64, uncompressed: u64) -> String {
    if uncompressed > 0 && compressed <= uncompressed {
        format!("{:>4}%", 100 - (compressed * 100 / uncompressed))
    } else {
        "  0%".to_string()
    }
}

fn method_label(method: zipstream::CompressionMethod) -> String {
    match method {
        zipstream::CompressionMethod::Stored => "Stored".to_string(),
        zipstream::CompressionMethod::Deflate => "Defl".to_string(),
        zipstream::CompressionMethod::BZip2 => "BZip2".to_string(),
        zipstream::CompressionMethod::Unknown(id) => format!("#{id}"),
    }
}

/// Format a byte size into a human-readable string.
fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} bytes", size)
    }
}
