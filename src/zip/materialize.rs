//! Turning one entry of a remote archive into bytes on disk.
//!
//! Two strategies are offered. A sidecar archive copies the entry's local
//! header, payload and descriptor verbatim into a small local file and
//! appends a single-record central directory, so the file is a valid ZIP on
//! its own. A direct stream decompresses the payload while it arrives and
//! never stores compressed bytes.

use async_compression::tokio::bufread::{BzDecoder, DeflateDecoder};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

use super::directory::CentralDirectoryImage;
use super::format::{write_central_header, write_end_of_central_directory};
use super::locator::{LocatedEntry, locate_entry};
use super::structures::*;
use crate::error::{Error, Result};
use crate::io::{COPY_BUFFER_SIZE, LocalFileReader, RangeStream, ReadAt, copy_cancellable};

/// An entry as it appears inside its sidecar archive.
///
/// Derived from the source [`ArchiveEntry`], which is left untouched; only
/// the local header offset (always 0) and the stored name differ.
#[derive(Debug, Clone)]
pub struct RehydratedEntry {
    /// Entry metadata relative to the sidecar file
    pub entry: ArchiveEntry,
    /// Location of the sidecar file
    pub path: PathBuf,
    /// Length of the copied local record (header, payload, descriptor)
    pub record_len: u64,
    /// Bytes fetched from the source by this call
    pub fetched: u64,
}

/// Copy `entry` from `reader` into a standalone archive at `sidecar`.
///
/// A sidecar left behind by an interrupted attempt is resumed from its
/// current length. `on_progress` receives the size of every fetched chunk.
pub async fn fetch_entry_archive<R, F>(
    reader: &R,
    entry: &ArchiveEntry,
    sidecar: &Path,
    strict: bool,
    cancel: &CancellationToken,
    mut on_progress: F,
) -> Result<RehydratedEntry>
where
    R: ReadAt + ?Sized,
    F: FnMut(u64),
{
    let located = locate_entry(reader, entry, strict).await?;
    let record_len = located.record_end(entry) - entry.offset;

    if let Some(parent) = sidecar.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(sidecar)
        .await?;

    // Anything past the local record is a stale central directory
    let resume_from = file.metadata().await?.len().min(record_len);
    file.set_len(resume_from).await?;
    file.seek(SeekFrom::Start(resume_from)).await?;

    let mut fetched = 0;
    if resume_from < record_len {
        if resume_from > 0 {
            tracing::debug!(entry = %entry.name, resume_from, "resuming sidecar download");
        }
        let mut stream = reader
            .open_range(entry.offset + resume_from, entry.offset + record_len)
            .await?;
        fetched = copy_cancellable(&mut stream, &mut file, cancel, |chunk| {
            on_progress(chunk.len() as u64)
        })
        .await?;
        if resume_from + fetched != record_len {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "{} ended after {} of {} bytes",
                    entry.name,
                    resume_from + fetched,
                    record_len
                ),
            )));
        }
    }

    let rehydrated = ArchiveEntry {
        offset: 0,
        raw_name: located.raw_name,
        ..entry.clone()
    };
    let mut trailer = Vec::new();
    let cd_size = write_central_header(&mut trailer, &rehydrated, 0)?;
    write_end_of_central_directory(&mut trailer, 1, cd_size, record_len, &[])?;
    file.write_all(&trailer).await?;
    file.flush().await?;

    Ok(RehydratedEntry {
        entry: rehydrated,
        path: sidecar.to_path_buf(),
        record_len,
        fetched,
    })
}

/// A sidecar archive opened for extraction.
pub struct SidecarArchive {
    reader: LocalFileReader,
    entry: ArchiveEntry,
    located: LocatedEntry,
}

impl SidecarArchive {
    /// The single entry of the sidecar.
    pub fn entry(&self) -> &ArchiveEntry {
        &self.entry
    }

    /// Open a decompressing stream over the entry.
    pub async fn open_stream(&self) -> Result<RangeStream> {
        open_entry_stream(&self.reader, &self.entry, &self.located).await
    }
}

/// Open a sidecar written by [`fetch_entry_archive`] and test its structure.
///
/// The sidecar must parse as a ZIP with exactly one entry whose local
/// header agrees with its central directory record.
pub async fn open_entry_archive(path: &Path, strict: bool) -> Result<SidecarArchive> {
    let reader = LocalFileReader::new(path)?;
    let mut entries = CentralDirectoryImage::fetch(&reader).await?.into_entries();
    if entries.len() != 1 {
        return Err(Error::ArchiveStructure(format!(
            "sidecar {} holds {} entries",
            path.display(),
            entries.len()
        )));
    }
    let entry = entries.remove(0);
    let located = locate_entry(&reader, &entry, strict).await?;
    Ok(SidecarArchive {
        reader,
        entry,
        located,
    })
}

/// Open a stream yielding the uncompressed content of `entry`.
///
/// Reads exactly the compressed payload range from `reader` and chains
/// the matching decoder over it.
pub async fn open_entry_stream<R: ReadAt + ?Sized>(
    reader: &R,
    entry: &ArchiveEntry,
    located: &LocatedEntry,
) -> Result<RangeStream> {
    if entry.flags & flags::UNSUPPORTED != 0 {
        return Err(Error::UnsupportedFeature(format!(
            "flags 0x{:04x} of {}",
            entry.flags & flags::UNSUPPORTED,
            entry.name
        )));
    }
    if let CompressionMethod::Unknown(method) = entry.compression_method {
        return Err(Error::UnsupportedFeature(format!(
            "compression method {method} of {}",
            entry.name
        )));
    }

    let raw = reader
        .open_range(located.data_start, located.data_end(entry))
        .await?;
    let stream: RangeStream = match entry.compression_method {
        CompressionMethod::Deflate => Box::new(DeflateDecoder::new(BufReader::with_capacity(
            COPY_BUFFER_SIZE,
            raw,
        ))),
        CompressionMethod::BZip2 => Box::new(BzDecoder::new(BufReader::with_capacity(
            COPY_BUFFER_SIZE,
            raw,
        ))),
        _ => raw,
    };
    Ok(stream)
}
