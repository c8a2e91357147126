use flate2::Crc;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::directory::CentralDirectoryImage;
use super::locator::{LocatedEntry, locate_entry};
use super::materialize::{RehydratedEntry, fetch_entry_archive, open_entry_stream};
use super::structures::ArchiveEntry;
use crate::error::{Error, Result};
use crate::io::{RangeStream, ReadAt, copy_cancellable};

/// High-level access to a ZIP archive behind a [`ReadAt`] source.
///
/// This is the main entry point for reading archives without a download
/// job. It provides methods to:
/// - List entries
/// - Stream an entry's uncompressed content
/// - Copy an entry into a standalone sidecar archive
/// - Extract an entry into memory with CRC verification
///
/// ## Example
///
/// ```no_run
/// use std::sync::Arc;
/// use zipstream::{HttpRangeReader, RemoteArchive};
///
/// # async fn example() -> zipstream::Result<()> {
/// let reader = Arc::new(HttpRangeReader::new("https://example.com/file.zip".into()).await?);
/// let archive = RemoteArchive::new(reader);
///
/// let entries = archive.list_files().await?;
/// for entry in &entries {
///     println!("{}: {} bytes", entry.name, entry.uncompressed_size);
/// }
/// # Ok(())
/// # }
/// ```
pub struct RemoteArchive<R: ReadAt + ?Sized> {
    reader: Arc<R>,
    strict: bool,
}

impl<R: ReadAt + ?Sized> RemoteArchive<R> {
    /// Create an archive over `reader` with strict local header checks.
    pub fn new(reader: Arc<R>) -> Self {
        Self {
            reader,
            strict: true,
        }
    }

    /// Enable or disable the strict local header checks.
    pub fn with_strict_checks(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Fetch the central directory from the tail of the source.
    pub async fn central_directory(&self) -> Result<CentralDirectoryImage> {
        CentralDirectoryImage::fetch(self.reader.as_ref()).await
    }

    /// List all entries in central directory order.
    pub async fn list_files(&self) -> Result<Vec<ArchiveEntry>> {
        Ok(self.central_directory().await?.into_entries())
    }

    /// Validate the local header of `entry` and find its payload.
    pub async fn locate(&self, entry: &ArchiveEntry) -> Result<LocatedEntry> {
        locate_entry(self.reader.as_ref(), entry, self.strict).await
    }

    /// Stream the uncompressed content of `entry` straight from the source.
    pub async fn open_entry(&self, entry: &ArchiveEntry) -> Result<RangeStream> {
        let located = self.locate(entry).await?;
        open_entry_stream(self.reader.as_ref(), entry, &located).await
    }

    /// Copy `entry` into a standalone archive at `sidecar`.
    pub async fn fetch_entry_archive<F: FnMut(u64)>(
        &self,
        entry: &ArchiveEntry,
        sidecar: &Path,
        cancel: &CancellationToken,
        on_progress: F,
    ) -> Result<RehydratedEntry> {
        fetch_entry_archive(
            self.reader.as_ref(),
            entry,
            sidecar,
            self.strict,
            cancel,
            on_progress,
        )
        .await
    }

    /// Extract `entry` into memory, checking size and CRC32.
    pub async fn extract_to_memory(&self, entry: &ArchiveEntry) -> Result<Vec<u8>> {
        let mut stream = self.open_entry(entry).await?;
        let mut data = Vec::with_capacity(entry.uncompressed_size.min(1 << 24) as usize);
        let mut crc = Crc::new();
        let cancel = CancellationToken::new();
        let len = copy_cancellable(&mut stream, &mut data, &cancel, |chunk| crc.update(chunk))
            .await?;
        check_integrity(entry, &crc, len)?;
        Ok(data)
    }
}

/// Compare extracted length and CRC32 against the central directory.
pub fn check_integrity(entry: &ArchiveEntry, crc: &Crc, len: u64) -> Result<()> {
    if len != entry.uncompressed_size {
        return Err(Error::SizeMismatch {
            entry: entry.name.clone(),
            expected: entry.uncompressed_size,
            actual: len,
        });
    }
    if crc.sum() != entry.crc32 {
        return Err(Error::Checksum {
            entry: entry.name.clone(),
            expected: entry.crc32,
            actual: crc.sum(),
        });
    }
    Ok(())
}
