//! Central directory reconstruction from the tail of a remote archive,
//! and the on-disk cache of the result.

use std::path::{Path, PathBuf};

use super::format::write_end_of_central_directory;
use super::parser::{ZipParser, find_eocd, find_zip64_locator, parse_central_directory};
use super::structures::*;
use crate::error::{Error, Result};
use crate::io::ReadAt;

/// First tail window fetched when looking for the EOCD.
const INITIAL_WINDOW: u64 = 1024;
/// Largest tail that can still hold an EOCD with a maximal comment.
const EOCD_SEARCH_LIMIT: u64 = MAX_COMMENT_SIZE + EndOfCentralDirectory::SIZE as u64;

/// Prefix written into the comment of every synthesized image.
const FINGERPRINT_PREFIX: &str = "zipstream-source:";

/// Extension of central directory cache files.
pub const CACHE_EXTENSION: &str = "zipcdr";

/// Where [`CentralDirectoryImage::load_or_fetch`] got its image from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// A cache file built from the current version of the source
    Hit,
    /// Fetched from the source; any previous cache file was missing,
    /// stale or corrupt
    Fetched,
}

/// The central directory of a remote archive, standalone.
///
/// The image is itself a valid ZIP file with no entry data: the central
/// directory records copied verbatim from the source (so entry offsets
/// still point into the source), followed by a synthesized EOCD whose
/// comment records the fingerprint of the source it was built from.
#[derive(Debug, Clone)]
pub struct CentralDirectoryImage {
    bytes: Vec<u8>,
    entries: Vec<ArchiveEntry>,
    fingerprint: String,
}

impl CentralDirectoryImage {
    /// Fetch the central directory of `reader`.
    ///
    /// Only the tail of the source is read: first the last 1 KiB, doubling
    /// until the EOCD turns up or the maximum comment length is covered,
    /// then whatever part of the central directory is not buffered yet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ArchiveStructure`] if no valid EOCD (or ZIP64 EOCD)
    /// exists within the search bounds.
    pub async fn fetch<R: ReadAt + ?Sized>(reader: &R) -> Result<Self> {
        let size = reader.size();
        let mut tail = TailBuffer::new(size);

        tail.grow(reader, INITIAL_WINDOW.min(size)).await?;
        let (eocd_pos, eocd) = loop {
            if let Some(found) = find_eocd(&tail.data) {
                break found;
            }
            let limit = EOCD_SEARCH_LIMIT.min(size);
            if tail.len() >= limit {
                return Err(Error::ArchiveStructure(format!(
                    "end of central directory not found in the last {} bytes",
                    tail.len()
                )));
            }
            tail.grow(reader, (tail.len() * 2).min(limit)).await?;
        };
        let eocd_abs = tail.start + eocd_pos as u64;

        let (entries, cd_size, cd_offset, cd_limit) = if eocd.is_zip64() {
            let missing_locator = || {
                Error::ArchiveStructure(
                    "ZIP64 end of central directory locator not found".to_string(),
                )
            };
            // The locator has a fixed slot right before the EOCD
            let locator_abs = eocd_abs
                .checked_sub(Zip64EOCDLocator::SIZE as u64)
                .ok_or_else(missing_locator)?;
            tail.grow(reader, size - locator_abs).await?;
            let locator = find_zip64_locator(&tail.data, (eocd_abs - tail.start) as usize)?
                .ok_or_else(missing_locator)?;

            let record_offset = locator.eocd64_offset;
            if record_offset
                .checked_add(Zip64EOCD::MIN_SIZE as u64)
                .is_none_or(|end| end > locator_abs)
            {
                return Err(Error::ArchiveStructure(format!(
                    "ZIP64 end of central directory offset {record_offset} out of range"
                )));
            }
            let mut record = [0u8; Zip64EOCD::MIN_SIZE];
            match tail.slice(record_offset, record.len() as u64) {
                Some(buffered) => record.copy_from_slice(buffered),
                None => reader.read_exact_at(record_offset, &mut record).await?,
            }
            let eocd64 = Zip64EOCD::from_bytes(&record)?;
            (
                eocd64.total_entries,
                eocd64.cd_size,
                eocd64.cd_offset,
                record_offset,
            )
        } else {
            (
                eocd.total_entries as u64,
                eocd.cd_size as u64,
                eocd.cd_offset as u64,
                eocd_abs,
            )
        };

        if cd_offset.checked_add(cd_size).is_none_or(|end| end > cd_limit) {
            return Err(Error::ArchiveStructure(format!(
                "central directory ({cd_size} bytes at {cd_offset}) overlaps its trailer"
            )));
        }

        let cd_end = cd_offset + cd_size;
        let cd = if let Some(buffered) = tail.slice(cd_offset, cd_size) {
            buffered.to_vec()
        } else if cd_end <= tail.start {
            reader.read_range(cd_offset, cd_end).await?
        } else {
            // Stream the part in front of the buffer, reuse the rest
            let mut cd = reader.read_range(cd_offset, tail.start).await?;
            cd.extend_from_slice(&tail.data[..(cd_end - tail.start) as usize]);
            cd
        };

        tracing::debug!(
            entries,
            cd_size,
            cd_offset,
            tail = tail.len(),
            "fetched central directory"
        );

        let parsed = parse_central_directory(&cd, entries)?;
        Self::assemble(cd, parsed, source_fingerprint(reader))
    }

    /// Parse a previously stored image.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let parser = ZipParser::new(&bytes);
        let trailer = parser.trailer()?;
        let entries = parser.list_files()?;
        let fingerprint = std::str::from_utf8(&trailer.comment)
            .ok()
            .and_then(|c| c.strip_prefix(FINGERPRINT_PREFIX))
            .unwrap_or_default()
            .to_string();
        Ok(Self {
            bytes,
            entries,
            fingerprint,
        })
    }

    fn assemble(cd: Vec<u8>, entries: Vec<ArchiveEntry>, fingerprint: String) -> Result<Self> {
        let cd_size = cd.len() as u64;
        let mut bytes = cd;
        let comment = format!("{FINGERPRINT_PREFIX}{fingerprint}");
        write_end_of_central_directory(
            &mut bytes,
            entries.len() as u64,
            cd_size,
            0,
            comment.as_bytes(),
        )?;
        Ok(Self {
            bytes,
            entries,
            fingerprint,
        })
    }

    /// Entries in central directory order.
    pub fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    /// Consume the image, keeping only the entries.
    pub fn into_entries(self) -> Vec<ArchiveEntry> {
        self.entries
    }

    /// The serialized image.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Fingerprint of the source the image was built from.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Load a cached image for `reader`, or fetch and store a fresh one.
    ///
    /// A cache file that does not parse or belongs to a different version
    /// of the source is deleted before fetching.
    pub async fn load_or_fetch<R: ReadAt + ?Sized>(
        reader: &R,
        cache_path: &Path,
    ) -> Result<(Self, CacheOutcome)> {
        if let Some(image) = Self::load_cached(reader, cache_path).await? {
            tracing::info!(path = %cache_path.display(), "using cached central directory");
            return Ok((image, CacheOutcome::Hit));
        }

        let image = Self::fetch(reader).await?;
        if let Err(e) = image.store(cache_path).await {
            tracing::warn!(
                path = %cache_path.display(),
                error = %e,
                "failed to write central directory cache"
            );
        }
        Ok((image, CacheOutcome::Fetched))
    }

    /// Read the cache file, discarding it when stale or corrupt.
    pub async fn load_cached<R: ReadAt + ?Sized>(
        reader: &R,
        cache_path: &Path,
    ) -> Result<Option<Self>> {
        let bytes = match tokio::fs::read(cache_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match Self::from_bytes(bytes) {
            Ok(image) if image.fingerprint == source_fingerprint(reader) => Ok(Some(image)),
            Ok(_) => {
                tracing::warn!(path = %cache_path.display(), "central directory cache is stale");
                Self::invalidate(cache_path).await?;
                Ok(None)
            }
            Err(e) => {
                tracing::warn!(
                    path = %cache_path.display(),
                    error = %e,
                    "central directory cache is corrupt"
                );
                Self::invalidate(cache_path).await?;
                Ok(None)
            }
        }
    }

    /// Write the image to `cache_path`, creating parent directories.
    pub async fn store(&self, cache_path: &Path) -> Result<()> {
        if let Some(parent) = cache_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(cache_path, &self.bytes).await?;
        Ok(())
    }

    /// Delete the cache file if it exists.
    pub async fn invalidate(cache_path: &Path) -> Result<()> {
        match tokio::fs::remove_file(cache_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Cache file location for the archive called `archive_name`.
pub fn cache_path(cache_dir: &Path, archive_name: &str) -> PathBuf {
    cache_dir.join(format!("{archive_name}.{CACHE_EXTENSION}"))
}

/// Identity of the source content: total length plus validator.
pub fn source_fingerprint<R: ReadAt + ?Sized>(reader: &R) -> String {
    format!(
        "{}:{}",
        reader.size(),
        reader.validator().unwrap_or_default()
    )
}

/// The last bytes of the source, grown towards the front on demand.
struct TailBuffer {
    data: Vec<u8>,
    /// Absolute offset of `data[0]`
    start: u64,
}

impl TailBuffer {
    fn new(source_size: u64) -> Self {
        Self {
            data: Vec::new(),
            start: source_size,
        }
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    /// Extend the buffer to the last `window` bytes, fetching only the new
    /// prefix.
    async fn grow<R: ReadAt + ?Sized>(&mut self, reader: &R, window: u64) -> Result<()> {
        if window <= self.len() {
            return Ok(());
        }
        let end = self.start;
        let start = end - (window - self.len());
        let mut data = reader.read_range(start, end).await?;
        data.extend_from_slice(&self.data);
        self.data = data;
        self.start = start;
        Ok(())
    }

    /// Buffered bytes for `[offset, offset + len)`, if fully covered.
    fn slice(&self, offset: u64, len: u64) -> Option<&[u8]> {
        let from = usize::try_from(offset.checked_sub(self.start)?).ok()?;
        let to = from.checked_add(usize::try_from(len).ok()?)?;
        self.data.get(from..to)
    }
}
