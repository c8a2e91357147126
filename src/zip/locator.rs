//! Local file header lookup and validation.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use super::parser::apply_zip64_extra;
use super::structures::*;
use crate::error::{Error, Result};
use crate::io::ReadAt;

/// Extract versions defined by PKWARE up to 6.3.
const KNOWN_VERSIONS: &[u16] = &[10, 11, 20, 21, 25, 27, 45, 46, 50, 51, 52, 61, 62, 63];

/// Where an entry's payload lives in the source archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedEntry {
    /// Absolute offset of the first compressed byte
    pub data_start: u64,
    /// File name bytes exactly as stored in the local header
    pub raw_name: Vec<u8>,
    /// Length of the local header including name and extra field
    pub header_len: u64,
}

impl LocatedEntry {
    /// Absolute offset one past the last compressed byte.
    pub fn data_end(&self, entry: &ArchiveEntry) -> u64 {
        self.data_start.saturating_add(entry.compressed_size)
    }

    /// End of everything belonging to the entry, trailing descriptor included.
    pub fn record_end(&self, entry: &ArchiveEntry) -> u64 {
        self.data_end(entry)
            .saturating_add(entry.data_descriptor_size())
    }
}

/// Fixed fields of a local file header
struct LocalHeader {
    version_needed: u16,
    flags: u16,
    compression_method: u16,
    last_mod_time: u16,
    last_mod_date: u16,
    crc32: u32,
    compressed_size: u64,
    uncompressed_size: u64,
    name_len: u16,
    extra_len: u16,
}

impl LocalHeader {
    fn from_bytes(data: &[u8; LFH_SIZE]) -> Result<Self> {
        let mut cursor = Cursor::new(&data[4..]);
        Ok(Self {
            version_needed: cursor.read_u16::<LittleEndian>()?,
            flags: cursor.read_u16::<LittleEndian>()?,
            compression_method: cursor.read_u16::<LittleEndian>()?,
            last_mod_time: cursor.read_u16::<LittleEndian>()?,
            last_mod_date: cursor.read_u16::<LittleEndian>()?,
            crc32: cursor.read_u32::<LittleEndian>()?,
            compressed_size: cursor.read_u32::<LittleEndian>()? as u64,
            uncompressed_size: cursor.read_u32::<LittleEndian>()? as u64,
            name_len: cursor.read_u16::<LittleEndian>()?,
            extra_len: cursor.read_u16::<LittleEndian>()?,
        })
    }
}

/// Fetch and check the local header of `entry`.
///
/// With `strict` set the header must agree with the central directory
/// record in every field the two share; otherwise only the structural
/// checks needed to find the payload are applied.
///
/// # Errors
///
/// [`Error::LocalHeaderMismatch`] for any inconsistency,
/// [`Error::UnsupportedFeature`] for encrypted, patched or otherwise
/// unsupported entries.
pub async fn locate_entry<R: ReadAt + ?Sized>(
    reader: &R,
    entry: &ArchiveEntry,
    strict: bool,
) -> Result<LocatedEntry> {
    let mismatch = |reason: String| Error::header_mismatch(&entry.name, reason);

    let mut fixed = [0u8; LFH_SIZE];
    reader.read_exact_at(entry.offset, &mut fixed).await?;
    if &fixed[0..4] != LFH_SIGNATURE {
        return Err(mismatch(format!(
            "wrong local header signature at 0x{:x}",
            entry.offset
        )));
    }
    let mut header = LocalHeader::from_bytes(&fixed)?;

    let variable_len = header.name_len as usize + header.extra_len as usize;
    let header_len = LFH_SIZE as u64 + variable_len as u64;
    let data_start = entry
        .offset
        .checked_add(header_len)
        .ok_or_else(|| mismatch(format!("local header offset {} out of range", entry.offset)))?;
    let mut variable = vec![0u8; variable_len];
    reader
        .read_exact_at(entry.offset + LFH_SIZE as u64, &mut variable)
        .await?;
    let (raw_name, extra) = variable.split_at(header.name_len as usize);

    let has_zip64 = apply_zip64_extra(
        extra,
        &mut header.uncompressed_size,
        &mut header.compressed_size,
        None,
    )
    .map_err(|e| mismatch(e.to_string()))?;
    let version = header.version_needed & 0x00FF;
    let marker = ZIP64_MARKER_32 as u64;

    if has_zip64 {
        if header.flags & flags::DESCRIPTOR != 0 {
            if header.uncompressed_size != 0 && header.uncompressed_size != entry.uncompressed_size
            {
                return Err(mismatch("size invalid for descriptor".to_string()));
            }
            if header.compressed_size != 0 && header.compressed_size != entry.compressed_size {
                return Err(mismatch(
                    "compressed size invalid for descriptor".to_string(),
                ));
            }
        }
    } else if version >= VERSION_ZIP64
        && (header.uncompressed_size == marker || header.compressed_size == marker)
    {
        return Err(mismatch(
            "required Zip64 extended information missing".to_string(),
        ));
    }

    if strict {
        check_strict(entry, &header, version, raw_name)?;
    }

    // Sizes can only be compared when the local header actually carries them
    if header.flags & flags::DESCRIPTOR == 0
        || ((header.uncompressed_size > 0 || header.compressed_size > 0)
            && entry.uncompressed_size > 0)
    {
        if header.uncompressed_size != 0 && header.uncompressed_size != entry.uncompressed_size {
            return Err(mismatch(format!(
                "size mismatch between central header ({}) and local header ({})",
                entry.uncompressed_size, header.uncompressed_size
            )));
        }
        if header.compressed_size != 0
            && header.compressed_size != marker
            && header.compressed_size != entry.compressed_size
        {
            return Err(mismatch(format!(
                "compressed size mismatch between central header ({}) and local header ({})",
                entry.compressed_size, header.compressed_size
            )));
        }
    }

    let record_end = data_start
        .checked_add(entry.compressed_size)
        .and_then(|end| end.checked_add(entry.data_descriptor_size()));
    if record_end.is_none_or(|end| end > reader.size()) {
        return Err(mismatch(format!(
            "entry data ({} bytes at 0x{:x}) extends past the end of the archive",
            entry.compressed_size, data_start
        )));
    }

    Ok(LocatedEntry {
        data_start,
        raw_name: raw_name.to_vec(),
        header_len,
    })
}

fn check_strict(
    entry: &ArchiveEntry,
    header: &LocalHeader,
    version: u16,
    raw_name: &[u8],
) -> Result<()> {
    let mismatch = |reason: String| Error::header_mismatch(&entry.name, reason);
    let local_flags = header.flags;

    if entry.is_file() {
        if !entry.compression_method.is_supported() {
            return Err(Error::UnsupportedFeature(format!(
                "compression method {} of {}",
                entry.compression_method.as_u16(),
                entry.name
            )));
        }
        if version > VERSION_MADE_BY || (version > 20 && version < VERSION_ZIP64) {
            return Err(mismatch(format!(
                "version required to extract this entry not supported ({version})"
            )));
        }
        if local_flags & flags::UNSUPPORTED != 0 {
            return Err(Error::UnsupportedFeature(format!(
                "flags 0x{:04x} of {}",
                local_flags & flags::UNSUPPORTED,
                entry.name
            )));
        }
    }

    // Later versions are unknown rather than invalid
    if version <= 63 && !KNOWN_VERSIONS.contains(&version) {
        return Err(mismatch(format!(
            "version required to extract this entry is invalid ({version})"
        )));
    }
    if local_flags & flags::RESERVED != 0 {
        return Err(mismatch("reserved bit flags cannot be set".to_string()));
    }
    if local_flags & flags::ENCRYPTED != 0 && version < 20 {
        return Err(mismatch(format!(
            "version too low for encryption ({version})"
        )));
    }
    if local_flags & flags::STRONG_ENCRYPTION != 0 {
        if local_flags & flags::ENCRYPTED == 0 {
            return Err(mismatch(
                "strong encryption flag set but encryption flag is not set".to_string(),
            ));
        }
        if version < 62 {
            return Err(mismatch(format!(
                "version too low for strong encryption ({version})"
            )));
        }
    }
    if local_flags & flags::PATCHED != 0 && version < 27 {
        return Err(mismatch(format!(
            "patched data requires a higher version than {version}"
        )));
    }
    if local_flags != entry.flags {
        return Err(mismatch(format!(
            "flags mismatch (central 0x{:04x}, local 0x{:04x})",
            entry.flags, local_flags
        )));
    }
    if header.compression_method != entry.compression_method.as_u16() {
        return Err(mismatch(format!(
            "compression method mismatch (central {}, local {})",
            entry.compression_method.as_u16(),
            header.compression_method
        )));
    }
    if local_flags & flags::HEADER_MASKED != 0
        && (header.last_mod_time != 0 || header.last_mod_date != 0)
    {
        return Err(mismatch(
            "header masked set but date/time values non-zero".to_string(),
        ));
    }
    if local_flags & flags::DESCRIPTOR == 0 && header.crc32 != entry.crc32 {
        return Err(mismatch(format!(
            "crc mismatch (central {:08x}, local {:08x})",
            entry.crc32, header.crc32
        )));
    }
    if header.uncompressed_size == 0 && header.compressed_size == 0 && header.crc32 != 0 {
        return Err(mismatch("invalid CRC for empty entry".to_string()));
    }
    if raw_name != entry.raw_name.as_slice() {
        return Err(mismatch(
            "central header and local header file name mismatch".to_string(),
        ));
    }
    if entry.is_directory() {
        if header.uncompressed_size > 0 {
            return Err(mismatch("directory cannot have size".to_string()));
        }
        if entry.is_encrypted() {
            return Err(Error::UnsupportedFeature(format!(
                "encrypted directory {}",
                entry.name
            )));
        }
        // Stored directories may validly carry two bytes of empty deflate data
        if header.compressed_size > 2 {
            return Err(mismatch("directory compressed size invalid".to_string()));
        }
    }
    Ok(())
}
