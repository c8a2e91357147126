//! Low-level ZIP trailer and central directory parser.
//!
//! This module handles the binary parsing of the records at the end of a
//! ZIP file, working on byte buffers that have already been fetched.
//!
//! ## Parsing Strategy
//!
//! ZIP files are designed to be read from the end:
//! 1. Find the End of Central Directory (EOCD) at the buffer's end
//! 2. If ZIP64, follow the locator to the ZIP64 EOCD for 64-bit values
//! 3. Parse the Central Directory to get metadata for all entries
//!
//! The same routines serve the remote tail buffer assembled by
//! [`CentralDirectoryImage`](super::CentralDirectoryImage) and the cached
//! image itself, which is laid out as a ZIP with no entry data.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};

use super::format::{ScanDirection, locate_signature};
use super::structures::*;
use crate::error::{Error, Result};

/// Location and size of a central directory, as announced by the trailer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trailer {
    /// Position of the classic EOCD record inside the parsed buffer
    pub eocd_pos: usize,
    /// Number of central directory records
    pub entries: u64,
    /// Size of the central directory in bytes
    pub cd_size: u64,
    /// Offset of the central directory, in the coordinates of the archive
    pub cd_offset: u64,
    /// Whether the values came from a ZIP64 EOCD
    pub zip64: bool,
    /// Archive comment
    pub comment: Vec<u8>,
}

/// Find the End of Central Directory record in a buffer that ends where
/// the archive ends.
///
/// Searches backwards from the end of `buf`. A candidate is only accepted
/// when its comment length reaches exactly to the end of the buffer, so a
/// stray signature inside the comment is not mistaken for the record.
///
/// # Returns
///
/// The position of the record in `buf` and the parsed record, or `None`
/// if no valid EOCD lies within the buffer.
pub fn find_eocd(buf: &[u8]) -> Option<(usize, EndOfCentralDirectory)> {
    let max_variable = MAX_COMMENT_SIZE as usize;
    let mut anchor = buf.len();

    while let Some(after) = locate_signature(
        buf,
        EndOfCentralDirectory::SIGNATURE,
        anchor,
        EndOfCentralDirectory::SIZE,
        max_variable,
        ScanDirection::Backward,
    ) {
        let pos = after - EndOfCentralDirectory::SIGNATURE.len();
        let comment_len = u16::from_le_bytes([buf[pos + 20], buf[pos + 21]]) as usize;
        if comment_len == buf.len() - pos - EndOfCentralDirectory::SIZE {
            if let Ok(eocd) = EndOfCentralDirectory::from_bytes(&buf[pos..]) {
                return Some((pos, eocd));
            }
        }
        // Keep looking below this false positive
        if pos == 0 {
            break;
        }
        anchor = pos + EndOfCentralDirectory::SIZE - 1;
    }
    None
}

/// Find the ZIP64 locator that must sit directly before the EOCD.
///
/// # Returns
///
/// `Ok(None)` when the buffer does not reach far enough back to hold the
/// locator, an error when the bytes are there but are not a locator.
pub fn find_zip64_locator(buf: &[u8], eocd_pos: usize) -> Result<Option<Zip64EOCDLocator>> {
    let Some(locator_pos) = eocd_pos.checked_sub(Zip64EOCDLocator::SIZE) else {
        return Ok(None);
    };
    Zip64EOCDLocator::from_bytes(&buf[locator_pos..eocd_pos]).map(Some)
}

/// Low-level parser for a central directory image.
///
/// An image is a byte buffer holding a complete central directory followed
/// by its trailer records, with no entry data in front of it. Entry offsets
/// inside the records are left exactly as stored.
///
/// ## Example
///
/// ```ignore
/// let parser = ZipParser::new(&image_bytes);
/// let entries = parser.list_files()?;
/// ```
pub struct ZipParser<'a> {
    /// The image bytes
    data: &'a [u8],
}

impl<'a> ZipParser<'a> {
    /// Create a new parser over `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Read the trailer records of the image.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ArchiveStructure`] if no valid EOCD can be found or
    /// the announced central directory does not fit in front of it.
    pub fn trailer(&self) -> Result<Trailer> {
        let (eocd_pos, eocd) = find_eocd(self.data).ok_or_else(|| {
            Error::ArchiveStructure("end of central directory not found".to_string())
        })?;
        let comment_start = eocd_pos + EndOfCentralDirectory::SIZE;
        let comment = self.data[comment_start..].to_vec();

        let trailer = if eocd.is_zip64() {
            let locator = find_zip64_locator(self.data, eocd_pos)?.ok_or_else(|| {
                Error::ArchiveStructure("ZIP64 locator missing".to_string())
            })?;
            let eocd64 = self.read_zip64_eocd(&locator)?;
            Trailer {
                eocd_pos,
                entries: eocd64.total_entries,
                cd_size: eocd64.cd_size,
                cd_offset: eocd64.cd_offset,
                zip64: true,
                comment,
            }
        } else {
            Trailer {
                eocd_pos,
                entries: eocd.total_entries as u64,
                cd_size: eocd.cd_size as u64,
                cd_offset: eocd.cd_offset as u64,
                zip64: false,
                comment,
            }
        };

        let cd_end = trailer.cd_offset.checked_add(trailer.cd_size);
        if cd_end.is_none_or(|end| end > eocd_pos as u64) {
            return Err(Error::ArchiveStructure(format!(
                "central directory ({} bytes at {}) overlaps its trailer",
                trailer.cd_size, trailer.cd_offset
            )));
        }
        Ok(trailer)
    }

    /// Read the ZIP64 End of Central Directory record the locator points at.
    fn read_zip64_eocd(&self, locator: &Zip64EOCDLocator) -> Result<Zip64EOCD> {
        let start = usize::try_from(locator.eocd64_offset)
            .ok()
            .filter(|&s| s < self.data.len())
            .ok_or_else(|| {
                Error::ArchiveStructure(format!(
                    "ZIP64 end of central directory offset {} out of range",
                    locator.eocd64_offset
                ))
            })?;
        Zip64EOCD::from_bytes(&self.data[start..])
    }

    /// List all entries in the image.
    ///
    /// # Returns
    ///
    /// A vector of [`ArchiveEntry`] values in central directory order.
    ///
    /// # Errors
    ///
    /// Returns an error if the image is invalid or the record count does
    /// not match the trailer.
    pub fn list_files(&self) -> Result<Vec<ArchiveEntry>> {
        let trailer = self.trailer()?;
        let start = trailer.cd_offset as usize;
        let cd = &self.data[start..start + trailer.cd_size as usize];
        parse_central_directory(cd, trailer.entries)
    }
}

/// Parse `expected` consecutive central directory records from `cd`.
pub fn parse_central_directory(cd: &[u8], expected: u64) -> Result<Vec<ArchiveEntry>> {
    // Each record is at least 46 bytes, so a bogus count cannot over-allocate
    let capacity = expected.min((cd.len() / CDFH_MIN_SIZE) as u64) as usize;
    let mut entries = Vec::with_capacity(capacity);
    let mut cursor = Cursor::new(cd);

    for _ in 0..expected {
        let entry = parse_cdfh(&mut cursor)?;
        entries.push(entry);
    }

    if cursor.position() != cd.len() as u64 {
        return Err(Error::ArchiveStructure(format!(
            "central directory has {} trailing bytes after {} records",
            cd.len() as u64 - cursor.position(),
            expected
        )));
    }
    Ok(entries)
}

/// Parse a Central Directory File Header from a cursor.
///
/// The CDFH contains metadata about an entry in the archive, including
/// its name, sizes, and the location of its local header.
///
/// # Errors
///
/// Returns [`Error::ArchiveStructure`] if the header is invalid or
/// truncated.
fn parse_cdfh(cursor: &mut Cursor<&[u8]>) -> Result<ArchiveEntry> {
    parse_cdfh_inner(cursor).map_err(|e| match e {
        Error::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
            Error::ArchiveStructure("truncated central directory record".to_string())
        }
        other => other,
    })
}

fn parse_cdfh_inner(cursor: &mut Cursor<&[u8]>) -> Result<ArchiveEntry> {
    // Read and verify the signature (PK\x01\x02)
    let mut sig = [0u8; 4];
    cursor.read_exact(&mut sig)?;
    if &sig != CDFH_SIGNATURE {
        return Err(Error::ArchiveStructure(format!(
            "invalid central directory record at {}",
            cursor.position() - 4
        )));
    }

    let version_made_by = cursor.read_u16::<LittleEndian>()?;
    let version_needed = cursor.read_u16::<LittleEndian>()?;
    let flags = cursor.read_u16::<LittleEndian>()?;
    let compression_method = cursor.read_u16::<LittleEndian>()?;
    let last_mod_time = cursor.read_u16::<LittleEndian>()?;
    let last_mod_date = cursor.read_u16::<LittleEndian>()?;
    let crc32 = cursor.read_u32::<LittleEndian>()?;
    let mut compressed_size = cursor.read_u32::<LittleEndian>()? as u64;
    let mut uncompressed_size = cursor.read_u32::<LittleEndian>()? as u64;
    let file_name_length = cursor.read_u16::<LittleEndian>()?;
    let extra_field_length = cursor.read_u16::<LittleEndian>()?;
    let file_comment_length = cursor.read_u16::<LittleEndian>()?;
    let _disk_number_start = cursor.read_u16::<LittleEndian>()?;
    let _internal_attrs = cursor.read_u16::<LittleEndian>()?;
    let external_attributes = cursor.read_u32::<LittleEndian>()?;
    let mut offset = cursor.read_u32::<LittleEndian>()? as u64;

    let mut raw_name = vec![0u8; file_name_length as usize];
    cursor.read_exact(&mut raw_name)?;
    // Use lossy conversion to handle non-UTF8 filenames gracefully
    let name = String::from_utf8_lossy(&raw_name).to_string();

    let mut extra = vec![0u8; extra_field_length as usize];
    cursor.read_exact(&mut extra)?;
    apply_zip64_extra(
        &extra,
        &mut uncompressed_size,
        &mut compressed_size,
        Some(&mut offset),
    )?;

    let mut comment = vec![0u8; file_comment_length as usize];
    cursor.read_exact(&mut comment)?;

    Ok(ArchiveEntry {
        name,
        raw_name,
        version_made_by,
        version_needed,
        flags,
        compression_method: CompressionMethod::from_u16(compression_method),
        last_mod_time,
        last_mod_date,
        crc32,
        compressed_size,
        uncompressed_size,
        offset,
        external_attributes,
        comment,
    })
}

/// Override sentinel values from a ZIP64 extended information extra field.
///
/// Fields are present only when the corresponding header field holds
/// 0xFFFFFFFF, in the order uncompressed size, compressed size, offset.
///
/// # Returns
///
/// Whether a ZIP64 extra field was present.
pub(crate) fn apply_zip64_extra(
    extra: &[u8],
    uncompressed_size: &mut u64,
    compressed_size: &mut u64,
    mut offset: Option<&mut u64>,
) -> Result<bool> {
    let mut cursor = Cursor::new(extra);
    let end = extra.len() as u64;
    let mut found = false;

    while cursor.position() + 4 <= end {
        let header_id = cursor.read_u16::<LittleEndian>()?;
        let field_size = cursor.read_u16::<LittleEndian>()? as u64;
        let field_end = cursor.position() + field_size;
        if field_end > end {
            return Err(Error::ArchiveStructure(
                "extra field runs past its header".to_string(),
            ));
        }

        if header_id == ZIP64_EXTRA_ID {
            found = true;
            let marker = ZIP64_MARKER_32 as u64;
            if *uncompressed_size == marker && cursor.position() + 8 <= field_end {
                *uncompressed_size = cursor.read_u64::<LittleEndian>()?;
            }
            if *compressed_size == marker && cursor.position() + 8 <= field_end {
                *compressed_size = cursor.read_u64::<LittleEndian>()?;
            }
            if let Some(offset) = offset.as_deref_mut() {
                if *offset == marker && cursor.position() + 8 <= field_end {
                    *offset = cursor.read_u64::<LittleEndian>()?;
                }
            }
        }
        cursor.set_position(field_end);
    }
    Ok(found)
}
