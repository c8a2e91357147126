//! Binary-format helpers: signature scanning and the writers for the
//! records this crate synthesizes (central headers and EOCD trailers).

use byteorder::{LittleEndian, WriteBytesExt};
use std::io::{self, Write};

use super::structures::*;

/// Scan direction for [`locate_signature`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDirection {
    /// Walk towards the start of the buffer
    Backward,
    /// Walk towards the end of the buffer
    Forward,
}

/// Find `signature` in `data` one byte at a time.
///
/// Backward scans start at `anchor - min_block` and walk down; forward
/// scans start at `anchor + min_block` and walk up. Either way at most
/// `max_variable` further positions are tried before giving up. A
/// candidate only counts if the whole signature lies inside `data`.
///
/// Returns the position immediately after the matched signature.
pub fn locate_signature(
    data: &[u8],
    signature: &[u8; 4],
    anchor: usize,
    min_block: usize,
    max_variable: usize,
    direction: ScanDirection,
) -> Option<usize> {
    let matches_at = |pos: usize| data.get(pos..pos + 4) == Some(&signature[..]);

    match direction {
        ScanDirection::Backward => {
            let start = anchor.checked_sub(min_block)?;
            let give_up = start.saturating_sub(max_variable);
            (give_up..=start).rev().find(|&pos| matches_at(pos)).map(|pos| pos + 4)
        }
        ScanDirection::Forward => {
            let start = anchor.checked_add(min_block)?;
            if start > data.len() {
                return None;
            }
            let give_up = start.saturating_add(max_variable).min(data.len());
            (start..=give_up).find(|&pos| matches_at(pos)).map(|pos| pos + 4)
        }
    }
}

/// Write the records that close a central directory of `entries` records,
/// `cd_size` bytes long, starting at `cd_offset`.
///
/// Escalates to a Zip64 EOCD plus locator (written first, at
/// `cd_offset + cd_size`) whenever a value does not fit the classic fields.
pub fn write_end_of_central_directory<W: Write>(
    out: &mut W,
    entries: u64,
    cd_size: u64,
    cd_offset: u64,
    comment: &[u8],
) -> io::Result<()> {
    let needs_zip64 = entries >= ZIP64_MARKER_16 as u64
        || cd_size >= ZIP64_MARKER_32 as u64
        || cd_offset >= ZIP64_MARKER_32 as u64;
    if needs_zip64 {
        write_zip64_end_of_central_directory(out, entries, cd_size, cd_offset)?;
    }

    if comment.len() > MAX_COMMENT_SIZE as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "archive comment longer than 65535 bytes",
        ));
    }

    out.write_all(EndOfCentralDirectory::SIGNATURE)?;
    out.write_u16::<LittleEndian>(0)?; // this disk
    out.write_u16::<LittleEndian>(0)?; // disk with central directory
    let count = if entries >= ZIP64_MARKER_16 as u64 {
        ZIP64_MARKER_16
    } else {
        entries as u16
    };
    out.write_u16::<LittleEndian>(count)?;
    out.write_u16::<LittleEndian>(count)?;
    out.write_u32::<LittleEndian>(clamp_u32(cd_size))?;
    out.write_u32::<LittleEndian>(clamp_u32(cd_offset))?;
    out.write_u16::<LittleEndian>(comment.len() as u16)?;
    out.write_all(comment)?;
    Ok(())
}

/// Write a Zip64 EOCD record followed by its locator.
///
/// The record is assumed to land directly after the central directory.
pub fn write_zip64_end_of_central_directory<W: Write>(
    out: &mut W,
    entries: u64,
    cd_size: u64,
    cd_offset: u64,
) -> io::Result<()> {
    let record_offset = cd_offset + cd_size;

    out.write_all(Zip64EOCD::SIGNATURE)?;
    out.write_u64::<LittleEndian>((Zip64EOCD::MIN_SIZE - 12) as u64)?;
    out.write_u16::<LittleEndian>(VERSION_MADE_BY)?;
    out.write_u16::<LittleEndian>(VERSION_ZIP64)?;
    out.write_u32::<LittleEndian>(0)?;
    out.write_u32::<LittleEndian>(0)?;
    out.write_u64::<LittleEndian>(entries)?;
    out.write_u64::<LittleEndian>(entries)?;
    out.write_u64::<LittleEndian>(cd_size)?;
    out.write_u64::<LittleEndian>(cd_offset)?;

    out.write_all(Zip64EOCDLocator::SIGNATURE)?;
    out.write_u32::<LittleEndian>(0)?;
    out.write_u64::<LittleEndian>(record_offset)?;
    out.write_u32::<LittleEndian>(1)?;
    Ok(())
}

/// Write a central directory header for `entry` whose local header sits at
/// `local_offset`. Returns the number of bytes written.
pub fn write_central_header<W: Write>(
    out: &mut W,
    entry: &ArchiveEntry,
    local_offset: u64,
) -> io::Result<u64> {
    let big_uncompressed = entry.uncompressed_size >= ZIP64_MARKER_32 as u64;
    let big_compressed = entry.compressed_size >= ZIP64_MARKER_32 as u64;
    let big_offset = local_offset >= ZIP64_MARKER_32 as u64;

    let mut extra = Vec::new();
    if big_uncompressed || big_compressed || big_offset {
        let mut fields = Vec::new();
        if big_uncompressed {
            fields.write_u64::<LittleEndian>(entry.uncompressed_size)?;
        }
        if big_compressed {
            fields.write_u64::<LittleEndian>(entry.compressed_size)?;
        }
        if big_offset {
            fields.write_u64::<LittleEndian>(local_offset)?;
        }
        extra.write_u16::<LittleEndian>(ZIP64_EXTRA_ID)?;
        extra.write_u16::<LittleEndian>(fields.len() as u16)?;
        extra.extend_from_slice(&fields);
    }

    let version_needed = if extra.is_empty() {
        entry.version_needed
    } else {
        entry.version_needed.max(VERSION_ZIP64)
    };

    out.write_all(CDFH_SIGNATURE)?;
    out.write_u16::<LittleEndian>(entry.version_made_by)?;
    out.write_u16::<LittleEndian>(version_needed)?;
    out.write_u16::<LittleEndian>(entry.flags)?;
    out.write_u16::<LittleEndian>(entry.compression_method.as_u16())?;
    out.write_u16::<LittleEndian>(entry.last_mod_time)?;
    out.write_u16::<LittleEndian>(entry.last_mod_date)?;
    out.write_u32::<LittleEndian>(entry.crc32)?;
    out.write_u32::<LittleEndian>(clamp_u32(entry.compressed_size))?;
    out.write_u32::<LittleEndian>(clamp_u32(entry.uncompressed_size))?;
    out.write_u16::<LittleEndian>(entry.raw_name.len() as u16)?;
    out.write_u16::<LittleEndian>(extra.len() as u16)?;
    out.write_u16::<LittleEndian>(entry.comment.len() as u16)?;
    out.write_u16::<LittleEndian>(0)?; // disk number start
    out.write_u16::<LittleEndian>(0)?; // internal attributes
    out.write_u32::<LittleEndian>(entry.external_attributes)?;
    out.write_u32::<LittleEndian>(clamp_u32(local_offset))?;
    out.write_all(&entry.raw_name)?;
    out.write_all(&extra)?;
    out.write_all(&entry.comment)?;

    Ok((CDFH_MIN_SIZE + entry.raw_name.len() + extra.len() + entry.comment.len()) as u64)
}

fn clamp_u32(value: u64) -> u32 {
    if value >= ZIP64_MARKER_32 as u64 {
        ZIP64_MARKER_32
    } else {
        value as u32
    }
}
