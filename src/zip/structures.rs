use byteorder::{LittleEndian, ReadBytesExt};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use std::io::Cursor;
use std::time::SystemTime;

use crate::error::{Error, Result};

/// ZIP compression methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionMethod {
    Stored,
    Deflate,
    BZip2,
    Unknown(u16),
}

impl CompressionMethod {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => CompressionMethod::Stored,
            8 => CompressionMethod::Deflate,
            12 => CompressionMethod::BZip2,
            _ => CompressionMethod::Unknown(value),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            CompressionMethod::Stored => 0,
            CompressionMethod::Deflate => 8,
            CompressionMethod::BZip2 => 12,
            CompressionMethod::Unknown(v) => *v,
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, CompressionMethod::Unknown(_))
    }
}

/// General purpose bit flags
pub mod flags {
    pub const ENCRYPTED: u16 = 0x0001;
    pub const DESCRIPTOR: u16 = 0x0008;
    pub const RESERVED_4: u16 = 0x0010;
    pub const PATCHED: u16 = 0x0020;
    pub const STRONG_ENCRYPTION: u16 = 0x0040;
    pub const UTF8: u16 = 0x0800;
    pub const ENHANCED_COMPRESS: u16 = 0x1000;
    pub const HEADER_MASKED: u16 = 0x2000;
    pub const RESERVED_14: u16 = 0x4000;
    pub const RESERVED_15: u16 = 0x8000;

    /// Flags this crate refuses to extract
    pub const UNSUPPORTED: u16 =
        ENCRYPTED | PATCHED | STRONG_ENCRYPTION | ENHANCED_COMPRESS | HEADER_MASKED;
    pub const RESERVED: u16 = RESERVED_4 | RESERVED_14 | RESERVED_15;
}

/// Sentinel stored in 32-bit fields whose value lives in the Zip64 records
pub const ZIP64_MARKER_32: u32 = 0xFFFF_FFFF;
/// Sentinel stored in 16-bit entry counts whose value lives in the Zip64 records
pub const ZIP64_MARKER_16: u16 = 0xFFFF;
/// Header id of the Zip64 extended information extra field
pub const ZIP64_EXTRA_ID: u16 = 0x0001;
/// Version needed to extract for Zip64 records
pub const VERSION_ZIP64: u16 = 45;
/// Version made by written into synthesized records
pub const VERSION_MADE_BY: u16 = 51;
/// Maximum ZIP comment size allowed by the format (65535 bytes).
pub const MAX_COMMENT_SIZE: u64 = 0xFFFF;

/// End of Central Directory (EOCD) - 22 bytes minimum
#[derive(Debug, Clone)]
pub struct EndOfCentralDirectory {
    pub disk_number: u16,
    pub disk_with_cd: u16,
    pub disk_entries: u16,
    pub total_entries: u16,
    pub cd_size: u32,
    pub cd_offset: u32,
    pub comment_len: u16,
}

impl EndOfCentralDirectory {
    pub const SIGNATURE: &'static [u8; 4] = b"PK\x05\x06";
    pub const SIZE: usize = 22;

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE || &data[0..4] != Self::SIGNATURE {
            return Err(Error::ArchiveStructure(
                "invalid End of Central Directory".to_string(),
            ));
        }

        let mut cursor = Cursor::new(&data[4..]);

        Ok(Self {
            disk_number: cursor.read_u16::<LittleEndian>()?,
            disk_with_cd: cursor.read_u16::<LittleEndian>()?,
            disk_entries: cursor.read_u16::<LittleEndian>()?,
            total_entries: cursor.read_u16::<LittleEndian>()?,
            cd_size: cursor.read_u32::<LittleEndian>()?,
            cd_offset: cursor.read_u32::<LittleEndian>()?,
            comment_len: cursor.read_u16::<LittleEndian>()?,
        })
    }

    pub fn is_zip64(&self) -> bool {
        self.disk_entries == ZIP64_MARKER_16
            || self.total_entries == ZIP64_MARKER_16
            || self.cd_size == ZIP64_MARKER_32
            || self.cd_offset == ZIP64_MARKER_32
    }
}

/// ZIP64 End of Central Directory Locator - 20 bytes
#[derive(Debug, Clone)]
pub struct Zip64EOCDLocator {
    pub disk_with_eocd64: u32,
    pub eocd64_offset: u64,
    pub total_disks: u32,
}

impl Zip64EOCDLocator {
    pub const SIGNATURE: &'static [u8; 4] = b"PK\x06\x07";
    pub const SIZE: usize = 20;

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE || &data[0..4] != Self::SIGNATURE {
            return Err(Error::ArchiveStructure(
                "invalid Zip64 end of central directory locator".to_string(),
            ));
        }

        let mut cursor = Cursor::new(&data[4..]);

        Ok(Self {
            disk_with_eocd64: cursor.read_u32::<LittleEndian>()?,
            eocd64_offset: cursor.read_u64::<LittleEndian>()?,
            total_disks: cursor.read_u32::<LittleEndian>()?,
        })
    }
}

/// ZIP64 End of Central Directory - 56 bytes minimum
#[derive(Debug, Clone)]
pub struct Zip64EOCD {
    pub eocd64_size: u64,
    pub version_made_by: u16,
    pub version_needed: u16,
    pub disk_number: u32,
    pub disk_with_cd: u32,
    pub disk_entries: u64,
    pub total_entries: u64,
    pub cd_size: u64,
    pub cd_offset: u64,
}

impl Zip64EOCD {
    pub const SIGNATURE: &'static [u8; 4] = b"PK\x06\x06";
    pub const MIN_SIZE: usize = 56;

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::MIN_SIZE {
            return Err(Error::ArchiveStructure(
                "truncated Zip64 end of central directory".to_string(),
            ));
        }
        if &data[0..4] != Self::SIGNATURE {
            return Err(Error::ArchiveStructure(
                "invalid Zip64 end of central directory signature".to_string(),
            ));
        }

        let mut cursor = Cursor::new(&data[4..]);

        Ok(Self {
            eocd64_size: cursor.read_u64::<LittleEndian>()?,
            version_made_by: cursor.read_u16::<LittleEndian>()?,
            version_needed: cursor.read_u16::<LittleEndian>()?,
            disk_number: cursor.read_u32::<LittleEndian>()?,
            disk_with_cd: cursor.read_u32::<LittleEndian>()?,
            disk_entries: cursor.read_u64::<LittleEndian>()?,
            total_entries: cursor.read_u64::<LittleEndian>()?,
            cd_size: cursor.read_u64::<LittleEndian>()?,
            cd_offset: cursor.read_u64::<LittleEndian>()?,
        })
    }
}

/// Central Directory File Header (CDFH) - 46 bytes minimum
pub const CDFH_SIGNATURE: &[u8; 4] = b"PK\x01\x02";
pub const CDFH_MIN_SIZE: usize = 46;

/// Local File Header (LFH) - 30 bytes
pub const LFH_SIGNATURE: &[u8; 4] = b"PK\x03\x04";
pub const LFH_SIZE: usize = 30;

/// Entry metadata read from the central directory.
///
/// `offset` always refers to the local header position in the original
/// archive; it is never rebased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub raw_name: Vec<u8>,
    pub version_made_by: u16,
    pub version_needed: u16,
    pub flags: u16,
    pub compression_method: CompressionMethod,
    pub last_mod_time: u16,
    pub last_mod_date: u16,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub offset: u64,
    pub external_attributes: u32,
    pub comment: Vec<u8>,
}

impl ArchiveEntry {
    /// Directory entries end with '/'
    pub fn is_directory(&self) -> bool {
        self.name.ends_with('/') || self.name.ends_with('\\')
    }

    pub fn is_file(&self) -> bool {
        !self.is_directory()
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags & flags::ENCRYPTED != 0
    }

    /// CRC and sizes follow the data in a trailing descriptor
    pub fn has_data_descriptor(&self) -> bool {
        self.flags & flags::DESCRIPTOR != 0
    }

    /// Whether the local header needs Zip64 size fields
    pub fn local_header_requires_zip64(&self) -> bool {
        self.uncompressed_size >= ZIP64_MARKER_32 as u64
            || self.compressed_size >= ZIP64_MARKER_32 as u64
    }

    /// Size of the trailing data descriptor including its signature
    pub fn data_descriptor_size(&self) -> u64 {
        if !self.has_data_descriptor() {
            0
        } else if self.local_header_requires_zip64() {
            24
        } else {
            16
        }
    }

    /// Parse modification date to (year, month, day)
    pub fn mod_date(&self) -> (u16, u8, u8) {
        let day = (self.last_mod_date & 0x1F) as u8;
        let month = ((self.last_mod_date >> 5) & 0x0F) as u8;
        let year = ((self.last_mod_date >> 9) & 0x7F) + 1980;
        (year, month, day)
    }

    /// Parse modification time to (hour, minute, second)
    pub fn mod_time(&self) -> (u8, u8, u8) {
        let second = ((self.last_mod_time & 0x1F) * 2) as u8;
        let minute = ((self.last_mod_time >> 5) & 0x3F) as u8;
        let hour = ((self.last_mod_time >> 11) & 0x1F) as u8;
        (hour, minute, second)
    }

    /// Modification time as a timestamp, interpreting the DOS fields as UTC.
    ///
    /// Returns `None` for out-of-range DOS values (e.g. a zeroed date).
    pub fn modified(&self) -> Option<SystemTime> {
        let (year, month, day) = self.mod_date();
        let (hour, minute, second) = self.mod_time();
        let date = NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)?;
        let time = NaiveTime::from_hms_opt(hour as u32, minute as u32, second as u32)?;
        Some(NaiveDateTime::new(date, time).and_utc().into())
    }
}
