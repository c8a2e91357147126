//! ZIP archive parsing and extraction over range reads.
//!
//! This module provides functionality for reading individual entries of a
//! ZIP archive that is only reachable through range requests, supporting
//! both the standard format and ZIP64 extensions for large archives.
//!
//! ## Architecture
//!
//! - [`structures`]: Data structures representing ZIP format elements (EOCD, entries, flags)
//! - [`format`]: Signature scanning and writers for synthesized records
//! - [`parser`]: Parsing of trailers and central directory records from raw bytes
//! - [`directory`]: Central directory reconstruction from the archive tail, plus its disk cache
//! - [`locator`]: Local header validation and payload location
//! - [`materialize`]: Sidecar archives and decompressing entry streams
//! - [`archive`]: High-level API for end users
//!
//! ## ZIP Format Overview
//!
//! A ZIP file consists of:
//! 1. Local file headers and compressed data for each file
//! 2. Central Directory with metadata for all files
//! 3. End of Central Directory (EOCD) record at the end
//!
//! The EOCD is read first (from the end of the file), then the Central
//! Directory, which allows listing files without reading the entire
//! archive. Each entry is then fetched on its own through its local header.
//!
//! ## Supported Features
//!
//! - Standard ZIP format (PKZIP APPNOTE 6.3.x compatible)
//! - ZIP64 extensions for files > 4GB
//! - STORED, DEFLATE and BZIP2 compression methods
//!
//! ## Limitations
//!
//! - No encryption support
//! - No multi-disk archive support

mod archive;
mod directory;
mod format;
mod locator;
mod materialize;
mod parser;
mod structures;

pub use archive::{RemoteArchive, check_integrity};
pub use directory::{
    CACHE_EXTENSION, CacheOutcome, CentralDirectoryImage, cache_path, source_fingerprint,
};
pub use format::{
    ScanDirection, locate_signature, write_central_header, write_end_of_central_directory,
    write_zip64_end_of_central_directory,
};
pub use locator::{LocatedEntry, locate_entry};
pub use materialize::{
    RehydratedEntry, SidecarArchive, fetch_entry_archive, open_entry_archive, open_entry_stream,
};
pub use parser::{Trailer, ZipParser};
pub use structures::*;
