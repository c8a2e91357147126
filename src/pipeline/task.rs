//! Per-entry work items and their on-disk paths.

use flate2::Crc;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::config::{DeliveryMode, JobConfig};
use crate::error::{Error, Result};
use crate::zip::{ArchiveEntry, RehydratedEntry};

/// Suffix of the pre-commit file next to the final path
pub const STAGING_SUFFIX: &str = "_tmp";
/// Suffix of sidecar archives under the staging directory
pub const SIDECAR_SUFFIX: &str = ".zip";

/// What the download stage produced for an entry.
#[derive(Debug, Default)]
pub enum Staged {
    #[default]
    Pending,
    /// Compressed bytes copied into a sidecar archive
    Sidecar(RehydratedEntry),
    /// Data already decompressed into the staging file
    Extracted { crc: Crc, len: u64 },
}

/// One file entry moving through the pipeline.
///
/// Owned by exactly one stage at a time; channels hand it on.
#[derive(Debug)]
pub struct EntryTask {
    pub entry: ArchiveEntry,
    /// Final location
    pub target_path: PathBuf,
    /// `<target>_tmp`, renamed onto `target_path` on commit
    pub staging_path: PathBuf,
    /// `<staging>/<name>.zip` in compressed-file mode
    pub sidecar_path: Option<PathBuf>,
    pub staged: Staged,
}

impl EntryTask {
    /// Build the task for a file entry, rejecting names that escape the
    /// target directory.
    pub fn new(entry: ArchiveEntry, config: &JobConfig) -> Result<Self> {
        let relative = sanitize_entry_path(&entry.name)?;
        let target_path = config.target_dir.join(&relative);
        let staging_path = with_suffix(&target_path, STAGING_SUFFIX);
        let sidecar_path = match config.delivery {
            DeliveryMode::CompressedFile => Some(with_suffix(
                &config.staging_dir.join(&relative),
                SIDECAR_SUFFIX,
            )),
            DeliveryMode::Streaming => None,
        };
        Ok(Self {
            entry,
            target_path,
            staging_path,
            sidecar_path,
            staged: Staged::Pending,
        })
    }

    pub fn name(&self) -> &str {
        &self.entry.name
    }

    /// Remove the staging file and sidecar of a permanently failed entry.
    pub async fn discard(&self) {
        remove_if_exists(&self.staging_path).await;
        if let Some(sidecar) = &self.sidecar_path {
            remove_if_exists(sidecar).await;
        }
    }
}

async fn remove_if_exists(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove file"),
    }
}

/// Delete every sidecar archive under `staging_dir`, returning how many
/// were removed.
///
/// A sidecar may only be resumed against the source version it was
/// fetched from.
pub async fn purge_sidecars(staging_dir: &Path) -> Result<usize> {
    let mut pending = vec![staging_dir.to_path_buf()];
    let mut removed = 0;
    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let kind = entry.file_type().await?;
            if kind.is_dir() {
                pending.push(path);
            } else if kind.is_file() && is_sidecar(&path) {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {
                        tracing::debug!(path = %path.display(), "deleted sidecar");
                        removed += 1;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }
    Ok(removed)
}

fn is_sidecar(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|name| name.to_string_lossy().ends_with(SIDECAR_SUFFIX))
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Turn an entry name into a relative path that stays inside its base.
///
/// Both `/` and `\` separate components. Empty and `.` components are
/// dropped. Absolute names, drive prefixes, `..` and NUL bytes are rejected.
pub fn sanitize_entry_path(name: &str) -> Result<PathBuf> {
    let invalid = || Error::InvalidEntryName(name.to_string());

    if name.starts_with('/') || name.starts_with('\\') || name.contains('\0') {
        return Err(invalid());
    }

    let mut relative = PathBuf::new();
    for (index, component) in name.split(['/', '\\']).enumerate() {
        match component {
            "" | "." => continue,
            ".." => return Err(invalid()),
            _ if index == 0 && is_drive_prefix(component) => return Err(invalid()),
            _ => relative.push(component),
        }
    }

    if relative.as_os_str().is_empty() {
        return Err(invalid());
    }
    Ok(relative)
}

fn is_drive_prefix(component: &str) -> bool {
    let bytes = component.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}
