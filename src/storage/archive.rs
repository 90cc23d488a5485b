use crate::{Result, SyncError};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::warn;
use std::path::{Component, Path, PathBuf};

/// Directories travel over the wire as gzipped tarballs.
pub const ARCHIVE_EXT: &str = ".tar.gz";

pub fn is_archive(name: &str) -> bool {
    name.ends_with(ARCHIVE_EXT)
}

pub fn archive_name(dir_name: &str) -> String {
    format!("{}{}", dir_name, ARCHIVE_EXT)
}

/// Unique scratch path for an outgoing archive.
pub fn temp_archive_path(dir_name: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "{}-{}{}",
        dir_name,
        uuid::Uuid::new_v4(),
        ARCHIVE_EXT
    ))
}

/// Entry paths must resolve inside the unpack root: no parent components,
/// no absolute paths.
fn is_safe_entry(path: &Path) -> bool {
    if path.as_os_str().is_empty() {
        return false;
    }
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Pack `src` into a gzipped tarball at `dest`. Entries are rooted at the
/// directory's own name, so unpacking recreates one top-level directory.
pub async fn pack_dir(src: &Path, dest: &Path) -> Result<()> {
    let root = src
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| {
            SyncError::ArchiveError(format!("Directory {} has no name", src.display()))
        })?;
    let src = src.to_path_buf();
    let dest = dest.to_path_buf();

    tokio::task::spawn_blocking(move || -> Result<()> {
        let file = std::fs::File::create(&dest).map_err(|e| {
            SyncError::ArchiveError(format!("Failed to create {}: {}", dest.display(), e))
        })?;
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);

        builder.append_dir_all(&root, &src).map_err(|e| {
            SyncError::ArchiveError(format!("Failed to pack {}: {}", src.display(), e))
        })?;

        let encoder = builder
            .into_inner()
            .map_err(|e| SyncError::ArchiveError(format!("Failed to finish archive: {}", e)))?;
        encoder
            .finish()
            .map_err(|e| SyncError::ArchiveError(format!("Failed to finish archive: {}", e)))?;
        Ok(())
    })
    .await
    .map_err(|e| SyncError::ArchiveError(format!("Archive task failed: {}", e)))?
}

/// Unpack a gzipped tarball under `dest_root`. Entries that would land
/// outside the root are skipped, not fatal.
pub async fn unpack_archive(archive: &Path, dest_root: &Path) -> Result<()> {
    let archive = archive.to_path_buf();
    let dest_root = dest_root.to_path_buf();

    tokio::task::spawn_blocking(move || -> Result<()> {
        let file = std::fs::File::open(&archive).map_err(|e| {
            SyncError::ArchiveError(format!("Failed to open {}: {}", archive.display(), e))
        })?;
        let decoder = GzDecoder::new(file);
        let mut reader = tar::Archive::new(decoder);

        let entries = reader.entries().map_err(|e| {
            SyncError::ArchiveError(format!("Failed to read {}: {}", archive.display(), e))
        })?;
        for entry in entries {
            let mut entry = entry.map_err(|e| {
                SyncError::ArchiveError(format!("Corrupt entry in {}: {}", archive.display(), e))
            })?;
            let path = entry
                .path()
                .map_err(|e| SyncError::ArchiveError(format!("Bad entry path: {}", e)))?
                .to_path_buf();

            if !is_safe_entry(&path) {
                warn!("Skipping unsafe archive entry {:?}", path);
                continue;
            }
            let unpacked = entry.unpack_in(&dest_root).map_err(|e| {
                SyncError::ArchiveError(format!("Failed to unpack {:?}: {}", path, e))
            })?;
            if !unpacked {
                warn!("Skipping archive entry escaping the target root: {:?}", path);
            }
        }
        Ok(())
    })
    .await
    .map_err(|e| SyncError::ArchiveError(format!("Archive task failed: {}", e)))?
}
