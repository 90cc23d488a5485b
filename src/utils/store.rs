//! Durable JSON state files (operation log, retry queue, peer snapshot).

use crate::{Result, SyncError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use tokio::fs;

/// Write `value` as pretty-printed JSON via a temp file and rename, so a
/// crash mid-write never leaves a truncated state file behind.
pub async fn write_json_atomic<T>(path: &Path, value: &T) -> Result<()>
where
    T: Serialize,
{
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(|e| {
            SyncError::IoError(format!("Failed to create {}: {}", parent.display(), e))
        })?;
    }

    let data = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("tmp");

    fs::write(&tmp, &data)
        .await
        .map_err(|e| SyncError::IoError(format!("Failed to write {}: {}", tmp.display(), e)))?;
    fs::rename(&tmp, path)
        .await
        .map_err(|e| SyncError::IoError(format!("Failed to replace {}: {}", path.display(), e)))?;

    Ok(())
}

/// Read a JSON list from disk. A missing file is an empty list; a corrupt
/// file is a serialization error the caller decides how to handle.
pub async fn read_json_list<T>(path: &Path) -> Result<Vec<T>>
where
    T: DeserializeOwned,
{
    match fs::read(path).await {
        Ok(data) => serde_json::from_slice(&data).map_err(|e| {
            SyncError::SerializationError(format!("Corrupt state file {}: {}", path.display(), e))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(SyncError::IoError(format!(
            "Failed to read {}: {}",
            path.display(),
            e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.json");

        write_json_atomic(&path, &vec![1u32, 2, 3]).await.unwrap();
        let items: Vec<u32> = read_json_list(&path).await.unwrap();
        assert_eq!(items, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let items: Vec<u32> = read_json_list(&dir.path().join("absent.json")).await.unwrap();
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, b"{]").await.unwrap();

        let result = read_json_list::<u32>(&path).await;
        assert!(matches!(result, Err(SyncError::SerializationError(_))));
    }

    #[tokio::test]
    async fn test_write_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/state/items.json");

        write_json_atomic(&path, &vec!["a", "b"]).await.unwrap();
        let items: Vec<String> = read_json_list(&path).await.unwrap();
        assert_eq!(items, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_rewrite_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.json");

        write_json_atomic(&path, &vec![1u32]).await.unwrap();
        write_json_atomic(&path, &vec![7u32, 8]).await.unwrap();
        let items: Vec<u32> = read_json_list(&path).await.unwrap();
        assert_eq!(items, vec![7, 8]);
    }
}
