use crate::{Result, SyncError};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs as async_fs;

/// One entry of the shared tree, as reported to peers and the CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub modified: i64,
    pub is_dir: bool,
}

/// Walk the shared directory and describe every file and subdirectory.
/// Entries that disappear or cannot be read mid-walk are skipped.
pub async fn list_files(base: &Path) -> Result<Vec<FileEntry>> {
    let mut entries = Vec::new();
    let mut pending = vec![base.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut reader = match async_fs::read_dir(&dir).await {
            Ok(reader) => reader,
            Err(e) => {
                warn!("Skipping unreadable directory {}: {}", dir.display(), e);
                continue;
            }
        };

        loop {
            let entry = match reader.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("Skipping unreadable entry in {}: {}", dir.display(), e);
                    break;
                }
            };

            let path = entry.path();
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(e) => {
                    debug!("Skipping {}: {}", path.display(), e);
                    continue;
                }
            };

            let modified = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);

            entries.push(FileEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                path: path.to_string_lossy().to_string(),
                size: metadata.len(),
                modified,
                is_dir: metadata.is_dir(),
            });

            if metadata.is_dir() {
                pending.push(path);
            }
        }
    }

    Ok(entries)
}

/// Write `data` to `path`, creating parent directories as needed.
pub async fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        async_fs::create_dir_all(parent).await.map_err(|e| {
            SyncError::IoError(format!("Failed to create {}: {}", parent.display(), e))
        })?;
    }

    async_fs::write(path, data)
        .await
        .map_err(|e| SyncError::IoError(format!("Failed to write {}: {}", path.display(), e)))
}

/// Remove a file or a directory tree. A path that is already gone counts
/// as removed.
pub async fn delete_path(path: &Path) -> Result<()> {
    let metadata = match async_fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(SyncError::IoError(format!(
                "Failed to inspect {}: {}",
                path.display(),
                e
            )))
        }
    };

    let result = if metadata.is_dir() {
        async_fs::remove_dir_all(path).await
    } else {
        async_fs::remove_file(path).await
    };

    result.map_err(|e| SyncError::IoError(format!("Failed to delete {}: {}", path.display(), e)))
}

/// PathBuf helper for a file name inside a base directory, rejecting names
/// that could escape it.
pub fn safe_join(base: &Path, name: &str) -> Result<PathBuf> {
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name == "."
        || name == ".."
    {
        return Err(SyncError::ProtocolError(format!(
            "Unsafe file name: {:?}",
            name
        )));
    }
    Ok(base.join(name))
}

/// Resolve a relative path under a base directory. Subdirectories are
/// allowed; absolute paths and parent components are not.
pub fn resolve_under(base: &Path, relative: &str) -> Result<PathBuf> {
    let rel = Path::new(relative);
    if relative.is_empty()
        || rel.is_absolute()
        || !rel
            .components()
            .all(|c| matches!(c, std::path::Component::Normal(_)))
    {
        return Err(SyncError::ProtocolError(format!(
            "Unsafe relative path: {:?}",
            relative
        )));
    }
    Ok(base.join(rel))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_files_walks_nested_tree() {
        let dir = tempfile::tempdir().unwrap();
        async_fs::create_dir_all(dir.path().join("docs/old")).await.unwrap();
        async_fs::write(dir.path().join("top.txt"), b"top").await.unwrap();
        async_fs::write(dir.path().join("docs/readme.md"), b"hello").await.unwrap();
        async_fs::write(dir.path().join("docs/old/legacy.md"), b"bye").await.unwrap();

        let entries = list_files(dir.path()).await.unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();

        assert_eq!(entries.len(), 5);
        assert!(names.contains(&"top.txt"));
        assert!(names.contains(&"docs"));
        assert!(names.contains(&"readme.md"));
        assert!(names.contains(&"legacy.md"));
        assert!(entries.iter().any(|e| e.name == "docs" && e.is_dir));
        assert!(entries
            .iter()
            .any(|e| e.name == "readme.md" && e.size == 5 && !e.is_dir));
    }

    #[tokio::test]
    async fn test_write_file_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/c.txt");

        write_file(&path, b"payload").await.unwrap();
        assert_eq!(async_fs::read(&path).await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_delete_path_handles_files_and_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("single.txt");
        let tree = dir.path().join("tree");
        async_fs::write(&file, b"x").await.unwrap();
        async_fs::create_dir_all(tree.join("inner")).await.unwrap();
        async_fs::write(tree.join("inner/leaf.txt"), b"y").await.unwrap();

        delete_path(&file).await.unwrap();
        delete_path(&tree).await.unwrap();
        assert!(!file.exists());
        assert!(!tree.exists());
    }

    #[tokio::test]
    async fn test_delete_missing_path_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        assert!(delete_path(&dir.path().join("ghost")).await.is_ok());
    }

    #[test]
    fn test_safe_join_rejects_traversal() {
        let base = Path::new("/srv/shared");
        assert!(safe_join(base, "notes.txt").is_ok());
        assert!(safe_join(base, "../etc/passwd").is_err());
        assert!(safe_join(base, "a/b.txt").is_err());
        assert!(safe_join(base, "..").is_err());
        assert!(safe_join(base, "").is_err());
    }

    #[test]
    fn test_resolve_under_allows_subdirs_only() {
        let base = Path::new("/srv/shared");
        assert_eq!(
            resolve_under(base, "docs/a.txt").unwrap(),
            PathBuf::from("/srv/shared/docs/a.txt")
        );
        assert!(resolve_under(base, "/etc/passwd").is_err());
        assert!(resolve_under(base, "docs/../../escape").is_err());
        assert!(resolve_under(base, "./docs/a.txt").is_err());
        assert!(resolve_under(base, "").is_err());
    }
}
