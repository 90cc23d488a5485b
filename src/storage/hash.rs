use crate::{Result, SyncError};
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::AsyncReadExt;

pub struct HashUtils;

impl HashUtils {
    pub fn hash_data(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hex::encode(hasher.finalize())
    }

    /// Streaming SHA-256 of a file, so large transfers never need the whole
    /// payload in memory.
    pub async fn hash_file(path: &Path) -> Result<String> {
        let mut file = tokio::fs::File::open(path).await.map_err(|e| {
            SyncError::IoError(format!("Failed to open {}: {}", path.display(), e))
        })?;

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf).await.map_err(|e| {
                SyncError::IoError(format!("Failed to read {}: {}", path.display(), e))
            })?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        Ok(hex::encode(hasher.finalize()))
    }

    pub fn verify_data(data: &[u8], expected_hash: &str) -> bool {
        Self::hash_data(data) == expected_hash
    }
}
