use crate::utils::store;
use crate::{Result, SyncError};
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::Mutex;

pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Kinds of entries in the operation log. `Transfer` and `Delete` mutate
/// the shared tree and replicate to peers; the rest are audit records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpKind {
    Transfer,
    Delete,
    HashOk,
    HashFail,
    SendFail,
    Unpack,
    UnpackFail,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Operation {
    #[serde(rename = "type")]
    pub op_type: OpKind,
    pub path: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "crate::utils::encoding::hex_bytes"
    )]
    pub data: Option<Vec<u8>>,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Operation {
    pub fn transfer(path: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            op_type: OpKind::Transfer,
            path: path.into(),
            data: Some(data),
            timestamp: unix_now(),
            detail: None,
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            op_type: OpKind::Delete,
            path: path.into(),
            data: None,
            timestamp: unix_now(),
            detail: None,
        }
    }

    pub fn audit(kind: OpKind, path: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            op_type: kind,
            path: path.into(),
            data: None,
            timestamp: unix_now(),
            detail: Some(detail.into()),
        }
    }
}

/// Append-only operation log backed by one JSON file. Every append rewrites
/// the file atomically, and a mutex serializes the read-modify-write so
/// concurrent appenders never lose entries.
pub struct OpLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl OpLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub async fn append(&self, op: Operation) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut ops = self.read_tolerant().await?;
        ops.push(op);
        store::write_json_atomic(&self.path, &ops).await
    }

    pub async fn read(&self) -> Result<Vec<Operation>> {
        let _guard = self.lock.lock().await;
        self.read_tolerant().await
    }

    /// Watermark for sync: the newest timestamp recorded locally, 0 for an
    /// empty log.
    pub async fn last_sync_time(&self) -> Result<i64> {
        let ops = self.read().await?;
        Ok(ops.iter().map(|op| op.timestamp).max().unwrap_or(0))
    }

    async fn read_tolerant(&self) -> Result<Vec<Operation>> {
        match store::read_json_list(&self.path).await {
            Ok(ops) => Ok(ops),
            Err(SyncError::SerializationError(e)) => {
                warn!("Operation log unreadable, starting empty: {}", e);
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op_at(ts: i64, path: &str) -> Operation {
        Operation {
            op_type: OpKind::Transfer,
            path: path.to_string(),
            data: Some(vec![1, 2, 3]),
            timestamp: ts,
            detail: None,
        }
    }

    #[tokio::test]
    async fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let log = OpLog::new(dir.path().join("oplog.json"));

        log.append(op_at(10, "a.txt")).await.unwrap();
        log.append(op_at(5, "b.txt")).await.unwrap();
        log.append(Operation::audit(OpKind::HashOk, "a.txt", "verified"))
            .await
            .unwrap();

        let ops = log.read().await.unwrap();
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[0].path, "a.txt");
        assert_eq!(ops[2].op_type, OpKind::HashOk);
    }

    #[tokio::test]
    async fn test_watermark_is_max_timestamp_not_last() {
        let dir = tempfile::tempdir().unwrap();
        let log = OpLog::new(dir.path().join("oplog.json"));

        log.append(op_at(100, "a")).await.unwrap();
        log.append(op_at(40, "b")).await.unwrap();
        assert_eq!(log.last_sync_time().await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_empty_log_watermark_is_zero() {
        let dir = tempfile::tempdir().unwrap();
        let log = OpLog::new(dir.path().join("oplog.json"));
        assert_eq!(log.last_sync_time().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_log_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oplog.json");

        OpLog::new(path.clone()).append(op_at(7, "kept")).await.unwrap();
        let reopened = OpLog::new(path);
        let ops = reopened.read().await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].path, "kept");
    }

    #[tokio::test]
    async fn test_corrupt_log_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oplog.json");
        tokio::fs::write(&path, b"not json").await.unwrap();

        let log = OpLog::new(path);
        assert!(log.read().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_appends_lose_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let log = std::sync::Arc::new(OpLog::new(dir.path().join("oplog.json")));

        let mut handles = Vec::new();
        for i in 0..16 {
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                log.append(op_at(i, &format!("file-{}", i))).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(log.read().await.unwrap().len(), 16);
    }

    #[test]
    fn test_wire_format_uses_screaming_snake_tags() {
        let json = serde_json::to_string(&Operation::delete("gone.txt")).unwrap();
        assert!(json.contains(r#""type":"DELETE""#));

        let audit = serde_json::to_string(&Operation::audit(
            OpKind::SendFail,
            "big.bin",
            "attempt 1 failed",
        ))
        .unwrap();
        assert!(audit.contains(r#""type":"SEND_FAIL""#));
    }
}
