use crate::storage::files;
use crate::sync::oplog::{OpKind, OpLog, Operation};
use crate::{Result, SyncError};
use log::{debug, info};
use std::path::Path;
use std::sync::Arc;

/// Replays remote operations against the local tree and records local
/// mutations, so two nodes exchanging logs converge on the same files.
pub struct SyncEngine {
    oplog: Arc<OpLog>,
}

impl SyncEngine {
    pub fn new(oplog: Arc<OpLog>) -> Self {
        Self { oplog }
    }

    pub fn oplog(&self) -> &OpLog {
        &self.oplog
    }

    pub async fn last_sync_time(&self) -> Result<i64> {
        self.oplog.last_sync_time().await
    }

    /// Apply one operation to the local tree. Only `Transfer` and `Delete`
    /// are replayable; audit entries are rejected so they never mutate
    /// anything during sync.
    pub async fn apply_operation(&self, op: &Operation) -> Result<()> {
        match op.op_type {
            OpKind::Transfer => {
                let data = op.data.as_deref().ok_or_else(|| {
                    SyncError::ProtocolError(format!(
                        "Transfer operation for {} carries no payload",
                        op.path
                    ))
                })?;
                files::write_file(Path::new(&op.path), data).await?;
                debug!("Applied transfer of {} ({} bytes)", op.path, data.len());
                Ok(())
            }
            OpKind::Delete => {
                files::delete_path(Path::new(&op.path)).await?;
                debug!("Applied delete of {}", op.path);
                Ok(())
            }
            other => Err(SyncError::ProtocolError(format!(
                "Operation {:?} is not replayable",
                other
            ))),
        }
    }

    /// Merge a remote log: apply every operation newer than `last_sync`,
    /// append the applied ones locally, and report how many landed.
    /// Operations that fail to apply are skipped and stay un-recorded.
    pub async fn sync_with_logs(&self, remote: &[Operation], last_sync: i64) -> Result<usize> {
        let mut applied = 0;

        for op in remote {
            if op.timestamp <= last_sync {
                continue;
            }
            match self.apply_operation(op).await {
                Ok(()) => {
                    self.oplog.append(op.clone()).await?;
                    applied += 1;
                }
                Err(e) => {
                    debug!("Skipping remote operation for {}: {}", op.path, e);
                }
            }
        }

        info!("Sync merged {} operation(s)", applied);
        Ok(applied)
    }

    /// Write a file locally and record a replayable transfer operation.
    pub async fn record_write(&self, path: &Path, data: &[u8]) -> Result<()> {
        files::write_file(path, data).await?;
        self.oplog
            .append(Operation::transfer(path.to_string_lossy(), data.to_vec()))
            .await
    }

    /// Delete a path locally and record a replayable delete operation.
    pub async fn record_delete(&self, path: &Path) -> Result<()> {
        files::delete_path(path).await?;
        self.oplog
            .append(Operation::delete(path.to_string_lossy()))
            .await
    }
}
