use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::sync::oplog::{OpKind, OpLog, Operation};
use crate::transfer::sender::FileSender;
use crate::utils::store;
use crate::{Result, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskKind {
    Transfer,
    Delete,
}

/// A transfer that could not be delivered, persisted so it survives
/// restarts. `retries` counts every attempt made so far.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingTask {
    #[serde(rename = "type")]
    pub task_type: TaskKind,
    #[serde(rename = "filepath")]
    pub file_path: PathBuf,
    pub target: SocketAddr,
    pub retries: u32,
}

/// Durable FIFO of pending tasks, one JSON file, mutex-serialized like the
/// operation log.
pub struct RetryQueue {
    path: PathBuf,
    lock: Mutex<()>,
}

impl RetryQueue {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    /// Append one task. A corrupt queue file is reset rather than blocking
    /// new work from being parked.
    pub async fn push(&self, task: PendingTask) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut tasks = match store::read_json_list(&self.path).await {
            Ok(tasks) => tasks,
            Err(SyncError::SerializationError(e)) => {
                warn!("Retry queue unreadable, resetting: {}", e);
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        tasks.push(task);
        store::write_json_atomic(&self.path, &tasks).await
    }

    pub async fn load(&self) -> Result<Vec<PendingTask>> {
        let _guard = self.lock.lock().await;
        store::read_json_list(&self.path).await
    }

    /// Drain the queue in one atomic step. Tasks enqueued after this call
    /// land in the emptied file and are not lost.
    pub async fn take_all(&self) -> Result<Vec<PendingTask>> {
        let _guard = self.lock.lock().await;
        let tasks: Vec<PendingTask> = store::read_json_list(&self.path).await?;
        if !tasks.is_empty() {
            store::write_json_atomic(&self.path, &Vec::<PendingTask>::new()).await?;
        }
        Ok(tasks)
    }

    /// Put tasks back, behind anything enqueued meanwhile.
    pub async fn extend(&self, tasks: Vec<PendingTask>) -> Result<()> {
        if tasks.is_empty() {
            return Ok(());
        }
        let _guard = self.lock.lock().await;
        let mut current: Vec<PendingTask> = store::read_json_list(&self.path).await?;
        current.extend(tasks);
        store::write_json_atomic(&self.path, &current).await
    }
}

/// Background loop that replays parked transfers. Tasks that keep failing
/// are abandoned once their attempt count crosses the cap, with a final
/// SEND_FAIL audit entry.
pub struct RetryWorker {
    queue: Arc<RetryQueue>,
    sender: Arc<FileSender>,
    oplog: Arc<OpLog>,
    max_retries: u32,
}

impl RetryWorker {
    pub fn new(
        queue: Arc<RetryQueue>,
        sender: Arc<FileSender>,
        oplog: Arc<OpLog>,
        max_retries: u32,
    ) -> Self {
        Self {
            queue,
            sender,
            oplog,
            max_retries,
        }
    }

    pub async fn run(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.pass().await {
                Ok(0) => {}
                Ok(flushed) => info!("Retry worker delivered {} task(s)", flushed),
                Err(e) => warn!("Retry pass failed: {}", e),
            }
        }
    }

    /// One pass over the queue: try every parked transfer once, keep the
    /// still-failing ones, abandon the hopeless ones. Returns how many
    /// tasks were delivered.
    pub async fn pass(&self) -> Result<usize> {
        let tasks = self.queue.take_all().await?;
        if tasks.is_empty() {
            return Ok(0);
        }
        debug!("Retry worker picked up {} task(s)", tasks.len());

        let mut delivered = 0;
        let mut kept = Vec::new();

        for mut task in tasks {
            if task.task_type != TaskKind::Transfer {
                // Unknown work for this worker; keep it parked untouched.
                kept.push(task);
                continue;
            }

            match self.sender.try_send(&task.file_path, task.target).await {
                Ok(()) => {
                    info!(
                        "Recovered transfer of {} to {}",
                        task.file_path.display(),
                        task.target
                    );
                    delivered += 1;
                }
                Err(e) => {
                    task.retries += 1;
                    if task.retries >= self.max_retries {
                        warn!(
                            "Abandoning transfer of {} to {} after {} attempts",
                            task.file_path.display(),
                            task.target,
                            task.retries
                        );
                        if let Err(log_err) = self
                            .oplog
                            .append(Operation::audit(
                                OpKind::SendFail,
                                task.file_path.to_string_lossy(),
                                format!(
                                    "abandoned delivery to {} after {} attempts: {}",
                                    task.target, task.retries, e
                                ),
                            ))
                            .await
                        {
                            warn!("Could not record abandonment: {}", log_err);
                        }
                    } else {
                        debug!(
                            "Transfer of {} to {} still failing ({} attempts): {}",
                            task.file_path.display(),
                            task.target,
                            task.retries,
                            e
                        );
                        kept.push(task);
                    }
                }
            }
        }

        self.queue.extend(kept).await?;
        Ok(delivered)
    }
}
