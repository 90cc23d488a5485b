use log::{info, warn};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use crate::core::config::Config;
use crate::network::transport;
use crate::storage::{archive, HashUtils};
use crate::sync::oplog::{OpKind, OpLog, Operation};
use crate::transfer::retry::{PendingTask, RetryQueue, TaskKind};
use crate::utils::MetricsCollector;
use crate::{Result, SyncError};

/// Pushes files and directories to peers over raw TCP streams. A directory
/// is packed into a tarball first; every payload travels as
/// `name\nsha256\nbytes`. Failed deliveries are retried a few times inline
/// and then parked in the durable retry queue.
pub struct FileSender {
    oplog: Arc<OpLog>,
    queue: Arc<RetryQueue>,
    metrics: Arc<MetricsCollector>,
    attempts: u32,
    dial_timeout: Duration,
    backoff_base: Duration,
}

impl FileSender {
    pub fn new(
        oplog: Arc<OpLog>,
        queue: Arc<RetryQueue>,
        metrics: Arc<MetricsCollector>,
        config: &Config,
    ) -> Self {
        Self {
            oplog,
            queue,
            metrics,
            attempts: config.send_attempts,
            dial_timeout: config.dial_timeout,
            backoff_base: Duration::from_secs(1),
        }
    }

    /// Send with the durability guarantee: when every delivery attempt
    /// fails, the transfer is enqueued for the retry worker before the
    /// error is returned. Local failures (unreadable source, packing,
    /// an unsendable name) are not retryable and propagate directly.
    pub async fn send_file(&self, path: &Path, target: SocketAddr) -> Result<()> {
        match self.try_send(path, target).await {
            Ok(()) => Ok(()),
            Err(e @ SyncError::SendExhausted { .. }) => {
                warn!(
                    "Parking {} for retry after failed send to {}",
                    path.display(),
                    target
                );
                self.queue
                    .push(PendingTask {
                        task_type: TaskKind::Transfer,
                        file_path: path.to_path_buf(),
                        target,
                        retries: self.attempts,
                    })
                    .await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// One full send: pack if needed, hash, then attempt delivery with
    /// linear backoff. Does not touch the retry queue.
    pub async fn try_send(&self, path: &Path, target: SocketAddr) -> Result<()> {
        let metadata = tokio::fs::metadata(path).await.map_err(|e| {
            SyncError::IoError(format!("Cannot access {}: {}", path.display(), e))
        })?;

        let (payload, wire_name, scratch) = if metadata.is_dir() {
            let dir_name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .ok_or_else(|| {
                    SyncError::IoError(format!("Directory {} has no name", path.display()))
                })?;
            let wire_name = Self::checked_wire_name(archive::archive_name(&dir_name))?;
            let tarball = archive::temp_archive_path(&dir_name);
            archive::pack_dir(path, &tarball).await?;
            (tarball.clone(), wire_name, Some(tarball))
        } else {
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .ok_or_else(|| {
                    SyncError::IoError(format!("File {} has no name", path.display()))
                })?;
            (path.to_path_buf(), Self::checked_wire_name(file_name)?, None)
        };

        let bytes = tokio::fs::metadata(&payload)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        let hash = HashUtils::hash_file(&payload).await?;
        let result = self.transmit(&payload, &wire_name, &hash, target).await;

        if let Some(tarball) = scratch {
            if let Err(e) = tokio::fs::remove_file(&tarball).await {
                warn!("Could not remove {}: {}", tarball.display(), e);
            }
        }

        let attempt = result?;
        self.metrics.record_file_sent(bytes).await;
        self.oplog
            .append(Operation::audit(
                OpKind::Transfer,
                path.to_string_lossy(),
                format!("sent {} to {} on attempt {}", wire_name, target, attempt),
            ))
            .await?;
        info!("Sent {} to {} ({} bytes)", wire_name, target, bytes);
        Ok(())
    }

    /// The receiver routes any connection whose first byte is `{` to the
    /// message parser, so a raw transfer name must never begin with one.
    fn checked_wire_name(name: String) -> Result<String> {
        if name.starts_with('{') {
            return Err(SyncError::ProtocolError(format!(
                "Refusing to send {}: raw transfer names must not start with '{{'",
                name
            )));
        }
        Ok(name)
    }

    /// Attempt delivery up to `attempts` times with a linearly growing
    /// pause. Each failed attempt leaves a SEND_FAIL audit entry.
    async fn transmit(
        &self,
        payload: &Path,
        wire_name: &str,
        hash: &str,
        target: SocketAddr,
    ) -> Result<u32> {
        let mut last_error = String::new();

        for attempt in 1..=self.attempts {
            match self.transmit_once(payload, wire_name, hash, target).await {
                Ok(()) => return Ok(attempt),
                Err(e) => {
                    warn!(
                        "Attempt {}/{} sending {} to {} failed: {}",
                        attempt, self.attempts, wire_name, target, e
                    );
                    last_error = e.to_string();
                    if let Err(log_err) = self
                        .oplog
                        .append(Operation::audit(
                            OpKind::SendFail,
                            wire_name,
                            format!("attempt {}/{} to {}: {}", attempt, self.attempts, target, e),
                        ))
                        .await
                    {
                        warn!("Could not record send failure: {}", log_err);
                    }
                    if attempt < self.attempts {
                        tokio::time::sleep(self.backoff_base * attempt).await;
                    }
                }
            }
        }

        self.metrics.record_send_failure().await;
        Err(SyncError::SendExhausted {
            attempts: self.attempts,
            reason: last_error,
        })
    }

    async fn transmit_once(
        &self,
        payload: &Path,
        wire_name: &str,
        hash: &str,
        target: SocketAddr,
    ) -> Result<()> {
        let mut stream = transport::connect(target, self.dial_timeout).await?;
        let mut file = tokio::fs::File::open(payload).await.map_err(|e| {
            SyncError::IoError(format!("Failed to open {}: {}", payload.display(), e))
        })?;

        stream
            .write_all(format!("{}\n{}\n", wire_name, hash).as_bytes())
            .await?;
        tokio::io::copy(&mut file, &mut stream)
            .await
            .map_err(|e| SyncError::NetworkError(format!("Stream to {} broke: {}", target, e)))?;
        stream.flush().await?;
        stream.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
    use tokio::net::TcpListener;

    fn sender_with(dir: &Path, attempts: u32) -> (Arc<FileSender>, Arc<RetryQueue>, Arc<OpLog>) {
        let oplog = Arc::new(OpLog::new(dir.join("oplog.json")));
        let queue = Arc::new(RetryQueue::new(dir.join("retry_queue.json")));
        let metrics = Arc::new(MetricsCollector::new());
        let config = Config {
            send_attempts: attempts,
            dial_timeout: Duration::from_millis(300),
            ..Config::default()
        };
        let sender = Arc::new(FileSender::new(
            oplog.clone(),
            queue.clone(),
            metrics,
            &config,
        ));
        (sender, queue, oplog)
    }

    /// Accept one raw transfer and hand back (name, hash, body).
    async fn accept_one(listener: TcpListener) -> (String, String, Vec<u8>) {
        let (stream, _) = listener.accept().await.unwrap();
        let mut reader = BufReader::new(stream);
        let mut name = String::new();
        reader.read_line(&mut name).await.unwrap();
        let mut hash = String::new();
        reader.read_line(&mut hash).await.unwrap();
        let mut body = Vec::new();
        reader.read_to_end(&mut body).await.unwrap();
        (name.trim().to_string(), hash.trim().to_string(), body)
    }

    #[tokio::test]
    async fn test_send_file_streams_name_hash_and_body() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("payload.txt");
        tokio::fs::write(&source, b"file body").await.unwrap();
        let (sender, queue, _oplog) = sender_with(dir.path(), 3);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        let server = tokio::spawn(accept_one(listener));

        sender.send_file(&source, target).await.unwrap();

        let (name, hash, body) = server.await.unwrap();
        assert_eq!(name, "payload.txt");
        assert_eq!(hash, HashUtils::hash_data(b"file body"));
        assert_eq!(body, b"file body");
        assert!(queue.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_directory_is_sent_as_tarball() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("album");
        tokio::fs::create_dir_all(&source).await.unwrap();
        tokio::fs::write(source.join("one.txt"), b"1").await.unwrap();
        let (sender, _queue, _oplog) = sender_with(dir.path(), 3);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        let server = tokio::spawn(accept_one(listener));

        sender.send_file(&source, target).await.unwrap();

        let (name, hash, body) = server.await.unwrap();
        assert_eq!(name, "album.tar.gz");
        assert_eq!(hash, HashUtils::hash_data(&body));
        assert!(!body.is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_send_parks_a_pending_task() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("stranded.txt");
        tokio::fs::write(&source, b"stranded").await.unwrap();
        let (sender, queue, oplog) = sender_with(dir.path(), 2);

        // Nothing listens here; every attempt must fail fast.
        let target: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let result = sender.send_file(&source, target).await;
        assert!(matches!(
            result,
            Err(SyncError::SendExhausted { attempts: 2, .. })
        ));

        let tasks = queue.load().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_type, TaskKind::Transfer);
        assert_eq!(tasks[0].file_path, source);
        assert_eq!(tasks[0].retries, 2);

        let ops = oplog.read().await.unwrap();
        let failures = ops
            .iter()
            .filter(|op| op.op_type == OpKind::SendFail)
            .count();
        assert_eq!(failures, 2);
    }

    #[tokio::test]
    async fn test_missing_source_is_not_queued() {
        let dir = tempfile::tempdir().unwrap();
        let (sender, queue, _oplog) = sender_with(dir.path(), 2);

        let target: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let result = sender
            .send_file(&dir.path().join("ghost.txt"), target)
            .await;

        assert!(matches!(result, Err(SyncError::IoError(_))));
        assert!(queue.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_brace_named_source_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("{weird.txt");
        tokio::fs::write(&source, b"payload").await.unwrap();
        let (sender, queue, oplog) = sender_with(dir.path(), 3);

        // A receiver would route this name to the message parser and
        // drop the bytes, so the send must fail loudly instead.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();

        let result = sender.send_file(&source, target).await;
        assert!(matches!(result, Err(SyncError::ProtocolError(_))));

        let album = dir.path().join("{album");
        tokio::fs::create_dir_all(&album).await.unwrap();
        tokio::fs::write(album.join("one.txt"), b"1").await.unwrap();
        let result = sender.send_file(&album, target).await;
        assert!(matches!(result, Err(SyncError::ProtocolError(_))));

        // Refused before any attempt: no dial, no parked task, no audit.
        let dialed = tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
        assert!(dialed.is_err());
        assert!(queue.load().await.unwrap().is_empty());
        assert!(oplog.read().await.unwrap().is_empty());
    }
}
