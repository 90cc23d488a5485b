use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

use crate::core::message::{Message, MessageType};
use crate::storage::{archive, files, HashUtils};
use crate::sync::oplog::{OpKind, Operation};
use crate::sync::SyncEngine;
use crate::utils::MetricsCollector;
use crate::{Result, SyncError};

pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| SyncError::ConnectionFailed(format!("Timed out connecting to {}", addr)))?
        .map_err(|e| {
            SyncError::ConnectionFailed(format!("Failed to connect to {}: {}", addr, e))
        })?;
    debug!("Connected to {}", addr);
    Ok(stream)
}

/// Quick liveness probe: can the peer's transfer port be dialed.
pub async fn probe(addr: SocketAddr, timeout: Duration) -> bool {
    connect(addr, timeout).await.is_ok()
}

/// Fire-and-forget delivery of a structured message.
pub async fn send_message(addr: SocketAddr, timeout: Duration, message: &Message) -> Result<()> {
    let mut stream = connect(addr, timeout).await?;
    let payload = serde_json::to_vec(message)?;
    stream.write_all(&payload).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Request-response exchange: deliver a structured message, half-close so
/// the peer sees EOF, then read its reply until it closes.
pub async fn request(addr: SocketAddr, timeout: Duration, message: &Message) -> Result<Vec<u8>> {
    let mut stream = connect(addr, timeout).await?;
    let payload = serde_json::to_vec(message)?;
    stream.write_all(&payload).await?;
    stream.shutdown().await?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;
    if response.is_empty() {
        return Err(SyncError::ProtocolError(format!(
            "Empty response from {}",
            addr
        )));
    }
    Ok(response)
}

/// Serves the transfer port. Every accepted connection is either a raw
/// file stream (`name\nhash\nbytes...`) or one JSON message; the first
/// byte tells them apart, since a structured message always starts with
/// `{` and file names never do.
pub struct ConnectionHandler {
    shared_dir: PathBuf,
    engine: Arc<SyncEngine>,
    metrics: Arc<MetricsCollector>,
}

impl ConnectionHandler {
    pub fn new(
        shared_dir: PathBuf,
        engine: Arc<SyncEngine>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            shared_dir,
            engine,
            metrics,
        }
    }

    pub async fn run_listener(self: Arc<Self>, port: u16) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await.map_err(|e| {
            SyncError::NetworkError(format!("Failed to bind transfer port {}: {}", port, e))
        })?;
        info!("Transfer listener on 0.0.0.0:{}", port);
        self.serve(listener).await
    }

    /// Accept loop, one task per connection. A failing connection is
    /// logged and dropped without disturbing the others.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("Connection from {}", addr);
                    let handler = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handler.handle_connection(stream, addr).await {
                            warn!("Connection from {} failed: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    pub async fn handle_connection(&self, stream: TcpStream, from: SocketAddr) -> Result<()> {
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let leading = {
            let buffered = reader.fill_buf().await?;
            if buffered.is_empty() {
                return Ok(());
            }
            buffered[0]
        };

        if leading == b'{' {
            self.handle_message(reader, write_half, from).await
        } else {
            self.handle_raw_transfer(reader, from).await
        }
    }

    async fn handle_raw_transfer(
        &self,
        mut reader: BufReader<OwnedReadHalf>,
        from: SocketAddr,
    ) -> Result<()> {
        let mut name = String::new();
        reader.read_line(&mut name).await?;
        let name = name.trim().to_string();
        let mut expected_hash = String::new();
        reader.read_line(&mut expected_hash).await?;
        let expected_hash = expected_hash.trim().to_string();

        if expected_hash.is_empty() {
            return Err(SyncError::ProtocolError(format!(
                "Incomplete transfer header from {}",
                from
            )));
        }
        let dest = files::safe_join(&self.shared_dir, &name)?;

        let mut file = tokio::fs::File::create(&dest).await.map_err(|e| {
            SyncError::IoError(format!("Failed to create {}: {}", dest.display(), e))
        })?;
        let received = tokio::io::copy(&mut reader, &mut file)
            .await
            .map_err(|e| {
                SyncError::NetworkError(format!("Transfer of {} interrupted: {}", name, e))
            })?;
        file.flush().await?;
        drop(file);

        info!("Received {} ({} bytes) from {}", name, received, from);
        self.metrics.record_file_received(received).await;
        let oplog = self.engine.oplog();
        oplog
            .append(Operation::audit(
                OpKind::Transfer,
                dest.to_string_lossy(),
                format!("received {} bytes from {}", received, from),
            ))
            .await?;

        let actual = HashUtils::hash_file(&dest).await?;
        if actual != expected_hash {
            warn!(
                "Hash mismatch for {}: expected {}, got {}",
                name, expected_hash, actual
            );
            self.metrics.record_hash_failure().await;
            oplog
                .append(Operation::audit(
                    OpKind::HashFail,
                    dest.to_string_lossy(),
                    format!("expected {}, got {}", expected_hash, actual),
                ))
                .await?;
            return Ok(());
        }

        info!("Hash verified for {}", name);
        oplog
            .append(Operation::audit(
                OpKind::HashOk,
                dest.to_string_lossy(),
                "sha256 verified",
            ))
            .await?;

        if archive::is_archive(&name) {
            info!("Unpacking {}", name);
            match archive::unpack_archive(&dest, &self.shared_dir).await {
                Ok(()) => {
                    if let Err(e) = tokio::fs::remove_file(&dest).await {
                        warn!("Could not remove {} after unpack: {}", dest.display(), e);
                    }
                    oplog
                        .append(Operation::audit(
                            OpKind::Unpack,
                            dest.to_string_lossy(),
                            "archive extracted",
                        ))
                        .await?;
                }
                Err(e) => {
                    warn!("Failed to unpack {}: {}", name, e);
                    oplog
                        .append(Operation::audit(
                            OpKind::UnpackFail,
                            dest.to_string_lossy(),
                            e.to_string(),
                        ))
                        .await?;
                }
            }
        }

        Ok(())
    }

    async fn handle_message(
        &self,
        mut reader: BufReader<OwnedReadHalf>,
        mut writer: OwnedWriteHalf,
        from: SocketAddr,
    ) -> Result<()> {
        let mut raw = Vec::new();
        reader.read_to_end(&mut raw).await?;
        let message: Message = serde_json::from_slice(&raw).map_err(|e| {
            SyncError::ProtocolError(format!("Malformed message from {}: {}", from, e))
        })?;
        debug!(
            "{:?} message from node {} ({})",
            message.msg_type, message.origin, from
        );

        match message.msg_type {
            MessageType::Transfer => {
                let data = message.data.as_deref().ok_or_else(|| {
                    SyncError::ProtocolError("TRANSFER message carries no payload".to_string())
                })?;
                let dest = files::resolve_under(&self.shared_dir, &message.path)?;
                self.engine.record_write(&dest, data).await?;
                self.metrics.record_file_received(data.len() as u64).await;
                info!(
                    "Stored {} ({} bytes) from node {}",
                    message.path,
                    data.len(),
                    message.origin
                );
            }
            MessageType::Delete => {
                let target = files::resolve_under(&self.shared_dir, &message.path)?;
                self.engine.record_delete(&target).await?;
                info!("Deleted {} on request of node {}", message.path, message.origin);
            }
            MessageType::SyncRequest => {
                let ops = self.engine.oplog().read().await?;
                let payload = serde_json::to_vec(&ops)?;
                writer.write_all(&payload).await?;
                writer.shutdown().await?;
                info!("Served {} operation(s) to node {}", ops.len(), message.origin);
            }
            MessageType::Sync => {
                let ops = message.operations()?;
                let watermark = self.engine.last_sync_time().await?;
                let applied = self.engine.sync_with_logs(&ops, watermark).await?;
                self.metrics.record_operations_applied(applied as u64).await;
            }
            MessageType::View => {
                let entries = files::list_files(&self.shared_dir).await?;
                let payload = serde_json::to_vec(&entries)?;
                writer.write_all(&payload).await?;
                writer.shutdown().await?;
            }
        }

        Ok(())
    }
}
