use log::{error, info, warn};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, Duration};

use crate::core::config::Config;
use crate::core::message::Message;
use crate::core::peer::{self, NodeId, PeerInfo, PeerRegistry};
use crate::network::transport::{self, ConnectionHandler};
use crate::network::Discovery;
use crate::storage::{files, FileEntry};
use crate::sync::oplog::Operation;
use crate::sync::{OpLog, SyncEngine};
use crate::transfer::{FileSender, RetryQueue, RetryWorker};
use crate::utils::{net, MetricsCollector};
use crate::Result;

const METRICS_REPORT_INTERVAL: Duration = Duration::from_secs(60);
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// One replication node: identity registry, transfer listener, discovery
/// and the retry worker, wired over a shared operation log.
pub struct Node {
    config: Config,
    registry: Arc<RwLock<PeerRegistry>>,
    oplog: Arc<OpLog>,
    engine: Arc<SyncEngine>,
    queue: Arc<RetryQueue>,
    sender: Arc<FileSender>,
    metrics: Arc<MetricsCollector>,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl Node {
    pub async fn new(config: Config) -> Result<Self> {
        tokio::fs::create_dir_all(&config.shared_dir).await?;
        tokio::fs::create_dir_all(&config.state_dir).await?;

        let local_addr = SocketAddr::new(net::local_ip(), config.tcp_port);
        info!("Local node address is {}", local_addr);

        let mut registry = PeerRegistry::new(local_addr);
        match peer::load_peers(&config.peers_path()).await {
            Ok(snapshot) if !snapshot.is_empty() => {
                registry.restore(snapshot);
                if registry.is_assigned() {
                    info!("Restored identity: node {}", registry.local_id());
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Ignoring unreadable peer snapshot: {}", e),
        }

        let registry = Arc::new(RwLock::new(registry));
        let oplog = Arc::new(OpLog::new(config.oplog_path()));
        let engine = Arc::new(SyncEngine::new(oplog.clone()));
        let queue = Arc::new(RetryQueue::new(config.retry_queue_path()));
        let metrics = Arc::new(MetricsCollector::new());
        let sender = Arc::new(FileSender::new(
            oplog.clone(),
            queue.clone(),
            metrics.clone(),
            &config,
        ));

        Ok(Self {
            config,
            registry,
            oplog,
            engine,
            queue,
            sender,
            metrics,
            shutdown_tx: None,
        })
    }

    /// Bring up every service and block until shutdown is requested or
    /// Ctrl+C arrives.
    pub async fn start(&mut self) -> Result<()> {
        info!(
            "Starting node on TCP port {} (discovery on UDP {})",
            self.config.tcp_port, self.config.discovery_port
        );

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        self.shutdown_tx = Some(shutdown_tx);

        let discovery = Arc::new(Discovery::new(
            self.registry.clone(),
            self.config.discovery_port,
            self.config.peers_path(),
        ));
        {
            let discovery = discovery.clone();
            tokio::spawn(async move {
                if let Err(e) = discovery.run_listener().await {
                    error!("Discovery listener failed: {}", e);
                }
            });
        }
        {
            let discovery = discovery.clone();
            let hello_interval = self.config.hello_interval;
            tokio::spawn(async move {
                discovery.run_hello_loop(hello_interval).await;
            });
        }
        {
            let discovery = discovery.clone();
            let grace = self.config.election_grace;
            tokio::spawn(async move {
                discovery.run_self_election(grace).await;
            });
        }

        let handler = Arc::new(ConnectionHandler::new(
            self.config.shared_dir.clone(),
            self.engine.clone(),
            self.metrics.clone(),
        ));
        {
            let port = self.config.tcp_port;
            tokio::spawn(async move {
                if let Err(e) = handler.run_listener(port).await {
                    error!("Transfer listener failed: {}", e);
                }
            });
        }

        let worker = Arc::new(RetryWorker::new(
            self.queue.clone(),
            self.sender.clone(),
            self.oplog.clone(),
            self.config.max_task_retries,
        ));
        {
            let retry_interval = self.config.retry_interval;
            tokio::spawn(async move {
                worker.run(retry_interval).await;
            });
        }

        {
            let metrics = self.metrics.clone();
            tokio::spawn(async move {
                let mut ticker = interval(METRICS_REPORT_INTERVAL);
                ticker.tick().await; // skip the immediate first tick
                loop {
                    ticker.tick().await;
                    metrics.log_report().await;
                }
            });
        }

        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down");
            }
        }

        Ok(())
    }

    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
    }

    pub async fn node_id(&self) -> NodeId {
        self.registry.read().await.local_id()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.registry.read().await.peers()
    }

    /// Probe every known peer's transfer port.
    pub async fn live_peers(&self) -> Vec<(PeerInfo, bool)> {
        let peers = self.peers().await;
        let mut report = Vec::with_capacity(peers.len());
        for peer in peers {
            let alive = transport::probe(peer.addr, PROBE_TIMEOUT).await;
            report.push((peer, alive));
        }
        report
    }

    /// Push a file or directory to one peer.
    pub async fn send_file(&self, path: &Path, target: SocketAddr) -> Result<()> {
        self.sender.send_file(path, target).await
    }

    pub async fn list_local_files(&self) -> Result<Vec<FileEntry>> {
        files::list_files(&self.config.shared_dir).await
    }

    /// Delete under the shared root and record it for replication.
    pub async fn delete_path(&self, relative: &str) -> Result<()> {
        let target = files::resolve_under(&self.config.shared_dir, relative)?;
        self.engine.record_delete(&target).await
    }

    /// Ask every known remote peer to delete the same path. Unreachable
    /// peers are skipped; returns how many accepted the message.
    pub async fn broadcast_delete(&self, relative: &str) -> Result<usize> {
        let origin = self.node_id().await;
        let peers = { self.registry.read().await.remote_peers() };

        let mut notified = 0;
        for peer in peers {
            let message = Message::delete(origin, peer.id, relative.to_string());
            match transport::send_message(peer.addr, self.config.dial_timeout, &message).await {
                Ok(()) => notified += 1,
                Err(e) => warn!("Could not notify node {} ({}): {}", peer.id, peer.addr, e),
            }
        }
        Ok(notified)
    }

    /// Pull the peer's full log and merge everything newer than the local
    /// watermark. Returns how many operations were applied.
    pub async fn request_sync(&self, target: SocketAddr) -> Result<usize> {
        let origin = self.node_id().await;
        let reply = transport::request(
            target,
            self.config.dial_timeout,
            &Message::sync_request(origin, 0),
        )
        .await?;
        let remote: Vec<Operation> = serde_json::from_slice(&reply)?;
        info!("Fetched {} operation(s) from {}", remote.len(), target);

        let watermark = self.engine.last_sync_time().await?;
        let applied = self.engine.sync_with_logs(&remote, watermark).await?;
        self.metrics.record_operations_applied(applied as u64).await;
        Ok(applied)
    }

    /// Push the local log to a peer, which merges it against its own
    /// watermark.
    pub async fn push_log(&self, target: SocketAddr) -> Result<()> {
        let origin = self.node_id().await;
        let ops = self.oplog.read().await?;
        let message = Message::sync(origin, 0, &ops)?;
        transport::send_message(target, self.config.dial_timeout, &message).await?;
        info!("Pushed {} operation(s) to {}", ops.len(), target);
        Ok(())
    }

    /// Fetch a peer's shared-tree listing.
    pub async fn request_view(&self, target: SocketAddr) -> Result<Vec<FileEntry>> {
        let origin = self.node_id().await;
        let reply = transport::request(
            target,
            self.config.dial_timeout,
            &Message::view(origin, 0),
        )
        .await?;
        Ok(serde_json::from_slice(&reply)?)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &Path) -> Config {
        Config {
            shared_dir: dir.join("shared"),
            state_dir: dir.join("state"),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_new_node_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::new(test_config(dir.path())).await.unwrap();

        assert!(dir.path().join("shared").is_dir());
        assert!(dir.path().join("state").is_dir());
        assert_eq!(node.node_id().await, 0);
        assert!(node.peers().await.is_empty());
    }

    #[tokio::test]
    async fn test_restart_restores_identity_from_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        let first = Node::new(config.clone()).await.unwrap();
        let local_addr = { first.registry.read().await.local_addr() };
        first.registry.write().await.take_id(3);
        let peers = first.peers().await;
        peer::save_peers(&config.peers_path(), &peers).await.unwrap();
        drop(first);

        let second = Node::new(config).await.unwrap();
        assert_eq!(second.node_id().await, 3);
        assert_eq!(
            second.registry.read().await.id_of(local_addr),
            Some(3)
        );
    }

    #[tokio::test]
    async fn test_delete_path_records_operation() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::new(test_config(dir.path())).await.unwrap();
        let victim = dir.path().join("shared/drop.txt");
        tokio::fs::write(&victim, b"x").await.unwrap();

        node.delete_path("drop.txt").await.unwrap();

        assert!(!victim.exists());
        let ops = node.oplog.read().await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].op_type, crate::sync::OpKind::Delete);
    }

    #[tokio::test]
    async fn test_list_local_files_sees_shared_tree() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::new(test_config(dir.path())).await.unwrap();
        tokio::fs::write(dir.path().join("shared/a.txt"), b"a")
            .await
            .unwrap();

        let entries = node.list_local_files().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "a.txt");
    }
}
