use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::core::peer::{self, NodeId, PeerRegistry, UNASSIGNED_ID};
use crate::utils::net;
use crate::Result;

/// UDP announcements for decentralized identity assignment. A new node
/// broadcasts HELLO until somebody answers with ASSIGN_ID, and every
/// assignment is flooded as NEW_NODE so all registries converge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnnouncementKind {
    Hello,
    AssignId,
    NewNode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Announcement {
    #[serde(rename = "type")]
    pub kind: AnnouncementKind,
    /// The announcing (or announced) node's LAN address.
    pub ip: IpAddr,
    /// Its TCP transfer port, which doubles as its identity address.
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<NodeId>,
}

impl Announcement {
    pub fn hello(addr: SocketAddr) -> Self {
        Self {
            kind: AnnouncementKind::Hello,
            ip: addr.ip(),
            port: addr.port(),
            id: None,
        }
    }

    pub fn assign_id(addr: SocketAddr, id: NodeId) -> Self {
        Self {
            kind: AnnouncementKind::AssignId,
            ip: addr.ip(),
            port: addr.port(),
            id: Some(id),
        }
    }

    pub fn new_node(addr: SocketAddr, id: NodeId) -> Self {
        Self {
            kind: AnnouncementKind::NewNode,
            ip: addr.ip(),
            port: addr.port(),
            id: Some(id),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

pub struct Discovery {
    registry: Arc<RwLock<PeerRegistry>>,
    discovery_port: u16,
    peers_path: PathBuf,
}

impl Discovery {
    pub fn new(
        registry: Arc<RwLock<PeerRegistry>>,
        discovery_port: u16,
        peers_path: PathBuf,
    ) -> Self {
        Self {
            registry,
            discovery_port,
            peers_path,
        }
    }

    /// Receive loop, one task per datagram so a slow handler never stalls
    /// the socket.
    pub async fn run_listener(self: Arc<Self>) -> Result<()> {
        let socket = net::broadcast_listener(self.discovery_port)?;
        info!("Discovery listening on UDP port {}", self.discovery_port);

        let mut buffer = [0u8; 2048];
        loop {
            match socket.recv_from(&mut buffer).await {
                Ok((len, from)) => {
                    let datagram = buffer[..len].to_vec();
                    let discovery = self.clone();
                    tokio::spawn(async move {
                        discovery.handle_datagram(&datagram, from).await;
                    });
                }
                Err(e) => {
                    warn!("Discovery receive error: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) {
        let announcement = match serde_json::from_slice::<Announcement>(datagram) {
            Ok(announcement) => announcement,
            Err(e) => {
                debug!("Dropping malformed announcement from {}: {}", from, e);
                return;
            }
        };
        self.handle_announcement(announcement).await;
    }

    pub async fn handle_announcement(&self, announcement: Announcement) {
        match announcement.kind {
            AnnouncementKind::Hello => self.handle_hello(announcement).await,
            AnnouncementKind::AssignId => self.handle_assign_id(announcement).await,
            AnnouncementKind::NewNode => self.handle_new_node(announcement).await,
        }
    }

    /// HELLO from an unknown address: assign the next free ID, answer the
    /// newcomer directly and flood the assignment. HELLOs from known
    /// addresses (and our own, looped back by the broadcast) are no-ops.
    async fn handle_hello(&self, announcement: Announcement) {
        let addr = announcement.addr();
        let assigned = {
            let mut registry = self.registry.write().await;
            if addr == registry.local_addr() {
                None
            } else {
                registry.assign_for(addr)
            }
        };
        let Some(id) = assigned else { return };

        info!("Assigned node {} to {}", id, addr);
        self.send_to_peer(&Announcement::assign_id(addr, id), announcement.ip)
            .await;
        self.broadcast(&Announcement::new_node(addr, id)).await;
        self.persist_peers().await;
    }

    /// ASSIGN_ID addressed to the local node while unassigned: adopt the
    /// identity and flood NEW_NODE so everybody learns of it.
    async fn handle_assign_id(&self, announcement: Announcement) {
        let addr = announcement.addr();
        let adopted = {
            let mut registry = self.registry.write().await;
            let id = announcement.id.unwrap_or(UNASSIGNED_ID);
            if addr == registry.local_addr() && id != UNASSIGNED_ID && registry.take_id(id) {
                Some(registry.local_info())
            } else {
                None
            }
        };
        let Some(local) = adopted else { return };

        self.broadcast(&Announcement::new_node(local.addr, local.id))
            .await;
        self.persist_peers().await;
    }

    /// NEW_NODE flood: record the mapping. When it names the local address
    /// while we are still unassigned, the direct ASSIGN_ID was lost and
    /// the flood carries our identity instead.
    async fn handle_new_node(&self, announcement: Announcement) {
        let addr = announcement.addr();
        let id = announcement.id.unwrap_or(UNASSIGNED_ID);
        if id == UNASSIGNED_ID {
            debug!("Dropping NEW_NODE without an id for {}", addr);
            return;
        }

        let (adopted, recorded) = {
            let mut registry = self.registry.write().await;
            if addr == registry.local_addr() && !registry.is_assigned() {
                let taken = registry.take_id(id);
                (taken.then(|| registry.local_info()), false)
            } else {
                (None, registry.record(addr, id))
            }
        };

        if let Some(local) = adopted {
            self.broadcast(&Announcement::new_node(local.addr, local.id))
                .await;
            self.persist_peers().await;
        } else if recorded {
            info!("Registered node {} at {}", id, addr);
            self.persist_peers().await;
        }
    }

    /// Broadcast HELLO until an identity arrives.
    pub async fn run_hello_loop(&self, interval: Duration) {
        loop {
            let hello = {
                let mut registry = self.registry.write().await;
                if registry.is_assigned() {
                    None
                } else {
                    registry.mark_hello_sent();
                    Some(Announcement::hello(registry.local_addr()))
                }
            };
            let Some(announcement) = hello else { break };

            debug!("Broadcasting HELLO from {}", announcement.addr());
            self.broadcast(&announcement).await;
            tokio::time::sleep(interval).await;
        }
        debug!("HELLO loop finished, identity assigned");
    }

    /// Bootstrap fallback: when the grace period passes with no identity,
    /// the node takes one itself and floods it.
    pub async fn run_self_election(&self, grace: Duration) {
        tokio::time::sleep(grace).await;
        let elected = {
            let mut registry = self.registry.write().await;
            if registry.self_elect() {
                Some(registry.local_info())
            } else {
                None
            }
        };
        let Some(local) = elected else { return };

        warn!(
            "No identity assigned after {:?}; elected self as node {}",
            grace, local.id
        );
        self.broadcast(&Announcement::new_node(local.addr, local.id))
            .await;
        self.persist_peers().await;
    }

    async fn broadcast(&self, announcement: &Announcement) {
        let dest = SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), self.discovery_port);
        self.send(announcement, dest).await;
    }

    async fn send_to_peer(&self, announcement: &Announcement, ip: IpAddr) {
        self.send(announcement, SocketAddr::new(ip, self.discovery_port))
            .await;
    }

    /// Announcements are best effort; failures are logged, never fatal.
    async fn send(&self, announcement: &Announcement, dest: SocketAddr) {
        let payload = match serde_json::to_vec(announcement) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Could not encode announcement: {}", e);
                return;
            }
        };
        match net::announcement_sender().await {
            Ok(socket) => {
                if let Err(e) = socket.send_to(&payload, dest).await {
                    warn!("Failed to send announcement to {}: {}", dest, e);
                }
            }
            Err(e) => warn!("Failed to open announcement socket: {}", e),
        }
    }

    async fn persist_peers(&self) {
        let peers = self.registry.read().await.peers();
        if let Err(e) = peer::save_peers(&self.peers_path, &peers).await {
            warn!("Failed to persist peer snapshot: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> SocketAddr {
        format!("192.168.7.{}:8001", last).parse().unwrap()
    }

    fn discovery_at(
        local: SocketAddr,
        dir: &std::path::Path,
    ) -> (Discovery, Arc<RwLock<PeerRegistry>>) {
        let registry = Arc::new(RwLock::new(PeerRegistry::new(local)));
        let discovery = Discovery::new(registry.clone(), 48999, dir.join("peers.json"));
        (discovery, registry)
    }

    #[test]
    fn test_announcement_wire_format() {
        let json = serde_json::to_string(&Announcement::hello(addr(2))).unwrap();
        assert!(json.contains(r#""type":"HELLO""#));
        assert!(!json.contains("id"));

        let json = serde_json::to_string(&Announcement::assign_id(addr(2), 3)).unwrap();
        assert!(json.contains(r#""type":"ASSIGN_ID""#));
        assert!(json.contains(r#""id":3"#));
    }

    #[tokio::test]
    async fn test_hello_assigns_once() {
        let dir = tempfile::tempdir().unwrap();
        let (discovery, registry) = discovery_at(addr(1), dir.path());

        discovery
            .handle_announcement(Announcement::hello(addr(2)))
            .await;
        let first = registry.read().await.id_of(addr(2)).unwrap();

        discovery
            .handle_announcement(Announcement::hello(addr(2)))
            .await;
        assert_eq!(registry.read().await.id_of(addr(2)), Some(first));
        assert_eq!(registry.read().await.peers().len(), 1);
    }

    #[tokio::test]
    async fn test_own_hello_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (discovery, registry) = discovery_at(addr(1), dir.path());

        discovery
            .handle_announcement(Announcement::hello(addr(1)))
            .await;
        assert_eq!(registry.read().await.id_of(addr(1)), None);
        assert!(!registry.read().await.is_assigned());
    }

    #[tokio::test]
    async fn test_hellos_from_different_addresses_get_distinct_ids() {
        let dir = tempfile::tempdir().unwrap();
        let (discovery, registry) = discovery_at(addr(1), dir.path());

        for last in 2..=6 {
            discovery
                .handle_announcement(Announcement::hello(addr(last)))
                .await;
        }

        let registry = registry.read().await;
        let mut ids: Vec<NodeId> = (2..=6).map(|l| registry.id_of(addr(l)).unwrap()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 5);
    }

    #[tokio::test]
    async fn test_assign_id_adopted_only_by_its_target() {
        let dir = tempfile::tempdir().unwrap();
        let (discovery, registry) = discovery_at(addr(1), dir.path());

        // Addressed to somebody else: no adoption.
        discovery
            .handle_announcement(Announcement::assign_id(addr(2), 5))
            .await;
        assert!(!registry.read().await.is_assigned());

        // Addressed to us: adopted, but only the first offer.
        discovery
            .handle_announcement(Announcement::assign_id(addr(1), 7))
            .await;
        assert_eq!(registry.read().await.local_id(), 7);

        discovery
            .handle_announcement(Announcement::assign_id(addr(1), 9))
            .await;
        assert_eq!(registry.read().await.local_id(), 7);
    }

    #[tokio::test]
    async fn test_new_node_records_mapping_once() {
        let dir = tempfile::tempdir().unwrap();
        let (discovery, registry) = discovery_at(addr(1), dir.path());

        discovery
            .handle_announcement(Announcement::new_node(addr(3), 4))
            .await;
        discovery
            .handle_announcement(Announcement::new_node(addr(3), 4))
            .await;

        let registry = registry.read().await;
        assert_eq!(registry.id_of(addr(3)), Some(4));
        assert_eq!(registry.peers().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_datagram_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let (discovery, registry) = discovery_at(addr(1), dir.path());

        discovery.handle_datagram(b"not json at all", addr(2)).await;
        assert!(registry.read().await.peers().is_empty());
    }

    #[tokio::test]
    async fn test_new_node_without_id_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let (discovery, registry) = discovery_at(addr(1), dir.path());

        let mut announcement = Announcement::new_node(addr(3), 4);
        announcement.id = None;
        discovery.handle_announcement(announcement).await;

        assert_eq!(registry.read().await.id_of(addr(3)), None);
    }

    #[tokio::test]
    async fn test_new_node_for_self_recovers_lost_assignment() {
        let dir = tempfile::tempdir().unwrap();
        let (discovery, registry) = discovery_at(addr(1), dir.path());

        discovery
            .handle_announcement(Announcement::new_node(addr(1), 6))
            .await;
        assert_eq!(registry.read().await.local_id(), 6);
    }

    #[tokio::test]
    async fn test_assignment_advances_past_flooded_ids() {
        let dir = tempfile::tempdir().unwrap();
        let (discovery, registry) = discovery_at(addr(1), dir.path());

        discovery
            .handle_announcement(Announcement::new_node(addr(2), 9))
            .await;
        discovery
            .handle_announcement(Announcement::hello(addr(3)))
            .await;

        assert_eq!(registry.read().await.id_of(addr(3)), Some(10));
    }

    #[tokio::test]
    async fn test_assignments_are_snapshotted() {
        let dir = tempfile::tempdir().unwrap();
        let (discovery, _registry) = discovery_at(addr(1), dir.path());

        discovery
            .handle_announcement(Announcement::hello(addr(2)))
            .await;

        let saved = peer::load_peers(&dir.path().join("peers.json")).await.unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].addr, addr(2));
    }
}
