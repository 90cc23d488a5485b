use crate::utils::store;
use crate::Result;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Instant;

/// Small integer identity handed out over discovery. Zero means the node
/// has not been assigned yet.
pub type NodeId = u32;

pub const UNASSIGNED_ID: NodeId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: NodeId,
    pub addr: SocketAddr,
}

/// Every node's view of who is on the network: the address-to-ID map used
/// when assigning identities, plus the peer list used for fan-out. Callers
/// share it behind `Arc<RwLock<..>>`; each method is one atomic step, so
/// checks and updates cannot interleave with other handlers.
#[derive(Debug)]
pub struct PeerRegistry {
    local_addr: SocketAddr,
    local_id: NodeId,
    assigned: HashMap<SocketAddr, NodeId>,
    next_id: NodeId,
    peers: Vec<PeerInfo>,
    last_hello_sent: Option<Instant>,
    last_id_assigned: Option<Instant>,
}

impl PeerRegistry {
    pub fn new(local_addr: SocketAddr) -> Self {
        Self {
            local_addr,
            local_id: UNASSIGNED_ID,
            assigned: HashMap::new(),
            next_id: 1,
            peers: Vec::new(),
            last_hello_sent: None,
            last_id_assigned: None,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn is_assigned(&self) -> bool {
        self.local_id != UNASSIGNED_ID
    }

    pub fn local_info(&self) -> PeerInfo {
        PeerInfo {
            id: self.local_id,
            addr: self.local_addr,
        }
    }

    pub fn id_of(&self, addr: SocketAddr) -> Option<NodeId> {
        self.assigned.get(&addr).copied()
    }

    /// Everyone known to this node, the local node included once assigned.
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers.clone()
    }

    /// Known peers minus the local node, for fan-out.
    pub fn remote_peers(&self) -> Vec<PeerInfo> {
        self.peers
            .iter()
            .filter(|p| p.addr != self.local_addr)
            .copied()
            .collect()
    }

    pub fn mark_hello_sent(&mut self) {
        self.last_hello_sent = Some(Instant::now());
    }

    pub fn last_hello_sent(&self) -> Option<Instant> {
        self.last_hello_sent
    }

    pub fn last_id_assigned(&self) -> Option<Instant> {
        self.last_id_assigned
    }

    /// Act as assigner for a HELLO: hand out the next free ID, or `None`
    /// when the address is already registered (repeated HELLOs are no-ops).
    pub fn assign_for(&mut self, addr: SocketAddr) -> Option<NodeId> {
        if self.assigned.contains_key(&addr) {
            return None;
        }
        let id = self.next_available_id();
        self.insert_mapping(addr, id);
        Some(id)
    }

    /// Record an assignment learned from the network (NEW_NODE). Returns
    /// false when the address was already known.
    pub fn record(&mut self, addr: SocketAddr, id: NodeId) -> bool {
        if self.assigned.contains_key(&addr) {
            return false;
        }
        self.insert_mapping(addr, id);
        true
    }

    /// Adopt an identity offered to the local node. Only the first offer
    /// wins; later ones return false.
    pub fn take_id(&mut self, id: NodeId) -> bool {
        if self.is_assigned() {
            return false;
        }
        self.local_id = id;
        self.last_id_assigned = Some(Instant::now());
        self.insert_mapping(self.local_addr, id);
        info!("Local node is now node {}", id);
        true
    }

    /// Bootstrap fallback: an unassigned node takes the lowest free ID
    /// itself, which is 1 when it is alone on the network.
    pub fn self_elect(&mut self) -> bool {
        if self.is_assigned() {
            return false;
        }
        let id = self.next_available_id();
        self.take_id(id)
    }

    /// Reload a saved peer snapshot. Re-registers every mapping and, when
    /// the snapshot names the local address, reclaims the previous local ID
    /// so a restarted node keeps its identity.
    pub fn restore(&mut self, snapshot: Vec<PeerInfo>) {
        for peer in snapshot {
            if peer.id == UNASSIGNED_ID {
                continue;
            }
            if peer.addr == self.local_addr && !self.is_assigned() {
                self.take_id(peer.id);
            } else {
                self.record(peer.addr, peer.id);
            }
        }
        debug!("Restored {} peer(s) from snapshot", self.peers.len());
    }

    fn next_available_id(&self) -> NodeId {
        let max_assigned = self.assigned.values().copied().max().unwrap_or(0);
        if max_assigned >= self.next_id {
            max_assigned + 1
        } else {
            self.next_id
        }
    }

    fn insert_mapping(&mut self, addr: SocketAddr, id: NodeId) {
        self.assigned.insert(addr, id);
        if id >= self.next_id {
            self.next_id = id + 1;
        }
        if !self.peers.iter().any(|p| p.addr == addr) {
            self.peers.push(PeerInfo { id, addr });
        }
    }
}

/// Persist the peer list so a restarted node comes back with the same
/// identity and fan-out targets.
pub async fn save_peers(path: &Path, peers: &[PeerInfo]) -> Result<()> {
    store::write_json_atomic(path, &peers).await
}

pub async fn load_peers(path: &Path) -> Result<Vec<PeerInfo>> {
    store::read_json_list(path).await
}
