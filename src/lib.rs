//! LAN File Replication Library
//!
//! A peer-to-peer replication node: decentralized identity assignment over
//! UDP broadcast, hash-verified file transfer over TCP, and log-based
//! directory synchronization.

pub mod core;
pub mod network;
pub mod storage;
pub mod sync;
pub mod transfer;
pub mod utils;

// Re-export main types
pub use crate::core::peer::{NodeId, PeerInfo};
pub use crate::core::{Config, Node};
pub use network::Discovery;
pub use storage::FileEntry;
pub use sync::{OpKind, Operation, SyncEngine};
pub use utils::error::{Result, SyncError};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
