pub mod config;
pub mod message;
pub mod node;
pub mod peer;

pub use config::Config;
pub use message::{Message, MessageType};
pub use node::Node;
pub use peer::{NodeId, PeerInfo, PeerRegistry};
