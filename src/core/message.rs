use crate::core::peer::NodeId;
use crate::sync::oplog::{unix_now, Operation};
use crate::{Result, SyncError};
use serde::{Deserialize, Serialize};

/// Structured requests carried over the transfer port. Raw file streams
/// use the same port but never start with a JSON object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Transfer,
    Delete,
    Sync,
    SyncRequest,
    View,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub origin: NodeId,
    /// Destination node ID, 0 for any node.
    pub target: NodeId,
    pub path: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "crate::utils::encoding::hex_bytes"
    )]
    pub data: Option<Vec<u8>>,
    pub timestamp: i64,
}

impl Message {
    fn new(
        msg_type: MessageType,
        origin: NodeId,
        target: NodeId,
        path: String,
        data: Option<Vec<u8>>,
    ) -> Self {
        Self {
            msg_type,
            origin,
            target,
            path,
            data,
            timestamp: unix_now(),
        }
    }

    pub fn transfer(origin: NodeId, target: NodeId, path: String, data: Vec<u8>) -> Self {
        Self::new(MessageType::Transfer, origin, target, path, Some(data))
    }

    pub fn delete(origin: NodeId, target: NodeId, path: String) -> Self {
        Self::new(MessageType::Delete, origin, target, path, None)
    }

    /// Push-style sync: the full local operation log as payload.
    pub fn sync(origin: NodeId, target: NodeId, ops: &[Operation]) -> Result<Self> {
        let payload = serde_json::to_vec(ops)?;
        Ok(Self::new(
            MessageType::Sync,
            origin,
            target,
            String::new(),
            Some(payload),
        ))
    }

    pub fn sync_request(origin: NodeId, target: NodeId) -> Self {
        Self::new(MessageType::SyncRequest, origin, target, String::new(), None)
    }

    pub fn view(origin: NodeId, target: NodeId) -> Self {
        Self::new(MessageType::View, origin, target, String::new(), None)
    }

    /// Decode the operation batch carried by a SYNC message.
    pub fn operations(&self) -> Result<Vec<Operation>> {
        let data = self.data.as_deref().ok_or_else(|| {
            SyncError::ProtocolError("SYNC message carries no operation batch".to_string())
        })?;
        serde_json::from_slice(data).map_err(|e| {
            SyncError::ProtocolError(format!("Malformed operation batch: {}", e))
        })
    }
}
