//! Typed requests over a session.

use crate::chain::PeerRecord;
use crate::error::ClusterError;
use serde_json::{json, Value};
use ws2p_session::Connection;
use ws2p_wire::{requests, HeadPayload, RequestBody};

/// Issues the WS2P requests of the protocol on one session
#[derive(Clone)]
pub struct Requester {
    connection: Connection,
}

impl Requester {
    /// Wrap a session
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    /// Key of the remote, once authenticated
    pub fn pubkey(&self) -> Option<String> {
        self.connection.pubkey()
    }

    /// The remote's chain tip
    pub async fn get_current(&self) -> Result<Value, ClusterError> {
        let current = self.connection.request(RequestBody::new(requests::CURRENT)).await?;
        if !current.is_object() {
            return Err(ClusterError::unexpected(requests::CURRENT, "not a block"));
        }
        Ok(current)
    }

    /// The remote's block `number`
    pub async fn get_block(&self, number: u64) -> Result<Value, ClusterError> {
        let body = RequestBody::new(requests::BLOCK_BY_NUMBER).with_params(json!({ "number": number }));
        let block = self.connection.request(body).await?;
        if !block.is_object() {
            return Err(ClusterError::unexpected(requests::BLOCK_BY_NUMBER, "not a block"));
        }
        Ok(block)
    }

    /// Up to `count` blocks of the remote starting at `from`
    pub async fn get_blocks(&self, count: u64, from: u64) -> Result<Vec<Value>, ClusterError> {
        let body = RequestBody::new(requests::BLOCKS_CHUNK)
            .with_params(json!({ "count": count, "fromNumber": from }));
        match self.connection.request(body).await? {
            Value::Array(blocks) => Ok(blocks),
            _ => Err(ClusterError::unexpected(requests::BLOCKS_CHUNK, "not an array")),
        }
    }

    /// Peers known by the remote
    pub async fn get_known_peers(&self) -> Result<Vec<PeerRecord>, ClusterError> {
        let answer = self.connection.request(RequestBody::new(requests::KNOWN_PEERS)).await?;
        let peers = answer
            .get("peers")
            .cloned()
            .ok_or_else(|| ClusterError::unexpected(requests::KNOWN_PEERS, "missing peers"))?;
        serde_json::from_value(peers)
            .map_err(|e| ClusterError::unexpected(requests::KNOWN_PEERS, e.to_string()))
    }

    /// Heads known by the remote
    pub async fn get_heads(&self) -> Result<Vec<HeadPayload>, ClusterError> {
        let answer = self.connection.request(RequestBody::new(requests::HEADS)).await?;
        serde_json::from_value(answer)
            .map_err(|e| ClusterError::unexpected(requests::HEADS, e.to_string()))
    }
}
