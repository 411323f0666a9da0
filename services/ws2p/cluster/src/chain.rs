//! Chain backend consumed by the cluster.
//!
//! The cluster never interprets documents itself. Membership, known blocks,
//! known peers and document acceptance are all answered by a [`ChainBackend`].
//! [`MemoryChain`] keeps everything in memory and accepts blocks that extend
//! its tip.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::{debug, trace};
use ws2p_wire::{is_hash_format, Blockstamp, PushKind, Ws2pEndpoint};

/// A peer document reduced to what discovery needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Peer public key
    pub pubkey: String,
    /// Advertised endpoints, WS2P ones among others
    pub endpoints: Vec<String>,
}

impl PeerRecord {
    /// Create a peer record
    pub fn new(pubkey: impl Into<String>, endpoints: Vec<String>) -> Self {
        Self {
            pubkey: pubkey.into(),
            endpoints,
        }
    }

    /// Every parseable WS2P endpoint
    pub fn ws2p_endpoints(&self) -> Vec<Ws2pEndpoint> {
        self.endpoints
            .iter()
            .filter_map(|e| e.parse().ok())
            .collect()
    }

    /// First parseable WS2P endpoint
    pub fn first_ws2p_endpoint(&self) -> Option<Ws2pEndpoint> {
        self.endpoints.iter().find_map(|e| e.parse().ok())
    }
}

/// Blockstamp of a block document, when it carries `number` and `hash`
pub fn blockstamp_of(block: &Value) -> Option<Blockstamp> {
    let number = block.get("number")?.as_u64()?;
    let hash = block.get("hash")?.as_str()?;
    is_hash_format(hash).then(|| Blockstamp::new(number, hash))
}

/// Upper-case hex SHA-256 of a document's JSON rendering
pub fn document_hash(document: &Value) -> String {
    let digest = Sha256::digest(document.to_string().as_bytes());
    digest.iter().map(|b| format!("{:02X}", b)).collect()
}

/// Storage and validation collaborator of the cluster
#[async_trait]
pub trait ChainBackend: Send + Sync {
    /// Whether `pubkey` is a member of the web of trust
    async fn is_member(&self, pubkey: &str) -> Result<bool>;

    /// Whether the block at `blockstamp` is known locally
    async fn block_exists(&self, blockstamp: &Blockstamp) -> Result<bool>;

    /// Local chain tip
    async fn current_block(&self) -> Result<Option<Value>>;

    /// Block by number
    async fn block(&self, number: u64) -> Result<Option<Value>>;

    /// Up to `count` blocks starting at `from`
    async fn blocks(&self, count: u64, from: u64) -> Result<Vec<Value>>;

    /// Known peers advertising WS2P endpoints
    async fn ws2p_peers(&self) -> Result<Vec<PeerRecord>>;

    /// Submit a document received from the network.
    ///
    /// Returns `Ok(true)` when the document is new and accepted, `Ok(false)`
    /// when it was already known, and an error when it is invalid.
    async fn submit_document(&self, kind: PushKind, document: Value) -> Result<bool>;
}

/// In-memory chain backend
#[derive(Debug, Default)]
pub struct MemoryChain {
    members: RwLock<HashSet<String>>,
    blocks: RwLock<Vec<Value>>,
    peers: RwLock<Vec<PeerRecord>>,
    documents: RwLock<HashMap<String, (PushKind, Value)>>,
}

impl MemoryChain {
    /// Create an empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a chain holding `blocks`, which must be numbered from 0
    pub fn with_blocks(blocks: Vec<Value>) -> Self {
        Self {
            blocks: RwLock::new(blocks),
            ..Self::default()
        }
    }

    /// Register a member key
    pub async fn add_member(&self, pubkey: impl Into<String>) {
        self.members.write().await.insert(pubkey.into());
    }

    /// Register or replace a peer record
    pub async fn add_peer(&self, peer: PeerRecord) {
        let mut peers = self.peers.write().await;
        peers.retain(|p| p.pubkey != peer.pubkey);
        peers.push(peer);
    }

    /// Number of blocks held
    pub async fn len(&self) -> usize {
        self.blocks.read().await.len()
    }

    /// Whether no block is held
    pub async fn is_empty(&self) -> bool {
        self.blocks.read().await.is_empty()
    }

    /// Number of non-block, non-peer documents held
    pub async fn documents_count(&self) -> usize {
        self.documents.read().await.len()
    }

    async fn apply_block(&self, block: Value) -> Result<bool> {
        let stamp = blockstamp_of(&block).ok_or_else(|| anyhow!("malformed block"))?;
        let mut blocks = self.blocks.write().await;
        let height = blocks.len() as u64;
        if stamp.number < height {
            if blocks
                .get(stamp.number as usize)
                .and_then(blockstamp_of)
                .map_or(false, |known| known == stamp)
            {
                return Ok(false);
            }
            bail!("block {} forks from the local chain", stamp);
        }
        if stamp.number > height {
            bail!("block {} does not follow local tip #{}", stamp, height as i64 - 1);
        }
        debug!("Chain: applied block {}", stamp);
        blocks.push(block);
        Ok(true)
    }

    async fn apply_peer(&self, document: Value) -> Result<bool> {
        let peer: PeerRecord =
            serde_json::from_value(document).map_err(|e| anyhow!("malformed peer: {}", e))?;
        let mut peers = self.peers.write().await;
        if peers.contains(&peer) {
            return Ok(false);
        }
        peers.retain(|p| p.pubkey != peer.pubkey);
        trace!("Chain: recorded peer {}", peer.pubkey);
        peers.push(peer);
        Ok(true)
    }
}

#[async_trait]
impl ChainBackend for MemoryChain {
    async fn is_member(&self, pubkey: &str) -> Result<bool> {
        Ok(self.members.read().await.contains(pubkey))
    }

    async fn block_exists(&self, blockstamp: &Blockstamp) -> Result<bool> {
        Ok(self
            .blocks
            .read()
            .await
            .get(blockstamp.number as usize)
            .and_then(blockstamp_of)
            .map_or(false, |known| &known == blockstamp))
    }

    async fn current_block(&self) -> Result<Option<Value>> {
        Ok(self.blocks.read().await.last().cloned())
    }

    async fn block(&self, number: u64) -> Result<Option<Value>> {
        Ok(self.blocks.read().await.get(number as usize).cloned())
    }

    async fn blocks(&self, count: u64, from: u64) -> Result<Vec<Value>> {
        Ok(self
            .blocks
            .read()
            .await
            .iter()
            .skip(from as usize)
            .take(count as usize)
            .cloned()
            .collect())
    }

    async fn ws2p_peers(&self) -> Result<Vec<PeerRecord>> {
        Ok(self
            .peers
            .read()
            .await
            .iter()
            .filter(|p| p.first_ws2p_endpoint().is_some())
            .cloned()
            .collect())
    }

    async fn submit_document(&self, kind: PushKind, document: Value) -> Result<bool> {
        match kind {
            PushKind::Block => self.apply_block(document).await,
            PushKind::Peer => self.apply_peer(document).await,
            PushKind::Head => bail!("heads are not documents"),
            _ => {
                if !document.is_object() && !document.is_string() {
                    bail!("malformed {} document", kind.payload_key());
                }
                let hash = document_hash(&document);
                let mut documents = self.documents.write().await;
                if documents.contains_key(&hash) {
                    return Ok(false);
                }
                documents.insert(hash, (kind, document));
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn block(number: u64) -> Value {
        json!({"number": number, "hash": format!("{:064X}", number + 1)})
    }

    #[tokio::test]
    async fn test_blocks_must_extend_tip() {
        let chain = MemoryChain::new();
        assert!(chain.submit_document(PushKind::Block, block(0)).await.unwrap());
        assert!(!chain.submit_document(PushKind::Block, block(0)).await.unwrap());
        assert!(chain.submit_document(PushKind::Block, block(2)).await.is_err());
        assert!(chain.submit_document(PushKind::Block, block(1)).await.unwrap());

        let current = chain.current_block().await.unwrap().unwrap();
        assert_eq!(blockstamp_of(&current).unwrap().number, 1);
        assert!(chain
            .block_exists(&Blockstamp::new(1, format!("{:064X}", 2)))
            .await
            .unwrap());
        assert!(!chain
            .block_exists(&Blockstamp::new(1, format!("{:064X}", 9)))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_blocks_range() {
        let chain = MemoryChain::with_blocks((0..10).map(block).collect());
        let chunk = chain.blocks(3, 8).await.unwrap();
        assert_eq!(chunk, vec![block(8), block(9)]);
        assert!(chain.block(10).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_documents_are_deduplicated() {
        let chain = MemoryChain::new();
        let identity = json!({"uid": "alice"});
        assert!(chain
            .submit_document(PushKind::Identity, identity.clone())
            .await
            .unwrap());
        assert!(!chain.submit_document(PushKind::Identity, identity).await.unwrap());
        assert!(chain.submit_document(PushKind::Identity, json!(42)).await.is_err());
        assert_eq!(chain.documents_count().await, 1);
    }

    #[tokio::test]
    async fn test_peers_without_ws2p_endpoint_are_hidden() {
        let chain = MemoryChain::new();
        let pubkey = "HgTTJLAQ5sqfknMq7yLPZbehtuLSsKj9CxWN7k8QvYJd";
        chain
            .add_peer(PeerRecord::new(pubkey, vec!["BASIC_MERKLED_API 1.2.3.4 80".into()]))
            .await;
        assert!(chain.ws2p_peers().await.unwrap().is_empty());

        let peer = json!({"pubkey": pubkey, "endpoints": ["WS2P 0f00ba12 1.2.3.4 20901"]});
        assert!(chain.submit_document(PushKind::Peer, peer.clone()).await.unwrap());
        assert!(!chain.submit_document(PushKind::Peer, peer).await.unwrap());
        let peers = chain.ws2p_peers().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].first_ws2p_endpoint().unwrap().port, 20901);
    }

    #[test]
    fn test_document_hash_is_hex() {
        let hash = document_hash(&json!({"a": 1}));
        assert!(is_hash_format(&hash));
    }
}
