//! Head gossip.
//!
//! Heads are cached per `(pubkey, instance id)` and only ever move forward.
//! A head is accepted when it is well formed and signed, strictly newer than
//! the cached one, issued by a key we trust and pointing at a block we know.
//! Accepted heads wait in a buffer until the cluster spreads them.

use crate::chain::ChainBackend;
use std::collections::{HashMap, HashSet};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, trace, warn};
use ws2p_session::verify;
use ws2p_wire::{is_signature_format, Blockstamp, Head, HeadPayload};

/// Latest accepted head of one instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadRecord {
    /// Announced chain tip
    pub blockstamp: Blockstamp,
    /// Canonical head string
    pub message: String,
    /// Signature over `message`
    pub sig: String,
}

impl HeadRecord {
    /// Wire form of this head
    pub fn payload(&self) -> HeadPayload {
        HeadPayload {
            message: self.message.clone(),
            sig: self.sig.clone(),
        }
    }
}

/// Head cache, trust caches and the pending spread buffer
#[derive(Debug)]
pub struct HeadCache {
    own_pubkey: String,
    records: RwLock<HashMap<(String, String), HeadRecord>>,
    members: RwLock<HashSet<String>>,
    blockstamps: RwLock<HashSet<Blockstamp>>,
    pending: Mutex<Vec<HeadPayload>>,
}

impl HeadCache {
    /// Create an empty cache for the node `own_pubkey`
    pub fn new(own_pubkey: impl Into<String>) -> Self {
        Self {
            own_pubkey: own_pubkey.into(),
            records: RwLock::new(HashMap::new()),
            members: RwLock::new(HashSet::new()),
            blockstamps: RwLock::new(HashSet::new()),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Process a batch of heads and return the accepted ones.
    ///
    /// `connected` lists the keys connected at either tier.
    pub async fn receive(
        &self,
        heads: Vec<HeadPayload>,
        connected: &[String],
        backend: &dyn ChainBackend,
    ) -> Vec<HeadPayload> {
        let mut accepted = Vec::new();
        for payload in heads {
            match self.receive_one(&payload, connected, backend).await {
                Ok(true) => accepted.push(payload),
                Ok(false) => {}
                Err(reason) => trace!("Ignoring head {:?}: {}", payload.message, reason),
            }
        }
        if !accepted.is_empty() {
            self.pending.lock().await.extend(accepted.iter().cloned());
        }
        accepted
    }

    async fn receive_one(
        &self,
        payload: &HeadPayload,
        connected: &[String],
        backend: &dyn ChainBackend,
    ) -> Result<bool, &'static str> {
        let head = Head::parse(&payload.message).map_err(|_| "malformed head")?;
        if !is_signature_format(&payload.sig) || !verify(&payload.message, &payload.sig, &head.pubkey) {
            return Err("wrong signature");
        }
        let key = (head.pubkey.clone(), head.instance_id.clone());
        if !self.is_newer(&key, &head.blockstamp).await {
            return Ok(false);
        }
        if !self.is_allowed(&head.pubkey, connected, backend).await {
            return Err("issuer is neither connected nor a member");
        }
        if !self.block_known(&head.blockstamp, backend).await {
            return Err("unknown block");
        }

        let mut records = self.records.write().await;
        if records
            .get(&key)
            .map_or(false, |r| r.blockstamp.number >= head.blockstamp.number)
        {
            return Ok(false);
        }
        debug!(
            "New head {} for {}-{}",
            head.blockstamp, head.pubkey, head.instance_id
        );
        records.insert(
            key,
            HeadRecord {
                blockstamp: head.blockstamp,
                message: payload.message.clone(),
                sig: payload.sig.clone(),
            },
        );
        Ok(true)
    }

    async fn is_newer(&self, key: &(String, String), blockstamp: &Blockstamp) -> bool {
        self.records
            .read()
            .await
            .get(key)
            .map_or(true, |r| r.blockstamp.number < blockstamp.number)
    }

    async fn is_allowed(&self, pubkey: &str, connected: &[String], backend: &dyn ChainBackend) -> bool {
        if pubkey == self.own_pubkey || connected.iter().any(|k| k == pubkey) {
            return true;
        }
        if self.members.read().await.contains(pubkey) {
            return true;
        }
        match backend.is_member(pubkey).await {
            Ok(true) => {
                self.members.write().await.insert(pubkey.to_string());
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!("Membership lookup of {} failed: {:#}", pubkey, e);
                false
            }
        }
    }

    async fn block_known(&self, blockstamp: &Blockstamp, backend: &dyn ChainBackend) -> bool {
        if self.blockstamps.read().await.contains(blockstamp) {
            return true;
        }
        match backend.block_exists(blockstamp).await {
            Ok(true) => {
                self.note_block(blockstamp.clone()).await;
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!("Block lookup of {} failed: {:#}", blockstamp, e);
                false
            }
        }
    }

    /// Remember a block as locally known
    pub async fn note_block(&self, blockstamp: Blockstamp) {
        self.blockstamps.write().await.insert(blockstamp);
    }

    /// Drain the heads waiting to be spread
    pub async fn take_pending(&self) -> Vec<HeadPayload> {
        std::mem::take(&mut *self.pending.lock().await)
    }

    /// Cached head of `(pubkey, instance_id)`
    pub async fn get(&self, pubkey: &str, instance_id: &str) -> Option<HeadRecord> {
        self.records
            .read()
            .await
            .get(&(pubkey.to_string(), instance_id.to_string()))
            .cloned()
    }

    /// Every cached head
    pub async fn all(&self) -> Vec<HeadPayload> {
        self.records.read().await.values().map(HeadRecord::payload).collect()
    }

    /// Number of cached heads
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Whether no head is cached
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Forget the positive membership and block lookups
    pub async fn clear_caches(&self) {
        self.members.write().await.clear();
        self.blockstamps.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MemoryChain;
    use serde_json::json;
    use ws2p_session::KeyPair;

    fn hash(n: u64) -> String {
        format!("{:064X}", n + 1)
    }

    fn chain(height: u64) -> MemoryChain {
        MemoryChain::with_blocks(
            (0..height)
                .map(|n| json!({"number": n, "hash": hash(n)}))
                .collect(),
        )
    }

    fn signed(pair: &KeyPair, number: u64, instance: &str) -> HeadPayload {
        let head = Head::v1(
            pair.pubkey(),
            Blockstamp::new(number, hash(number)),
            instance,
            "ws2p",
            "0.1.0",
            1,
        );
        let message = head.to_message();
        HeadPayload {
            sig: pair.sign(&message),
            message,
        }
    }

    #[tokio::test]
    async fn test_heads_only_move_forward() {
        let issuer = KeyPair::generate();
        let backend = chain(10);
        backend.add_member(issuer.pubkey()).await;
        let cache = HeadCache::new("me");

        let accepted = cache.receive(vec![signed(&issuer, 5, "0000000b")], &[], &backend).await;
        assert_eq!(accepted.len(), 1);
        assert!(cache
            .receive(vec![signed(&issuer, 5, "0000000b"), signed(&issuer, 3, "0000000b")], &[], &backend)
            .await
            .is_empty());
        assert_eq!(
            cache.get(issuer.pubkey(), "0000000b").await.unwrap().blockstamp.number,
            5
        );

        let accepted = cache.receive(vec![signed(&issuer, 7, "0000000b")], &[], &backend).await;
        assert_eq!(accepted.len(), 1);
        assert_eq!(
            cache.get(issuer.pubkey(), "0000000b").await.unwrap().blockstamp.number,
            7
        );
        assert_eq!(cache.take_pending().await.len(), 2);
        assert!(cache.take_pending().await.is_empty());
    }

    #[tokio::test]
    async fn test_instances_are_tracked_separately() {
        let issuer = KeyPair::generate();
        let backend = chain(10);
        backend.add_member(issuer.pubkey()).await;
        let cache = HeadCache::new("me");

        cache.receive(vec![signed(&issuer, 8, "0000000b")], &[], &backend).await;
        let accepted = cache.receive(vec![signed(&issuer, 4, "0000000c")], &[], &backend).await;
        assert_eq!(accepted.len(), 1);
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn test_untrusted_issuer_is_ignored_unless_connected() {
        let issuer = KeyPair::generate();
        let backend = chain(10);
        let cache = HeadCache::new("me");

        let head = signed(&issuer, 2, "0000000b");
        assert!(cache.receive(vec![head.clone()], &[], &backend).await.is_empty());
        let connected = vec![issuer.pubkey().to_string()];
        assert_eq!(cache.receive(vec![head], &connected, &backend).await.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_block_and_bad_signature_are_ignored() {
        let issuer = KeyPair::generate();
        let backend = chain(3);
        backend.add_member(issuer.pubkey()).await;
        let cache = HeadCache::new("me");

        assert!(cache.receive(vec![signed(&issuer, 9, "0000000b")], &[], &backend).await.is_empty());

        let mut forged = signed(&issuer, 2, "0000000b");
        forged.sig = KeyPair::generate().sign(&forged.message);
        assert!(cache.receive(vec![forged], &[], &backend).await.is_empty());

        let garbage = HeadPayload {
            message: "WS2P:HEAD:nope".into(),
            sig: "x".into(),
        };
        assert!(cache.receive(vec![garbage], &[], &backend).await.is_empty());
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_v0_heads_use_default_instance() {
        let issuer = KeyPair::generate();
        let backend = chain(3);
        backend.add_member(issuer.pubkey()).await;
        let cache = HeadCache::new("me");

        let message = format!("WS2P:HEAD:{}:1-{}", issuer.pubkey(), hash(1));
        let head = HeadPayload {
            sig: issuer.sign(&message),
            message,
        };
        assert_eq!(cache.receive(vec![head], &[], &backend).await.len(), 1);
        assert!(cache.get(issuer.pubkey(), "00000000").await.is_some());
    }
}
