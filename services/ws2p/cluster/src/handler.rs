//! Message handler plugged into every session of the cluster.

use crate::chain::{blockstamp_of, document_hash};
use crate::cluster::{Cluster, ClusterInner};
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Weak;
use tracing::{debug, trace};
use ws2p_session::{Connection, MessageHandler};
use ws2p_wire::{requests, PushKind, PushMessage, RequestBody};

/// Answers requests from the backend and feeds pushes into the cluster
pub(crate) struct ClusterHandler {
    pub(crate) cluster: Weak<ClusterInner>,
}

impl ClusterHandler {
    fn cluster(&self) -> anyhow::Result<Cluster> {
        self.cluster
            .upgrade()
            .map(Cluster::from_inner)
            .ok_or_else(|| anyhow!("cluster is shut down"))
    }
}

#[async_trait]
impl MessageHandler for ClusterHandler {
    async fn handle_push(&self, push: PushMessage, connection: &Connection) -> anyhow::Result<()> {
        let cluster = self.cluster()?;
        if push.kind == PushKind::Head {
            let heads = push.head_payloads()?;
            trace!("Received {} heads from {}", heads.len(), connection.id());
            cluster.heads_received(heads).await;
            return Ok(());
        }

        let hash = document_hash(&push.payload);
        match cluster
            .backend()
            .submit_document(push.kind, push.payload.clone())
            .await
        {
            Ok(true) => {
                debug!("New {} document {} from {}", push.kind, hash, connection.id());
                if push.kind == PushKind::Block {
                    if let Some(stamp) = blockstamp_of(&push.payload) {
                        cluster.block_applied(stamp).await;
                    }
                }
                cluster.broadcast_document(&push, Some(connection)).await;
                Ok(())
            }
            Ok(false) => {
                trace!("Already known {} document {}", push.kind, hash);
                Ok(())
            }
            Err(e) => {
                let reason = format!("{:#}", e);
                if let Some(pubkey) = connection.pubkey() {
                    cluster.record_offense(&pubkey, &hash, &reason).await;
                }
                Err(e.context(format!("invalid {} document {}", push.kind, hash)))
            }
        }
    }

    async fn answer_to_request(
        &self,
        body: RequestBody,
        _connection: &Connection,
    ) -> anyhow::Result<Value> {
        let cluster = self.cluster()?;
        let backend = cluster.backend();
        match body.name.as_str() {
            requests::CURRENT => backend
                .current_block()
                .await?
                .ok_or_else(|| anyhow!("no current block")),
            requests::BLOCK_BY_NUMBER => {
                let number = body
                    .param_u64("number")
                    .ok_or_else(|| anyhow!("missing block number"))?;
                backend
                    .block(number)
                    .await?
                    .ok_or_else(|| anyhow!("block #{} not found", number))
            }
            requests::BLOCKS_CHUNK => {
                let count = body.param_u64("count").ok_or_else(|| anyhow!("missing count"))?;
                let from = body
                    .param_u64("fromNumber")
                    .ok_or_else(|| anyhow!("missing fromNumber"))?;
                let count = count.min(cluster.config().chunk_size);
                Ok(Value::Array(backend.blocks(count, from).await?))
            }
            requests::KNOWN_PEERS => {
                let peers = backend.ws2p_peers().await?;
                Ok(json!({ "peers": peers }))
            }
            requests::HEADS => Ok(serde_json::to_value(cluster.known_heads().await)?),
            other => bail!("unsupported request {}", other),
        }
    }
}
