//! Block download from one session.

use crate::chain::{blockstamp_of, ChainBackend};
use crate::error::ClusterError;
use crate::requester::Requester;
use std::sync::Arc;
use tracing::{debug, info, warn};
use ws2p_wire::{requests, Blockstamp, PushKind};

/// Downloads the blocks a remote has and we lack
pub struct BlockPuller {
    requester: Requester,
    backend: Arc<dyn ChainBackend>,
    chunk_size: u64,
}

impl BlockPuller {
    /// Create a puller over `requester`
    pub fn new(requester: Requester, backend: Arc<dyn ChainBackend>, chunk_size: u64) -> Self {
        Self {
            requester,
            backend,
            chunk_size: chunk_size.max(1),
        }
    }

    async fn local_next(&self) -> Result<u64, ClusterError> {
        let current = self.backend.current_block().await?;
        Ok(current
            .as_ref()
            .and_then(blockstamp_of)
            .map_or(0, |stamp| stamp.number.saturating_add(1)))
    }

    /// Pull blocks up to the remote tip.
    ///
    /// Stops at the first block the backend refuses. Returns the blocks applied
    /// and the last blockstamp applied, if any.
    pub async fn pull(&self) -> Result<(u64, Option<Blockstamp>), ClusterError> {
        let remote = self.requester.get_current().await?;
        let remote = blockstamp_of(&remote)
            .ok_or_else(|| ClusterError::unexpected(requests::CURRENT, "no blockstamp"))?;
        let peer = self.requester.pubkey().unwrap_or_default();

        let mut next = self.local_next().await?;
        if next > remote.number {
            debug!("Pull: {} is not ahead of us ({})", peer, remote);
            return Ok((0, None));
        }
        info!("Pull: downloading #{}..#{} from {}", next, remote.number, peer);

        let mut applied = 0;
        let mut last = None;
        while next <= remote.number {
            let remaining = (remote.number - next)
                .checked_add(1)
                .ok_or_else(|| ClusterError::unexpected(requests::CURRENT, "block number out of range"))?;
            let count = self.chunk_size.min(remaining);
            let blocks = self.requester.get_blocks(count, next).await?;
            if blocks.is_empty() {
                break;
            }
            for block in blocks {
                let stamp = blockstamp_of(&block);
                match self.backend.submit_document(PushKind::Block, block).await {
                    Ok(true) => {
                        applied += 1;
                        last = stamp;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!("Pull: block from {} refused: {:#}", peer, e);
                        return Ok((applied, last));
                    }
                }
            }
            let after = self.local_next().await?;
            if after <= next {
                break;
            }
            next = after;
        }
        Ok((applied, last))
    }
}
