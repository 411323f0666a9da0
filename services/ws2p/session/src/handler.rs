//! Application message handlers plugged into a session.

use crate::connection::Connection;
use async_trait::async_trait;
use serde_json::Value;
use ws2p_wire::{PushMessage, RequestBody};

/// Application side of a session: handles pushes and answers requests.
///
/// Pushes are delivered one at a time in arrival order. Requests are answered
/// concurrently. Failures of `handle_push` are logged and never sent back;
/// failures of `answer_to_request` are returned to the requester as `err`.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle a pushed document
    async fn handle_push(&self, push: PushMessage, connection: &Connection) -> anyhow::Result<()>;

    /// Compute the answer to a request
    async fn answer_to_request(
        &self,
        body: RequestBody,
        connection: &Connection,
    ) -> anyhow::Result<Value>;
}

/// Handler that ignores pushes and refuses every request
#[derive(Debug, Default, Clone, Copy)]
pub struct MutedHandler;

#[async_trait]
impl MessageHandler for MutedHandler {
    async fn handle_push(&self, _push: PushMessage, _connection: &Connection) -> anyhow::Result<()> {
        Ok(())
    }

    async fn answer_to_request(
        &self,
        body: RequestBody,
        _connection: &Connection,
    ) -> anyhow::Result<Value> {
        anyhow::bail!("unsupported request {}", body.name)
    }
}
