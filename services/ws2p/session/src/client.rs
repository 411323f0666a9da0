//! Outbound WS2P sessions.

use crate::auth::{AdmissionPolicy, PubkeyLocalAuth, PubkeyRemoteAuth};
use crate::connection::{Connection, ConnectionConfig, ConnectionOptions};
use crate::crypto::KeyPair;
use crate::error::ConnectionError;
use crate::handler::MessageHandler;
use std::sync::Arc;
use tokio_tungstenite::MaybeTlsStream;
use tracing::{debug, info};

/// Dials remote WS2P endpoints with our identity
#[derive(Clone)]
pub struct Client {
    currency: String,
    pair: Arc<KeyPair>,
    handler: Arc<dyn MessageHandler>,
    options: ConnectionOptions,
}

impl Client {
    /// Create a client signing with `pair`
    pub fn new(
        currency: impl Into<String>,
        pair: Arc<KeyPair>,
        handler: Arc<dyn MessageHandler>,
        options: ConnectionOptions,
    ) -> Self {
        Self {
            currency: currency.into(),
            pair,
            handler,
            options,
        }
    }

    /// Open a session to `address` and complete the handshake.
    ///
    /// `expected_pubkey` pins the remote identity; `policy` decides whether
    /// the key presented by the remote is acceptable.
    pub async fn connect_to(
        &self,
        address: &str,
        expected_pubkey: Option<&str>,
        instance_id: Option<&str>,
        policy: Arc<dyn AdmissionPolicy>,
    ) -> Result<Connection, ConnectionError> {
        debug!("WS2P: dialing {}", address);
        let dial = tokio_tungstenite::connect_async(address);
        let (ws, _) = tokio::time::timeout(self.options.connection_timeout, dial)
            .await
            .map_err(|_| ConnectionError::ConnectionTimeout)?
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;

        let peer_addr = match ws.get_ref() {
            MaybeTlsStream::Plain(tcp) => tcp.peer_addr().ok(),
            _ => None,
        };
        let connection = Connection::new(
            ws,
            Box::new(PubkeyLocalAuth::new(
                self.currency.clone(),
                self.pair.clone(),
                policy.clone(),
            )),
            Box::new(PubkeyRemoteAuth::new(
                self.currency.clone(),
                self.pair.clone(),
                policy,
            )),
            self.handler.clone(),
            ConnectionConfig {
                options: self.options,
                expected_pubkey: expected_pubkey.map(str::to_string),
                instance_id: instance_id.map(str::to_string),
                address: Some(address.to_string()),
                peer_addr,
            },
        );

        if let Err(e) = connection.connect().await {
            connection.close().await;
            return Err(e);
        }
        info!(
            "WS2P: established outbound connection to {} ({})",
            address,
            connection.pubkey().unwrap_or_default()
        );
        Ok(connection)
    }

    /// Our public key
    pub fn pubkey(&self) -> &str {
        self.pair.pubkey()
    }
}
