//! Cluster configuration.

use crate::constants::*;
use crate::error::ClusterError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use ws2p_session::{ConnectionOptions, CONNECTION_TIMEOUT, MAXIMUM_ERRORS_COUNT, REQUEST_TIMEOUT};
use ws2p_wire::{is_instance_id_format, is_pubkey_format, Ws2pEndpoint};

/// Settings of a WS2P cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Currency every session must agree on
    pub currency: String,
    /// Our instance id, 8 lower-case hex chars
    pub instance_id: String,
    /// Listen host
    pub host: String,
    /// Listen port, 0 for any
    pub port: u16,
    /// Publicly reachable host, when the node accepts inbound sessions
    pub remote_host: Option<String>,
    /// Publicly reachable port
    pub remote_port: Option<u16>,
    /// Publicly reachable path
    pub remote_path: Option<String>,
    /// Outbound (level 1) ceiling
    pub max_private: usize,
    /// Inbound (level 2) ceiling
    pub max_public: usize,
    /// Keys always accepted as outbound peers
    pub prefered_nodes: Vec<String>,
    /// Only connect to prefered keys
    pub prefered_only: bool,
    /// Keys always accepted as inbound peers
    pub privileged_nodes: Vec<String>,
    /// Only accept privileged keys
    pub privileged_only: bool,
    /// Delay for a handshake to complete
    pub connection_timeout: Duration,
    /// Delay for a request to be answered
    pub request_timeout: Duration,
    /// Faults tolerated per session
    pub max_errors: u32,
    /// Debounce delay of head gossip
    pub heads_spread_delay: Duration,
    /// How long a banned key is refused
    pub ban_duration: Duration,
    /// Resubmissions of an invalid document before banning
    pub ban_threshold: u32,
    /// Window during which invalid documents are remembered
    pub offense_recall: Duration,
    /// Period of peer discovery
    pub reconnection_interval: Duration,
    /// Period of block pulling
    pub block_pulling_interval: Duration,
    /// Blocks per BLOCKS_CHUNK request
    pub chunk_size: u64,
    /// Sessions picked per pulling shot
    pub peers_per_pull: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            currency: "g1".to_string(),
            instance_id: "0000000a".to_string(),
            host: "127.0.0.1".to_string(),
            port: 20901,
            remote_host: None,
            remote_port: None,
            remote_path: None,
            max_private: MAX_LEVEL_1_PEERS,
            max_public: MAX_LEVEL_2_PEERS,
            prefered_nodes: Vec::new(),
            prefered_only: false,
            privileged_nodes: Vec::new(),
            privileged_only: false,
            connection_timeout: CONNECTION_TIMEOUT,
            request_timeout: REQUEST_TIMEOUT,
            max_errors: MAXIMUM_ERRORS_COUNT,
            heads_spread_delay: HEADS_SPREAD_TIMEOUT,
            ban_duration: BAN_DURATION,
            ban_threshold: BAN_ON_REPEAT_THRESHOLD,
            offense_recall: ERROR_RECALL_DURATION,
            reconnection_interval: RECONNECTION_INTERVAL,
            block_pulling_interval: BLOCK_PULLING_INTERVAL,
            chunk_size: BLOCKS_CHUNK_SIZE,
            peers_per_pull: CRAWL_PEERS_COUNT,
        }
    }
}

impl ClusterConfig {
    /// Check values the cluster cannot run with
    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.currency.is_empty() {
            return Err(ClusterError::Config("currency must not be empty".into()));
        }
        if !is_instance_id_format(&self.instance_id) || self.instance_id == NULL_INSTANCE_ID {
            return Err(ClusterError::Config(format!(
                "invalid instance id {:?}",
                self.instance_id
            )));
        }
        if let Some(key) = self
            .prefered_nodes
            .iter()
            .chain(self.privileged_nodes.iter())
            .find(|k| !is_pubkey_format(k))
        {
            return Err(ClusterError::Config(format!("invalid public key {:?}", key)));
        }
        if self.chunk_size == 0 {
            return Err(ClusterError::Config("chunk size must be positive".into()));
        }
        if self.reconnection_interval.is_zero() || self.block_pulling_interval.is_zero() {
            return Err(ClusterError::Config("crawling intervals must be positive".into()));
        }
        Ok(())
    }

    /// Session settings derived from this configuration
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            connection_timeout: self.connection_timeout,
            request_timeout: self.request_timeout,
            max_errors: self.max_errors,
        }
    }

    /// Endpoint advertised to other nodes, if the node is publicly reachable
    pub fn endpoint(&self) -> Option<Ws2pEndpoint> {
        let host = self.remote_host.as_ref()?;
        Some(Ws2pEndpoint {
            version: None,
            instance_id: self.instance_id.clone(),
            host: host.clone(),
            port: self.remote_port.unwrap_or(self.port),
            path: self.remote_path.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ClusterConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_private, 5);
        assert_eq!(config.max_public, 20);
        assert_eq!(config.ban_threshold, 5);
        assert_eq!(config.heads_spread_delay, Duration::from_millis(100));
    }

    #[test]
    fn test_invalid_instance_id_rejected() {
        let config = ClusterConfig {
            instance_id: "XYZ".into(),
            ..ClusterConfig::default()
        };
        assert!(matches!(config.validate(), Err(ClusterError::Config(_))));

        let config = ClusterConfig {
            instance_id: NULL_INSTANCE_ID.into(),
            ..ClusterConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_endpoint_uses_remote_settings() {
        let mut config = ClusterConfig::default();
        assert!(config.endpoint().is_none());

        config.remote_host = Some("node.example.org".into());
        config.remote_port = Some(443);
        config.remote_path = Some("ws2p".into());
        let endpoint = config.endpoint().unwrap();
        assert_eq!(endpoint.url(), "wss://node.example.org:443/ws2p");
        assert_eq!(endpoint.instance_id, config.instance_id);
    }

    #[test]
    fn test_partial_document_keeps_defaults() {
        let config: ClusterConfig = serde_json::from_str(r#"{"currency": "test", "max_private": 2}"#).unwrap();
        assert_eq!(config.currency, "test");
        assert_eq!(config.max_private, 2);
        assert_eq!(config.max_public, MAX_LEVEL_2_PEERS);
    }
}
