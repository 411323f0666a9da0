//! Configuration handling for the ws2p service.
//!
//! Values come from the shared YAML config file first, then from `WS2P_*`
//! environment variables. Command line flags are applied last by `main`.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};
use ws2p_cluster::ClusterConfig;
use ws2p_wire::Ws2pEndpoint;

/// A peer given by configuration: `<pubkey>@WS2P <instance> <host> <port> [path]`
#[derive(Debug, Clone, PartialEq)]
pub struct PeerSpec {
    /// Key the peer must authenticate with
    pub pubkey: String,
    /// Where to reach it
    pub endpoint: Ws2pEndpoint,
}

impl std::str::FromStr for PeerSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (pubkey, endpoint) = s
            .split_once('@')
            .ok_or_else(|| anyhow!("peer {:?} is not <pubkey>@<endpoint>", s))?;
        let endpoint = endpoint
            .trim()
            .parse::<Ws2pEndpoint>()
            .map_err(|e| anyhow!("peer {:?}: {}", s, e))?;
        Ok(Self {
            pubkey: pubkey.trim().to_string(),
            endpoint,
        })
    }
}

/// Node configuration
#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    /// Cluster settings
    pub cluster: ClusterConfig,
    /// Expanded base58 secret key, a random key is generated when absent
    pub secret_key: Option<String>,
    /// Peers known at startup
    pub peers: Vec<PeerSpec>,
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    services: Option<ServicesConfig>,
}

#[derive(Debug, Deserialize)]
struct ServicesConfig {
    ws2p: Option<ServiceConfig>,
}

#[derive(Debug, Deserialize)]
struct ServiceConfig {
    args: Option<Vec<String>>,
    config: Option<HashMap<String, String>>,
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .with_context(|| format!("invalid duration {:?} for {}", value, key))
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| anyhow!("invalid number {:?} for {}", value, key))
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "true" | "1" | "yes")
}

impl NodeConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        match std::fs::read_to_string(&config_path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root) => {
                    config.apply_root_config(root)?;
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Err(e) => warn!(
                    "Failed to parse config file {:?} ({}), using defaults",
                    config_path.as_ref(),
                    e
                ),
            },
            Err(_) => warn!(
                "Config file {:?} not found, using defaults",
                config_path.as_ref()
            ),
        }

        config.apply_environment_overrides(|name| std::env::var(name).ok())?;

        info!(
            "Final ws2p configuration: currency={}, instance={}, listen={}:{}, peers={}",
            config.cluster.currency,
            config.cluster.instance_id,
            config.cluster.host,
            config.cluster.port,
            config.peers.len()
        );
        Ok(config)
    }

    fn apply_root_config(&mut self, root: RootConfig) -> Result<()> {
        if let Some(service) = root.services.and_then(|s| s.ws2p) {
            self.apply_service_config(service)?;
        }
        Ok(())
    }

    fn apply_service_config(&mut self, service: ServiceConfig) -> Result<()> {
        for arg in service.args.unwrap_or_default() {
            if let Some(port) = arg.strip_prefix("--port=") {
                self.cluster.port = parse_number("--port", port)?;
            } else if let Some(host) = arg.strip_prefix("--host=") {
                self.cluster.host = host.to_string();
            }
        }

        for (key, value) in service.config.unwrap_or_default() {
            match key.strip_prefix("services.ws2p.") {
                Some(name) => self.apply_value(name, &value)?,
                None => warn!("Ignoring configuration key {} outside services.ws2p", key),
            }
        }
        Ok(())
    }

    /// Apply one setting by its short name (`max_private`, `ban_duration`, ...)
    fn apply_value(&mut self, name: &str, value: &str) -> Result<()> {
        let cluster = &mut self.cluster;
        match name {
            "currency" => cluster.currency = value.to_string(),
            "instance_id" => cluster.instance_id = value.to_string(),
            "host" => cluster.host = value.to_string(),
            "port" => cluster.port = parse_number(name, value)?,
            "remote_host" => cluster.remote_host = Some(value.to_string()),
            "remote_port" => cluster.remote_port = Some(parse_number(name, value)?),
            "remote_path" => cluster.remote_path = Some(value.to_string()),
            "max_private" => cluster.max_private = parse_number(name, value)?,
            "max_public" => cluster.max_public = parse_number(name, value)?,
            "prefered_nodes" => cluster.prefered_nodes = parse_list(value),
            "prefered_only" => cluster.prefered_only = parse_flag(value),
            "privileged_nodes" => cluster.privileged_nodes = parse_list(value),
            "privileged_only" => cluster.privileged_only = parse_flag(value),
            "connection_timeout" => cluster.connection_timeout = parse_duration(name, value)?,
            "request_timeout" => cluster.request_timeout = parse_duration(name, value)?,
            "max_errors" => cluster.max_errors = parse_number(name, value)?,
            "ban_duration" => cluster.ban_duration = parse_duration(name, value)?,
            "ban_threshold" => cluster.ban_threshold = parse_number(name, value)?,
            "offense_recall" => cluster.offense_recall = parse_duration(name, value)?,
            "heads_spread_delay" => cluster.heads_spread_delay = parse_duration(name, value)?,
            "chunk_size" => cluster.chunk_size = parse_number(name, value)?,
            "peers_per_pull" => cluster.peers_per_pull = parse_number(name, value)?,
            "reconnection_interval" => {
                cluster.reconnection_interval = parse_duration(name, value)?
            }
            "block_pulling_interval" => {
                cluster.block_pulling_interval = parse_duration(name, value)?
            }
            "secret_key" => self.secret_key = Some(value.to_string()),
            "peers" => {
                self.peers = value
                    .split(';')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::parse)
                    .collect::<Result<_>>()?
            }
            _ => warn!("Unknown ws2p configuration key {}", name),
        }
        Ok(())
    }

    /// Apply `WS2P_<NAME>` overrides looked up through `lookup`
    fn apply_environment_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        for name in [
            "currency",
            "instance_id",
            "host",
            "port",
            "remote_host",
            "remote_port",
            "max_private",
            "max_public",
            "prefered_nodes",
            "privileged_nodes",
            "heads_spread_delay",
            "offense_recall",
            "chunk_size",
            "peers_per_pull",
            "secret_key",
            "peers",
        ] {
            let variable = format!("WS2P_{}", name.to_uppercase());
            if let Some(value) = lookup(&variable) {
                self.apply_value(name, &value)?;
                if name != "secret_key" {
                    info!("{} overridden by environment: {}", name, value);
                }
            }
        }
        Ok(())
    }
}
