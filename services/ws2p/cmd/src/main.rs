//! WS2P node binary.
//!
//! Runs a standalone WS2P node over an in-memory chain: it listens for inbound
//! sessions, connects to configured peers, gossips heads and pulls blocks.

use anyhow::Context;
use clap::Parser;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use ws2p_cluster::{Cluster, ClusterEvent, MemoryChain, PeerRecord};
use ws2p_session::KeyPair;

mod config;
mod logging;

use config::{NodeConfig, PeerSpec};
use logging::Ws2pLogFormatter;

/// WS2P peer-to-peer node
#[derive(Parser, Debug)]
#[command(name = "ws2p", version, about = "WS2P peer-to-peer node")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Listen address, e.g. 0.0.0.0:20901
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Currency name
    #[arg(long)]
    currency: Option<String>,

    /// Instance id, 8 lower-case hex chars
    #[arg(long)]
    instance_id: Option<String>,

    /// Expanded base58 secret key
    #[arg(long)]
    secret_key: Option<String>,

    /// Peer to connect to, `<pubkey>@WS2P <instance> <host> <port> [path]` (repeatable)
    #[arg(long)]
    peer: Vec<String>,

    /// Outbound sessions ceiling
    #[arg(long)]
    max_private: Option<usize>,

    /// Inbound sessions ceiling
    #[arg(long)]
    max_public: Option<usize>,

    /// Handshake timeout, e.g. 15s
    #[arg(long)]
    connection_timeout: Option<humantime::Duration>,

    /// Request timeout, e.g. 30s
    #[arg(long)]
    request_timeout: Option<humantime::Duration>,

    /// Do not run periodic discovery and block pulling
    #[arg(long)]
    no_crawl: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn apply(&self, config: &mut NodeConfig) -> anyhow::Result<()> {
        let cluster = &mut config.cluster;
        if let Some(listen) = self.listen {
            cluster.host = listen.ip().to_string();
            cluster.port = listen.port();
        }
        if let Some(currency) = &self.currency {
            cluster.currency = currency.clone();
        }
        if let Some(instance_id) = &self.instance_id {
            cluster.instance_id = instance_id.clone();
        }
        if let Some(max) = self.max_private {
            cluster.max_private = max;
        }
        if let Some(max) = self.max_public {
            cluster.max_public = max;
        }
        if let Some(timeout) = self.connection_timeout {
            cluster.connection_timeout = timeout.into();
        }
        if let Some(timeout) = self.request_timeout {
            cluster.request_timeout = timeout.into();
        }
        if let Some(secret) = &self.secret_key {
            config.secret_key = Some(secret.clone());
        }
        for peer in &self.peer {
            config.peers.push(peer.parse::<PeerSpec>()?);
        }
        Ok(())
    }
}

fn load_keypair(secret: Option<&str>) -> anyhow::Result<KeyPair> {
    match secret {
        Some(secret) => KeyPair::from_base58_secret(secret).context("invalid secret key"),
        None => {
            let pair = KeyPair::generate();
            warn!(
                "No secret key configured, using the random key {}",
                pair.pubkey()
            );
            Ok(pair)
        }
    }
}

fn log_event(event: ClusterEvent) {
    match event {
        ClusterEvent::Connected {
            pubkey,
            address,
            level,
        } => component_info!("cluster", "{} session opened with {} ({})", level, pubkey, address),
        ClusterEvent::Disconnected { pubkey, level } => {
            component_info!("cluster", "{} session closed with {}", level, pubkey)
        }
        ClusterEvent::Banned { pubkey, reason } => {
            component_warn!("cluster", "{} banned: {}", pubkey, reason)
        }
        ClusterEvent::HeadsSpread { heads, peers } => {
            component_debug!("gossip", "{} heads spread to {} peers", heads, peers)
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("warn")
        .add_directive(format!("ws2p={}", args.log_level).parse()?)
        .add_directive(format!("ws2p_wire={}", args.log_level).parse()?)
        .add_directive(format!("ws2p_session={}", args.log_level).parse()?)
        .add_directive(format!("ws2p_cluster={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(true)
        .event_format(Ws2pLogFormatter::new("ws2p"))
        .init();

    info!("Starting WS2P node v{}", env!("CARGO_PKG_VERSION"));

    let mut node_config = NodeConfig::load_from_file(&args.config)?;
    args.apply(&mut node_config)?;

    let pair = Arc::new(load_keypair(node_config.secret_key.as_deref())?);
    let backend = Arc::new(MemoryChain::new());
    for peer in &node_config.peers {
        backend
            .add_peer(PeerRecord::new(
                peer.pubkey.clone(),
                vec![peer.endpoint.to_string()],
            ))
            .await;
    }
    if let Some(endpoint) = node_config.cluster.endpoint() {
        info!("Advertising endpoint `{}`", endpoint);
        backend
            .add_peer(PeerRecord::new(pair.pubkey(), vec![endpoint.to_string()]))
            .await;
    }

    let cluster = Cluster::new(node_config.cluster.clone(), pair.clone(), backend)
        .context("invalid ws2p configuration")?;
    let addr = match cluster.listen().await {
        Ok(addr) => addr,
        Err(e) => {
            component_error!(
                "node",
                "Cannot listen on {}:{}: {}",
                node_config.cluster.host,
                node_config.cluster.port,
                e
            );
            return Err(e.into());
        }
    };
    component_info!("node", "Node {} listening on {}", pair.pubkey(), addr);

    let mut events = cluster.subscribe();
    let event_logger = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(event),
                Err(RecvError::Lagged(missed)) => {
                    component_warn!("cluster", "{} status events dropped", missed)
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    if args.no_crawl {
        for peer in &node_config.peers {
            if let Err(e) = cluster.connect_to_remote(&peer.endpoint, &peer.pubkey).await {
                component_warn!("node", "Could not reach {}: {}", peer.pubkey, e);
            }
        }
    } else {
        cluster.start_crawling();
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        component_error!("node", "Cannot wait for the shutdown signal: {}", e);
    }
    info!("Shutdown requested");

    cluster.close().await;
    event_logger.abort();
    info!("WS2P node stopped");
    Ok(())
}
