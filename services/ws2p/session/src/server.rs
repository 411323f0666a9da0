//! Inbound WS2P sessions.
//!
//! The server accepts WebSocket upgrades, runs the handshake on each socket and
//! keeps the authenticated sessions in a table. The table is kept clean of
//! duplicate keys and trimmed down to the configured ceiling by evicting the
//! lowest priority sessions first.

use crate::auth::{AdmissionPolicy, PubkeyLocalAuth, PubkeyRemoteAuth};
use crate::connection::{Connection, ConnectionConfig, ConnectionOptions};
use crate::crypto::KeyPair;
use crate::handler::MessageHandler;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Admission and eviction decisions delegated to the overlay
#[async_trait]
pub trait ServerPolicy: Send + Sync {
    /// Whether `pubkey` may open an inbound session given the keys already connected
    async fn should_accept(&self, pubkey: &str, connected: &[String]) -> bool;

    /// Priority of a key; lower values are evicted first
    async fn priority_level(&self, pubkey: &str) -> u8;
}

/// Settings of the inbound side
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Currency every session must agree on
    pub currency: String,
    /// Ceiling of inbound sessions, own key excluded
    pub max_public: usize,
    /// Per-session timeouts
    pub options: ConnectionOptions,
}

struct ServerState {
    pair: Arc<KeyPair>,
    settings: ServerSettings,
    handler: Arc<dyn MessageHandler>,
    policy: Arc<dyn ServerPolicy>,
    connections: RwLock<Vec<Connection>>,
    notifications: Option<mpsc::UnboundedSender<Connection>>,
}

/// WS2P listener and its table of inbound sessions
pub struct Server {
    local_addr: SocketAddr,
    state: Arc<ServerState>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

/// Accepts the first key presented on a socket and only that one
struct SaidPubkeyPolicy {
    said: Mutex<Option<String>>,
    state: Arc<ServerState>,
}

#[async_trait]
impl AdmissionPolicy for SaidPubkeyPolicy {
    async fn accept(&self, pubkey: &str) -> bool {
        {
            let Ok(mut said) = self.said.lock() else {
                return false;
            };
            match said.as_deref() {
                None => *said = Some(pubkey.to_string()),
                Some(first) if first != pubkey => return false,
                Some(_) => {}
            }
        }
        let connected = self.state.connected_pubkeys().await;
        self.state.policy.should_accept(pubkey, &connected).await
    }
}

impl Server {
    /// Bind on `host:port` and start accepting sessions.
    ///
    /// Each newly authenticated session is also sent on `notifications`.
    pub async fn bind(
        host: &str,
        port: u16,
        pair: Arc<KeyPair>,
        handler: Arc<dyn MessageHandler>,
        policy: Arc<dyn ServerPolicy>,
        settings: ServerSettings,
        notifications: Option<mpsc::UnboundedSender<Connection>>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind((host, port)).await?;
        let local_addr = listener.local_addr()?;
        let state = Arc::new(ServerState {
            pair,
            settings,
            handler,
            policy,
            connections: RwLock::new(Vec::new()),
            notifications,
        });
        info!("WS2P server {} listening on {}", state.pair.pubkey(), local_addr);

        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        info!("WS2P: new incoming connection from {}", peer);
                        let state = accept_state.clone();
                        tokio::spawn(async move {
                            state.handle_socket(stream, peer).await;
                        });
                    }
                    Err(e) => {
                        warn!("WS2P: accept error: {}", e);
                    }
                }
            }
        });

        Ok(Self {
            local_addr,
            state,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Authenticated inbound sessions
    pub async fn connections(&self) -> Vec<Connection> {
        self.state.connections.read().await.clone()
    }

    /// Number of inbound sessions, own key excluded
    pub async fn count_connections(&self) -> usize {
        self.state.count_connections().await
    }

    /// Session opened by `pubkey`, if any
    pub async fn get_connection(&self, pubkey: &str) -> Option<Connection> {
        self.state
            .connections
            .read()
            .await
            .iter()
            .find(|c| c.pubkey().as_deref() == Some(pubkey))
            .cloned()
    }

    /// Drop duplicates, then evict until under the inbound ceiling
    pub async fn remove_excess_incoming_connections(&self) {
        self.state.remove_excess_incoming_connections().await
    }

    /// Keep a single session per key
    pub async fn remove_duplicate_connections(&self) {
        self.state.remove_duplicate_connections().await
    }

    /// Evict the session with the lowest priority level.
    ///
    /// Returns false when there was nothing to evict.
    pub async fn remove_low_priority_connection(&self) -> bool {
        self.state.remove_low_priority_connection().await
    }

    /// Close every session and stop listening
    pub async fn close(&self) {
        if let Ok(mut task) = self.accept_task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
        let connections: Vec<Connection> = self.state.connections.write().await.drain(..).collect();
        for c in connections {
            c.close().await;
        }
        info!("WS2P server on {} closed", self.local_addr);
    }
}

impl ServerState {
    async fn handle_socket(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let ws = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!("WS2P: websocket upgrade failed for {}: {}", peer, e);
                return;
            }
        };

        let policy: Arc<dyn AdmissionPolicy> = Arc::new(SaidPubkeyPolicy {
            said: Mutex::new(None),
            state: self.clone(),
        });
        let currency = self.settings.currency.clone();
        let connection = Connection::new(
            ws,
            Box::new(PubkeyLocalAuth::new(
                currency.clone(),
                self.pair.clone(),
                policy.clone(),
            )),
            Box::new(PubkeyRemoteAuth::new(currency, self.pair.clone(), policy)),
            self.handler.clone(),
            ConnectionConfig {
                options: self.settings.options,
                peer_addr: Some(peer),
                ..Default::default()
            },
        );

        if let Err(e) = connection.connect().await {
            warn!("WS2P: cannot connect to incoming WebSocket connection from {}: {}", peer, e);
            connection.close().await;
            return;
        }

        let pubkey = connection.pubkey().unwrap_or_default();
        self.connections.write().await.push(connection.clone());
        info!(
            "WS2P: established incoming connection from {} {}",
            short(&pubkey),
            peer
        );
        if let Some(notifications) = &self.notifications {
            let _ = notifications.send(connection.clone());
        }

        let watcher = self.clone();
        let watched = connection.clone();
        tokio::spawn(async move {
            watched.closed().await;
            info!("WS2P: close incoming connection from {} {}", short(&pubkey), peer);
            watcher
                .connections
                .write()
                .await
                .retain(|c| !c.same_as(&watched));
        });

        self.remove_excess_incoming_connections().await;
    }

    async fn connected_pubkeys(&self) -> Vec<String> {
        self.connections
            .read()
            .await
            .iter()
            .filter_map(|c| c.pubkey())
            .collect()
    }

    async fn count_connections(&self) -> usize {
        let own = self.pair.pubkey();
        self.connections
            .read()
            .await
            .iter()
            .filter(|c| c.pubkey().as_deref() != Some(own))
            .count()
    }

    async fn remove_excess_incoming_connections(&self) {
        self.remove_duplicate_connections().await;
        while self.count_connections().await > self.settings.max_public {
            if !self.remove_low_priority_connection().await {
                break;
            }
        }
    }

    async fn remove_duplicate_connections(&self) {
        let own = self.pair.pubkey();
        let duplicates = {
            let mut seen: Vec<String> = Vec::new();
            let mut duplicates = Vec::new();
            for c in self.connections.read().await.iter() {
                let pubkey = c.pubkey().unwrap_or_default();
                if seen.contains(&pubkey) {
                    duplicates.push(c.clone());
                } else if pubkey != own {
                    seen.push(pubkey);
                }
            }
            duplicates
        };
        for c in duplicates {
            debug!("WS2P: removing duplicate connection {}", c.id());
            self.remove_connection(&c).await;
        }
    }

    /// Evict one session; false when the table is empty
    async fn remove_low_priority_connection(&self) -> bool {
        let snapshot = self.connections.read().await.clone();
        let mut lowest: Option<(u8, Connection)> = None;
        for c in snapshot {
            let level = self
                .policy
                .priority_level(&c.pubkey().unwrap_or_default())
                .await;
            match &lowest {
                Some((min, _)) if level >= *min => {}
                _ => lowest = Some((level, c)),
            }
        }
        match lowest {
            Some((level, c)) => {
                debug!("WS2P: evicting connection {} (priority {})", c.id(), level);
                self.remove_connection(&c).await;
                true
            }
            None => false,
        }
    }

    async fn remove_connection(&self, connection: &Connection) {
        let removed = {
            let mut connections = self.connections.write().await;
            let before = connections.len();
            connections.retain(|c| !c.same_as(connection));
            connections.len() != before
        };
        if removed {
            connection.close().await;
        }
    }
}

fn short(pubkey: &str) -> &str {
    pubkey.get(..8).unwrap_or(pubkey)
}
