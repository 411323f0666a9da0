//! The WS2P cluster of a node.
//!
//! A [`Cluster`] owns the outbound (level 1) sessions it opened and the
//! server holding the inbound (level 2) ones. It decides who may connect,
//! trims both tiers back under their ceilings, gossips heads, bans abusive
//! keys and pulls blocks from its peers.

use crate::admission::{short, Admission, AdmissionQuery};
use crate::bans::{BanList, OffenseLog};
use crate::chain::{blockstamp_of, ChainBackend};
use crate::config::ClusterConfig;
use crate::constants::{DEFAULT_POW_PREFIX, SOFTWARE, SOFTWARE_VERSION, SWEEP_INTERVAL};
use crate::error::ClusterError;
use crate::events::{ClusterEvent, ConnectionLevel};
use crate::handler::ClusterHandler;
use crate::heads::HeadCache;
use crate::puller::BlockPuller;
use crate::requester::Requester;
use async_trait::async_trait;
use futures::future::join_all;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use ws2p_session::{
    AdmissionPolicy, Client, Connection, KeyPair, Server, ServerPolicy, ServerSettings,
};
use ws2p_wire::{Blockstamp, Head, HeadPayload, PushMessage, Ws2pEndpoint};

const EVENTS_CAPACITY: usize = 256;

pub(crate) struct ClusterInner {
    config: ClusterConfig,
    pair: Arc<KeyPair>,
    backend: Arc<dyn ChainBackend>,
    handler: Arc<ClusterHandler>,
    client: Client,
    admission: Admission,
    bans: Arc<BanList>,
    offenses: OffenseLog,
    heads: HeadCache,
    level1: RwLock<HashMap<String, Connection>>,
    server: RwLock<Option<Arc<Server>>>,
    events: broadcast::Sender<ClusterEvent>,
    spread_task: Mutex<Option<JoinHandle<()>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    crawler: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle on the WS2P cluster of a node
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

/// Inbound admission, delegated to the cluster
struct InboundPolicy {
    cluster: Weak<ClusterInner>,
}

#[async_trait]
impl ServerPolicy for InboundPolicy {
    async fn should_accept(&self, pubkey: &str, connected: &[String]) -> bool {
        match self.cluster.upgrade() {
            Some(inner) => Cluster::from_inner(inner).accept_inbound(pubkey, connected).await,
            None => false,
        }
    }

    async fn priority_level(&self, pubkey: &str) -> u8 {
        match self.cluster.upgrade() {
            Some(inner) => {
                inner
                    .admission
                    .key_priority_level(pubkey, &inner.config.privileged_nodes)
                    .await
            }
            None => 0,
        }
    }
}

/// Outbound admission for one dialed endpoint
struct OutboundPolicy {
    cluster: Weak<ClusterInner>,
    expected_pubkey: String,
    target_instance: String,
}

#[async_trait]
impl AdmissionPolicy for OutboundPolicy {
    async fn accept(&self, _pubkey: &str) -> bool {
        match self.cluster.upgrade() {
            Some(inner) => {
                Cluster::from_inner(inner)
                    .accept_outbound(&self.expected_pubkey, Some(&self.target_instance))
                    .await
            }
            None => false,
        }
    }
}

impl Cluster {
    /// Create the cluster of the node signing with `pair`.
    ///
    /// Nothing is opened until [`Cluster::listen`], [`Cluster::connect_to_remote`]
    /// or [`Cluster::start_crawling`] is called.
    pub fn new(
        config: ClusterConfig,
        pair: Arc<KeyPair>,
        backend: Arc<dyn ChainBackend>,
    ) -> Result<Self, ClusterError> {
        config.validate()?;
        let bans = Arc::new(BanList::new(config.ban_duration));
        let (events, _) = broadcast::channel(EVENTS_CAPACITY);

        let inner = Arc::new_cyclic(|weak: &Weak<ClusterInner>| {
            let handler = Arc::new(ClusterHandler {
                cluster: weak.clone(),
            });
            let client = Client::new(
                config.currency.clone(),
                pair.clone(),
                handler.clone(),
                config.connection_options(),
            );
            ClusterInner {
                admission: Admission::new(
                    pair.pubkey(),
                    config.instance_id.clone(),
                    backend.clone(),
                    bans.clone(),
                ),
                offenses: OffenseLog::new(config.ban_threshold, config.offense_recall),
                heads: HeadCache::new(pair.pubkey()),
                config,
                pair,
                backend,
                handler,
                client,
                bans,
                level1: RwLock::new(HashMap::new()),
                server: RwLock::new(None),
                events,
                spread_task: Mutex::new(None),
                background: Mutex::new(Vec::new()),
                crawler: Mutex::new(Vec::new()),
            }
        });
        Ok(Self { inner })
    }

    pub(crate) fn from_inner(inner: Arc<ClusterInner>) -> Self {
        Self { inner }
    }

    /// Our public key
    pub fn pubkey(&self) -> &str {
        self.inner.pair.pubkey()
    }

    /// Configuration in use
    pub fn config(&self) -> &ClusterConfig {
        &self.inner.config
    }

    /// Chain backend
    pub fn backend(&self) -> &Arc<dyn ChainBackend> {
        &self.inner.backend
    }

    /// Subscribe to status notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: ClusterEvent) {
        let _ = self.inner.events.send(event);
    }

    async fn server(&self) -> Option<Arc<Server>> {
        self.inner.server.read().await.clone()
    }

    /// Sessions we opened
    pub async fn level1_connections(&self) -> Vec<Connection> {
        self.inner.level1.read().await.values().cloned().collect()
    }

    /// Sessions our server accepted
    pub async fn level2_connections(&self) -> Vec<Connection> {
        match self.server().await {
            Some(server) => server.connections().await,
            None => Vec::new(),
        }
    }

    /// Every session, both tiers
    pub async fn all_connections(&self) -> Vec<Connection> {
        let mut all = self.level2_connections().await;
        all.extend(self.level1_connections().await);
        all
    }

    /// Keys connected at either tier
    pub async fn connected_pubkeys(&self) -> Vec<String> {
        self.all_connections()
            .await
            .iter()
            .filter_map(Connection::pubkey)
            .collect()
    }

    async fn connected_instances(&self) -> Vec<String> {
        self.all_connections()
            .await
            .iter()
            .filter_map(|c| c.instance_id().map(str::to_string))
            .collect()
    }

    /// Distinct remote keys among our outbound sessions, own key excluded
    pub async fn clients_count(&self) -> usize {
        let own = self.pubkey();
        self.inner
            .level1
            .read()
            .await
            .values()
            .filter_map(Connection::pubkey)
            .filter(|k| k.as_str() != own)
            .collect::<HashSet<_>>()
            .len()
    }

    /// Inbound sessions counted against the inbound ceiling
    pub async fn served_count(&self) -> usize {
        match self.server().await {
            Some(server) => server.count_connections().await,
            None => 0,
        }
    }

    /// Whether `pubkey` is currently banned
    pub async fn is_banned(&self, pubkey: &str) -> bool {
        self.inner.bans.is_banned(pubkey).await
    }

    /// Only the server table counts; outbound duplicates are closed by the trim
    async fn accept_inbound(&self, pubkey: &str, connected: &[String]) -> bool {
        let config = &self.inner.config;
        self.inner
            .admission
            .accept_pubkey(AdmissionQuery {
                pubkey,
                connected_pubkeys: connected,
                connected_instances: &[],
                count: self.served_count().await,
                max: config.max_public,
                priority_keys: &config.privileged_nodes,
                priority_only: config.privileged_only,
                target_instance: None,
            })
            .await
    }

    async fn accept_outbound(&self, pubkey: &str, target_instance: Option<&str>) -> bool {
        let connected_pubkeys = self.connected_pubkeys().await;
        let connected_instances = self.connected_instances().await;
        let config = &self.inner.config;
        self.inner
            .admission
            .accept_pubkey(AdmissionQuery {
                pubkey,
                connected_pubkeys: &connected_pubkeys,
                connected_instances: &connected_instances,
                count: self.clients_count().await,
                max: config.max_private,
                priority_keys: &config.prefered_nodes,
                priority_only: config.prefered_only,
                target_instance,
            })
            .await
    }

    /// Start accepting inbound sessions and return the bound address
    pub async fn listen(&self) -> Result<SocketAddr, ClusterError> {
        if let Some(server) = self.server().await {
            return Ok(server.local_addr());
        }
        let config = &self.inner.config;
        let (notifications, mut accepted) = mpsc::unbounded_channel();
        let server = Server::bind(
            &config.host,
            config.port,
            self.inner.pair.clone(),
            self.inner.handler.clone(),
            Arc::new(InboundPolicy {
                cluster: Arc::downgrade(&self.inner),
            }),
            ServerSettings {
                currency: config.currency.clone(),
                max_public: config.max_public,
                options: config.connection_options(),
            },
            Some(notifications),
        )
        .await
        .map_err(|e| ClusterError::Listen(format!("{:#}", e)))?;
        let local_addr = server.local_addr();
        *self.inner.server.write().await = Some(Arc::new(server));

        let cluster = Arc::downgrade(&self.inner);
        let watcher = tokio::spawn(async move {
            while let Some(connection) = accepted.recv().await {
                let Some(inner) = cluster.upgrade() else {
                    break;
                };
                Cluster::from_inner(inner).on_inbound(connection);
            }
        });
        if let Ok(mut background) = self.inner.background.lock() {
            background.push(watcher);
        }
        info!("WS2P: cluster {} listening on {}", short(self.pubkey()), local_addr);
        Ok(local_addr)
    }

    fn on_inbound(&self, connection: Connection) {
        let pubkey = connection.pubkey().unwrap_or_default();
        let address = connection
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        self.emit(ClusterEvent::Connected {
            pubkey: pubkey.clone(),
            address,
            level: ConnectionLevel::Inbound,
        });
        let cluster = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            connection.closed().await;
            if let Some(inner) = cluster.upgrade() {
                Cluster::from_inner(inner).emit(ClusterEvent::Disconnected {
                    pubkey,
                    level: ConnectionLevel::Inbound,
                });
            }
        });
    }

    /// Open an outbound session to `endpoint`, which must authenticate as `pubkey`
    pub async fn connect_to_remote(
        &self,
        endpoint: &Ws2pEndpoint,
        pubkey: &str,
    ) -> Result<Connection, ClusterError> {
        if !self
            .accept_outbound(pubkey, Some(&endpoint.instance_id))
            .await
        {
            return Err(ClusterError::Refused(pubkey.to_string()));
        }

        let url = endpoint.url();
        let policy = Arc::new(OutboundPolicy {
            cluster: Arc::downgrade(&self.inner),
            expected_pubkey: pubkey.to_string(),
            target_instance: endpoint.instance_id.clone(),
        });
        let connection = match self
            .inner
            .client
            .connect_to(&url, Some(pubkey), Some(&endpoint.instance_id), policy)
            .await
        {
            Ok(connection) => connection,
            Err(e) => {
                info!(
                    "WS2P: could not connect to peer {} using `{}`: {}",
                    short(pubkey),
                    endpoint,
                    e
                );
                return Err(e.into());
            }
        };

        self.inner
            .level1
            .write()
            .await
            .insert(connection.id().to_string(), connection.clone());
        info!("WS2P: connected to peer {} using `{}`", short(pubkey), endpoint);
        self.emit(ClusterEvent::Connected {
            pubkey: pubkey.to_string(),
            address: url,
            level: ConnectionLevel::Outbound,
        });

        let cluster = Arc::downgrade(&self.inner);
        let watched = connection.clone();
        let label = endpoint.to_string();
        let pubkey = pubkey.to_string();
        tokio::spawn(async move {
            watched.closed().await;
            let Some(inner) = cluster.upgrade() else {
                return;
            };
            info!(
                "WS2P: connection [{} `{}`] has been closed",
                short(&pubkey),
                label
            );
            inner.level1.write().await.remove(watched.id());
            Cluster::from_inner(inner).emit(ClusterEvent::Disconnected {
                pubkey,
                level: ConnectionLevel::Outbound,
            });
        });
        Ok(connection)
    }

    /// Connect to known peers until the outbound ceiling is reached.
    ///
    /// Our own siblings come first, then prefered keys, then the others.
    /// Returns the number of sessions opened.
    pub async fn connect_to_peers(&self) -> Result<usize, ClusterError> {
        let config = &self.inner.config;
        if let Some(server) = self.server().await {
            if server.count_connections().await >= config.max_public {
                if server.remove_low_priority_connection().await {
                    debug!("WS2P: inbound table full, evicted one session");
                }
            }
        }

        let own = self.pubkey().to_string();
        let mut peers = self.inner.backend.ws2p_peers().await?;
        peers.sort_by_key(|p| (p.pubkey != own, !config.prefered_nodes.contains(&p.pubkey)));

        let mut opened = 0;
        for peer in peers {
            if peer.pubkey == own {
                for endpoint in peer.ws2p_endpoints() {
                    if endpoint.instance_id == config.instance_id {
                        continue;
                    }
                    match self.connect_to_remote(&endpoint, &peer.pubkey).await {
                        Ok(_) => opened += 1,
                        Err(e) => debug!("WS2P: sibling {} unreachable: {}", endpoint, e),
                    }
                }
                continue;
            }
            if self.clients_count().await >= config.max_private {
                break;
            }
            if self.connected_pubkeys().await.contains(&peer.pubkey) {
                continue;
            }
            let Some(endpoint) = peer.first_ws2p_endpoint() else {
                continue;
            };
            match self.connect_to_remote(&endpoint, &peer.pubkey).await {
                Ok(_) => opened += 1,
                Err(e) => debug!("WS2P: init: failed connection to {}: {}", short(&peer.pubkey), e),
            }
        }

        self.remove_low_priority_connections().await;
        Ok(opened)
    }

    async fn drop_level1(&self, connection: &Connection) {
        self.inner.level1.write().await.remove(connection.id());
        connection.close().await;
    }

    /// Trim the outbound tier.
    ///
    /// Outbound sessions duplicating an inbound one are closed first, then the
    /// lowest priority sessions until the outbound ceiling is respected. Our
    /// own key is never evicted.
    pub async fn remove_low_priority_connections(&self) {
        let own = self.pubkey().to_string();
        let served: Vec<String> = self
            .level2_connections()
            .await
            .iter()
            .filter_map(Connection::pubkey)
            .collect();

        let mut clients = self.level1_connections().await;
        clients.shuffle(&mut rand::thread_rng());
        for connection in clients {
            let Some(pubkey) = connection.pubkey() else {
                continue;
            };
            if pubkey != own && served.contains(&pubkey) {
                debug!("WS2P: {} already connected inbound, closing outbound session", short(&pubkey));
                self.drop_level1(&connection).await;
            }
        }

        let prefered = &self.inner.config.prefered_nodes;
        while self.clients_count().await > self.inner.config.max_private {
            let mut clients = self.level1_connections().await;
            clients.shuffle(&mut rand::thread_rng());
            let mut lowest: Option<(u8, Connection)> = None;
            for connection in clients {
                let pubkey = connection.pubkey().unwrap_or_default();
                if pubkey == own {
                    continue;
                }
                let level = self.inner.admission.key_priority_level(&pubkey, prefered).await;
                if lowest.as_ref().map_or(true, |(min, _)| level < *min) {
                    lowest = Some((level, connection));
                }
            }
            match lowest {
                Some((level, connection)) => {
                    debug!(
                        "WS2P: evicting outbound session to {} (priority {})",
                        short(&connection.pubkey().unwrap_or_default()),
                        level
                    );
                    self.drop_level1(&connection).await;
                }
                None => break,
            }
        }
    }

    /// Ban `pubkey` and close all its sessions
    pub async fn ban_connection(&self, pubkey: &str, reason: &str) {
        if pubkey == self.pubkey() {
            return;
        }
        warn!(
            "Banning connections of {} for {}s, reason: {}",
            short(pubkey),
            self.inner.config.ban_duration.as_secs(),
            reason
        );
        self.inner.bans.ban(pubkey, reason).await;
        for connection in self.all_connections().await {
            if connection.pubkey().as_deref() == Some(pubkey) {
                connection.close().await;
            }
        }
        self.emit(ClusterEvent::Banned {
            pubkey: pubkey.to_string(),
            reason: reason.to_string(),
        });
    }

    /// Record that `pubkey` sent the invalid document `document_hash`; bans on repeat
    pub async fn record_offense(&self, pubkey: &str, document_hash: &str, reason: &str) {
        if self
            .inner
            .offenses
            .record(document_hash, pubkey, reason)
            .await
        {
            let reason = format!("repeated invalid document {}", document_hash);
            self.ban_connection(pubkey, &reason).await;
        }
    }

    /// Push a document to every session but `except`
    pub async fn broadcast_document(&self, push: &PushMessage, except: Option<&Connection>) {
        for connection in self.all_connections().await {
            if except.map_or(false, |e| e.same_as(&connection)) {
                continue;
            }
            if let Err(e) = connection.push(push.clone()).await {
                warn!("WS2P: could not forward {} to {}: {}", push.kind, connection.id(), e);
            }
        }
    }

    /// Process received heads; returns how many were accepted
    pub async fn heads_received(&self, heads: Vec<HeadPayload>) -> usize {
        let connected = self.connected_pubkeys().await;
        let accepted = self
            .inner
            .heads
            .receive(heads, &connected, self.inner.backend.as_ref())
            .await;
        if !accepted.is_empty() {
            self.arm_heads_spread();
        }
        accepted.len()
    }

    fn arm_heads_spread(&self) {
        let Ok(mut task) = self.inner.spread_task.lock() else {
            return;
        };
        if let Some(previous) = task.take() {
            previous.abort();
        }
        let deadline = Instant::now() + self.inner.config.heads_spread_delay;
        let cluster = Arc::downgrade(&self.inner);
        *task = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = cluster.upgrade() {
                tokio::spawn(Cluster::from_inner(inner).spread_new_heads());
            }
        }));
    }

    async fn spread_new_heads(self) {
        let heads = self.inner.heads.take_pending().await;
        if heads.is_empty() {
            return;
        }
        let mut peers = 0;
        for connection in self.all_connections().await {
            match connection.push_heads(&heads).await {
                Ok(()) => peers += 1,
                Err(e) => warn!(
                    "Could not spread new HEAD info to {}: {}",
                    connection.pubkey().unwrap_or_default(),
                    e
                ),
            }
        }
        debug!("WS2P: spread {} heads to {} peers", heads.len(), peers);
        self.emit(ClusterEvent::HeadsSpread {
            heads: heads.len(),
            peers,
        });
    }

    /// Sign our head for `blockstamp`
    pub fn say_head_changed(&self, blockstamp: Blockstamp) -> HeadPayload {
        let head = Head::v1(
            self.pubkey(),
            blockstamp,
            self.inner.config.instance_id.clone(),
            SOFTWARE,
            SOFTWARE_VERSION,
            DEFAULT_POW_PREFIX,
        );
        let message = head.to_message();
        HeadPayload {
            sig: self.inner.pair.sign(&message),
            message,
        }
    }

    /// Announce our head for `blockstamp` to the network
    pub async fn broadcast_head(&self, blockstamp: Blockstamp) -> bool {
        let head = self.say_head_changed(blockstamp);
        self.heads_received(vec![head]).await > 0
    }

    /// Every cached head, ours included
    pub async fn known_heads(&self) -> Vec<HeadPayload> {
        let cached = self
            .inner
            .heads
            .get(self.pubkey(), &self.inner.config.instance_id)
            .await;
        if cached.is_none() {
            if let Some(stamp) = self.local_head().await {
                self.broadcast_head(stamp).await;
            }
        }
        self.inner.heads.all().await
    }

    async fn local_head(&self) -> Option<Blockstamp> {
        match self.inner.backend.current_block().await {
            Ok(current) => current.as_ref().and_then(blockstamp_of),
            Err(e) => {
                warn!("Cannot read local head: {:#}", e);
                None
            }
        }
    }

    /// A block was added to the local chain
    pub(crate) async fn block_applied(&self, blockstamp: Blockstamp) {
        self.inner.heads.note_block(blockstamp.clone()).await;
        if self.local_head().await.as_ref() == Some(&blockstamp) {
            self.broadcast_head(blockstamp).await;
        }
    }

    /// Pull blocks from random sessions while our head keeps advancing.
    ///
    /// Returns the number of blocks applied.
    pub async fn pull_blocks(&self) -> u64 {
        let config = &self.inner.config;
        let mut total = 0;
        loop {
            let before = self.local_head().await.map(|s| s.number);
            let connections = self.all_connections().await;
            let chosen: Vec<Connection> = connections
                .choose_multiple(&mut rand::thread_rng(), config.peers_per_pull)
                .cloned()
                .collect();
            if chosen.is_empty() {
                break;
            }
            let shots = chosen.into_iter().map(|connection| {
                let puller = BlockPuller::new(
                    Requester::new(connection),
                    self.inner.backend.clone(),
                    config.chunk_size,
                );
                async move { puller.pull().await }
            });
            for result in join_all(shots).await {
                match result {
                    Ok((applied, _)) => total += applied,
                    Err(e) => warn!("WS2P: pulling failed: {}", e),
                }
            }
            let after = self.local_head().await.map(|s| s.number);
            if after <= before {
                break;
            }
        }
        if total > 0 {
            if let Some(stamp) = self.local_head().await {
                info!("WS2P: pulled {} blocks, now at {}", total, stamp);
                self.block_applied(stamp).await;
            }
        }
        total
    }

    fn spawn_periodic<F, Fut>(&self, start: Instant, period: Duration, job: F) -> JoinHandle<()>
    where
        F: Fn(Cluster) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cluster = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                ticker.tick().await;
                let Some(inner) = cluster.upgrade() else {
                    break;
                };
                job(Cluster::from_inner(inner)).await;
            }
        })
    }

    /// Start periodic discovery, block pulling and expiry sweeps.
    ///
    /// Discovery runs right away and is followed by a first pull.
    pub fn start_crawling(&self) {
        self.stop_crawling();
        let config = &self.inner.config;
        let now = Instant::now();
        let tasks = vec![
            self.spawn_periodic(now, config.reconnection_interval, |cluster| async move {
                if let Err(e) = cluster.connect_to_peers().await {
                    warn!("WS2P: peer discovery failed: {}", e);
                }
            }),
            self.spawn_periodic(now, config.block_pulling_interval, |cluster| async move {
                cluster.pull_blocks().await;
            }),
            self.spawn_periodic(now + SWEEP_INTERVAL, SWEEP_INTERVAL, |cluster| async move {
                cluster.sweep().await;
            }),
        ];
        if let Ok(mut crawler) = self.inner.crawler.lock() {
            *crawler = tasks;
        }
        info!("WS2P: crawling started");
    }

    /// Stop the periodic tasks
    pub fn stop_crawling(&self) {
        if let Ok(mut crawler) = self.inner.crawler.lock() {
            for task in crawler.drain(..) {
                task.abort();
            }
        }
    }

    /// Drop expired bans and offenses and forget cached lookups
    pub async fn sweep(&self) {
        self.inner.bans.sweep().await;
        self.inner.offenses.sweep().await;
        self.inner.heads.clear_caches().await;
    }

    /// Stop crawling and close every session
    pub async fn close(&self) {
        self.stop_crawling();
        if let Ok(mut task) = self.inner.spread_task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
        if let Ok(mut background) = self.inner.background.lock() {
            for task in background.drain(..) {
                task.abort();
            }
        }
        let server = self.inner.server.write().await.take();
        if let Some(server) = server {
            server.close().await;
        }
        let clients: Vec<Connection> = self
            .inner
            .level1
            .write()
            .await
            .drain()
            .map(|(_, c)| c)
            .collect();
        for connection in clients {
            connection.close().await;
        }
        info!("WS2P: cluster {} closed", short(self.pubkey()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MemoryChain;
    use serde_json::json;

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

    fn head(pair: &KeyPair, number: u64) -> HeadPayload {
        let message = Head::v1(
            pair.pubkey(),
            Blockstamp::new(number, hash(number)),
            "0000000b",
            "ws2p",
            "0.1.0",
            1,
        )
        .to_message();
        HeadPayload {
            sig: pair.sign(&message),
            message,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_heads_burst_is_spread_once() {
        let backend = chain(10);
        let issuers: Vec<KeyPair> = (0..3).map(|_| KeyPair::generate()).collect();
        for issuer in &issuers {
            backend.add_member(issuer.pubkey()).await;
        }
        let cluster = Cluster::new(
            ClusterConfig::default(),
            Arc::new(KeyPair::generate()),
            Arc::new(backend),
        )
        .unwrap();
        let mut events = cluster.subscribe();

        assert_eq!(cluster.heads_received(vec![head(&issuers[0], 3)]).await, 1);
        tokio::time::advance(Duration::from_millis(60)).await;
        let burst = vec![head(&issuers[1], 3), head(&issuers[2], 4), head(&issuers[0], 2)];
        assert_eq!(cluster.heads_received(burst).await, 2);
        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(events.try_recv().is_err());

        tokio::time::advance(Duration::from_millis(60)).await;
        assert_eq!(
            events.recv().await.unwrap(),
            ClusterEvent::HeadsSpread { heads: 3, peers: 0 }
        );
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_known_heads_include_our_head() {
        let pair = Arc::new(KeyPair::generate());
        let cluster = Cluster::new(ClusterConfig::default(), pair.clone(), Arc::new(chain(4))).unwrap();

        let heads = cluster.known_heads().await;
        assert_eq!(heads.len(), 1);
        let ours = Head::parse(&heads[0].message).unwrap();
        assert_eq!(ours.pubkey, pair.pubkey());
        assert_eq!(ours.blockstamp.number, 3);
        assert_eq!(ours.instance_id, cluster.config().instance_id);
        assert!(ws2p_session::verify(&heads[0].message, &heads[0].sig, pair.pubkey()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_offense_bans_then_expires() {
        let cluster = Cluster::new(
            ClusterConfig::default(),
            Arc::new(KeyPair::generate()),
            Arc::new(chain(1)),
        )
        .unwrap();
        let mut events = cluster.subscribe();
        let offender = KeyPair::generate();

        for _ in 0..4 {
            cluster.record_offense(offender.pubkey(), "H", "bad").await;
        }
        assert!(!cluster.is_banned(offender.pubkey()).await);
        cluster.record_offense(offender.pubkey(), "H", "bad").await;
        assert!(cluster.is_banned(offender.pubkey()).await);
        assert!(matches!(
            events.try_recv(),
            Ok(ClusterEvent::Banned { pubkey, .. }) if pubkey == offender.pubkey()
        ));

        tokio::time::advance(Duration::from_secs(121)).await;
        assert!(!cluster.is_banned(offender.pubkey()).await);
    }

    #[tokio::test]
    async fn test_refuses_to_dial_own_instance_or_banned_key() {
        let pair = Arc::new(KeyPair::generate());
        let cluster = Cluster::new(ClusterConfig::default(), pair.clone(), Arc::new(chain(1))).unwrap();
        let own = Ws2pEndpoint {
            version: None,
            instance_id: cluster.config().instance_id.clone(),
            host: "127.0.0.1".into(),
            port: 1,
            path: None,
        };
        assert!(matches!(
            cluster.connect_to_remote(&own, pair.pubkey()).await,
            Err(ClusterError::Refused(_))
        ));

        let banned = KeyPair::generate();
        cluster.ban_connection(banned.pubkey(), "test").await;
        let endpoint = Ws2pEndpoint {
            instance_id: "0000000f".into(),
            ..own
        };
        assert!(matches!(
            cluster.connect_to_remote(&endpoint, banned.pubkey()).await,
            Err(ClusterError::Refused(_))
        ));
    }

    #[tokio::test]
    async fn test_own_key_is_never_banned() {
        let cluster = Cluster::new(
            ClusterConfig::default(),
            Arc::new(KeyPair::generate()),
            Arc::new(chain(1)),
        )
        .unwrap();
        let own = cluster.pubkey().to_string();
        cluster.ban_connection(&own, "test").await;
        assert!(!cluster.is_banned(&own).await);
    }
}
