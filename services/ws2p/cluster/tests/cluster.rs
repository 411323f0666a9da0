//! Loopback scenarios between WS2P clusters.

use serde_json::{json, Value};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use ws2p_cluster::{
    blockstamp_of, BlockPuller, ChainBackend, Cluster, ClusterConfig, ClusterError, ClusterEvent,
    ConnectionLevel, MemoryChain, PeerRecord, Requester,
};
use ws2p_session::KeyPair;
use ws2p_wire::{Blockstamp, Head, Ws2pEndpoint};

fn hash(n: u64) -> String {
    format!("{:064X}", n + 1)
}

fn block(n: u64) -> Value {
    json!({"number": n, "hash": hash(n), "issuer": "test"})
}

fn chain(height: u64) -> MemoryChain {
    MemoryChain::with_blocks((0..height).map(block).collect())
}

fn config(instance: &str) -> ClusterConfig {
    ClusterConfig {
        instance_id: instance.to_string(),
        host: "127.0.0.1".to_string(),
        port: 0,
        connection_timeout: Duration::from_secs(3),
        request_timeout: Duration::from_secs(5),
        ..ClusterConfig::default()
    }
}

fn node(config: ClusterConfig, backend: Arc<MemoryChain>) -> (Cluster, Arc<KeyPair>) {
    let pair = Arc::new(KeyPair::generate());
    let cluster = Cluster::new(config, pair.clone(), backend).unwrap();
    (cluster, pair)
}

fn endpoint(instance: &str, addr: SocketAddr) -> Ws2pEndpoint {
    Ws2pEndpoint {
        version: None,
        instance_id: instance.to_string(),
        host: "127.0.0.1".to_string(),
        port: addr.port(),
        path: None,
    }
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..250 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_requester_reads_remote_chain() {
    let (server, _) = node(config("0000000a"), Arc::new(chain(5)));
    let addr = server.listen().await.unwrap();
    let (client, _) = node(config("0000000b"), Arc::new(MemoryChain::new()));

    let connection = client
        .connect_to_remote(&endpoint("0000000a", addr), server.pubkey())
        .await
        .unwrap();
    let requester = Requester::new(connection);

    assert_eq!(requester.get_current().await.unwrap(), block(4));
    assert_eq!(requester.get_block(2).await.unwrap(), block(2));
    assert_eq!(requester.get_blocks(2, 1).await.unwrap(), vec![block(1), block(2)]);
    assert!(requester.get_block(9).await.is_err());
    assert!(requester.get_known_peers().await.unwrap().is_empty());

    let heads = requester.get_heads().await.unwrap();
    assert_eq!(heads.len(), 1);
    let head = Head::parse(&heads[0].message).unwrap();
    assert_eq!(head.pubkey, server.pubkey());
    assert_eq!(head.blockstamp, Blockstamp::new(4, hash(4)));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_pull_blocks_catches_up() {
    let (server, _) = node(config("0000000a"), Arc::new(chain(120)));
    let addr = server.listen().await.unwrap();
    let backend = Arc::new(MemoryChain::new());
    let (client, _) = node(config("0000000b"), backend.clone());
    client
        .connect_to_remote(&endpoint("0000000a", addr), server.pubkey())
        .await
        .unwrap();

    assert_eq!(client.pull_blocks().await, 120);
    assert_eq!(backend.len().await, 120);
    let current = backend.current_block().await.unwrap().unwrap();
    assert_eq!(blockstamp_of(&current).unwrap().number, 119);
    assert_eq!(client.pull_blocks().await, 0);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_heads_are_gossiped_between_nodes() {
    let (server, _) = node(config("0000000a"), Arc::new(chain(5)));
    let addr = server.listen().await.unwrap();
    let (client, _) = node(config("0000000b"), Arc::new(chain(5)));
    client
        .connect_to_remote(&endpoint("0000000a", addr), server.pubkey())
        .await
        .unwrap();

    assert!(server.broadcast_head(Blockstamp::new(4, hash(4))).await);
    let server_key = server.pubkey().to_string();
    let watched = client.clone();
    eventually(move || {
        let watched = watched.clone();
        let server_key = server_key.clone();
        async move {
            watched.known_heads().await.iter().any(|h| {
                Head::parse(&h.message)
                    .map(|head| head.pubkey == server_key)
                    .unwrap_or(false)
            })
        }
    })
    .await;

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_repeated_invalid_document_bans_sender() {
    let (server, _) = node(config("0000000a"), Arc::new(chain(1)));
    let addr = server.listen().await.unwrap();
    let (client, _) = node(config("0000000b"), Arc::new(chain(1)));
    let connection = client
        .connect_to_remote(&endpoint("0000000a", addr), server.pubkey())
        .await
        .unwrap();

    for _ in 0..5 {
        connection.push_identity(json!(42)).await.unwrap();
    }
    let watched = server.clone();
    let offender = client.pubkey().to_string();
    eventually(move || {
        let watched = watched.clone();
        let offender = offender.clone();
        async move { watched.is_banned(&offender).await }
    })
    .await;

    let closed = connection.clone();
    eventually(move || {
        let closed = closed.clone();
        async move { closed.is_closed() }
    })
    .await;
    assert!(client
        .connect_to_remote(&endpoint("0000000a", addr), server.pubkey())
        .await
        .is_err());

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_valid_documents_are_forwarded() {
    let (hub, _) = node(config("0000000a"), Arc::new(chain(1)));
    let addr = hub.listen().await.unwrap();
    let (sender, _) = node(config("0000000b"), Arc::new(chain(1)));
    let listener_backend = Arc::new(chain(1));
    let (listener, _) = node(config("0000000c"), listener_backend.clone());

    let to_hub = sender
        .connect_to_remote(&endpoint("0000000a", addr), hub.pubkey())
        .await
        .unwrap();
    listener
        .connect_to_remote(&endpoint("0000000a", addr), hub.pubkey())
        .await
        .unwrap();

    to_hub.push_identity(json!({"uid": "alice"})).await.unwrap();
    let watched = listener_backend.clone();
    eventually(move || {
        let watched = watched.clone();
        async move { watched.documents_count().await == 1 }
    })
    .await;

    sender.close().await;
    listener.close().await;
    hub.close().await;
}

#[tokio::test]
async fn test_connect_to_peers_stops_at_ceiling() {
    let mut servers = Vec::new();
    let backend = Arc::new(MemoryChain::new());
    for instance in ["00000001", "00000002", "00000003"] {
        let (server, _) = node(config(instance), Arc::new(chain(1)));
        let addr = server.listen().await.unwrap();
        backend
            .add_peer(PeerRecord::new(
                server.pubkey(),
                vec![format!("WS2P {} 127.0.0.1 {}", instance, addr.port())],
            ))
            .await;
        servers.push(server);
    }

    let client_config = ClusterConfig {
        max_private: 2,
        ..config("0000000b")
    };
    let (client, pair) = node(client_config, backend.clone());
    backend
        .add_peer(PeerRecord::new(
            pair.pubkey(),
            vec!["WS2P 0000000b 127.0.0.1 1".to_string()],
        ))
        .await;

    assert_eq!(client.connect_to_peers().await.unwrap(), 2);
    assert_eq!(client.clients_count().await, 2);
    let connected = client.connected_pubkeys().await;
    assert!(connected.contains(&servers[0].pubkey().to_string()));
    assert!(connected.contains(&servers[1].pubkey().to_string()));

    client.close().await;
    for server in servers {
        server.close().await;
    }
}

#[tokio::test]
async fn test_trim_keeps_prefered_outbound_session() {
    let (first, _) = node(config("00000001"), Arc::new(chain(1)));
    let first_addr = first.listen().await.unwrap();
    let (second, _) = node(config("00000002"), Arc::new(chain(1)));
    let second_addr = second.listen().await.unwrap();

    let client_config = ClusterConfig {
        max_private: 1,
        prefered_nodes: vec![second.pubkey().to_string()],
        ..config("0000000b")
    };
    let (client, _) = node(client_config, Arc::new(MemoryChain::new()));
    client
        .connect_to_remote(&endpoint("00000001", first_addr), first.pubkey())
        .await
        .unwrap();
    client
        .connect_to_remote(&endpoint("00000002", second_addr), second.pubkey())
        .await
        .unwrap();
    assert_eq!(client.clients_count().await, 2);

    client.remove_low_priority_connections().await;
    let remaining: Vec<String> = client
        .level1_connections()
        .await
        .iter()
        .filter_map(|c| c.pubkey())
        .collect();
    assert_eq!(remaining, vec![second.pubkey().to_string()]);

    client.close().await;
    first.close().await;
    second.close().await;
}

#[tokio::test]
async fn test_privileged_key_evicts_inbound_session_at_capacity() {
    let privileged = Arc::new(KeyPair::generate());
    let server_config = ClusterConfig {
        max_public: 1,
        privileged_nodes: vec![privileged.pubkey().to_string()],
        ..config("0000000a")
    };
    let (server, _) = node(server_config, Arc::new(chain(1)));
    let addr = server.listen().await.unwrap();
    let mut events = server.subscribe();

    let (stranger, _) = node(config("0000000b"), Arc::new(chain(1)));
    let evicted = stranger
        .connect_to_remote(&endpoint("0000000a", addr), server.pubkey())
        .await
        .unwrap();
    let friend = Cluster::new(config("0000000c"), privileged.clone(), Arc::new(chain(1))).unwrap();
    friend
        .connect_to_remote(&endpoint("0000000a", addr), server.pubkey())
        .await
        .unwrap();

    let closed = evicted.clone();
    eventually(move || {
        let closed = closed.clone();
        async move { closed.is_closed() }
    })
    .await;
    let watched = server.clone();
    eventually(move || {
        let watched = watched.clone();
        async move { watched.served_count().await == 1 }
    })
    .await;
    let remaining = server.level2_connections().await;
    assert_eq!(remaining[0].pubkey().as_deref(), Some(privileged.pubkey()));

    let mut seen = Vec::new();
    let disconnected = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            seen.push(event.clone());
            if matches!(
                &event,
                ClusterEvent::Disconnected { pubkey, level: ConnectionLevel::Inbound }
                    if pubkey == stranger.pubkey()
            ) {
                break;
            }
        }
    })
    .await;
    assert!(disconnected.is_ok());
    assert!(seen.iter().any(|event| matches!(
        event,
        ClusterEvent::Connected { pubkey, level: ConnectionLevel::Inbound, .. }
            if pubkey == stranger.pubkey()
    )));

    stranger.close().await;
    friend.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_peer_may_dial_back_and_trim_keeps_inbound() {
    let (first, _) = node(config("00000001"), Arc::new(chain(1)));
    let first_addr = first.listen().await.unwrap();
    let (second, _) = node(config("00000002"), Arc::new(chain(1)));
    let second_addr = second.listen().await.unwrap();

    first
        .connect_to_remote(&endpoint("00000002", second_addr), second.pubkey())
        .await
        .unwrap();
    second
        .connect_to_remote(&endpoint("00000001", first_addr), first.pubkey())
        .await
        .unwrap();

    let watched = second.clone();
    eventually(move || {
        let watched = watched.clone();
        async move { watched.served_count().await == 1 }
    })
    .await;
    assert_eq!(second.clients_count().await, 1);

    second.remove_low_priority_connections().await;
    assert_eq!(second.clients_count().await, 0);
    let served: Vec<String> = second
        .level2_connections()
        .await
        .iter()
        .filter_map(|c| c.pubkey())
        .collect();
    assert_eq!(served, vec![first.pubkey().to_string()]);

    first.close().await;
    second.close().await;
}

#[tokio::test]
async fn test_pull_refuses_out_of_range_remote_tip() {
    let tip = json!({"number": u64::MAX, "hash": hash(0)});
    let (server, _) = node(config("0000000a"), Arc::new(MemoryChain::with_blocks(vec![tip])));
    let addr = server.listen().await.unwrap();
    let backend = Arc::new(MemoryChain::new());
    let (client, _) = node(config("0000000b"), backend.clone());
    let connection = client
        .connect_to_remote(&endpoint("0000000a", addr), server.pubkey())
        .await
        .unwrap();

    let puller = BlockPuller::new(Requester::new(connection), backend.clone(), 50);
    assert!(matches!(
        puller.pull().await,
        Err(ClusterError::UnexpectedAnswer { .. })
    ));
    assert_eq!(client.pull_blocks().await, 0);
    assert!(backend.is_empty().await);

    client.close().await;
    server.close().await;
}
