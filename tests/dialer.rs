//! Integration tests for the dialer over real QUIC connections.
//!
//! A small planet of responders on loopback, all knowing each other, is
//! queried by a dialer that dials out of one of the planet's own endpoints.

use std::sync::Arc;
use std::time::Duration;

use kademlia_dialer::{
    ContactSource, Dialer, DialerConfig, DialerError, KB, Keypair, Node, NodeDirectory, NodeId, NodeType,
    QuicTransport, Responder, SimulatedNetwork, distance_cmp,
};

const STORAGE_NODES: usize = 4;

/// Upper bound on planet setup.
const SETUP_TIMEOUT: Duration = Duration::from_secs(10);

struct Planet {
    satellite: Responder,
    storage: Vec<Responder>,
}

impl Planet {
    fn start() -> Planet {
        let bind = |node_type| {
            Responder::bind(
                Keypair::generate(),
                "127.0.0.1:0".parse().unwrap(),
                node_type,
                Arc::new(NodeDirectory::new(64)),
                None,
            )
            .expect("bind failed")
        };
        let satellite = bind(NodeType::Satellite);
        let storage: Vec<Responder> = (0..STORAGE_NODES).map(|_| bind(NodeType::Storage)).collect();
        Planet { satellite, storage }
    }

    fn nodes(&self) -> Vec<Node> {
        std::iter::once(&self.satellite)
            .chain(&self.storage)
            .map(|r| r.local().clone())
            .collect()
    }

    /// The querying node: the first storage node, dialing from its own endpoint.
    fn querier(&self) -> &Responder {
        &self.storage[0]
    }

    /// Every node except the querier.
    fn peers(&self) -> Vec<Node> {
        let querier = self.querier().local().id;
        self.nodes().into_iter().filter(|n| n.id != querier).collect()
    }

    fn transport(&self) -> QuicTransport {
        self.querier().transport().expect("transport")
    }

    async fn shutdown(self) {
        self.satellite.shutdown().await;
        for node in &self.storage {
            node.shutdown().await;
        }
    }
}

/// Start a planet whose responders all know each other.
async fn connected_planet() -> Planet {
    let planet = Planet::start();
    let nodes = planet.nodes();

    // Each node introduces itself to every other node via FIND_NODE.
    let introductions = async {
        for (i, responder) in std::iter::once(&planet.satellite).chain(&planet.storage).enumerate() {
            let dialer = Dialer::new(responder.transport().expect("transport"));
            for (j, peer) in nodes.iter().enumerate() {
                if i != j {
                    dialer
                        .lookup(&nodes[i], peer, &nodes[i])
                        .await
                        .expect("introduction lookup failed");
                }
            }
            dialer.close().await.expect("close failed");
        }
    };
    tokio::time::timeout(SETUP_TIMEOUT, introductions)
        .await
        .expect("planet setup timed out");
    planet
}

fn assert_sorted_towards(nodes: &[Node], target: &NodeId) {
    for pair in nodes.windows(2) {
        assert_ne!(
            distance_cmp(&pair[0].id.xor_distance(target), &pair[1].id.xor_distance(target)),
            std::cmp::Ordering::Greater,
            "results must be ordered by XOR distance to the target"
        );
    }
}

fn targets(nodes: &[Node]) -> Vec<NodeId> {
    let mut high = [0u8; 32];
    high[0] = 255;
    let mut targets: Vec<NodeId> = nodes.iter().map(|n| n.id).collect();
    targets.push(NodeId::default());
    targets.push(NodeId::from_bytes(high));
    targets.push(Keypair::generate().node_id());
    targets
}

#[tokio::test]
async fn ping_every_peer() {
    let planet = connected_planet().await;
    let dialer = Dialer::new(planet.transport());

    for peer in planet.peers() {
        assert!(dialer.ping_node(&peer).await.expect("ping failed"));
    }

    dialer.close().await.unwrap();
    planet.shutdown().await;
}

#[tokio::test]
async fn fetch_identity_of_every_peer() {
    let planet = connected_planet().await;
    let dialer = Dialer::new(planet.transport());

    for peer in planet.peers() {
        let identity = dialer.fetch_peer_identity(&peer).await.expect("fetch failed");
        assert_eq!(identity.id, peer.id);
        assert!(identity.leaf().is_some(), "certificate chain must be exposed");

        let unverified = dialer
            .fetch_peer_identity_unverified(&peer.address)
            .await
            .expect("unverified fetch failed");
        assert_eq!(unverified.id, peer.id);
    }

    dialer.close().await.unwrap();
    planet.shutdown().await;
}

#[tokio::test]
async fn fetch_identity_detects_wrong_node_at_address() {
    let planet = connected_planet().await;
    let dialer = Dialer::new(planet.transport());
    let real = planet.satellite.local().clone();

    let expected = Keypair::generate().node_id();
    let claimed = Node::new(expected, real.address.clone(), NodeType::Satellite);

    let err = dialer.fetch_peer_identity(&claimed).await.unwrap_err();
    assert_eq!(
        err,
        DialerError::IdentityMismatch {
            expected,
            actual: real.id,
        }
    );
    assert!(!err.is_transport());

    dialer.close().await.unwrap();
    planet.shutdown().await;
}

#[tokio::test]
async fn lookup_every_peer_for_every_target() {
    let planet = connected_planet().await;
    let dialer = Dialer::new(planet.transport());
    let sender = planet.querier().local().clone();
    sender.node_type.assert_valid("lookup sender");
    let nodes = planet.nodes();

    for peer in &planet.peers() {
        for target in targets(&nodes) {
            let results = dialer
                .lookup(&sender, peer, &Node::target(target))
                .await
                .expect("lookup failed");

            assert_eq!(results.len(), nodes.len(), "every peer knows the whole planet");
            assert_sorted_towards(&results, &target);
            if let Some(member) = nodes.iter().find(|n| n.id == target) {
                assert_eq!(&results[0], member, "an exact match sorts first");
            }
        }
    }

    dialer.close().await.unwrap();
    planet.shutdown().await;
}

#[tokio::test]
async fn concurrent_lookups_stay_consistent() {
    let planet = connected_planet().await;
    let dialer = Dialer::new(planet.transport());
    let sender = planet.querier().local().clone();
    let nodes = planet.nodes();

    let mut handles = Vec::new();
    for peer in &planet.peers() {
        for target in targets(&nodes) {
            let dialer = dialer.clone();
            let sender = sender.clone();
            let peer = peer.clone();
            handles.push(tokio::spawn(async move {
                let results = dialer.lookup(&sender, &peer, &Node::target(target)).await?;
                Ok::<_, DialerError>((target, results))
            }));
        }
    }

    for handle in handles {
        let (target, results) = handle.await.unwrap().expect("lookup failed");
        assert_eq!(results.len(), nodes.len());
        assert_sorted_towards(&results, &target);
    }
    assert!(dialer.pooled_connections() <= nodes.len());

    dialer.close().await.unwrap();
    planet.shutdown().await;
}

#[tokio::test]
async fn lookup_with_unauthenticated_sender_is_refused() {
    let planet = connected_planet().await;
    let dialer = Dialer::new(planet.transport());
    let impostor = planet.storage[1].local().clone();

    let err = dialer
        .lookup(&impostor, planet.satellite.local(), &Node::target(NodeId::default()))
        .await
        .unwrap_err();
    assert!(matches!(err, DialerError::Protocol(_)), "got {err:?}");

    dialer.close().await.unwrap();
    planet.shutdown().await;
}

#[tokio::test]
async fn slow_network_times_out_every_call() {
    let planet = connected_planet().await;
    let slow = SimulatedNetwork {
        dial_latency: Duration::from_secs(200),
        bytes_per_second: KB,
    };
    let transport = slow.new_client(planet.transport().with_timeout(Duration::from_millis(20)));
    let dialer = Dialer::new(transport);
    let sender = planet.querier().local().clone();
    let peer = planet.satellite.local().clone();

    let err = dialer.ping_node(&peer).await.unwrap_err();
    assert!(err.is_transport() && err.is_timeout(), "ping: {err:?}");

    let err = dialer.fetch_peer_identity(&peer).await.unwrap_err();
    assert!(err.is_transport() && err.is_timeout(), "fetch: {err:?}");

    let err = dialer.fetch_peer_identity_unverified(&peer.address).await.unwrap_err();
    assert!(err.is_transport() && err.is_timeout(), "unverified fetch: {err:?}");

    let err = dialer
        .lookup(&sender, &peer, &Node::target(NodeId::default()))
        .await
        .unwrap_err();
    assert!(err.is_transport() && err.is_timeout(), "lookup: {err:?}");

    dialer.close().await.unwrap();
    assert_eq!(dialer.open_connections(), 0);
    planet.shutdown().await;
}

#[tokio::test]
async fn call_timeout_bounds_calls_to_unresponsive_address() {
    let planet = connected_planet().await;
    let config = DialerConfig {
        call_timeout: Some(Duration::from_millis(100)),
        ..DialerConfig::default()
    };
    let dialer = Dialer::with_config(planet.transport(), config);

    // Nothing listens here; QUIC retransmits the handshake until the budget runs out.
    let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let address = silent.local_addr().unwrap().to_string();

    let started = std::time::Instant::now();
    let err = dialer.fetch_peer_identity_unverified(&address).await.unwrap_err();
    assert!(err.is_timeout(), "got {err:?}");
    assert!(started.elapsed() < Duration::from_secs(5));

    dialer.close().await.unwrap();
    planet.shutdown().await;
}

#[tokio::test]
async fn close_releases_every_connection() {
    let planet = connected_planet().await;
    let dialer = Dialer::new(planet.transport());
    let peers = planet.peers();

    for peer in &peers {
        dialer.ping_node(peer).await.unwrap();
    }
    assert!(dialer.open_connections() > 0);

    dialer.close().await.unwrap();
    assert_eq!(dialer.open_connections(), 0);
    assert_eq!(dialer.pooled_connections(), 0);

    assert_eq!(dialer.ping_node(&peers[0]).await, Err(DialerError::Closed));
    assert_eq!(
        dialer
            .lookup(planet.querier().local(), &peers[0], &Node::target(NodeId::default()))
            .await,
        Err(DialerError::Closed)
    );

    // Closing again is harmless.
    dialer.close().await.unwrap();
    planet.shutdown().await;
}

#[tokio::test]
async fn responder_records_authenticated_senders() {
    let directory = Arc::new(NodeDirectory::new(64));
    let responder = Responder::bind(
        Keypair::generate(),
        "127.0.0.1:0".parse().unwrap(),
        NodeType::Bootstrap,
        directory.clone(),
        None,
    )
    .unwrap();
    let client = Responder::bind(
        Keypair::generate(),
        "127.0.0.1:0".parse().unwrap(),
        NodeType::Storage,
        Arc::new(NodeDirectory::new(64)),
        None,
    )
    .unwrap();

    assert_eq!(directory.len(), 1, "a responder knows itself");

    let dialer = Dialer::new(client.transport().unwrap());
    let results = dialer
        .lookup(client.local(), responder.local(), &Node::target(client.local().id))
        .await
        .unwrap();

    assert!(directory.contains(&client.local().id));
    assert_eq!(results[0], *client.local(), "the sender is visible to its own lookup");
    assert_eq!(directory.closest(&client.local().id, 1)[0].id, client.local().id);

    dialer.close().await.unwrap();
    client.shutdown().await;
    responder.shutdown().await;
}

#[tokio::test]
async fn close_succeeds_after_peer_went_away() {
    let planet = connected_planet().await;
    let dialer = Dialer::new(planet.transport());
    let departed = planet.satellite.local().clone();
    let remaining = planet.storage[1].local().clone();

    assert!(dialer.ping_node(&departed).await.unwrap());
    assert!(dialer.ping_node(&remaining).await.unwrap());

    planet.satellite.shutdown().await;
    // Let the peer's CONNECTION_CLOSE reach our side of the session.
    tokio::time::sleep(Duration::from_millis(200)).await;

    dialer.close().await.expect("a peer that already left is not a close failure");
    assert_eq!(dialer.open_connections(), 0);
    planet.shutdown().await;
}
