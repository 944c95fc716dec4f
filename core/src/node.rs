// Whoosh node: startup sequence and lifetime
//
//   identity → swarm (handshake handler, listeners) → monitor + local discovery
//   → seed bootstrap → routing table bootstrap → startup summary
//
// Anything that fails before the swarm is live aborts startup. Everything
// after that is best-effort.

use crate::config::NodeConfig;
use crate::discovery::bootstrap::{self, parse_seeds};
use crate::discovery::{ConnectError, DiscoveryStats, LocalDiscovery, PeerConnector, PeerRecord};
use crate::handshake::HandshakeError;
use crate::identity::{IdentityStore, NodeIdentity};
use crate::monitor::{ConnectivityMonitor, ConnectivitySummary};
use crate::transport::{
    start_swarm, AdmissionConfig, BehaviourOptions, SwarmFeeds, SwarmHandle, SwarmOptions,
};
use anyhow::{Context, Result};
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const FEED_CAPACITY: usize = 256;

/// A running node and the background tasks it owns
pub struct WhooshNode {
    identity: NodeIdentity,
    device_name: String,
    swarm: SwarmHandle,
    monitor: JoinHandle<ConnectivitySummary>,
    discovery: JoinHandle<DiscoveryStats>,
}

/// What the background tasks observed, returned by `WhooshNode::shutdown`
#[derive(Debug, Clone, Default)]
pub struct NodeReport {
    pub connectivity: ConnectivitySummary,
    pub discovery: DiscoveryStats,
}

impl WhooshNode {
    /// Load (or create) the identity named in `config` and start the node
    pub async fn start(config: &NodeConfig) -> Result<Self> {
        config.validate().context("Invalid configuration")?;
        let identity = IdentityStore::new(&config.identity_path)
            .load_or_create()
            .context("Failed to load identity")?;
        Self::start_with_identity(config, identity).await
    }

    /// Start the node with an identity the caller already holds
    pub async fn start_with_identity(config: &NodeConfig, identity: NodeIdentity) -> Result<Self> {
        config.validate().context("Invalid configuration")?;
        let admission = AdmissionConfig::try_from(&config.connection_manager)
            .context("Failed to create connection manager")?;

        tracing::info!("Starting Whoosh node {}", identity.peer_id());

        let (peer_found_tx, peer_found_rx) = mpsc::channel(FEED_CAPACITY);
        let (connectivity_tx, connectivity_rx) = mpsc::channel(FEED_CAPACITY);

        let options = SwarmOptions {
            listen_addrs: config.listen.multiaddrs()?,
            public_addr: config.listen.public_multiaddr()?,
            admission,
            trim_interval: config.connection_manager.trim_interval(),
            idle_connection_timeout: config.idle_connection_timeout(),
            greeting_timeout: config.greeting_timeout(),
            behaviour: BehaviourOptions {
                enable_mdns: config.enable_mdns,
                mdns_query_interval: config.mdns_query_interval(),
                enable_dht: config.enable_dht,
            },
        };
        let swarm = start_swarm(
            &identity,
            options,
            SwarmFeeds {
                peer_found_tx,
                connectivity_tx,
            },
        )
        .await
        .context("Failed to create libp2p host")?;

        let monitor = tokio::spawn(ConnectivityMonitor::new().run(connectivity_rx));
        let connector: Arc<dyn PeerConnector> = Arc::new(swarm.clone());
        let discovery = tokio::spawn(
            LocalDiscovery::new(
                connector.clone(),
                config.dial_timeout(),
                config.max_concurrent_discovery_dials,
            )
            .run(peer_found_rx),
        );

        let node = Self {
            identity,
            device_name: config.device_name.clone(),
            swarm,
            monitor,
            discovery,
        };

        node.bootstrap(config, connector).await;
        node.log_addresses().await;
        Ok(node)
    }

    async fn bootstrap(&self, config: &NodeConfig, connector: Arc<dyn PeerConnector>) {
        let seeds = parse_seeds(&config.bootstrap_peers);
        for seed in &seeds {
            if let Err(e) = self.swarm.protect(seed.peer_id).await {
                tracing::warn!("Could not protect seed peer {}: {}", seed.peer_id, e);
            }
        }

        bootstrap::bootstrap(connector, &config.bootstrap_peers, config.dial_timeout()).await;

        if config.enable_dht && !seeds.is_empty() {
            if let Err(e) = self.swarm.bootstrap_routing().await {
                tracing::warn!("DHT routing bootstrap not started: {}", e);
            }
        }
    }

    async fn log_addresses(&self) {
        tracing::info!("Peer ID: {}", self.peer_id());
        match self.addresses().await {
            Ok(addrs) => {
                for addr in addrs {
                    tracing::info!("Listening on: {}", addr);
                }
            }
            Err(e) => tracing::warn!("Could not read listen addresses: {}", e),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    /// Name sent in outbound greetings
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn swarm(&self) -> &SwarmHandle {
        &self.swarm
    }

    /// Every listen and external address, suffixed with `/p2p/<peer id>`
    pub async fn addresses(&self) -> Result<Vec<Multiaddr>> {
        let mut addrs = self.swarm.listen_addrs().await?;
        for external in self.swarm.external_addrs().await? {
            if !addrs.contains(&external) {
                addrs.push(external);
            }
        }
        Ok(addrs
            .into_iter()
            .map(|addr| with_peer_id(addr, self.peer_id()))
            .collect())
    }

    /// Connect to a peer given as `.../p2p/<peer id>`
    pub async fn connect(&self, addr: &Multiaddr) -> Result<PeerId> {
        let record = PeerRecord::from_p2p_addr(addr)?;
        let peer_id = record.peer_id;
        self.swarm
            .connect(record)
            .await
            .map_err(|e: ConnectError| anyhow::anyhow!(e))
            .with_context(|| format!("Failed to connect to {}", addr))?;
        Ok(peer_id)
    }

    /// Connect to `addr` and greet it under this node's device name
    pub async fn hello(&self, addr: &Multiaddr) -> Result<String> {
        let peer_id = self.connect(addr).await?;
        self.swarm
            .hello(peer_id, &self.device_name)
            .await
            .map_err(|e: HandshakeError| anyhow::anyhow!(e))
            .with_context(|| format!("Handshake with {} failed", peer_id))
    }

    /// Run until Ctrl-C, then shut down
    pub async fn run_until_interrupted(self) -> Result<NodeReport> {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
        tracing::info!("Received interrupt, shutting down");
        self.shutdown().await
    }

    /// Stop the swarm and wait for the monitor and discovery tasks to drain
    pub async fn shutdown(self) -> Result<NodeReport> {
        self.swarm.shutdown().await?;

        let connectivity = self.monitor.await.context("Connectivity monitor panicked")?;
        let discovery = self.discovery.await.context("Local discovery panicked")?;
        tracing::info!(
            "Node stopped ({} peers discovered locally, {} connectivity events)",
            discovery.attempted,
            connectivity.events
        );
        Ok(NodeReport {
            connectivity,
            discovery,
        })
    }
}

fn with_peer_id(mut addr: Multiaddr, peer_id: PeerId) -> Multiaddr {
    if !matches!(addr.iter().last(), Some(Protocol::P2p(_))) {
        addr.push(Protocol::P2p(peer_id));
    }
    addr
}
