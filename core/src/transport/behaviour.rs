// Combined NetworkBehaviour for the Whoosh node
//
// - kademlia: DHT membership and peer routing on WAN (server mode)
// - mdns: peer discovery on LAN
// - identify: exchange listen addresses (feeds Kademlia)
// - ping: liveness
// - relay + relay_client + dcutr: relay service and hole punching for NATed peers
// - stream: raw application streams (client handshake protocol)

use libp2p::{
    dcutr, identify, kad, mdns, ping, relay,
    swarm::{behaviour::toggle::Toggle, NetworkBehaviour},
};
use std::time::Duration;

/// Identify protocol version advertised to other peers
pub const IDENTIFY_PROTOCOL_VERSION: &str = "/whoosh/1.0.0";

/// Which optional protocols to run
#[derive(Debug, Clone)]
pub struct BehaviourOptions {
    pub enable_mdns: bool,
    pub mdns_query_interval: Duration,
    pub enable_dht: bool,
}

impl Default for BehaviourOptions {
    fn default() -> Self {
        Self {
            enable_mdns: true,
            mdns_query_interval: Duration::from_secs(5),
            enable_dht: true,
        }
    }
}

/// The Whoosh network behaviour combining all protocols.
#[derive(NetworkBehaviour)]
pub struct WhooshBehaviour {
    /// DHT for WAN peer discovery
    pub kademlia: Toggle<kad::Behaviour<kad::store::MemoryStore>>,
    /// LAN peer discovery
    pub mdns: Toggle<mdns::tokio::Behaviour>,
    /// Peer identification
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
    /// Relay service for peers that cannot be reached directly
    pub relay: relay::Behaviour,
    pub relay_client: relay::client::Behaviour,
    /// Hole punching through relayed connections
    pub dcutr: dcutr::Behaviour,
    /// Raw streams for the client handshake protocol
    pub stream: libp2p_stream::Behaviour,
}

impl WhooshBehaviour {
    /// Create a new behaviour with the given keypair
    pub fn new(
        keypair: &libp2p::identity::Keypair,
        relay_client: relay::client::Behaviour,
        options: &BehaviourOptions,
    ) -> anyhow::Result<Self> {
        let peer_id = keypair.public().to_peer_id();

        // Kademlia in server mode: we take part in the routing table and can
        // be found through it, not just query it
        let kademlia = if options.enable_dht {
            let mut kademlia = kad::Behaviour::new(peer_id, kad::store::MemoryStore::new(peer_id));
            kademlia.set_mode(Some(kad::Mode::Server));
            Some(kademlia)
        } else {
            None
        };

        let mdns = if options.enable_mdns {
            let config = mdns::Config {
                query_interval: options.mdns_query_interval,
                ..Default::default()
            };
            Some(mdns::tokio::Behaviour::new(config, peer_id)?)
        } else {
            None
        };

        let identify = identify::Behaviour::new(
            identify::Config::new(IDENTIFY_PROTOCOL_VERSION.to_string(), keypair.public())
                .with_agent_version(format!("whoosh-node/{}", env!("CARGO_PKG_VERSION")))
                .with_push_listen_addr_updates(true)
                .with_interval(Duration::from_secs(60)),
        );

        Ok(Self {
            kademlia: Toggle::from(kademlia),
            mdns: Toggle::from(mdns),
            identify,
            ping: ping::Behaviour::new(ping::Config::new()),
            relay: relay::Behaviour::new(peer_id, relay::Config::default()),
            relay_client,
            dcutr: dcutr::Behaviour::new(peer_id),
            stream: libp2p_stream::Behaviour::new(),
        })
    }
}
