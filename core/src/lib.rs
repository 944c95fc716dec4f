// Whoosh Core: peer-to-peer overlay node
//
// Stable identity, two discovery paths (mDNS on the LAN, Kademlia across the
// global swarm), a one-shot seed bootstrap, soft connection-count admission
// and a plaintext greeting protocol for desktop clients.

pub mod config;
pub mod discovery;
pub mod handshake;
pub mod identity;
pub mod monitor;
pub mod node;
pub mod transport;

pub use config::{ConfigError, NodeConfig};
pub use discovery::{ConnectError, LocalDiscovery, PeerConnector, PeerRecord};
pub use handshake::{HandshakeError, HandshakeSession, WHOOSH_CLIENT_PROTOCOL};
pub use identity::{IdentityError, IdentityStore, NodeIdentity};
pub use monitor::{ConnectednessEvent, ConnectivityMonitor};
pub use node::{NodeReport, WhooshNode};
pub use transport::SwarmHandle;
