// Swarm task: owns the libp2p Swarm and everything that touches it
//
// Transports are TCP, QUIC and WebSocket (Noise + Yamux) plus DNS resolution
// and the relay client transport. The task fans mDNS discoveries and
// connectedness transitions out on channels, serves connect requests through
// the dial tracker and applies admission pressure relief.
//
// Everything else talks to the swarm through a cloneable `SwarmHandle`.

use super::admission::{AdmissionConfig, AdmissionController};
use super::behaviour::{BehaviourOptions, WhooshBehaviour, WhooshBehaviourEvent};
use super::dial::{DialPlan, DialReply, DialTracker};
use crate::discovery::{ConnectError, PeerConnector, PeerRecord};
use crate::handshake::{self, HandshakeError, WHOOSH_CLIENT_PROTOCOL};
use crate::identity::NodeIdentity;
use crate::monitor::ConnectednessEvent;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use libp2p::swarm::dial_opts::{DialOpts, PeerCondition};
use libp2p::swarm::{ConnectionId, DialError, SwarmEvent};
use libp2p::{identify, kad, mdns, noise, yamux, Multiaddr, PeerId, Swarm};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Commands that can be sent to the swarm task
#[derive(Debug)]
pub enum SwarmCommand {
    /// Connect to a peer (no-op if already connected)
    Connect { record: PeerRecord, reply: DialReply },
    /// Get list of connected peers
    GetPeers { reply: oneshot::Sender<Vec<PeerId>> },
    /// Get the addresses we are listening on
    GetListenAddrs { reply: oneshot::Sender<Vec<Multiaddr>> },
    /// Get the addresses we advertise as externally reachable
    GetExternalAddrs { reply: oneshot::Sender<Vec<Multiaddr>> },
    /// Exempt a peer from connection pressure relief
    Protect { peer_id: PeerId },
    /// Start a Kademlia bootstrap query
    BootstrapRouting { reply: oneshot::Sender<Result<(), String>> },
    /// Shutdown the swarm
    Shutdown,
}

/// Everything the swarm needs to come up
#[derive(Debug, Clone)]
pub struct SwarmOptions {
    pub listen_addrs: Vec<Multiaddr>,
    pub public_addr: Option<Multiaddr>,
    pub admission: AdmissionConfig,
    pub trim_interval: Duration,
    pub idle_connection_timeout: Duration,
    pub greeting_timeout: Duration,
    pub behaviour: BehaviourOptions,
}

/// Feeds the swarm publishes to the rest of the node
pub struct SwarmFeeds {
    /// Peers found on the local network
    pub peer_found_tx: mpsc::Sender<PeerRecord>,
    /// Connect/disconnect transitions
    pub connectivity_tx: mpsc::Sender<ConnectednessEvent>,
}

/// Handle to communicate with the running swarm task
#[derive(Clone)]
pub struct SwarmHandle {
    local_peer_id: PeerId,
    command_tx: mpsc::Sender<SwarmCommand>,
    stream_control: libp2p_stream::Control,
}

impl SwarmHandle {
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SwarmCommand,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(build(reply_tx))
            .await
            .map_err(|_| anyhow::anyhow!("Swarm task not running"))?;

        reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("No reply from swarm"))
    }

    /// Get connected peers
    pub async fn get_peers(&self) -> Result<Vec<PeerId>> {
        self.request(|reply| SwarmCommand::GetPeers { reply }).await
    }

    /// Addresses the swarm is listening on
    pub async fn listen_addrs(&self) -> Result<Vec<Multiaddr>> {
        self.request(|reply| SwarmCommand::GetListenAddrs { reply }).await
    }

    /// Addresses advertised as externally reachable
    pub async fn external_addrs(&self) -> Result<Vec<Multiaddr>> {
        self.request(|reply| SwarmCommand::GetExternalAddrs { reply }).await
    }

    /// Never evict connections to this peer under connection pressure
    pub async fn protect(&self, peer_id: PeerId) -> Result<()> {
        self.command_tx
            .send(SwarmCommand::Protect { peer_id })
            .await
            .map_err(|_| anyhow::anyhow!("Swarm task not running"))
    }

    /// Kick off a Kademlia bootstrap query
    pub async fn bootstrap_routing(&self) -> Result<()> {
        self.request(|reply| SwarmCommand::BootstrapRouting { reply })
            .await?
            .map_err(|e| anyhow::anyhow!(e))
    }

    /// Greet a peer over the client handshake protocol and return its reply
    pub async fn hello(
        &self,
        peer_id: PeerId,
        device_name: &str,
    ) -> Result<String, HandshakeError> {
        let mut control = self.stream_control.clone();
        let mut stream = control
            .open_stream(peer_id, WHOOSH_CLIENT_PROTOCOL)
            .await
            .map_err(|e| HandshakeError::Open(e.to_string()))?;
        handshake::client_hello(&mut stream, device_name).await
    }

    /// Shut down the swarm
    pub async fn shutdown(&self) -> Result<()> {
        self.command_tx
            .send(SwarmCommand::Shutdown)
            .await
            .map_err(|_| anyhow::anyhow!("Swarm task not running"))
    }
}

#[async_trait]
impl PeerConnector for SwarmHandle {
    async fn connect(&self, record: PeerRecord) -> Result<(), ConnectError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(SwarmCommand::Connect {
                record,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ConnectError::SwarmStopped)?;

        reply_rx
            .await
            .map_err(|_| ConnectError::SwarmStopped)?
            .map_err(ConnectError::Dial)
    }
}

/// Build and start the libp2p swarm, returning a handle for communication.
///
/// The handshake protocol handler is registered before any listener is
/// opened, so no inbound stream can arrive unhandled. Listener and behaviour
/// construction failures are returned as errors.
pub async fn start_swarm(
    identity: &NodeIdentity,
    options: SwarmOptions,
    feeds: SwarmFeeds,
) -> Result<SwarmHandle> {
    let behaviour_options = options.behaviour.clone();
    let mut swarm = libp2p::SwarmBuilder::with_existing_identity(identity.keypair().clone())
        .with_tokio()
        .with_tcp(
            libp2p::tcp::Config::default(),
            noise::Config::new,
            yamux::Config::default,
        )?
        .with_quic()
        .with_dns()?
        .with_websocket(noise::Config::new, yamux::Config::default)
        .await?
        .with_relay_client(noise::Config::new, yamux::Config::default)?
        .with_behaviour(|key, relay_client| -> Result<WhooshBehaviour, BoxError> {
            WhooshBehaviour::new(key, relay_client, &behaviour_options)
                .map_err(|e| e.to_string().into())
        })?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(options.idle_connection_timeout))
        .build();

    // Handshake handler first
    let mut stream_control = swarm.behaviour().stream.new_control();
    let incoming = stream_control
        .accept(WHOOSH_CLIENT_PROTOCOL)
        .map_err(|_| anyhow::anyhow!("handshake protocol already registered"))?;
    tokio::spawn(handshake::accept_loop(incoming, options.greeting_timeout));

    for addr in &options.listen_addrs {
        swarm
            .listen_on(addr.clone())
            .with_context(|| format!("Failed to listen on {}", addr))?;
    }

    if let Some(public_addr) = &options.public_addr {
        tracing::info!("Advertising public address {}", public_addr);
        swarm.add_external_address(public_addr.clone());
    }

    let (command_tx, command_rx) = mpsc::channel::<SwarmCommand>(256);
    let handle = SwarmHandle {
        local_peer_id: *swarm.local_peer_id(),
        command_tx,
        stream_control,
    };

    let event_loop = EventLoop {
        swarm,
        command_rx,
        feeds,
        dials: DialTracker::new(),
        admission: AdmissionController::new(options.admission),
        trim_interval: options.trim_interval,
    };
    tokio::spawn(event_loop.run());

    Ok(handle)
}

struct EventLoop {
    swarm: Swarm<WhooshBehaviour>,
    command_rx: mpsc::Receiver<SwarmCommand>,
    feeds: SwarmFeeds,
    dials: DialTracker,
    admission: AdmissionController<ConnectionId>,
    trim_interval: Duration,
}

impl EventLoop {
    async fn run(mut self) {
        let mut trim = tokio::time::interval(self.trim_interval);
        trim.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                // Process incoming swarm events
                event = self.swarm.select_next_some() => self.on_swarm_event(event).await,

                // Process commands from the application layer
                command = self.command_rx.recv() => match command {
                    Some(SwarmCommand::Shutdown) | None => {
                        tracing::info!("Swarm shutting down");
                        break;
                    }
                    Some(command) => self.on_command(command),
                },

                _ = trim.tick() => self.trim_connections(),
            }
        }
    }

    async fn on_swarm_event(&mut self, event: SwarmEvent<WhooshBehaviourEvent>) {
        match event {
            SwarmEvent::Behaviour(WhooshBehaviourEvent::Mdns(mdns::Event::Discovered(peers))) => {
                for (peer_id, addr) in &peers {
                    tracing::debug!("mDNS discovered peer: {} at {}", peer_id, addr);
                    self.add_routing_address(peer_id, addr.clone());
                }
                for record in PeerRecord::group_by_peer(peers) {
                    let _ = self.feeds.peer_found_tx.send(record).await;
                }
            }

            SwarmEvent::Behaviour(WhooshBehaviourEvent::Mdns(mdns::Event::Expired(peers))) => {
                for (peer_id, _addr) in peers {
                    tracing::debug!("mDNS peer expired: {}", peer_id);
                }
            }

            SwarmEvent::Behaviour(WhooshBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
            })) => {
                tracing::debug!(
                    "Identified peer {} ({}) with {} addresses",
                    peer_id,
                    info.agent_version,
                    info.listen_addrs.len()
                );
                for addr in info.listen_addrs {
                    self.add_routing_address(&peer_id, addr);
                }
            }

            SwarmEvent::Behaviour(WhooshBehaviourEvent::Kademlia(kad::Event::RoutingUpdated {
                peer,
                ..
            })) => {
                tracing::debug!("Routing table updated with {}", peer);
            }

            SwarmEvent::Behaviour(WhooshBehaviourEvent::Kademlia(
                kad::Event::OutboundQueryProgressed {
                    result: kad::QueryResult::Bootstrap(result),
                    ..
                },
            )) => match result {
                Ok(ok) => tracing::debug!(
                    "DHT bootstrap step: {} remaining buckets",
                    ok.num_remaining
                ),
                Err(e) => tracing::warn!("DHT bootstrap query failed: {:?}", e),
            },

            SwarmEvent::Behaviour(WhooshBehaviourEvent::Dcutr(event)) => {
                tracing::debug!("Hole punching: {:?}", event);
            }

            SwarmEvent::Behaviour(WhooshBehaviourEvent::Relay(event)) => {
                tracing::debug!("Relay: {:?}", event);
            }

            SwarmEvent::NewListenAddr { address, .. } => {
                tracing::info!("Listening on {}", address);
            }

            SwarmEvent::ConnectionEstablished {
                peer_id,
                connection_id,
                endpoint,
                num_established,
                ..
            } => {
                tracing::debug!("Connected to {} via {}", peer_id, endpoint.get_remote_address());

                self.admission.register(connection_id, peer_id, Instant::now());
                self.dials.on_established(peer_id);

                if num_established.get() == 1 {
                    let _ = self
                        .feeds
                        .connectivity_tx
                        .send(ConnectednessEvent::connected(peer_id))
                        .await;
                }

                self.trim_connections();
            }

            SwarmEvent::ConnectionClosed {
                peer_id,
                connection_id,
                num_established,
                ..
            } => {
                tracing::debug!("Connection {} to {} closed", connection_id, peer_id);
                self.admission.unregister(&connection_id);
                self.dials.on_closed(&peer_id, num_established);

                if num_established == 0 {
                    let _ = self
                        .feeds
                        .connectivity_tx
                        .send(ConnectednessEvent::not_connected(peer_id))
                        .await;
                }
            }

            SwarmEvent::OutgoingConnectionError {
                peer_id: Some(peer_id),
                connection_id,
                error,
            } => {
                if self.dials.on_dial_failed(&peer_id, connection_id, &error.to_string()) {
                    tracing::debug!("Dial {:?} to {} failed: {}", connection_id, peer_id, error);
                }
            }

            _ => {}
        }
    }

    fn on_command(&mut self, command: SwarmCommand) {
        match command {
            SwarmCommand::Connect { record, reply } => self.connect(record, reply),

            SwarmCommand::GetPeers { reply } => {
                let _ = reply.send(self.swarm.connected_peers().cloned().collect());
            }

            SwarmCommand::GetListenAddrs { reply } => {
                let _ = reply.send(self.swarm.listeners().cloned().collect());
            }

            SwarmCommand::GetExternalAddrs { reply } => {
                let _ = reply.send(self.swarm.external_addresses().cloned().collect());
            }

            SwarmCommand::Protect { peer_id } => self.admission.protect(peer_id),

            SwarmCommand::BootstrapRouting { reply } => {
                let result = match self.swarm.behaviour_mut().kademlia.as_mut() {
                    Some(kademlia) => kademlia.bootstrap().map(|_| ()).map_err(|e| e.to_string()),
                    None => Err("DHT disabled".to_string()),
                };
                let _ = reply.send(result);
            }

            // Handled by the loop
            SwarmCommand::Shutdown => {}
        }
    }

    fn connect(&mut self, record: PeerRecord, reply: DialReply) {
        let peer_id = record.peer_id;
        for addr in &record.addrs {
            self.add_routing_address(&peer_id, addr.clone());
        }

        let addrs = match self.dials.request(peer_id, &record.addrs, reply) {
            DialPlan::Dial(addrs) => addrs,
            DialPlan::AlreadyConnected | DialPlan::Joined => return,
        };

        // Disconnected rather than the default: a second request with new
        // addresses dials them alongside the dial already in flight
        let opts = DialOpts::peer_id(peer_id)
            .condition(PeerCondition::Disconnected)
            .addresses(addrs)
            .build();
        let connection_id = opts.connection_id();

        match self.swarm.dial(opts) {
            Ok(()) => {
                tracing::debug!("Dialing {} ({:?})", peer_id, connection_id);
                self.dials.dial_started(&peer_id, connection_id);
            }
            // Connected behind the tracker's back; nothing to wait for
            Err(DialError::DialPeerConditionFalse(_)) => self.dials.settle(&peer_id, Ok(())),
            Err(e) => self.dials.dial_rejected(&peer_id, &e.to_string()),
        }
    }

    fn add_routing_address(&mut self, peer_id: &PeerId, addr: Multiaddr) {
        if let Some(kademlia) = self.swarm.behaviour_mut().kademlia.as_mut() {
            kademlia.add_address(peer_id, addr);
        }
    }

    fn trim_connections(&mut self) {
        let evictions = self.admission.select_evictions(Instant::now());
        if evictions.is_empty() {
            return;
        }

        tracing::info!(
            "Connection pressure: {} connections, high water mark {}, closing {}",
            self.admission.len(),
            self.admission.config().high_water,
            evictions.len()
        );
        for connection_id in evictions {
            self.admission.unregister(&connection_id);
            self.swarm.close_connection(connection_id);
        }
    }
}
