// Discovery: peer records and the single "connect to this peer" action
//
// Two feeders end up here:
// - mDNS (local network): every discovered peer is handed to `LocalDiscovery`,
//   which makes exactly one connection attempt per notification
// - the seed list (global swarm): see `bootstrap`
//
// The Kademlia routing table converges on its own inside the swarm and needs
// no callback from this module.

pub mod bootstrap;

use async_trait::async_trait;
use libp2p::{multiaddr::Protocol, Multiaddr, PeerId};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

/// Why a single connection attempt failed. Always non-fatal.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("connection attempt timed out after {0:?}")]
    Timeout(Duration),
    #[error("dial failed: {0}")]
    Dial(String),
    #[error("swarm task not running")]
    SwarmStopped,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PeerRecordError {
    #[error("invalid multiaddr {addr}: {reason}")]
    InvalidAddress { addr: String, reason: String },
    #[error("multiaddr {0} does not end with /p2p/<peer id>")]
    MissingPeerId(String),
}

/// A remote node: its identity and whatever addresses we know for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

impl PeerRecord {
    pub fn new(peer_id: PeerId, addrs: Vec<Multiaddr>) -> Self {
        Self { peer_id, addrs }
    }

    /// Split a `.../p2p/<peer id>` multiaddr into a record whose single
    /// address is everything before the peer id
    pub fn from_p2p_addr(addr: &Multiaddr) -> Result<Self, PeerRecordError> {
        let mut transport = addr.clone();
        match transport.pop() {
            Some(Protocol::P2p(peer_id)) => {
                let addrs = if transport.is_empty() {
                    Vec::new()
                } else {
                    vec![transport]
                };
                Ok(Self { peer_id, addrs })
            }
            _ => Err(PeerRecordError::MissingPeerId(addr.to_string())),
        }
    }

    /// Parse a textual `.../p2p/<peer id>` multiaddr
    pub fn parse(addr: &str) -> Result<Self, PeerRecordError> {
        let multiaddr: Multiaddr = addr.parse().map_err(|e: libp2p::multiaddr::Error| {
            PeerRecordError::InvalidAddress {
                addr: addr.to_string(),
                reason: e.to_string(),
            }
        })?;
        Self::from_p2p_addr(&multiaddr)
    }

    /// Group an mDNS discovery batch (one entry per address) into one record
    /// per peer, keeping first-seen order
    pub fn group_by_peer(entries: impl IntoIterator<Item = (PeerId, Multiaddr)>) -> Vec<Self> {
        let mut records: Vec<Self> = Vec::new();
        for (peer_id, addr) in entries {
            match records.iter_mut().find(|r| r.peer_id == peer_id) {
                Some(record) => {
                    if !record.addrs.contains(&addr) {
                        record.addrs.push(addr);
                    }
                }
                None => records.push(Self::new(peer_id, vec![addr])),
            }
        }
        records
    }
}

/// The "connect to this peer" capability.
///
/// Implementations must treat a request for an already-connected peer as a
/// success and must be safe to call concurrently.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, record: PeerRecord) -> Result<(), ConnectError>;
}

/// One connection attempt bounded by `deadline`. Expiry is reported like any
/// other connect failure.
pub async fn connect_with_deadline(
    connector: &dyn PeerConnector,
    record: PeerRecord,
    deadline: Duration,
) -> Result<(), ConnectError> {
    match tokio::time::timeout(deadline, connector.connect(record)).await {
        Ok(result) => result,
        Err(_) => Err(ConnectError::Timeout(deadline)),
    }
}

/// Outcome counts of a `LocalDiscovery::run`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveryStats {
    pub attempted: usize,
    pub connected: usize,
    pub failed: usize,
}

/// Consumer of local "peer found" notifications
#[derive(Clone)]
pub struct LocalDiscovery {
    connector: Arc<dyn PeerConnector>,
    dial_timeout: Duration,
    limit: Option<Arc<Semaphore>>,
}

impl LocalDiscovery {
    /// `max_concurrent` bounds the number of attempts in flight; `None`
    /// lets a discovery burst fan out without limit
    pub fn new(
        connector: Arc<dyn PeerConnector>,
        dial_timeout: Duration,
        max_concurrent: Option<usize>,
    ) -> Self {
        Self {
            connector,
            dial_timeout,
            limit: max_concurrent.map(|n| Arc::new(Semaphore::new(n.max(1)))),
        }
    }

    /// Consume notifications until the feed closes, one independent attempt
    /// per record. Returns once every attempt has resolved.
    pub async fn run(self, mut found_rx: mpsc::Receiver<PeerRecord>) -> DiscoveryStats {
        let mut stats = DiscoveryStats::default();
        let mut attempts: JoinSet<Result<(), ConnectError>> = JoinSet::new();

        loop {
            tokio::select! {
                found = found_rx.recv() => match found {
                    Some(record) => {
                        stats.attempted += 1;
                        attempts.spawn(self.clone().attempt(record));
                    }
                    None => break,
                },
                Some(done) = attempts.join_next(), if !attempts.is_empty() => {
                    stats.record(done);
                }
            }
        }

        while let Some(done) = attempts.join_next().await {
            stats.record(done);
        }

        tracing::debug!(
            "Local discovery feed closed ({} attempted, {} connected, {} failed)",
            stats.attempted,
            stats.connected,
            stats.failed
        );
        stats
    }

    async fn attempt(self, record: PeerRecord) -> Result<(), ConnectError> {
        let peer_id = record.peer_id;
        tracing::info!("Found peer via mDNS: {}", peer_id);

        let _permit = match &self.limit {
            Some(limit) => Some(
                limit
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| ConnectError::SwarmStopped)?,
            ),
            None => None,
        };

        let result =
            connect_with_deadline(self.connector.as_ref(), record, self.dial_timeout).await;
        match &result {
            Ok(()) => tracing::info!("Successfully connected to peer {}", peer_id),
            Err(e) => tracing::warn!("Failed to connect to peer {}: {}", peer_id, e),
        }
        result
    }
}

impl DiscoveryStats {
    fn record(&mut self, done: Result<Result<(), ConnectError>, tokio::task::JoinError>) {
        match done {
            Ok(Ok(())) => self.connected += 1,
            Ok(Err(_)) => self.failed += 1,
            Err(e) => {
                tracing::error!("Discovery connect task aborted: {}", e);
                self.failed += 1;
            }
        }
    }
}
