// Connectivity Event Monitor: observes connect/disconnect transitions
//
// The swarm reports a peer as Connected when its first connection comes up
// and NotConnected when its last one goes away. The monitor is the single
// consumer of that feed; it logs and keeps a view of who is connected, and
// never touches connection state itself.

use libp2p::PeerId;
use std::collections::HashSet;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectedness {
    Connected,
    NotConnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectednessEvent {
    pub peer_id: PeerId,
    pub state: Connectedness,
}

impl ConnectednessEvent {
    pub fn connected(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            state: Connectedness::Connected,
        }
    }

    pub fn not_connected(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            state: Connectedness::NotConnected,
        }
    }
}

/// What the monitor saw over its lifetime
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectivitySummary {
    pub events: usize,
    pub connects: usize,
    pub disconnects: usize,
    /// Peers still connected when the feed ended
    pub connected_peers: HashSet<PeerId>,
}

#[derive(Debug, Default)]
pub struct ConnectivityMonitor {
    summary: ConnectivitySummary,
}

impl ConnectivityMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process one event
    pub fn observe(&mut self, event: ConnectednessEvent) {
        self.summary.events += 1;
        match event.state {
            Connectedness::Connected => {
                self.summary.connects += 1;
                self.summary.connected_peers.insert(event.peer_id);
                tracing::info!(
                    "Peer connected: {} ({} connected)",
                    event.peer_id,
                    self.summary.connected_peers.len()
                );
            }
            Connectedness::NotConnected => {
                self.summary.disconnects += 1;
                self.summary.connected_peers.remove(&event.peer_id);
                tracing::info!(
                    "Peer disconnected: {} ({} connected)",
                    event.peer_id,
                    self.summary.connected_peers.len()
                );
            }
        }
    }

    pub fn connected_count(&self) -> usize {
        self.summary.connected_peers.len()
    }

    /// Consume the feed in arrival order until it closes
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<ConnectednessEvent>,
    ) -> ConnectivitySummary {
        while let Some(event) = events.recv().await {
            self.observe(event);
        }
        tracing::debug!("Connectivity feed closed after {} events", self.summary.events);
        self.summary
    }
}
