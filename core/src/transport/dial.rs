// Dial bookkeeping for the swarm task
//
// Both discovery feeders and the bootstrap pass may ask for the same peer at
// the same time, possibly with different addresses. A request for a
// connected peer succeeds immediately. A request for a peer already being
// dialed joins that dial and dials only the addresses not yet tried. The
// first connection to the peer answers every waiter with success; waiters
// get an error only once every dial we started for the peer has failed.
//
// Only dials started here count. Failures of dials made by Kademlia, relay or
// hole punching for the same peer are ignored.

use libp2p::swarm::ConnectionId;
use libp2p::{Multiaddr, PeerId};
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use tokio::sync::oneshot;

pub type DialReply = oneshot::Sender<Result<(), String>>;

/// What the swarm should do with a connect request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialPlan {
    /// Peer already connected; the request was answered
    AlreadyConnected,
    /// Every address is already being dialed; the request waits on that
    Joined,
    /// Start a dial to these addresses and report it with `dial_started`
    Dial(Vec<Multiaddr>),
}

#[derive(Debug)]
struct PendingPeer<C> {
    waiters: Vec<DialReply>,
    in_flight: HashSet<C>,
    addrs: HashSet<Multiaddr>,
    last_error: Option<String>,
}

impl<C> Default for PendingPeer<C> {
    fn default() -> Self {
        Self {
            waiters: Vec::new(),
            in_flight: HashSet::new(),
            addrs: HashSet::new(),
            last_error: None,
        }
    }
}

impl<C> PendingPeer<C> {
    fn answer(self, result: Result<(), String>) {
        for reply in self.waiters {
            let _ = reply.send(result.clone());
        }
    }
}

#[derive(Debug)]
pub struct DialTracker<C = ConnectionId> {
    /// Established connection count per peer
    connected: HashMap<PeerId, u32>,
    pending: HashMap<PeerId, PendingPeer<C>>,
}

impl<C> Default for DialTracker<C> {
    fn default() -> Self {
        Self {
            connected: HashMap::new(),
            pending: HashMap::new(),
        }
    }
}

impl<C> DialTracker<C>
where
    C: Copy + Eq + Hash,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connect request for `peer_id` reachable at `addrs`
    pub fn request(&mut self, peer_id: PeerId, addrs: &[Multiaddr], reply: DialReply) -> DialPlan {
        if self.is_connected(&peer_id) {
            let _ = reply.send(Ok(()));
            return DialPlan::AlreadyConnected;
        }

        let first = !self.pending.contains_key(&peer_id);
        let pending = self.pending.entry(peer_id).or_default();
        pending.waiters.push(reply);

        let fresh: Vec<Multiaddr> = addrs
            .iter()
            .filter(|addr| pending.addrs.insert((*addr).clone()))
            .cloned()
            .collect();

        // An address-less first request still dials: the swarm asks the
        // behaviours (Kademlia) for addresses
        if first || !fresh.is_empty() {
            DialPlan::Dial(fresh)
        } else {
            DialPlan::Joined
        }
    }

    /// A dial planned by `request` was handed to the swarm
    pub fn dial_started(&mut self, peer_id: &PeerId, connection_id: C) {
        if let Some(pending) = self.pending.get_mut(peer_id) {
            pending.in_flight.insert(connection_id);
        }
    }

    /// The swarm refused a planned dial outright. Waiters fail only if no
    /// other dial for the peer is still running.
    pub fn dial_rejected(&mut self, peer_id: &PeerId, error: &str) {
        let Some(pending) = self.pending.get_mut(peer_id) else {
            return;
        };
        pending.last_error = Some(error.to_string());
        if pending.in_flight.is_empty() {
            self.fail(peer_id);
        }
    }

    /// An outgoing connection failed. Returns false when the dial was not
    /// one of ours.
    pub fn on_dial_failed(&mut self, peer_id: &PeerId, connection_id: C, error: &str) -> bool {
        let Some(pending) = self.pending.get_mut(peer_id) else {
            return false;
        };
        if !pending.in_flight.remove(&connection_id) {
            return false;
        }
        pending.last_error = Some(error.to_string());
        if pending.in_flight.is_empty() {
            self.fail(peer_id);
        }
        true
    }

    fn fail(&mut self, peer_id: &PeerId) {
        if let Some(pending) = self.pending.remove(peer_id) {
            let error = pending
                .last_error
                .clone()
                .unwrap_or_else(|| "dial failed".to_string());
            pending.answer(Err(error));
        }
    }

    /// A connection to the peer came up (dialed by us or not)
    pub fn on_established(&mut self, peer_id: PeerId) {
        *self.connected.entry(peer_id).or_insert(0) += 1;
        self.settle(&peer_id, Ok(()));
    }

    /// A connection to the peer went away; `remaining` is what the swarm
    /// still holds for that peer
    pub fn on_closed(&mut self, peer_id: &PeerId, remaining: u32) {
        if remaining == 0 {
            self.connected.remove(peer_id);
        } else {
            self.connected.insert(*peer_id, remaining);
        }
    }

    /// Answer every waiter on the peer with `result` without touching the
    /// connection count
    pub fn settle(&mut self, peer_id: &PeerId, result: Result<(), String>) {
        if let Some(pending) = self.pending.remove(peer_id) {
            pending.answer(result);
        }
    }

    pub fn is_connected(&self, peer_id: &PeerId) -> bool {
        self.connected.contains_key(peer_id)
    }

    pub fn is_pending(&self, peer_id: &PeerId) -> bool {
        self.pending.contains_key(peer_id)
    }

    pub fn connected_peers(&self) -> usize {
        self.connected.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> Multiaddr {
        format!("/ip4/10.0.0.1/tcp/{}", port).parse().unwrap()
    }

    fn tracker() -> DialTracker<u64> {
        DialTracker::new()
    }

    #[test]
    fn test_first_request_dials_all_addresses() {
        let mut tracker = tracker();
        let peer = PeerId::random();
        let (tx, _rx) = oneshot::channel();

        assert_eq!(
            tracker.request(peer, &[addr(1), addr(2)], tx),
            DialPlan::Dial(vec![addr(1), addr(2)])
        );
        assert!(tracker.is_pending(&peer));
    }

    #[test]
    fn test_first_request_without_addresses_still_dials() {
        let mut tracker = tracker();
        let (tx, _rx) = oneshot::channel();
        assert_eq!(tracker.request(PeerId::random(), &[], tx), DialPlan::Dial(vec![]));
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_dial() {
        let mut tracker = tracker();
        let peer = PeerId::random();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();

        assert_eq!(tracker.request(peer, &[addr(1)], tx1), DialPlan::Dial(vec![addr(1)]));
        tracker.dial_started(&peer, 1);
        assert_eq!(tracker.request(peer, &[addr(1)], tx2), DialPlan::Joined);

        tracker.on_established(peer);

        assert_eq!(rx1.await.unwrap(), Ok(()));
        assert_eq!(rx2.await.unwrap(), Ok(()));
        assert_eq!(tracker.connected_peers(), 1);
        assert!(!tracker.is_pending(&peer));
    }

    #[tokio::test]
    async fn test_joined_request_dials_its_new_addresses() {
        let mut tracker = tracker();
        let peer = PeerId::random();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();

        tracker.request(peer, &[addr(1)], tx1);
        tracker.dial_started(&peer, 1);
        assert_eq!(
            tracker.request(peer, &[addr(1), addr(2)], tx2),
            DialPlan::Dial(vec![addr(2)])
        );
        tracker.dial_started(&peer, 2);

        // The first dial failing leaves the second one running
        assert!(tracker.on_dial_failed(&peer, 1, "timeout"));
        assert!(tracker.is_pending(&peer));

        tracker.on_established(peer);
        assert_eq!(rx1.await.unwrap(), Ok(()));
        assert_eq!(rx2.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_waiters_fail_once_every_dial_failed() {
        let mut tracker = tracker();
        let peer = PeerId::random();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();

        tracker.request(peer, &[addr(1)], tx1);
        tracker.dial_started(&peer, 1);
        tracker.request(peer, &[addr(2)], tx2);
        tracker.dial_started(&peer, 2);

        tracker.on_dial_failed(&peer, 1, "timeout");
        tracker.on_dial_failed(&peer, 2, "connection refused");

        assert_eq!(rx1.await.unwrap(), Err("connection refused".to_string()));
        assert_eq!(rx2.await.unwrap(), Err("connection refused".to_string()));
        assert!(!tracker.is_pending(&peer));
        assert!(!tracker.is_connected(&peer));
    }

    #[tokio::test]
    async fn test_foreign_dial_failure_is_ignored() {
        let mut tracker = tracker();
        let peer = PeerId::random();
        let (tx, mut rx) = oneshot::channel();

        tracker.request(peer, &[addr(1)], tx);
        tracker.dial_started(&peer, 1);

        // A dial for the same peer started by some other behaviour
        assert!(!tracker.on_dial_failed(&peer, 99, "unreachable"));
        assert!(tracker.is_pending(&peer));
        assert!(rx.try_recv().is_err());

        tracker.on_established(peer);
        assert_eq!(rx.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_rejected_dial_fails_only_without_dials_in_flight() {
        let mut tracker = tracker();
        let peer = PeerId::random();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();

        tracker.request(peer, &[addr(1)], tx1);
        tracker.dial_started(&peer, 1);
        tracker.request(peer, &[addr(2)], tx2);
        tracker.dial_rejected(&peer, "no addresses");
        assert!(tracker.is_pending(&peer));

        tracker.on_dial_failed(&peer, 1, "timeout");
        assert_eq!(rx1.await.unwrap(), Err("timeout".to_string()));
        assert_eq!(rx2.await.unwrap(), Err("timeout".to_string()));

        let (tx3, rx3) = oneshot::channel();
        tracker.request(peer, &[addr(3)], tx3);
        tracker.dial_rejected(&peer, "no addresses");
        assert_eq!(rx3.await.unwrap(), Err("no addresses".to_string()));
    }

    #[tokio::test]
    async fn test_duplicate_request_to_connected_peer_is_noop() {
        let mut tracker = tracker();
        let peer = PeerId::random();
        tracker.on_established(peer);

        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        assert_eq!(tracker.request(peer, &[addr(1)], tx1), DialPlan::AlreadyConnected);
        assert_eq!(tracker.request(peer, &[addr(2)], tx2), DialPlan::AlreadyConnected);

        assert_eq!(rx1.await.unwrap(), Ok(()));
        assert_eq!(rx2.await.unwrap(), Ok(()));
        assert!(!tracker.is_pending(&peer));
        assert_eq!(tracker.connected_peers(), 1);
    }

    #[tokio::test]
    async fn test_settle_answers_waiters_without_marking_connected() {
        let mut tracker = tracker();
        let peer = PeerId::random();
        let (tx, rx) = oneshot::channel();
        tracker.request(peer, &[addr(1)], tx);

        tracker.settle(&peer, Ok(()));

        assert_eq!(rx.await.unwrap(), Ok(()));
        assert!(!tracker.is_pending(&peer));
        assert!(!tracker.is_connected(&peer));
    }

    #[test]
    fn test_peer_stays_connected_until_last_connection_closes() {
        let mut tracker = tracker();
        let peer = PeerId::random();
        tracker.on_established(peer);
        tracker.on_established(peer);

        tracker.on_closed(&peer, 1);
        assert!(tracker.is_connected(&peer));

        tracker.on_closed(&peer, 0);
        assert!(!tracker.is_connected(&peer));
    }

    #[test]
    fn test_request_after_disconnect_dials_again() {
        let mut tracker = tracker();
        let peer = PeerId::random();
        tracker.on_established(peer);
        tracker.on_closed(&peer, 0);

        let (tx, _rx) = oneshot::channel();
        assert_eq!(tracker.request(peer, &[addr(1)], tx), DialPlan::Dial(vec![addr(1)]));
    }
}
