// Admission Controller: soft connection-count pressure relief
//
// Tracks every established connection with the instant it came up. Once the
// total exceeds the high water mark, connections older than the grace period
// become eviction candidates until the count is back at the high water mark.
// Nothing is ever refused at accept time.

use crate::config::ConnectionManagerConfig;
use libp2p::PeerId;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("low water mark ({low}) must be below high water mark ({high})")]
    InvertedWatermarks { low: usize, high: usize },
}

/// Validated admission settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionConfig {
    pub low_water: usize,
    pub high_water: usize,
    pub grace_period: Duration,
}

impl AdmissionConfig {
    pub fn new(
        low_water: usize,
        high_water: usize,
        grace_period: Duration,
    ) -> Result<Self, AdmissionError> {
        if low_water >= high_water {
            return Err(AdmissionError::InvertedWatermarks {
                low: low_water,
                high: high_water,
            });
        }
        Ok(Self {
            low_water,
            high_water,
            grace_period,
        })
    }
}

impl TryFrom<&ConnectionManagerConfig> for AdmissionConfig {
    type Error = AdmissionError;

    fn try_from(cfg: &ConnectionManagerConfig) -> Result<Self, Self::Error> {
        Self::new(cfg.low_water, cfg.high_water, cfg.grace_period())
    }
}

#[derive(Debug, Clone)]
struct TrackedConnection {
    peer_id: PeerId,
    established_at: Instant,
}

/// Connection tracker with watermark-based eviction.
///
/// Generic over the connection key so the swarm can use `ConnectionId`
/// directly.
#[derive(Debug)]
pub struct AdmissionController<C> {
    config: AdmissionConfig,
    connections: HashMap<C, TrackedConnection>,
    protected: HashSet<PeerId>,
}

impl<C> AdmissionController<C>
where
    C: Copy + Eq + Hash,
{
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            config,
            connections: HashMap::new(),
            protected: HashSet::new(),
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// Record a newly established connection
    pub fn register(&mut self, conn: C, peer_id: PeerId, established_at: Instant) {
        self.connections.insert(
            conn,
            TrackedConnection {
                peer_id,
                established_at,
            },
        );
    }

    /// Forget a closed connection
    pub fn unregister(&mut self, conn: &C) {
        self.connections.remove(conn);
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Exempt a peer's connections from eviction
    pub fn protect(&mut self, peer_id: PeerId) {
        self.protected.insert(peer_id);
    }

    pub fn unprotect(&mut self, peer_id: &PeerId) -> bool {
        self.protected.remove(peer_id)
    }

    pub fn is_protected(&self, peer_id: &PeerId) -> bool {
        self.protected.contains(peer_id)
    }

    /// Pick the connections to close so the total returns to the high water
    /// mark. Only connections older than the grace period whose peer is not
    /// protected qualify; the youngest qualifying connections go first.
    /// Returns fewer than needed (possibly none) when candidates run out.
    pub fn select_evictions(&self, now: Instant) -> Vec<C> {
        let total = self.connections.len();
        if total <= self.config.high_water {
            return Vec::new();
        }
        let excess = total - self.config.high_water;

        let mut candidates: Vec<(C, Instant)> = self
            .connections
            .iter()
            .filter(|(_, tracked)| !self.protected.contains(&tracked.peer_id))
            .filter(|(_, tracked)| {
                now.saturating_duration_since(tracked.established_at) > self.config.grace_period
            })
            .map(|(conn, tracked)| (*conn, tracked.established_at))
            .collect();

        candidates.sort_by(|a, b| b.1.cmp(&a.1));
        candidates
            .into_iter()
            .take(excess)
            .map(|(conn, _)| conn)
            .collect()
    }
}
