// Bootstrap Orchestrator: one best-effort pass over the seed peers
//
// Every seed gets its own task; a failing seed never affects its siblings.
// The pass ends when every task has resolved, whatever the outcome.

use super::{connect_with_deadline, PeerConnector, PeerRecord};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

/// Well-known public bootstrap peers of the libp2p/IPFS DHT
pub const DEFAULT_BOOTSTRAP_PEERS: &[&str] = &[
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmQCU2EcMqAqQPR2i9bChDtGNJchTbq5TbXJJ16u19uLTa",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmbLHAnMoJPWSCR5Zhtx6BHJX9KiKNN6tpvbUcqanj75Nb",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmcZf59bWwK5XFi76CZX8cbJ4BhTzzA3gU1ZjYZcYW3dwt",
    "/ip4/104.131.131.82/tcp/4001/p2p/QmaCpDMGvV2BGHeYERUEnRQAwe3N8SzbUtfsmvsqQLuvuJ",
    "/ip4/104.131.131.82/udp/4001/quic-v1/p2p/QmaCpDMGvV2BGHeYERUEnRQAwe3N8SzbUtfsmvsqQLuvuJ",
];

/// Parse the seeds that are usable, logging the rest
pub fn parse_seeds(seeds: &[String]) -> Vec<PeerRecord> {
    seeds
        .iter()
        .filter_map(|seed| match PeerRecord::parse(seed) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!("Ignoring bootstrap peer: {}", e);
                None
            }
        })
        .collect()
}

/// Dial every seed concurrently and wait for all attempts to finish.
///
/// Never fails: zero reachable seeds is logged like any other outcome, the
/// local and DHT discovery paths carry on regardless.
pub async fn bootstrap(
    connector: Arc<dyn PeerConnector>,
    seeds: &[String],
    dial_timeout: Duration,
) {
    tracing::info!("Bootstrapping DHT ({} seed peers)", seeds.len());

    let mut tasks = JoinSet::new();
    for seed in seeds {
        let connector = connector.clone();
        let seed = seed.clone();
        tasks.spawn(async move {
            let record = match PeerRecord::parse(&seed) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!("Failed to parse bootstrap peer: {}", e);
                    return;
                }
            };

            let peer_id = record.peer_id;
            match connect_with_deadline(connector.as_ref(), record, dial_timeout).await {
                Ok(()) => tracing::info!("Connection established with bootstrap peer: {}", peer_id),
                Err(e) => {
                    tracing::warn!("Failed to connect to bootstrap peer {}: {}", peer_id, e)
                }
            }
        });
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            tracing::error!("Bootstrap task aborted: {}", e);
        }
    }

    tracing::info!("DHT Bootstrap complete.");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_bootstrap_peers_parse() {
        let seeds: Vec<String> = DEFAULT_BOOTSTRAP_PEERS.iter().map(|s| s.to_string()).collect();
        let records = parse_seeds(&seeds);
        assert_eq!(records.len(), DEFAULT_BOOTSTRAP_PEERS.len());

        for record in &records {
            assert_eq!(record.addrs.len(), 1, "seed should carry a transport address");
        }
    }

    #[test]
    fn test_parse_seeds_skips_invalid_entries() {
        let seeds = vec![
            DEFAULT_BOOTSTRAP_PEERS[4].to_string(),
            "/ip4/1.2.3.4/tcp/4001".to_string(),
            "nonsense".to_string(),
        ];
        assert_eq!(parse_seeds(&seeds).len(), 1);
    }
}
