// Node identity: a long-lived Ed25519 keypair and the PeerId derived from it

mod store;

pub use store::IdentityStore;

use libp2p::identity::Keypair;
use libp2p::PeerId;
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Failed to access identity file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Identity file {path} is corrupt: {reason}")]
    Decode { path: String, reason: String },
    #[error("Failed to encode identity: {0}")]
    Encode(String),
}

/// The node's cryptographic identity.
///
/// Immutable for the lifetime of the process. The keypair never leaves the
/// node; only the derived `PeerId` is shared with other peers (by the
/// transport's security handshake, not by this crate).
#[derive(Clone)]
pub struct NodeIdentity {
    keypair: Keypair,
    peer_id: PeerId,
}

impl NodeIdentity {
    /// Generate a fresh Ed25519 identity
    pub fn generate() -> Self {
        Self::from_keypair(Keypair::generate_ed25519())
    }

    pub fn from_keypair(keypair: Keypair) -> Self {
        let peer_id = keypair.public().to_peer_id();
        Self { keypair, peer_id }
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Serialize the private key in libp2p's protobuf encoding.
    /// The returned buffer wipes the secret key material on drop.
    pub fn to_protobuf(&self) -> Result<Zeroizing<Vec<u8>>, IdentityError> {
        self.keypair
            .to_protobuf_encoding()
            .map(Zeroizing::new)
            .map_err(|e| IdentityError::Encode(e.to_string()))
    }

    /// Decode a protobuf-encoded private key.
    pub fn from_protobuf(bytes: &[u8]) -> Result<Self, libp2p::identity::DecodingError> {
        Keypair::from_protobuf_encoding(bytes).map(Self::from_keypair)
    }
}

impl std::fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}
