//! Discovery contract - what the core needs from the overlay network

use super::P2PError;
use crate::crypto::ContentId;

use async_trait::async_trait;
use libp2p::{multiaddr::Protocol, Multiaddr, PeerId, StreamProtocol};
use tokio::io::{AsyncRead, AsyncWrite};

/// A duplex byte stream to a remote peer
pub trait PeerIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> PeerIo for T {}

pub type PeerStream = Box<dyn PeerIo>;

/// A peer that announced it holds some CID. Transient, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provider {
    pub peer_id: PeerId,
    pub addresses: Vec<Multiaddr>,
}

impl Provider {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            addresses: Vec::new(),
        }
    }
}

/// Announce/find providers, reach peers, and open protocol streams.
///
/// Implementations must not block the caller for longer than their own
/// query timeouts; callers never hold local locks across these calls.
#[async_trait]
pub trait Discovery: Send + Sync {
    fn local_peer_id(&self) -> PeerId;

    /// Advertise that this node can serve `cid`
    async fn announce(&self, cid: &ContentId) -> Result<(), P2PError>;

    /// Peers that announced `cid`, in the order the lookup produced them
    async fn find_providers(
        &self,
        cid: &ContentId,
        max_results: usize,
    ) -> Result<Vec<Provider>, P2PError>;

    /// Dial an address that ends in `/p2p/<peer-id>`
    async fn connect(&self, address: &Multiaddr) -> Result<PeerId, P2PError>;

    async fn open_stream(
        &self,
        peer: &PeerId,
        protocol: &StreamProtocol,
    ) -> Result<PeerStream, P2PError>;

    /// Peers this node currently knows how to reach
    async fn known_peers(&self) -> Vec<PeerId>;
}

/// Extract peer ID from multiaddr
pub fn extract_peer_id(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|p| {
        if let Protocol::P2p(peer_id) = p {
            Some(peer_id)
        } else {
            None
        }
    })
}
