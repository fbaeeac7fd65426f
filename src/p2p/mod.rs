//! P2P Networking Module using libp2p
//!
//! Provider discovery over the Kademlia DHT and the single-shot retrieval
//! protocol peers use to pull file bytes and listings from each other.

mod discovery;
pub mod memory;
mod node;
pub mod protocol;

pub use discovery::{extract_peer_id, Discovery, PeerIo, PeerStream, Provider};
pub use memory::{MemoryDiscovery, MemoryNetwork, PeerMode};
pub use node::{EventLoop, NetworkClient, P2PNode, P2PNodeConfig};
pub use protocol::{Request, Served, PROTOCOL};

pub use libp2p::{Multiaddr, PeerId};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum P2PError {
    #[error("Failed to initialize network: {0}")]
    InitializationFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("No providers found for CID: {0}")]
    NoProviders(String),

    #[error("All {tried} providers failed to deliver {cid}")]
    ProvidersExhausted { cid: String, tried: usize },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("DHT error: {0}")]
    Dht(String),

    #[error("Timeout")]
    Timeout,

    #[error("Stream I/O error: {0}")]
    Io(#[from] std::io::Error),
}
