//! ObscureFS - Decentralized content-addressed file storage
//!
//! Files are addressed by the SHA-256 of their bytes, split into
//! Reed-Solomon data + parity shards on disk, announced on a Kademlia DHT,
//! and pulled from peers over a single-shot stream protocol.

pub mod api;
pub mod content_node;
pub mod crypto;
pub mod p2p;
pub mod storage;

pub use content_node::{ContentNode, NetworkListing, RetrievalOptions, RetrievalSource, ShareReceipt};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Main error type for ObscureFS operations
#[derive(Error, Debug)]
pub enum ObscureError {
    #[error("Content id error: {0}")]
    Crypto(#[from] crypto::CidError),

    #[error("P2P network error: {0}")]
    P2P(#[from] p2p::P2PError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl ObscureError {
    /// The requested content is nowhere to be found, locally or on the network
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ObscureError::Storage(storage::StorageError::FileNotFound(_))
                | ObscureError::P2P(p2p::P2PError::NoProviders(_))
                | ObscureError::P2P(p2p::P2PError::ProvidersExhausted { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, ObscureError>;

/// Core configuration for an ObscureFS node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Root directory for shard sets
    pub storage_root: PathBuf,

    /// Where HTTP uploads are saved before sharing
    pub upload_dir: PathBuf,

    /// Scratch space for files retrieved on behalf of HTTP clients
    pub temp_dir: PathBuf,

    /// TCP/QUIC port for the P2P transport (0 = any)
    pub listen_port: u16,

    /// Port for the HTTP API
    pub api_port: u16,

    /// Multiaddrs ending in `/p2p/<peer-id>`
    pub bootstrap_nodes: Vec<String>,

    /// Hex-encoded 32-byte ed25519 secret for a stable peer id
    pub identity_seed: Option<String>,

    pub data_shards: usize,
    pub parity_shards: usize,

    /// Encode shared files into shards
    pub redundancy: bool,

    /// Bound on a single provider attempt
    pub provider_timeout_secs: u64,

    pub max_providers: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("./data"),
            upload_dir: PathBuf::from("./uploads"),
            temp_dir: PathBuf::from("./temp"),
            listen_port: 4001,
            api_port: 8080,
            bootstrap_nodes: vec![],
            identity_seed: None,
            data_shards: 4,
            parity_shards: 2,
            redundancy: true,
            provider_timeout_secs: 30,
            max_providers: 10,
        }
    }
}

impl NodeConfig {
    /// Read a TOML config file; missing keys take their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| ObscureError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.erasure_config().validate()?;

        if self.provider_timeout_secs == 0 {
            return Err(ObscureError::Config("provider_timeout_secs must be at least 1".into()));
        }
        if self.max_providers == 0 {
            return Err(ObscureError::Config("max_providers must be at least 1".into()));
        }
        self.identity_seed_bytes()?;
        Ok(())
    }

    pub fn erasure_config(&self) -> storage::ErasureConfig {
        storage::ErasureConfig::new(self.data_shards, self.parity_shards)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    pub fn retrieval_options(&self) -> RetrievalOptions {
        RetrievalOptions {
            provider_timeout: self.provider_timeout(),
            max_providers: self.max_providers,
            redundancy: self.redundancy,
        }
    }

    pub fn identity_seed_bytes(&self) -> Result<Option<[u8; 32]>> {
        let Some(seed) = &self.identity_seed else {
            return Ok(None);
        };

        let bytes = hex::decode(seed.trim())
            .map_err(|e| ObscureError::Config(format!("identity_seed is not hex: {}", e)))?;
        let seed: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
            ObscureError::Config(format!("identity_seed must be 32 bytes, got {}", b.len()))
        })?;
        Ok(Some(seed))
    }

    /// Transport settings derived from this config
    pub fn p2p_config(&self) -> Result<p2p::P2PNodeConfig> {
        let bootstrap_nodes = self
            .bootstrap_nodes
            .iter()
            .map(|addr| {
                addr.parse::<p2p::Multiaddr>()
                    .map_err(|e| ObscureError::Config(format!("bad bootstrap address {}: {}", addr, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(p2p::P2PNodeConfig {
            bootstrap_nodes,
            identity_seed: self.identity_seed_bytes()?,
            query_timeout: self.provider_timeout(),
            ..p2p::P2PNodeConfig::with_port(self.listen_port)
        })
    }
}
