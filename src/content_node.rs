//! Content node - ties the local store, the shard codec and discovery together.
//!
//! Sharing hashes a file, registers it, optionally encodes it into shards and
//! announces it. Retrieval tries this node first and only then walks the
//! provider list, one peer at a time, until some peer hands over bytes that
//! hash to the requested CID.

use crate::crypto::{hash_file, ContentId, IncrementalHasher};
use crate::p2p::{protocol, Discovery, P2PError, PeerId, Provider, PROTOCOL};
use crate::storage::{ErasureCodec, FileStore, ShardMetadata, StorageError};
use crate::{ObscureError, Result};

use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

const COPY_CHUNK: usize = 64 * 1024;

/// Knobs for the network half of retrieval
#[derive(Debug, Clone, Copy)]
pub struct RetrievalOptions {
    /// Bound on one provider attempt (stream open + full response)
    pub provider_timeout: Duration,

    /// How many providers to ask discovery for
    pub max_providers: usize,

    /// Encode shared files into shards
    pub redundancy: bool,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            provider_timeout: Duration::from_secs(30),
            max_providers: 10,
            redundancy: true,
        }
    }
}

/// Outcome of a successful share
#[derive(Debug, Clone, Serialize)]
pub struct ShareReceipt {
    pub cid: ContentId,
    pub location: PathBuf,
    pub shards: Option<ShardMetadata>,
}

/// Where retrieved bytes came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetrievalSource {
    LocalStore,
    LocalShards,
    Peer(PeerId),
}

/// One peer's answer to `list_files`
#[derive(Debug, Clone, Serialize)]
pub struct PeerListing {
    pub peer_id: String,
    pub files: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkListing {
    pub local_files: BTreeMap<String, String>,
    pub network_files: Vec<PeerListing>,
}

#[derive(Debug, Clone, Copy)]
enum RetrievalState {
    LocalLookup,
    LocalShards,
    DiscoverProviders,
    TryNextProvider,
    PersistAndDone,
    Failed,
}

/// What one provider attempt produced
enum Attempt {
    Delivered(Vec<u8>),
    Miss,
    Corrupt,
}

pub struct ContentNode {
    store: Arc<FileStore>,
    codec: Arc<ErasureCodec>,
    discovery: Arc<dyn Discovery>,
    options: RetrievalOptions,
}

impl ContentNode {
    pub fn new(
        store: Arc<FileStore>,
        codec: Arc<ErasureCodec>,
        discovery: Arc<dyn Discovery>,
        options: RetrievalOptions,
    ) -> Self {
        Self {
            store,
            codec,
            discovery,
            options,
        }
    }

    pub fn store(&self) -> &Arc<FileStore> {
        &self.store
    }

    pub fn codec(&self) -> &Arc<ErasureCodec> {
        &self.codec
    }

    pub fn discovery(&self) -> &Arc<dyn Discovery> {
        &self.discovery
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.discovery.local_peer_id()
    }

    /// Hash → register → encode (if enabled) → announce.
    ///
    /// Each step aborts the share on failure; earlier steps are not undone.
    pub async fn share_file(&self, path: impl AsRef<Path>) -> Result<ShareReceipt> {
        let location = path.as_ref().to_path_buf();

        let cid = {
            let location = location.clone();
            tokio::task::spawn_blocking(move || hash_file(location))
                .await
                .map_err(|e| ObscureError::Task(e.to_string()))??
        };

        self.store.store(cid.clone(), &location);

        let shards = if self.options.redundancy {
            Some(self.encode_shards(cid.clone(), location.clone()).await?)
        } else {
            None
        };

        self.discovery.announce(&cid).await?;

        tracing::info!(cid = %cid, path = %location.display(), "Shared file");

        Ok(ShareReceipt {
            cid,
            location,
            shards,
        })
    }

    async fn encode_shards(&self, cid: ContentId, location: PathBuf) -> Result<ShardMetadata> {
        let codec = Arc::clone(&self.codec);

        let metadata = tokio::task::spawn_blocking(move || -> std::result::Result<ShardMetadata, StorageError> {
            let data = std::fs::read(&location)?;
            let name = location
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| cid.to_string());

            let mut metadata = ShardMetadata::new(name, cid);
            codec.encode(&mut metadata, &data)?;
            codec.save_metadata(&metadata)?;
            Ok(metadata)
        })
        .await
        .map_err(|e| ObscureError::Task(e.to_string()))??;

        Ok(metadata)
    }

    /// Fetch `cid` into `output`, preferring anything this node already has
    pub async fn retrieve_file(
        &self,
        cid: &ContentId,
        output: impl AsRef<Path>,
    ) -> Result<RetrievalSource> {
        let output = output.as_ref();

        log_state(cid, RetrievalState::LocalLookup);
        if let Ok(location) = self.store.get(cid) {
            match copy_local(&location, output, cid).await {
                Ok(true) => return Ok(RetrievalSource::LocalStore),
                Ok(false) => tracing::warn!(
                    cid = %cid,
                    location = %location.display(),
                    "Registered file no longer matches its CID, falling back"
                ),
                Err(e) => tracing::warn!(
                    cid = %cid,
                    location = %location.display(),
                    error = %e,
                    "Registered file unreadable, falling back"
                ),
            }
        }

        if self.codec.has_shards(cid) {
            log_state(cid, RetrievalState::LocalShards);
            match self.recover_local(cid).await {
                Ok(data) => {
                    write_output(output, data).await?;
                    return Ok(RetrievalSource::LocalShards);
                }
                Err(e) => tracing::warn!(cid = %cid, error = %e, "Local shard recovery failed"),
            }
        }

        log_state(cid, RetrievalState::DiscoverProviders);
        let local = self.local_peer_id();
        let providers: Vec<Provider> = self
            .discovery
            .find_providers(cid, self.options.max_providers)
            .await?
            .into_iter()
            .filter(|p| p.peer_id != local)
            .collect();

        if providers.is_empty() {
            log_state(cid, RetrievalState::Failed);
            return Err(P2PError::NoProviders(cid.to_string()).into());
        }

        let tried = providers.len();
        for provider in providers {
            log_state(cid, RetrievalState::TryNextProvider);
            let peer = provider.peer_id;

            match self.try_provider(&peer, cid).await {
                Ok(Attempt::Delivered(data)) => {
                    log_state(cid, RetrievalState::PersistAndDone);
                    let bytes = data.len();
                    write_output(output, data).await?;
                    tracing::info!(cid = %cid, peer = %peer, bytes, "Retrieved file from peer");
                    return Ok(RetrievalSource::Peer(peer));
                }
                Ok(Attempt::Miss) => {
                    tracing::debug!(cid = %cid, peer = %peer, "Peer does not have file")
                }
                Ok(Attempt::Corrupt) => {
                    tracing::warn!(cid = %cid, peer = %peer, "Peer sent bytes that do not match CID")
                }
                Err(e) => tracing::warn!(cid = %cid, peer = %peer, error = %e, "Provider attempt failed"),
            }
        }

        log_state(cid, RetrievalState::Failed);
        Err(P2PError::ProvidersExhausted {
            cid: cid.to_string(),
            tried,
        }
        .into())
    }

    async fn try_provider(&self, peer: &PeerId, cid: &ContentId) -> std::result::Result<Attempt, P2PError> {
        let attempt = async {
            let stream = self.discovery.open_stream(peer, &PROTOCOL).await?;
            protocol::fetch(stream, cid).await
        };

        let fetched = tokio::time::timeout(self.options.provider_timeout, attempt)
            .await
            .map_err(|_| P2PError::Timeout)??;

        Ok(match fetched {
            Some(data) if cid.verify(&data) => Attempt::Delivered(data),
            Some(_) => Attempt::Corrupt,
            None => Attempt::Miss,
        })
    }

    /// Rebuild a file from the shards persisted under this node's storage root
    pub async fn recover_local(&self, cid: &ContentId) -> Result<Vec<u8>> {
        let codec = Arc::clone(&self.codec);
        let checksum = cid.clone();

        let data = tokio::task::spawn_blocking(move || -> std::result::Result<Vec<u8>, StorageError> {
            let metadata = codec.load_metadata(&checksum)?;
            codec.reconstruct(&metadata)
        })
        .await
        .map_err(|e| ObscureError::Task(e.to_string()))??;

        if !cid.verify(&data) {
            return Err(StorageError::Reconstruction(format!(
                "reconstructed bytes do not hash to {}",
                cid
            ))
            .into());
        }
        Ok(data)
    }

    /// Local registrations plus whatever every reachable peer reports.
    ///
    /// A peer that fails to answer is left out of the result.
    pub async fn list_network_files(&self) -> NetworkListing {
        let local_files = self.store.listing();
        let local = self.local_peer_id();

        let peers: Vec<PeerId> = self
            .discovery
            .known_peers()
            .await
            .into_iter()
            .filter(|peer| *peer != local)
            .collect();

        let requests = peers.into_iter().map(|peer| async move {
            let attempt = async {
                let stream = self.discovery.open_stream(&peer, &PROTOCOL).await?;
                protocol::list_files(stream).await
            };

            match tokio::time::timeout(self.options.provider_timeout, attempt).await {
                Ok(Ok(files)) => Some(PeerListing {
                    peer_id: peer.to_string(),
                    files,
                }),
                Ok(Err(e)) => {
                    tracing::warn!(peer = %peer, error = %e, "Failed to list peer files");
                    None
                }
                Err(_) => {
                    tracing::warn!(peer = %peer, "Timed out listing peer files");
                    None
                }
            }
        });

        let network_files = join_all(requests).await.into_iter().flatten().collect();

        NetworkListing {
            local_files,
            network_files,
        }
    }

    /// Dial an explicit peer address
    pub async fn connect(&self, address: &str) -> Result<PeerId> {
        let address = address
            .parse()
            .map_err(|e| P2PError::InvalidAddress(format!("{}: {}", address, e)))?;

        let peer = self.discovery.connect(&address).await?;
        tracing::info!(peer = %peer, "Connected to peer");
        Ok(peer)
    }

    /// Dial every bootstrap address except our own, returning how many connected
    pub async fn connect_bootstrap(&self, addresses: &[String]) -> usize {
        let local = self.local_peer_id().to_string();
        let mut connected = 0;

        for address in addresses {
            if address.ends_with(&local) {
                tracing::debug!(address = %address, "Skipping own bootstrap address");
                continue;
            }

            match self.connect(address).await {
                Ok(_) => connected += 1,
                Err(e) => tracing::warn!(address = %address, error = %e, "Failed to connect to bootstrap node"),
            }
        }

        connected
    }
}

fn log_state(cid: &ContentId, state: RetrievalState) {
    tracing::debug!(cid = %cid, ?state, "Retrieval state");
}

/// Copy a registered file to `output`. `Ok(false)` means its bytes no longer
/// hash to `cid` and nothing was written.
async fn copy_local(location: &Path, output: &Path, cid: &ContentId) -> Result<bool> {
    let location = location.to_path_buf();
    let output = output.to_path_buf();
    let cid = cid.clone();

    let copied = tokio::task::spawn_blocking(move || copy_verified(&location, &output, &cid))
        .await
        .map_err(|e| ObscureError::Task(e.to_string()))??;
    Ok(copied)
}

async fn write_output(output: &Path, data: Vec<u8>) -> Result<()> {
    let output = output.to_path_buf();

    tokio::task::spawn_blocking(move || persist_bytes(&output, &data))
        .await
        .map_err(|e| ObscureError::Task(e.to_string()))??;
    Ok(())
}

/// Hidden staging file next to `output`, removed unless persisted
fn staging_file(output: &Path) -> std::io::Result<NamedTempFile> {
    let parent = match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;

    tempfile::Builder::new()
        .prefix(".obscurefs-")
        .suffix(".partial")
        .tempfile_in(parent)
}

fn persist_bytes(output: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut staged = staging_file(output)?;
    staged.write_all(data)?;
    staged.persist(output).map_err(|e| e.error)?;
    Ok(())
}

fn copy_verified(location: &Path, output: &Path, cid: &ContentId) -> std::io::Result<bool> {
    if location == output {
        return Ok(hash_file(location)? == *cid);
    }

    let mut source = std::fs::File::open(location)?;
    let mut staged = staging_file(output)?;
    let mut hasher = IncrementalHasher::new();
    let mut buffer = vec![0u8; COPY_CHUNK];

    loop {
        let n = match source.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..n]);
        staged.write_all(&buffer[..n])?;
    }

    if hasher.finalize() != *cid {
        return Ok(false);
    }

    staged.persist(output).map_err(|e| e.error)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::{MemoryDiscovery, MemoryNetwork, Multiaddr, PeerMode, PeerStream};
    use crate::storage::ErasureConfig;
    use async_trait::async_trait;
    use libp2p::StreamProtocol;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Counts every call that would touch the network
    struct CountingDiscovery {
        inner: MemoryDiscovery,
        lookups: AtomicUsize,
        streams: AtomicUsize,
    }

    impl CountingDiscovery {
        fn new(inner: MemoryDiscovery) -> Self {
            Self {
                inner,
                lookups: AtomicUsize::new(0),
                streams: AtomicUsize::new(0),
            }
        }

        fn network_calls(&self) -> (usize, usize) {
            (self.lookups.load(Ordering::SeqCst), self.streams.load(Ordering::SeqCst))
        }
    }

    #[async_trait]
    impl Discovery for CountingDiscovery {
        fn local_peer_id(&self) -> PeerId {
            self.inner.local_peer_id()
        }

        async fn announce(&self, cid: &ContentId) -> std::result::Result<(), P2PError> {
            self.inner.announce(cid).await
        }

        async fn find_providers(
            &self,
            cid: &ContentId,
            max_results: usize,
        ) -> std::result::Result<Vec<Provider>, P2PError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.find_providers(cid, max_results).await
        }

        async fn connect(&self, address: &Multiaddr) -> std::result::Result<PeerId, P2PError> {
            self.inner.connect(address).await
        }

        async fn open_stream(
            &self,
            peer: &PeerId,
            protocol: &StreamProtocol,
        ) -> std::result::Result<PeerStream, P2PError> {
            self.streams.fetch_add(1, Ordering::SeqCst);
            self.inner.open_stream(peer, protocol).await
        }

        async fn known_peers(&self) -> Vec<PeerId> {
            self.inner.known_peers().await
        }
    }

    struct TestNode {
        node: ContentNode,
        dir: TempDir,
    }

    fn test_node(network: &MemoryNetwork, options: RetrievalOptions) -> TestNode {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileStore::new());
        let codec = Arc::new(ErasureCodec::new(dir.path().join("shards"), ErasureConfig::new(4, 2)).unwrap());
        let discovery = Arc::new(network.join(Arc::clone(&store)));

        TestNode {
            node: ContentNode::new(store, codec, discovery, options),
            dir,
        }
    }

    fn write_file(dir: &TempDir, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    #[tokio::test]
    async fn test_share_registers_encodes_and_announces() {
        let network = MemoryNetwork::new();
        let a = test_node(&network, RetrievalOptions::default());
        let b = test_node(&network, RetrievalOptions::default());

        let path = write_file(&a.dir, "hello.txt", b"hello network");
        let receipt = a.node.share_file(&path).await.unwrap();

        assert_eq!(receipt.cid, ContentId::of(b"hello network"));
        assert_eq!(a.node.store().get(&receipt.cid).unwrap(), path);

        let shards = receipt.shards.unwrap();
        assert_eq!(shards.shard_count, 4);
        assert_eq!(shards.parity_count, 2);
        assert!(a.node.codec().has_shards(&receipt.cid));

        let providers = b.node.discovery().find_providers(&receipt.cid, 10).await.unwrap();
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].peer_id, a.node.local_peer_id());
    }

    #[tokio::test]
    async fn test_share_without_redundancy_skips_shards() {
        let network = MemoryNetwork::new();
        let options = RetrievalOptions {
            redundancy: false,
            ..Default::default()
        };
        let a = test_node(&network, options);

        let path = write_file(&a.dir, "plain.txt", b"no shards please");
        let receipt = a.node.share_file(&path).await.unwrap();

        assert!(receipt.shards.is_none());
        assert!(!a.node.codec().has_shards(&receipt.cid));
    }

    #[tokio::test]
    async fn test_share_missing_file_fails() {
        let network = MemoryNetwork::new();
        let a = test_node(&network, RetrievalOptions::default());

        let result = a.node.share_file(a.dir.path().join("missing.bin")).await;
        assert!(matches!(result, Err(ObscureError::Io(_))));
        assert!(a.node.store().is_empty());
    }

    #[tokio::test]
    async fn test_local_retrieval_never_touches_discovery() {
        let network = MemoryNetwork::new();
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileStore::new());
        let codec = Arc::new(ErasureCodec::new(dir.path().join("shards"), ErasureConfig::new(4, 2)).unwrap());
        let discovery = Arc::new(CountingDiscovery::new(network.join(Arc::clone(&store))));
        let node = ContentNode::new(store, codec, discovery.clone(), RetrievalOptions::default());

        let path = write_file(&dir, "local.txt", b"already here");
        let cid = node.share_file(&path).await.unwrap().cid;

        let output = dir.path().join("out/local.txt");
        let source = node.retrieve_file(&cid, &output).await.unwrap();
        assert_eq!(source, RetrievalSource::LocalStore);
        assert_eq!(std::fs::read(&output).unwrap(), b"already here");
        assert_eq!(discovery.network_calls(), (0, 0));

        // Shards are still local too
        std::fs::remove_file(&path).unwrap();
        let output = dir.path().join("out/from-shards.txt");
        let source = node.retrieve_file(&cid, &output).await.unwrap();
        assert_eq!(source, RetrievalSource::LocalShards);
        assert_eq!(std::fs::read(&output).unwrap(), b"already here");
        assert_eq!(discovery.network_calls(), (0, 0));
    }

    #[tokio::test]
    async fn test_replaced_local_file_is_not_served() {
        let network = MemoryNetwork::new();
        let a = test_node(&network, RetrievalOptions::default());

        let path = write_file(&a.dir, "report.txt", b"version one");
        let cid = a.node.share_file(&path).await.unwrap().cid;
        std::fs::write(&path, b"version two!!").unwrap();

        let output = a.dir.path().join("out/report.txt");
        let source = a.node.retrieve_file(&cid, &output).await.unwrap();

        assert_eq!(source, RetrievalSource::LocalShards);
        assert_eq!(std::fs::read(&output).unwrap(), b"version one");
    }

    #[tokio::test]
    async fn test_replaced_local_file_without_shards_is_not_found() {
        let network = MemoryNetwork::new();
        let options = RetrievalOptions {
            redundancy: false,
            ..Default::default()
        };
        let a = test_node(&network, options);

        let path = write_file(&a.dir, "report.txt", b"version one");
        let cid = a.node.share_file(&path).await.unwrap().cid;
        std::fs::write(&path, b"version two!!").unwrap();

        let output = a.dir.path().join("out/report.txt");
        let err = a.node.retrieve_file(&cid, &output).await.unwrap_err();

        assert!(err.is_not_found());
        assert!(!output.exists());
        assert_eq!(std::fs::read_dir(a.dir.path().join("out")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_retrieve_recovers_from_local_shards() {
        let network = MemoryNetwork::new();
        let a = test_node(&network, RetrievalOptions::default());

        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let path = write_file(&a.dir, "sharded.bin", &data);
        let receipt = a.node.share_file(&path).await.unwrap();

        // Original gone, two shards gone: still within parity
        std::fs::remove_file(&path).unwrap();
        let shards = receipt.shards.unwrap();
        std::fs::remove_file(&shards.shard_locations[0]).unwrap();
        std::fs::remove_file(&shards.shard_locations[5]).unwrap();

        let output = a.dir.path().join("recovered.bin");
        let source = a.node.retrieve_file(&receipt.cid, &output).await.unwrap();

        assert_eq!(source, RetrievalSource::LocalShards);
        assert_eq!(std::fs::read(&output).unwrap(), data);
    }

    #[tokio::test]
    async fn test_retrieve_from_peer() {
        let network = MemoryNetwork::new();
        let a = test_node(&network, RetrievalOptions::default());
        let b = test_node(&network, RetrievalOptions::default());

        let path = write_file(&a.dir, "remote.txt", b"fetch me over the wire");
        let cid = a.node.share_file(&path).await.unwrap().cid;

        let output = b.dir.path().join("fetched.txt");
        let source = b.node.retrieve_file(&cid, &output).await.unwrap();

        assert_eq!(source, RetrievalSource::Peer(a.node.local_peer_id()));
        assert_eq!(std::fs::read(&output).unwrap(), b"fetch me over the wire");
        // Retrieval does not cache into the local store
        assert!(!b.node.store().contains(&cid));

        let written: Vec<_> = std::fs::read_dir(b.dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .filter(|name| name.to_string_lossy().ends_with(".partial"))
            .collect();
        assert!(written.is_empty());
    }

    #[tokio::test]
    async fn test_retrieve_without_providers() {
        let network = MemoryNetwork::new();
        let a = test_node(&network, RetrievalOptions::default());

        let cid = ContentId::of(b"nobody shared this");
        let result = a.node.retrieve_file(&cid, a.dir.path().join("x")).await;

        assert!(matches!(result, Err(ObscureError::P2P(P2PError::NoProviders(_)))));
        assert!(result.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_miss_moves_to_next_provider() {
        let network = MemoryNetwork::new();
        let liar = test_node(&network, RetrievalOptions::default());
        let holder = test_node(&network, RetrievalOptions::default());
        let client = test_node(&network, RetrievalOptions::default());

        let data = b"only one of you has this";
        let cid = ContentId::of(data);

        // Claims the CID but has nothing registered
        network.add_provider(cid.clone(), liar.node.local_peer_id());
        let path = write_file(&holder.dir, "real.txt", data);
        holder.node.share_file(&path).await.unwrap();

        let output = client.dir.path().join("got.txt");
        let source = client.node.retrieve_file(&cid, &output).await.unwrap();

        assert_eq!(source, RetrievalSource::Peer(holder.node.local_peer_id()));
        assert_eq!(std::fs::read(&output).unwrap(), data);
    }

    #[tokio::test]
    async fn test_corrupt_provider_is_skipped() {
        let network = MemoryNetwork::new();
        let forger = test_node(&network, RetrievalOptions::default());
        let client = test_node(&network, RetrievalOptions::default());

        let cid = ContentId::of(b"the real bytes");
        let fake = write_file(&forger.dir, "fake.txt", b"something else entirely");
        forger.node.store().store(cid.clone(), fake);
        network.add_provider(cid.clone(), forger.node.local_peer_id());

        let result = client.node.retrieve_file(&cid, client.dir.path().join("x")).await;
        assert!(matches!(
            result,
            Err(ObscureError::P2P(P2PError::ProvidersExhausted { tried: 1, .. }))
        ));
        assert!(!client.dir.path().join("x").exists());
    }

    #[tokio::test]
    async fn test_stalled_provider_times_out() {
        let network = MemoryNetwork::new();
        let options = RetrievalOptions {
            provider_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let staller = test_node(&network, options);
        let holder = test_node(&network, options);
        let client = test_node(&network, options);

        let data = b"patience";
        let cid = ContentId::of(data);
        network.add_provider(cid.clone(), staller.node.local_peer_id());
        network.set_mode(&staller.node.local_peer_id(), PeerMode::Stall);

        let path = write_file(&holder.dir, "p.txt", data);
        holder.node.share_file(&path).await.unwrap();

        let output = client.dir.path().join("p.txt");
        let source = client.node.retrieve_file(&cid, &output).await.unwrap();
        assert_eq!(source, RetrievalSource::Peer(holder.node.local_peer_id()));
    }

    #[tokio::test]
    async fn test_list_network_files_omits_failing_peers() {
        let network = MemoryNetwork::new();
        let options = RetrievalOptions {
            provider_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let a = test_node(&network, options);
        let b = test_node(&network, options);
        let c = test_node(&network, options);

        let path = write_file(&b.dir, "b.txt", b"from b");
        let cid = b.node.share_file(&path).await.unwrap().cid;
        network.set_mode(&c.node.local_peer_id(), PeerMode::Stall);

        let listing = a.node.list_network_files().await;

        assert!(listing.local_files.is_empty());
        assert_eq!(listing.network_files.len(), 1);
        assert_eq!(listing.network_files[0].peer_id, b.node.local_peer_id().to_string());
        assert!(listing.network_files[0].files.contains_key(cid.as_str()));
    }

    #[tokio::test]
    async fn test_connect_bootstrap_skips_self() {
        let network = MemoryNetwork::new();
        let a = test_node(&network, RetrievalOptions::default());
        let b = test_node(&network, RetrievalOptions::default());

        let own = network.address_of(&a.node.local_peer_id()).unwrap().to_string();
        let peer = network.address_of(&b.node.local_peer_id()).unwrap().to_string();

        let connected = a
            .node
            .connect_bootstrap(&[own, peer, "not an address".to_string()])
            .await;
        assert_eq!(connected, 1);
    }

    #[tokio::test]
    async fn test_connect_explicit_address() {
        let network = MemoryNetwork::new();
        let a = test_node(&network, RetrievalOptions::default());
        let b = test_node(&network, RetrievalOptions::default());

        let address = network.address_of(&b.node.local_peer_id()).unwrap().to_string();
        assert_eq!(a.node.connect(&address).await.unwrap(), b.node.local_peer_id());

        assert!(matches!(
            a.node.connect("not an address").await,
            Err(ObscureError::P2P(P2PError::InvalidAddress(_)))
        ));
    }
}
