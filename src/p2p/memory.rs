//! In-process overlay for tests and single-host setups.
//!
//! Every peer that joins a [`MemoryNetwork`] can reach every other peer.
//! Provider records live in a shared table, and streams are in-memory duplex
//! pipes whose far end is served by the same code a libp2p node runs.

use super::discovery::{Discovery, PeerStream, Provider};
use super::protocol::{serve_stream, PROTOCOL};
use super::{extract_peer_id, P2PError};
use crate::crypto::ContentId;
use crate::storage::FileStore;

use async_trait::async_trait;
use libp2p::{identity::Keypair, multiaddr::Protocol, Multiaddr, PeerId, StreamProtocol};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::oneshot;

const PIPE_CAPACITY: usize = 64 * 1024;

/// How a member answers inbound streams
#[derive(Debug, Clone)]
pub enum PeerMode {
    /// Answer requests from this store
    Serve(Arc<FileStore>),
    /// Refuse every dial
    Unreachable,
    /// Accept streams and never answer
    Stall,
}

#[derive(Debug)]
struct Member {
    port: u64,
    mode: PeerMode,
}

#[derive(Debug, Default)]
struct Hub {
    members: HashMap<PeerId, Member>,
    providers: HashMap<ContentId, Vec<PeerId>>,
    /// Streams to stalled peers whose near end is still open
    stalled: usize,
    next_port: u64,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fresh peer that serves from `store`
    pub fn join(&self, store: Arc<FileStore>) -> MemoryDiscovery {
        let peer_id = Keypair::generate_ed25519().public().to_peer_id();

        let mut hub = self.hub.lock();
        hub.next_port += 1;
        let port = hub.next_port;
        hub.members.insert(
            peer_id,
            Member {
                port,
                mode: PeerMode::Serve(store),
            },
        );
        drop(hub);

        tracing::debug!(peer = %peer_id, port, "Peer joined memory network");

        MemoryDiscovery {
            network: self.clone(),
            peer_id,
        }
    }

    pub fn set_mode(&self, peer: &PeerId, mode: PeerMode) {
        if let Some(member) = self.hub.lock().members.get_mut(peer) {
            member.mode = mode;
        }
    }

    /// `/memory/<port>/p2p/<peer>` for a member
    pub fn address_of(&self, peer: &PeerId) -> Option<Multiaddr> {
        let hub = self.hub.lock();
        hub.members.get(peer).map(|member| {
            Multiaddr::empty()
                .with(Protocol::Memory(member.port))
                .with(Protocol::P2p(*peer))
        })
    }

    /// Record a provider without going through the peer's own announce
    pub fn add_provider(&self, cid: ContentId, peer: PeerId) {
        let mut hub = self.hub.lock();
        let providers = hub.providers.entry(cid).or_default();
        if !providers.contains(&peer) {
            providers.push(peer);
        }
    }

    pub fn peer_count(&self) -> usize {
        self.hub.lock().members.len()
    }

    pub fn stalled_streams(&self) -> usize {
        self.hub.lock().stalled
    }
}

/// Near end of a stream to a stalled peer. Dropping it releases the far end.
struct StalledStream {
    inner: DuplexStream,
    _release: oneshot::Sender<()>,
}

impl AsyncRead for StalledStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for StalledStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// One member's view of a [`MemoryNetwork`]
#[derive(Debug, Clone)]
pub struct MemoryDiscovery {
    network: MemoryNetwork,
    peer_id: PeerId,
}

impl MemoryDiscovery {
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    pub fn address(&self) -> Option<Multiaddr> {
        self.network.address_of(&self.peer_id)
    }
}

#[async_trait]
impl Discovery for MemoryDiscovery {
    fn local_peer_id(&self) -> PeerId {
        self.peer_id
    }

    async fn announce(&self, cid: &ContentId) -> Result<(), P2PError> {
        self.network.add_provider(cid.clone(), self.peer_id);
        tracing::debug!(cid = %cid, peer = %self.peer_id, "Announced provider");
        Ok(())
    }

    async fn find_providers(
        &self,
        cid: &ContentId,
        max_results: usize,
    ) -> Result<Vec<Provider>, P2PError> {
        let hub = self.network.hub.lock();
        let providers = hub
            .providers
            .get(cid)
            .map(|peers| {
                peers
                    .iter()
                    .take(max_results)
                    .map(|peer_id| Provider {
                        peer_id: *peer_id,
                        addresses: hub
                            .members
                            .get(peer_id)
                            .map(|m| {
                                vec![Multiaddr::empty()
                                    .with(Protocol::Memory(m.port))
                                    .with(Protocol::P2p(*peer_id))]
                            })
                            .unwrap_or_default(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(providers)
    }

    async fn connect(&self, address: &Multiaddr) -> Result<PeerId, P2PError> {
        let peer_id = extract_peer_id(address)
            .ok_or_else(|| P2PError::InvalidAddress(format!("{} has no /p2p component", address)))?;

        match self.network.hub.lock().members.get(&peer_id) {
            Some(Member {
                mode: PeerMode::Unreachable,
                ..
            }) => Err(P2PError::ConnectionFailed(format!("{} is unreachable", peer_id))),
            Some(_) => Ok(peer_id),
            None => Err(P2PError::PeerNotFound(peer_id.to_string())),
        }
    }

    async fn open_stream(
        &self,
        peer: &PeerId,
        protocol: &StreamProtocol,
    ) -> Result<PeerStream, P2PError> {
        if *protocol != PROTOCOL {
            return Err(P2PError::Protocol(format!(
                "{} does not support {}",
                peer, protocol
            )));
        }

        let mut hub = self.network.hub.lock();
        let mode = hub
            .members
            .get(peer)
            .map(|m| m.mode.clone())
            .ok_or_else(|| P2PError::PeerNotFound(peer.to_string()))?;

        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        match mode {
            PeerMode::Serve(store) => {
                drop(hub);
                let peer = *peer;
                tokio::spawn(async move {
                    if let Err(e) = serve_stream(remote, &store).await {
                        tracing::debug!(peer = %peer, error = %e, "Memory stream ended with error");
                    }
                });
            }
            PeerMode::Unreachable => {
                return Err(P2PError::ConnectionFailed(format!("{} is unreachable", peer)));
            }
            PeerMode::Stall => {
                hub.stalled += 1;
                drop(hub);

                let (release, released) = oneshot::channel::<()>();
                let network = self.network.clone();
                tokio::spawn(async move {
                    // Resolves once the near end is dropped
                    let _ = released.await;
                    drop(remote);
                    let mut hub = network.hub.lock();
                    hub.stalled = hub.stalled.saturating_sub(1);
                });

                return Ok(Box::new(StalledStream {
                    inner: local,
                    _release: release,
                }));
            }
        }

        Ok(Box::new(local))
    }

    async fn known_peers(&self) -> Vec<PeerId> {
        let hub = self.network.hub.lock();
        let mut peers: Vec<(u64, PeerId)> = hub
            .members
            .iter()
            .filter(|(id, m)| **id != self.peer_id && !matches!(m.mode, PeerMode::Unreachable))
            .map(|(id, m)| (m.port, *id))
            .collect();
        // Join order
        peers.sort_unstable_by_key(|(port, _)| *port);
        peers.into_iter().map(|(_, id)| id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::protocol;
    use std::time::Duration;

    #[tokio::test]
    async fn test_announce_and_find() {
        let network = MemoryNetwork::new();
        let a = network.join(Arc::new(FileStore::new()));
        let b = network.join(Arc::new(FileStore::new()));
        let cid = ContentId::of(b"announced");

        assert!(b.find_providers(&cid, 10).await.unwrap().is_empty());

        a.announce(&cid).await.unwrap();
        a.announce(&cid).await.unwrap();

        let providers = b.find_providers(&cid, 10).await.unwrap();
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].peer_id, a.local_peer_id());
        assert_eq!(providers[0].addresses, vec![a.address().unwrap()]);
    }

    #[tokio::test]
    async fn test_find_respects_max_results() {
        let network = MemoryNetwork::new();
        let cid = ContentId::of(b"popular");
        let peers: Vec<_> = (0..5)
            .map(|_| network.join(Arc::new(FileStore::new())))
            .collect();
        for peer in &peers {
            peer.announce(&cid).await.unwrap();
        }

        assert_eq!(peers[0].find_providers(&cid, 3).await.unwrap().len(), 3);
        assert_eq!(peers[0].find_providers(&cid, 10).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_connect() {
        let network = MemoryNetwork::new();
        let a = network.join(Arc::new(FileStore::new()));
        let b = network.join(Arc::new(FileStore::new()));

        let addr = b.address().unwrap();
        assert_eq!(a.connect(&addr).await.unwrap(), b.local_peer_id());

        let bare: Multiaddr = "/memory/99".parse().unwrap();
        assert!(matches!(a.connect(&bare).await, Err(P2PError::InvalidAddress(_))));

        network.set_mode(&b.local_peer_id(), PeerMode::Unreachable);
        assert!(matches!(a.connect(&addr).await, Err(P2PError::ConnectionFailed(_))));
        assert!(a.known_peers().await.is_empty());
    }

    #[tokio::test]
    async fn test_stream_reaches_peer_store() {
        let network = MemoryNetwork::new();
        let remote_store = Arc::new(FileStore::new());
        let a = network.join(Arc::new(FileStore::new()));
        let b = network.join(Arc::clone(&remote_store));

        remote_store.store(ContentId::of(b"x"), "/remote/x");

        let stream = a.open_stream(&b.local_peer_id(), &PROTOCOL).await.unwrap();
        let listing = protocol::list_files(stream).await.unwrap();
        assert_eq!(listing.len(), 1);

        let other = StreamProtocol::new("/something-else/1.0.0");
        assert!(matches!(
            a.open_stream(&b.local_peer_id(), &other).await,
            Err(P2PError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_stalled_peer_never_answers() {
        let network = MemoryNetwork::new();
        let a = network.join(Arc::new(FileStore::new()));
        let b = network.join(Arc::new(FileStore::new()));
        network.set_mode(&b.local_peer_id(), PeerMode::Stall);

        let stream = a.open_stream(&b.local_peer_id(), &PROTOCOL).await.unwrap();
        let result = tokio::time::timeout(
            Duration::from_millis(100),
            protocol::fetch(stream, &ContentId::of(b"x")),
        )
        .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_dropping_stalled_stream_releases_far_end() {
        let network = MemoryNetwork::new();
        let a = network.join(Arc::new(FileStore::new()));
        let b = network.join(Arc::new(FileStore::new()));
        network.set_mode(&b.local_peer_id(), PeerMode::Stall);

        let first = a.open_stream(&b.local_peer_id(), &PROTOCOL).await.unwrap();
        let second = a.open_stream(&b.local_peer_id(), &PROTOCOL).await.unwrap();
        assert_eq!(network.stalled_streams(), 2);

        drop(first);
        drop(second);

        tokio::time::timeout(Duration::from_secs(5), async {
            while network.stalled_streams() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}
