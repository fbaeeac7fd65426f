//! P2P Node implementation using libp2p
//!
//! The swarm is owned by an [`EventLoop`] task. Everything else talks to it
//! through a [`NetworkClient`], which sends commands over a channel and
//! waits on a oneshot reply. Retrieval streams bypass the loop entirely and
//! go through a `libp2p_stream::Control`.

use super::discovery::{extract_peer_id, Discovery, PeerStream, Provider};
use super::protocol::{serve_stream, PROTOCOL};
use super::P2PError;
use crate::crypto::ContentId;
use crate::storage::FileStore;

use async_trait::async_trait;
use libp2p::{
    identify,
    identity::Keypair,
    kad::{self, store::MemoryStore, Mode, QueryId, RecordKey},
    multiaddr::Protocol,
    noise,
    swarm::{NetworkBehaviour, SwarmEvent},
    tcp, yamux, Multiaddr, PeerId, StreamProtocol, Swarm, SwarmBuilder,
};

use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::compat::FuturesAsyncReadCompatExt;

const IDENTIFY_VERSION: &str = "/obscure-fs/id/1.0.0";
const KAD_PROTOCOL: StreamProtocol = StreamProtocol::new("/obscure-fs/kad/1.0.0");

const COMMAND_BUFFER: usize = 64;

/// Configuration for P2P node
#[derive(Debug, Clone)]
pub struct P2PNodeConfig {
    /// Listen addresses
    pub listen_addresses: Vec<Multiaddr>,

    /// Seed peers added to the routing table at startup
    pub bootstrap_nodes: Vec<Multiaddr>,

    /// Fixed ed25519 secret for a stable peer id; random when unset
    pub identity_seed: Option<[u8; 32]>,

    /// Upper bound on a single DHT query
    pub query_timeout: Duration,
}

impl P2PNodeConfig {
    /// TCP and QUIC on all interfaces at `port` (0 picks a free port)
    pub fn with_port(port: u16) -> Self {
        Self {
            listen_addresses: vec![
                Multiaddr::empty()
                    .with(Protocol::Ip4(Ipv4Addr::UNSPECIFIED))
                    .with(Protocol::Tcp(port)),
                Multiaddr::empty()
                    .with(Protocol::Ip4(Ipv4Addr::UNSPECIFIED))
                    .with(Protocol::Udp(port))
                    .with(Protocol::QuicV1),
            ],
            bootstrap_nodes: Vec::new(),
            identity_seed: None,
            query_timeout: Duration::from_secs(30),
        }
    }

    fn keypair(&self) -> Result<Keypair, P2PError> {
        match self.identity_seed {
            Some(seed) => Keypair::ed25519_from_bytes(seed)
                .map_err(|e| P2PError::InitializationFailed(e.to_string())),
            None => Ok(Keypair::generate_ed25519()),
        }
    }
}

impl Default for P2PNodeConfig {
    fn default() -> Self {
        Self::with_port(0)
    }
}

/// Combined network behaviour
#[derive(NetworkBehaviour)]
pub struct ObscureBehaviour {
    /// Kademlia DHT for provider records
    pub kademlia: kad::Behaviour<MemoryStore>,

    /// Identify protocol for peer information
    pub identify: identify::Behaviour,

    /// Raw streams for the retrieval protocol
    pub stream: libp2p_stream::Behaviour,
}

enum Command {
    StartProviding {
        key: RecordKey,
        sender: oneshot::Sender<Result<(), P2PError>>,
    },
    GetProviders {
        key: RecordKey,
        limit: usize,
        sender: oneshot::Sender<Vec<Provider>>,
    },
    Dial {
        peer_id: PeerId,
        address: Multiaddr,
        sender: oneshot::Sender<Result<PeerId, P2PError>>,
    },
    ConnectedPeers {
        sender: oneshot::Sender<Vec<PeerId>>,
    },
    ListenAddresses {
        sender: oneshot::Sender<Vec<Multiaddr>>,
    },
}

struct PendingProviders {
    found: Vec<PeerId>,
    limit: usize,
    sender: oneshot::Sender<Vec<Provider>>,
}

/// Main P2P node: a client handle plus the loop that drives the swarm
pub struct P2PNode {
    client: NetworkClient,
    event_loop: EventLoop,
}

impl P2PNode {
    /// Create a new P2P node and start listening
    pub fn new(config: P2PNodeConfig) -> Result<Self, P2PError> {
        let keypair = config.keypair()?;
        let local_peer_id = keypair.public().to_peer_id();

        tracing::info!(peer = %local_peer_id, "Creating P2P node");

        let mut swarm = Self::build_swarm(keypair, &config)?;

        for addr in &config.listen_addresses {
            swarm
                .listen_on(addr.clone())
                .map_err(|e| P2PError::Transport(e.to_string()))?;
        }

        for addr in &config.bootstrap_nodes {
            match extract_peer_id(addr) {
                Some(peer_id) if peer_id != local_peer_id => {
                    swarm.behaviour_mut().kademlia.add_address(&peer_id, addr.clone());
                }
                Some(_) => {}
                None => tracing::warn!(address = %addr, "Bootstrap address has no peer id, ignoring"),
            }
        }

        let control = swarm.behaviour().stream.new_control();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);

        Ok(Self {
            client: NetworkClient {
                local_peer_id,
                sender: command_tx,
                control,
            },
            event_loop: EventLoop {
                swarm,
                command_rx,
                pending_providers: HashMap::new(),
                pending_dial: HashMap::new(),
                peer_addresses: HashMap::new(),
                connected_peers: HashSet::new(),
            },
        })
    }

    /// Build the libp2p swarm with all protocols
    fn build_swarm(
        keypair: Keypair,
        config: &P2PNodeConfig,
    ) -> Result<Swarm<ObscureBehaviour>, P2PError> {
        let peer_id = keypair.public().to_peer_id();
        let query_timeout = config.query_timeout;

        let swarm = SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                tcp::Config::default(),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|e| P2PError::InitializationFailed(e.to_string()))?
            .with_quic()
            .with_behaviour(|keypair| {
                let kademlia = {
                    let store = MemoryStore::new(peer_id);
                    let mut config = kad::Config::new(KAD_PROTOCOL);
                    config.set_query_timeout(query_timeout);
                    let mut behaviour = kad::Behaviour::with_config(peer_id, store, config);
                    behaviour.set_mode(Some(Mode::Server));
                    behaviour
                };

                let identify = identify::Behaviour::new(
                    identify::Config::new(IDENTIFY_VERSION.to_string(), keypair.public())
                        .with_agent_version(format!("obscurefs/{}", env!("CARGO_PKG_VERSION"))),
                );

                ObscureBehaviour {
                    kademlia,
                    identify,
                    stream: libp2p_stream::Behaviour::new(),
                }
            })
            .map_err(|e| P2PError::InitializationFailed(e.to_string()))?
            .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(Duration::from_secs(60)))
            .build();

        Ok(swarm)
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.client.local_peer_id
    }

    pub fn client(&self) -> NetworkClient {
        self.client.clone()
    }

    /// Hand the swarm to a background task
    pub fn spawn(self) -> (NetworkClient, JoinHandle<()>) {
        let handle = tokio::spawn(self.event_loop.run());
        (self.client, handle)
    }

    pub fn into_parts(self) -> (NetworkClient, EventLoop) {
        (self.client, self.event_loop)
    }
}

/// Cloneable handle to a running node
#[derive(Clone)]
pub struct NetworkClient {
    local_peer_id: PeerId,
    sender: mpsc::Sender<Command>,
    control: libp2p_stream::Control,
}

impl NetworkClient {
    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, P2PError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(command(tx))
            .await
            .map_err(|_| P2PError::Transport("network event loop has stopped".into()))?;
        rx.await
            .map_err(|_| P2PError::Transport("network event loop dropped the request".into()))
    }

    /// Addresses the swarm is listening on, with the `/p2p` suffix
    pub async fn listen_addresses(&self) -> Result<Vec<Multiaddr>, P2PError> {
        let peer_id = self.local_peer_id;
        let addresses = self
            .request(|sender| Command::ListenAddresses { sender })
            .await?;
        Ok(addresses
            .into_iter()
            .map(|addr| addr.with(Protocol::P2p(peer_id)))
            .collect())
    }

    /// Answer inbound retrieval streams from `store`, one task per stream
    pub fn serve(&self, store: Arc<FileStore>) -> Result<JoinHandle<()>, P2PError> {
        let mut incoming = self
            .control
            .clone()
            .accept(PROTOCOL)
            .map_err(|e| P2PError::InitializationFailed(e.to_string()))?;

        Ok(tokio::spawn(async move {
            while let Some((peer, stream)) = incoming.next().await {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    match serve_stream(stream.compat(), &store).await {
                        Ok(served) => tracing::debug!(peer = %peer, ?served, "Served stream"),
                        Err(e) => tracing::warn!(peer = %peer, error = %e, "Failed to serve stream"),
                    }
                });
            }
        }))
    }
}

fn provider_key(cid: &ContentId) -> RecordKey {
    RecordKey::new(&cid.as_str().as_bytes())
}

#[async_trait]
impl Discovery for NetworkClient {
    fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    async fn announce(&self, cid: &ContentId) -> Result<(), P2PError> {
        let key = provider_key(cid);
        self.request(|sender| Command::StartProviding { key, sender })
            .await?
    }

    async fn find_providers(
        &self,
        cid: &ContentId,
        max_results: usize,
    ) -> Result<Vec<Provider>, P2PError> {
        if max_results == 0 {
            return Ok(Vec::new());
        }

        let key = provider_key(cid);
        self.request(|sender| Command::GetProviders {
            key,
            limit: max_results,
            sender,
        })
        .await
    }

    async fn connect(&self, address: &Multiaddr) -> Result<PeerId, P2PError> {
        let peer_id = extract_peer_id(address)
            .ok_or_else(|| P2PError::InvalidAddress(format!("{} has no /p2p component", address)))?;
        if peer_id == self.local_peer_id {
            return Err(P2PError::InvalidAddress(format!("{} is this node", address)));
        }

        let address = address.clone();
        self.request(|sender| Command::Dial {
            peer_id,
            address,
            sender,
        })
        .await?
    }

    async fn open_stream(
        &self,
        peer: &PeerId,
        protocol: &StreamProtocol,
    ) -> Result<PeerStream, P2PError> {
        let mut control = self.control.clone();
        let stream = control
            .open_stream(*peer, protocol.clone())
            .await
            .map_err(|e| match e {
                libp2p_stream::OpenStreamError::UnsupportedProtocol(p) => {
                    P2PError::Protocol(format!("{} does not support {}", peer, p))
                }
                other => P2PError::ConnectionFailed(other.to_string()),
            })?;

        Ok(Box::new(stream.compat()))
    }

    async fn known_peers(&self) -> Vec<PeerId> {
        self.request(|sender| Command::ConnectedPeers { sender })
            .await
            .unwrap_or_default()
    }
}

/// Owns the swarm; run it on its own task
pub struct EventLoop {
    swarm: Swarm<ObscureBehaviour>,
    command_rx: mpsc::Receiver<Command>,
    pending_providers: HashMap<QueryId, PendingProviders>,
    pending_dial: HashMap<PeerId, Vec<oneshot::Sender<Result<PeerId, P2PError>>>>,
    peer_addresses: HashMap<PeerId, Vec<Multiaddr>>,
    connected_peers: HashSet<PeerId>,
}

impl EventLoop {
    /// Run until every [`NetworkClient`] has been dropped
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
                command = self.command_rx.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        tracing::debug!("All network clients dropped, stopping event loop");
                        return;
                    }
                },
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartProviding { key, sender } => {
                let result = self
                    .swarm
                    .behaviour_mut()
                    .kademlia
                    .start_providing(key)
                    .map(|query_id| tracing::debug!(?query_id, "Started providing"))
                    .map_err(|e| P2PError::Dht(e.to_string()));
                let _ = sender.send(result);
            }

            Command::GetProviders { key, limit, sender } => {
                let query_id = self.swarm.behaviour_mut().kademlia.get_providers(key);
                self.pending_providers.insert(
                    query_id,
                    PendingProviders {
                        found: Vec::new(),
                        limit,
                        sender,
                    },
                );
            }

            Command::Dial {
                peer_id,
                address,
                sender,
            } => {
                if self.swarm.is_connected(&peer_id) {
                    let _ = sender.send(Ok(peer_id));
                    return;
                }

                self.swarm
                    .behaviour_mut()
                    .kademlia
                    .add_address(&peer_id, address.clone());

                match self.swarm.dial(address) {
                    Ok(()) => self.pending_dial.entry(peer_id).or_default().push(sender),
                    Err(e) => {
                        let _ = sender.send(Err(P2PError::ConnectionFailed(e.to_string())));
                    }
                }
            }

            Command::ConnectedPeers { sender } => {
                let mut peers: Vec<PeerId> = self.connected_peers.iter().copied().collect();
                peers.sort();
                let _ = sender.send(peers);
            }

            Command::ListenAddresses { sender } => {
                let _ = sender.send(self.swarm.listeners().cloned().collect());
            }
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<ObscureBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                tracing::info!(
                    "Listening on {}",
                    address.clone().with(Protocol::P2p(*self.swarm.local_peer_id()))
                );
            }

            SwarmEvent::ConnectionEstablished {
                peer_id, endpoint, ..
            } => {
                tracing::info!(peer = %peer_id, "Connected");
                self.connected_peers.insert(peer_id);

                if endpoint.is_dialer() {
                    self.remember_address(peer_id, endpoint.get_remote_address().clone());
                }
                if let Some(senders) = self.pending_dial.remove(&peer_id) {
                    for sender in senders {
                        let _ = sender.send(Ok(peer_id));
                    }
                }
            }

            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                ..
            } => {
                if num_established == 0 {
                    tracing::info!(peer = %peer_id, "Disconnected");
                    self.connected_peers.remove(&peer_id);
                }
            }

            SwarmEvent::OutgoingConnectionError {
                peer_id: Some(peer_id),
                error,
                ..
            } => {
                tracing::warn!(peer = %peer_id, error = %error, "Outgoing connection failed");
                if let Some(senders) = self.pending_dial.remove(&peer_id) {
                    for sender in senders {
                        let _ = sender.send(Err(P2PError::ConnectionFailed(error.to_string())));
                    }
                }
            }

            SwarmEvent::Behaviour(event) => self.handle_behaviour_event(event),

            _ => {}
        }
    }

    fn handle_behaviour_event(&mut self, event: ObscureBehaviourEvent) {
        match event {
            ObscureBehaviourEvent::Kademlia(kad::Event::OutboundQueryProgressed {
                id,
                result: kad::QueryResult::StartProviding(result),
                ..
            }) => match result {
                Ok(ok) => tracing::debug!(query_id = ?id, key = ?ok.key, "Provider record published"),
                Err(e) => tracing::warn!(query_id = ?id, error = %e, "Provider record publish incomplete"),
            },

            ObscureBehaviourEvent::Kademlia(kad::Event::OutboundQueryProgressed {
                id,
                result: kad::QueryResult::GetProviders(result),
                step,
                ..
            }) => self.on_get_providers(id, result, step.last),

            ObscureBehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. }) => {
                tracing::debug!(
                    "Identified peer {}: {} ({})",
                    peer_id,
                    info.agent_version,
                    info.protocol_version
                );

                for addr in info.listen_addrs {
                    self.swarm.behaviour_mut().kademlia.add_address(&peer_id, addr.clone());
                    self.remember_address(peer_id, addr);
                }
            }

            _ => {}
        }
    }

    fn on_get_providers(&mut self, id: QueryId, result: kad::GetProvidersResult, last: bool) {
        let mut finished = last;

        match result {
            Ok(kad::GetProvidersOk::FoundProviders { providers, .. }) => {
                if let Some(pending) = self.pending_providers.get_mut(&id) {
                    for peer in providers {
                        if pending.found.len() < pending.limit && !pending.found.contains(&peer) {
                            pending.found.push(peer);
                        }
                    }
                    if pending.found.len() >= pending.limit {
                        if let Some(mut query) = self.swarm.behaviour_mut().kademlia.query_mut(&id) {
                            query.finish();
                        }
                        finished = true;
                    }
                }
            }
            Ok(kad::GetProvidersOk::FinishedWithNoAdditionalRecord { .. }) => finished = true,
            Err(e) => {
                tracing::warn!(query_id = ?id, error = %e, "Provider lookup ended early");
                finished = true;
            }
        }

        if !finished {
            return;
        }

        if let Some(pending) = self.pending_providers.remove(&id) {
            let providers = pending
                .found
                .into_iter()
                .map(|peer_id| Provider {
                    peer_id,
                    addresses: self.peer_addresses.get(&peer_id).cloned().unwrap_or_default(),
                })
                .collect();
            let _ = pending.sender.send(providers);
        }
    }

    fn remember_address(&mut self, peer_id: PeerId, address: Multiaddr) {
        let known = self.peer_addresses.entry(peer_id).or_default();
        if !known.contains(&address) {
            known.push(address);
        }
    }
}
