//! ObscureFS node daemon and command-line tools

use anyhow::Context;
use clap::{Parser, Subcommand};
use obscurefs::api::{self, AppState};
use obscurefs::crypto::{hash_file, ContentId};
use obscurefs::p2p::{Discovery, NetworkClient, P2PNode};
use obscurefs::storage::{ErasureCodec, FileStore, ShardMetadata};
use obscurefs::{ContentNode, NodeConfig};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "obscurefs")]
#[command(about = "Content-addressed, erasure-coded peer-to-peer file store")]
#[command(version)]
struct Cli {
    /// Configuration file path (TOML)
    #[arg(short, long, env = "OBSCUREFS_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Shard storage root (overrides config file)
    #[arg(long, env = "OBSCUREFS_STORAGE_ROOT", global = true)]
    storage_root: Option<PathBuf>,

    /// P2P listen port (overrides config file)
    #[arg(long, env = "OBSCUREFS_LISTEN_PORT", global = true)]
    listen_port: Option<u16>,

    /// Bootstrap peer multiaddrs, comma separated (overrides config file)
    #[arg(long, env = "OBSCUREFS_BOOTSTRAP", value_delimiter = ',', global = true)]
    bootstrap: Vec<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a node: P2P transport, retrieval protocol and HTTP API
    Serve {
        /// HTTP API port (overrides config file)
        #[arg(long, env = "OBSCUREFS_API_PORT")]
        api_port: Option<u16>,
    },

    /// Print the content id of a file
    Hash { file: PathBuf },

    /// Split a file into shards under the storage root
    Encode {
        file: PathBuf,

        /// Name for the reconstructed output (defaults to the file name)
        #[arg(long)]
        name: Option<String>,
    },

    /// Rebuild a file from its shards
    Decode { checksum: String },

    /// Retrieve a file by CID through the bootstrap peers
    Get {
        cid: String,

        #[arg(short, long)]
        output: PathBuf,
    },

    /// Connect to the bootstrap peers and list who answered
    Peers,

    /// Dial one peer address ending in /p2p/<peer-id>
    Connect { address: String },

    /// Print local and peer file listings gathered through the bootstrap peers
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(true)
        .init();

    let mut config = match &cli.config {
        Some(path) => NodeConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => NodeConfig::default(),
    };
    if let Some(root) = cli.storage_root {
        config.storage_root = root;
    }
    let explicit_port = cli.listen_port.is_some();
    if let Some(port) = cli.listen_port {
        config.listen_port = port;
    }
    if !cli.bootstrap.is_empty() {
        config.bootstrap_nodes = cli.bootstrap;
    }

    match cli.command {
        Command::Serve { api_port } => {
            if let Some(port) = api_port {
                config.api_port = port;
            }
            config.validate()?;
            serve(config).await
        }
        Command::Hash { file } => {
            let cid = hash_file(&file).with_context(|| format!("Failed to hash {}", file.display()))?;
            println!("{}", cid);
            Ok(())
        }
        Command::Encode { file, name } => {
            config.validate()?;
            encode(&config, file, name)
        }
        Command::Decode { checksum } => {
            config.validate()?;
            let codec = ErasureCodec::new(&config.storage_root, config.erasure_config())?;
            let checksum = ContentId::parse(&checksum)?;
            let metadata = codec.load_metadata(&checksum)?;
            let output = codec.decode(&metadata)?;
            println!("{}", output.display());
            Ok(())
        }
        Command::Get { cid, output } => {
            one_shot(&mut config, explicit_port)?;
            let cid = ContentId::parse(&cid)?;
            let (node, _network) = start_node(&config).await?;

            node.connect_bootstrap(&config.bootstrap_nodes).await;
            let source = node.retrieve_file(&cid, &output).await?;
            info!(cid = %cid, ?source, "Retrieved");
            println!("{}", output.display());
            Ok(())
        }
        Command::Peers => {
            one_shot(&mut config, explicit_port)?;
            let (node, network) = start_node(&config).await?;

            let connected = node.connect_bootstrap(&config.bootstrap_nodes).await;
            info!(connected, "Bootstrap complete");
            for peer in network.known_peers().await {
                println!("{}", peer);
            }
            Ok(())
        }
        Command::Connect { address } => {
            one_shot(&mut config, explicit_port)?;
            let (node, _network) = start_node(&config).await?;

            let peer = node.connect(&address).await?;
            println!("{}", peer);
            Ok(())
        }
        Command::List => {
            one_shot(&mut config, explicit_port)?;
            let (node, _network) = start_node(&config).await?;

            node.connect_bootstrap(&config.bootstrap_nodes).await;
            let listing = node.list_network_files().await;
            println!("{}", serde_json::to_string_pretty(&listing)?);
            Ok(())
        }
    }
}

/// Short-lived commands listen on any free port unless one was given
fn one_shot(config: &mut NodeConfig, explicit_port: bool) -> anyhow::Result<()> {
    if !explicit_port {
        config.listen_port = 0;
    }
    config.validate()?;
    Ok(())
}

/// Build the transport, spawn its event loop, and wire a content node on top
async fn start_node(config: &NodeConfig) -> anyhow::Result<(Arc<ContentNode>, NetworkClient)> {
    let store = Arc::new(FileStore::new());
    start_node_with_store(config, store).await.map(|(node, client, _)| (node, client))
}

async fn start_node_with_store(
    config: &NodeConfig,
    store: Arc<FileStore>,
) -> anyhow::Result<(Arc<ContentNode>, NetworkClient, JoinHandle<()>)> {
    let codec = Arc::new(ErasureCodec::new(&config.storage_root, config.erasure_config())?);

    let p2p = P2PNode::new(config.p2p_config()?)?;
    let (client, event_loop) = p2p.spawn();

    let node = Arc::new(ContentNode::new(
        store,
        codec,
        Arc::new(client.clone()),
        config.retrieval_options(),
    ));

    Ok((node, client, event_loop))
}

async fn serve(config: NodeConfig) -> anyhow::Result<()> {
    info!("ObscureFS node starting...");

    std::fs::create_dir_all(&config.storage_root)
        .with_context(|| format!("Failed to create {}", config.storage_root.display()))?;

    let store = Arc::new(FileStore::new());
    let (node, client, event_loop) = start_node_with_store(&config, Arc::clone(&store)).await?;
    let accept_loop = client.serve(store)?;

    info!(peer = %node.local_peer_id(), "Node identity");

    // Give the listeners a moment to bind before reporting them
    tokio::time::sleep(Duration::from_millis(200)).await;
    for addr in client.listen_addresses().await? {
        info!("Reachable at {}", addr);
    }

    let connected = node.connect_bootstrap(&config.bootstrap_nodes).await;
    if !config.bootstrap_nodes.is_empty() && connected == 0 {
        warn!("Could not reach any bootstrap node, running standalone");
    }

    let state = AppState::new(Arc::clone(&node), &config.upload_dir, &config.temp_dir);
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.api_port));

    api::serve(addr, state, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
    })
    .await?;

    accept_loop.abort();
    event_loop.abort();
    info!("ObscureFS node stopped");
    Ok(())
}

fn encode(config: &NodeConfig, file: PathBuf, name: Option<String>) -> anyhow::Result<()> {
    let codec = ErasureCodec::new(&config.storage_root, config.erasure_config())?;

    let data = std::fs::read(&file).with_context(|| format!("Failed to read {}", file.display()))?;
    let checksum = ContentId::of(&data);
    let name = match name {
        Some(name) => name,
        None => file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .context("Input path has no file name")?,
    };

    let mut metadata = ShardMetadata::new(name, checksum);
    codec.encode(&mut metadata, &data)?;
    let metadata_path = codec.save_metadata(&metadata)?;

    println!("checksum: {}", metadata.checksum);
    println!("shards:   {} data + {} parity", metadata.shard_count, metadata.parity_count);
    for location in &metadata.shard_locations {
        println!("  {}", location.display());
    }
    println!("metadata: {}", metadata_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_connect() {
        let address = "/ip4/127.0.0.1/tcp/4001/p2p/12D3KooWDpJ7As7BWAwRMfu1VU2WCqNjvq387JEYKDBj4kx6nXTN";
        let cli = Cli::try_parse_from(["obscurefs", "connect", address]).unwrap();

        match cli.command {
            Command::Connect { address: parsed } => assert_eq!(parsed, address),
            _ => panic!("expected connect"),
        }
        assert!(Cli::try_parse_from(["obscurefs", "connect"]).is_err());
    }

    #[test]
    fn test_parse_list_with_bootstrap() {
        let cli = Cli::try_parse_from(["obscurefs", "list", "--bootstrap", "/ip4/10.0.0.1/tcp/4001,/ip4/10.0.0.2/tcp/4001"])
            .unwrap();

        assert!(matches!(cli.command, Command::List));
        assert_eq!(cli.bootstrap.len(), 2);
    }
}
