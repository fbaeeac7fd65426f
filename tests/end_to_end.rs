use obscurefs::crypto::{hash_file, ContentId};
use obscurefs::p2p::{MemoryNetwork, P2PError, PeerMode};
use obscurefs::storage::{ErasureCodec, ErasureConfig, FileStore, ShardMetadata, StorageError};
use obscurefs::{ContentNode, ObscureError, RetrievalOptions, RetrievalSource};

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const TEN_MIB: usize = 10 * 1024 * 1024;

fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 33) as u8
        })
        .collect()
}

struct Peer {
    node: ContentNode,
    dir: TempDir,
}

fn join(network: &MemoryNetwork, options: RetrievalOptions) -> Peer {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileStore::new());
    let codec = Arc::new(ErasureCodec::new(dir.path().join("shards"), ErasureConfig::new(4, 2)).unwrap());
    let discovery = Arc::new(network.join(Arc::clone(&store)));

    Peer {
        node: ContentNode::new(store, codec, discovery, options),
        dir,
    }
}

#[test]
fn ten_mib_survives_two_lost_shards_but_not_three() {
    let dir = TempDir::new().unwrap();
    let codec = ErasureCodec::new(dir.path(), ErasureConfig::new(4, 2)).unwrap();

    let data = pseudo_random(TEN_MIB, 42);
    let checksum = ContentId::of(&data);
    let mut metadata = ShardMetadata::new("big.bin", checksum.clone());
    codec.encode(&mut metadata, &data).unwrap();

    assert_eq!(metadata.shard_locations.len(), 6);
    assert_eq!(metadata.size, TEN_MIB as u64);

    // Any two: one data shard and one parity shard
    std::fs::remove_file(&metadata.shard_locations[1]).unwrap();
    std::fs::remove_file(&metadata.shard_locations[4]).unwrap();

    let output = codec.decode(&metadata).unwrap();
    assert_eq!(output, dir.path().join(checksum.as_str()).join("big.bin"));
    assert_eq!(hash_file(&output).unwrap(), checksum);

    std::fs::remove_file(&output).unwrap();
    std::fs::remove_file(&metadata.shard_locations[2]).unwrap();

    let err = codec.decode(&metadata).unwrap_err();
    assert!(matches!(err, StorageError::InsufficientShards { have: 3, need: 4 }));
    assert!(!output.exists());
}

#[tokio::test]
async fn share_discover_fetch_over_memory_network() {
    let network = MemoryNetwork::new();
    let alice = join(&network, RetrievalOptions::default());
    let bob = join(&network, RetrievalOptions::default());

    let data = pseudo_random(256 * 1024, 7);
    let path = alice.dir.path().join("photo.raw");
    std::fs::write(&path, &data).unwrap();

    let receipt = alice.node.share_file(&path).await.unwrap();
    assert_eq!(receipt.cid, ContentId::of(&data));

    let output = bob.dir.path().join("downloads/photo.raw");
    let source = bob.node.retrieve_file(&receipt.cid, &output).await.unwrap();

    assert_eq!(source, RetrievalSource::Peer(alice.node.local_peer_id()));
    assert_eq!(std::fs::read(&output).unwrap(), data);
}

#[tokio::test]
async fn local_hit_never_touches_network() {
    let network = MemoryNetwork::new();
    let alice = join(&network, RetrievalOptions::default());

    let path = alice.dir.path().join("note.txt");
    std::fs::write(&path, b"local only").unwrap();
    let cid = alice.node.share_file(&path).await.unwrap().cid;

    // Even our own announcement is unreachable now
    network.set_mode(&alice.node.local_peer_id(), PeerMode::Unreachable);

    let output = alice.dir.path().join("copy.txt");
    let source = alice.node.retrieve_file(&cid, &output).await.unwrap();
    assert_eq!(source, RetrievalSource::LocalStore);
    assert_eq!(std::fs::read(&output).unwrap(), b"local only");
}

#[tokio::test]
async fn misses_and_failures_fall_through_to_a_holder() {
    let network = MemoryNetwork::new();
    let options = RetrievalOptions {
        provider_timeout: Duration::from_millis(250),
        ..Default::default()
    };
    let empty = join(&network, options);
    let down = join(&network, options);
    let slow = join(&network, options);
    let holder = join(&network, options);
    let client = join(&network, options);

    let data = b"worth the wait".to_vec();
    let cid = ContentId::of(&data);

    for peer in [&empty, &down, &slow] {
        network.add_provider(cid.clone(), peer.node.local_peer_id());
    }
    network.set_mode(&down.node.local_peer_id(), PeerMode::Unreachable);
    network.set_mode(&slow.node.local_peer_id(), PeerMode::Stall);

    let path = holder.dir.path().join("w.txt");
    std::fs::write(&path, &data).unwrap();
    holder.node.share_file(&path).await.unwrap();

    let output = client.dir.path().join("w.txt");
    let source = client.node.retrieve_file(&cid, &output).await.unwrap();

    assert_eq!(source, RetrievalSource::Peer(holder.node.local_peer_id()));
    assert_eq!(std::fs::read(&output).unwrap(), data);
}

#[tokio::test]
async fn every_provider_missing_is_a_failure() {
    let network = MemoryNetwork::new();
    let a = join(&network, RetrievalOptions::default());
    let b = join(&network, RetrievalOptions::default());
    let client = join(&network, RetrievalOptions::default());

    let cid = ContentId::of(b"claimed but absent");
    network.add_provider(cid.clone(), a.node.local_peer_id());
    network.add_provider(cid.clone(), b.node.local_peer_id());

    let output = client.dir.path().join("nothing");
    let err = client.node.retrieve_file(&cid, &output).await.unwrap_err();

    assert!(matches!(
        err,
        ObscureError::P2P(P2PError::ProvidersExhausted { tried: 2, .. })
    ));
    assert!(err.is_not_found());
    assert!(!output.exists());
}

#[tokio::test]
async fn owner_recovers_from_shards_after_losing_the_original() {
    let network = MemoryNetwork::new();
    let alice = join(&network, RetrievalOptions::default());

    let data = pseudo_random(1024 * 1024 + 3, 99);
    let path = alice.dir.path().join("archive.tar");
    std::fs::write(&path, &data).unwrap();

    let receipt = alice.node.share_file(&path).await.unwrap();
    let shards = receipt.shards.unwrap();

    std::fs::remove_file(&path).unwrap();
    std::fs::remove_file(&shards.shard_locations[0]).unwrap();
    std::fs::remove_file(&shards.shard_locations[3]).unwrap();

    let output = alice.dir.path().join("restored.tar");
    let source = alice.node.retrieve_file(&receipt.cid, &output).await.unwrap();

    assert_eq!(source, RetrievalSource::LocalShards);
    assert_eq!(std::fs::read(&output).unwrap(), data);
}
