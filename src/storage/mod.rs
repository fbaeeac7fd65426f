//! Storage Module - Local file registry and erasure-coded shard storage
//!
//! The file store maps content identifiers to locations on this node; the
//! codec splits files into data + parity shards on disk and rebuilds them
//! from any sufficiently large subset.

mod erasure;
mod file_store;

pub use erasure::{ErasureCodec, ErasureConfig, ShardMetadata, MAX_TOTAL_SHARDS};
pub use file_store::{FileRecord, FileStore};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Not enough shards available: have {have}, need {need}")]
    InsufficientShards { have: usize, need: usize },

    #[error("Reconstruction failed: {0}")]
    Reconstruction(String),

    #[error("Invalid erasure configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
