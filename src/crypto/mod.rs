//! Crypto Module - content addressing
//!
//! Every file is identified by the digest of its bytes; the same bytes give
//! the same identifier on every node, which is what provider lookups key on.

mod hashing;

pub use hashing::{hash_file, hash_reader, ContentId, IncrementalHasher, CID_LEN, DIGEST_LEN};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CidError {
    #[error("Invalid content id length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Invalid content id encoding: {0}")]
    InvalidEncoding(String),
}
