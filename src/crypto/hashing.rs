//! Content addressing using SHA-256
//!
//! A content identifier is the lowercase hex encoding of the SHA-256 digest
//! of a file's bytes: always 64 characters, identical on every node.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use super::CidError;

/// Digest length in bytes
pub const DIGEST_LEN: usize = 32;

/// Length of the encoded identifier (hex, two characters per byte)
pub const CID_LEN: usize = DIGEST_LEN * 2;

/// Chunk size used when hashing readers
const READ_CHUNK: usize = 64 * 1024;

/// Content identifier derived from a byte stream
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentId(String);

impl ContentId {
    /// Hash a buffer and return its identifier
    pub fn of(data: &[u8]) -> Self {
        Self::from_digest(&Sha256::digest(data))
    }

    fn from_digest(digest: &[u8]) -> Self {
        Self(hex::encode(digest))
    }

    /// Parse an identifier received from outside (CLI, HTTP path, wire frame)
    pub fn parse(s: &str) -> Result<Self, CidError> {
        let s = s.trim();
        if s.len() != CID_LEN {
            return Err(CidError::InvalidLength {
                expected: CID_LEN,
                actual: s.len(),
            });
        }
        if !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(CidError::InvalidEncoding(s.to_string()));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Verify that data matches this identifier
    pub fn verify(&self, data: &[u8]) -> bool {
        Self::of(data) == *self
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({})", self.0)
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ContentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for ContentId {
    type Err = CidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ContentId {
    type Error = CidError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<ContentId> for String {
    fn from(cid: ContentId) -> Self {
        cid.0
    }
}

/// Incremental hasher for large files
pub struct IncrementalHasher {
    hasher: Sha256,
    bytes_processed: u64,
}

impl IncrementalHasher {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
            bytes_processed: 0,
        }
    }

    /// Update with more data
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes_processed += data.len() as u64;
    }

    /// Finalize and get the content identifier
    pub fn finalize(self) -> ContentId {
        ContentId::from_digest(&self.hasher.finalize())
    }

    /// Get bytes processed so far
    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed
    }
}

impl Default for IncrementalHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash everything a reader yields, in chunks
pub fn hash_reader<R: Read>(reader: &mut R) -> std::io::Result<ContentId> {
    let mut hasher = IncrementalHasher::new();
    let mut buffer = vec![0u8; READ_CHUNK];

    loop {
        let bytes_read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize())
}

/// Hash a file on disk. Fails only if the file cannot be opened or read.
pub fn hash_file(path: impl AsRef<Path>) -> std::io::Result<ContentId> {
    let mut file = std::fs::File::open(path.as_ref())?;
    hash_reader(&mut file)
}
