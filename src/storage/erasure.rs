//! Erasure Coding using Reed-Solomon
//!
//! Splits a file into `k` data shards plus `m` parity shards and persists
//! them under `<root>/<checksum>/<checksum>.<index>`. Any `k` intact shards
//! are enough to rebuild the file.

use super::StorageError;
use crate::crypto::ContentId;

use reed_solomon_erasure::galois_8::ReedSolomon;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// GF(2^8) ceiling on data + parity shards
pub const MAX_TOTAL_SHARDS: usize = 256;

const METADATA_FILE: &str = "metadata.json";
const PARTIAL_SUFFIX: &str = "partial";

/// Configuration for erasure coding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErasureConfig {
    /// Number of data shards
    pub data_shards: usize,

    /// Number of parity shards
    pub parity_shards: usize,
}

impl ErasureConfig {
    pub fn new(data_shards: usize, parity_shards: usize) -> Self {
        Self {
            data_shards,
            parity_shards,
        }
    }

    /// Total number of shards
    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Minimum shards needed to reconstruct
    pub fn min_shards(&self) -> usize {
        self.data_shards
    }

    /// Maximum shards that can be lost
    pub fn max_losses(&self) -> usize {
        self.parity_shards
    }

    /// Overhead factor (total / data)
    pub fn overhead(&self) -> f32 {
        self.total_shards() as f32 / self.data_shards as f32
    }

    pub fn validate(&self) -> Result<(), StorageError> {
        if self.data_shards == 0 {
            return Err(StorageError::Config("data shard count must be at least 1".into()));
        }
        if self.parity_shards == 0 {
            return Err(StorageError::Config("parity shard count must be at least 1".into()));
        }
        if self.total_shards() > MAX_TOTAL_SHARDS {
            return Err(StorageError::Config(format!(
                "data + parity shards cannot exceed {} (got {} + {})",
                MAX_TOTAL_SHARDS, self.data_shards, self.parity_shards
            )));
        }
        Ok(())
    }

    /// Length of every shard for an input of `data_len` bytes.
    /// Never zero: the field arithmetic rejects empty shards.
    pub fn shard_len(&self, data_len: usize) -> usize {
        data_len.div_ceil(self.data_shards).max(1)
    }

    fn reed_solomon(&self) -> Result<ReedSolomon, StorageError> {
        self.validate()?;
        ReedSolomon::new(self.data_shards, self.parity_shards).map_err(codec_error)
    }
}

impl Default for ErasureConfig {
    fn default() -> Self {
        // 4 data + 2 parity: survives any two lost shards at 1.5x storage
        Self {
            data_shards: 4,
            parity_shards: 2,
        }
    }
}

/// Everything needed to reverse an encoding. Must be kept next to the shards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardMetadata {
    /// File name used for the reconstructed output
    pub name: String,

    /// Content id of the original bytes; also names the shard directory
    pub checksum: ContentId,

    /// Original byte length, used to strip encode-time padding
    pub size: u64,

    pub shard_count: usize,
    pub parity_count: usize,

    /// `shard_count + parity_count` paths, in shard index order
    pub shard_locations: Vec<PathBuf>,

    /// Content id of each shard as written at encode time
    #[serde(default)]
    pub shard_checksums: Vec<ContentId>,
}

impl ShardMetadata {
    /// Fresh metadata for a file that has not been encoded yet
    pub fn new(name: impl Into<String>, checksum: ContentId) -> Self {
        Self {
            name: name.into(),
            checksum,
            size: 0,
            shard_count: 0,
            parity_count: 0,
            shard_locations: Vec::new(),
            shard_checksums: Vec::new(),
        }
    }

    pub fn total_shards(&self) -> usize {
        self.shard_count + self.parity_count
    }

    pub fn config(&self) -> ErasureConfig {
        ErasureConfig::new(self.shard_count, self.parity_count)
    }

    fn validate_name(&self) -> Result<(), StorageError> {
        let is_plain = Path::new(&self.name)
            .file_name()
            .map(|n| n == self.name.as_str())
            .unwrap_or(false);

        if !is_plain || self.name == METADATA_FILE {
            return Err(StorageError::Config(format!(
                "invalid output file name: {:?}",
                self.name
            )));
        }
        Ok(())
    }

    fn validate_layout(&self) -> Result<(), StorageError> {
        self.config().validate()?;
        self.validate_name()?;

        if self.shard_locations.len() != self.total_shards() {
            return Err(StorageError::Config(format!(
                "metadata lists {} shard locations for {} shards",
                self.shard_locations.len(),
                self.total_shards()
            )));
        }
        if !self.shard_checksums.is_empty() && self.shard_checksums.len() != self.total_shards() {
            return Err(StorageError::Config(format!(
                "metadata lists {} shard checksums for {} shards",
                self.shard_checksums.len(),
                self.total_shards()
            )));
        }
        Ok(())
    }
}

/// Encoder/decoder bound to a storage root.
///
/// Both directions do blocking file I/O and CPU-bound parity math; async
/// callers should run them on a blocking thread.
#[derive(Debug, Clone)]
pub struct ErasureCodec {
    storage_root: PathBuf,
    config: ErasureConfig,
}

impl ErasureCodec {
    pub fn new(storage_root: impl Into<PathBuf>, config: ErasureConfig) -> Result<Self, StorageError> {
        config.validate()?;
        Ok(Self {
            storage_root: storage_root.into(),
            config,
        })
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    pub fn config(&self) -> ErasureConfig {
        self.config
    }

    /// Directory holding every shard of one file
    pub fn shard_dir(&self, checksum: &ContentId) -> PathBuf {
        self.storage_root.join(checksum.as_str())
    }

    pub fn shard_path(&self, checksum: &ContentId, index: usize) -> PathBuf {
        self.shard_dir(checksum)
            .join(format!("{}.{}", checksum, index))
    }

    pub fn output_path(&self, metadata: &ShardMetadata) -> PathBuf {
        self.shard_dir(&metadata.checksum).join(&metadata.name)
    }

    pub fn metadata_path(&self, checksum: &ContentId) -> PathBuf {
        self.shard_dir(checksum).join(METADATA_FILE)
    }

    /// Split `data` into shards, write them, and record the layout in `metadata`.
    ///
    /// Shards already present on disk are left untouched, so re-encoding after
    /// a partial failure just fills in what is missing.
    pub fn encode(&self, metadata: &mut ShardMetadata, data: &[u8]) -> Result<(), StorageError> {
        let config = self.config;
        let rs = config.reed_solomon()?;
        metadata.validate_name()?;

        tracing::info!(
            checksum = %metadata.checksum,
            size = data.len(),
            data_shards = config.data_shards,
            parity_shards = config.parity_shards,
            "Encoding file"
        );

        let shard_len = config.shard_len(data.len());
        let mut shards: Vec<Vec<u8>> = Vec::with_capacity(config.total_shards());

        for i in 0..config.data_shards {
            let start = (i * shard_len).min(data.len());
            let end = (start + shard_len).min(data.len());

            let mut shard = data[start..end].to_vec();
            shard.resize(shard_len, 0);
            shards.push(shard);
        }

        for _ in 0..config.parity_shards {
            shards.push(vec![0u8; shard_len]);
        }

        rs.encode(&mut shards).map_err(codec_error)?;

        let dir = self.shard_dir(&metadata.checksum);
        std::fs::create_dir_all(&dir)?;

        let mut locations = Vec::with_capacity(shards.len());
        let mut checksums = Vec::with_capacity(shards.len());

        for (index, shard) in shards.iter().enumerate() {
            let path = self.shard_path(&metadata.checksum, index);

            if path.exists() {
                tracing::debug!(path = %path.display(), "Shard exists, skipping");
            } else {
                tracing::debug!(path = %path.display(), bytes = shard.len(), "Writing shard");
                std::fs::write(&path, shard)?;
            }

            locations.push(path);
            checksums.push(ContentId::of(shard));
        }

        metadata.size = data.len() as u64;
        metadata.shard_count = config.data_shards;
        metadata.parity_count = config.parity_shards;
        metadata.shard_locations = locations;
        metadata.shard_checksums = checksums;

        Ok(())
    }

    /// Rebuild the original file and write it to `<root>/<checksum>/<name>`.
    ///
    /// The output only appears once every byte is in memory and verified.
    pub fn decode(&self, metadata: &ShardMetadata) -> Result<PathBuf, StorageError> {
        let data = self.reconstruct(metadata)?;

        let output = self.output_path(metadata);
        let partial = output.with_file_name(format!("{}.{}", metadata.name, PARTIAL_SUFFIX));

        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&partial, &data)?;
        std::fs::rename(&partial, &output)?;

        tracing::info!(output = %output.display(), bytes = data.len(), "File decoded");
        Ok(output)
    }

    /// Read, verify and if needed repair the shard set, returning the original bytes
    pub fn reconstruct(&self, metadata: &ShardMetadata) -> Result<Vec<u8>, StorageError> {
        metadata.validate_layout()?;

        let config = metadata.config();
        let rs = config.reed_solomon()?;
        let size = usize::try_from(metadata.size)
            .map_err(|_| StorageError::Reconstruction(format!("file size {} too large", metadata.size)))?;
        let shard_len = config.shard_len(size);

        tracing::info!(
            checksum = %metadata.checksum,
            data_shards = config.data_shards,
            parity_shards = config.parity_shards,
            "Decoding file"
        );

        let mut shards: Vec<Option<Vec<u8>>> = metadata
            .shard_locations
            .iter()
            .enumerate()
            .map(|(index, path)| self.read_shard(metadata, index, path, shard_len))
            .collect();

        let present = shards.iter().filter(|s| s.is_some()).count();
        let total = config.total_shards();

        let verified = present == total && {
            let full: Vec<&[u8]> = shards.iter().flatten().map(Vec::as_slice).collect();
            rs.verify(&full).map_err(codec_error)?
        };

        if !verified {
            if present < config.data_shards {
                tracing::error!(
                    checksum = %metadata.checksum,
                    have = present,
                    need = config.data_shards,
                    "File is unrecoverable"
                );
                return Err(StorageError::InsufficientShards {
                    have: present,
                    need: config.data_shards,
                });
            }

            tracing::warn!(
                checksum = %metadata.checksum,
                missing = total - present,
                "Shard set failed verification, reconstructing"
            );

            if present < total {
                rs.reconstruct(&mut shards).map_err(codec_error)?;
            }

            let full: Vec<&[u8]> = shards.iter().flatten().map(Vec::as_slice).collect();
            if full.len() != total || !rs.verify(&full).map_err(codec_error)? {
                return Err(StorageError::Reconstruction(format!(
                    "shard set for {} still inconsistent after reconstruction",
                    metadata.checksum
                )));
            }

            tracing::info!(checksum = %metadata.checksum, "Reconstruction succeeded");
        }

        let mut data = Vec::with_capacity(shard_len * config.data_shards);
        for shard in shards.iter().take(config.data_shards) {
            match shard {
                Some(shard) => data.extend_from_slice(shard),
                None => return Err(StorageError::Reconstruction("data shard missing after repair".into())),
            }
        }
        data.truncate(size);

        Ok(data)
    }

    /// Read one shard; anything unreadable or inconsistent counts as erased
    fn read_shard(
        &self,
        metadata: &ShardMetadata,
        index: usize,
        path: &Path,
        shard_len: usize,
    ) -> Option<Vec<u8>> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Unreadable shard");
                return None;
            }
        };

        if bytes.len() != shard_len {
            tracing::warn!(
                path = %path.display(),
                expected = shard_len,
                actual = bytes.len(),
                "Malformed shard length"
            );
            return None;
        }

        if let Some(expected) = metadata.shard_checksums.get(index) {
            if !expected.verify(&bytes) {
                tracing::warn!(path = %path.display(), "Corrupted shard");
                return None;
            }
        }

        Some(bytes)
    }

    /// Persist metadata next to the shards
    pub fn save_metadata(&self, metadata: &ShardMetadata) -> Result<PathBuf, StorageError> {
        let path = self.metadata_path(&metadata.checksum);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(metadata)?;
        std::fs::write(&path, json)?;
        Ok(path)
    }

    pub fn load_metadata(&self, checksum: &ContentId) -> Result<ShardMetadata, StorageError> {
        let path = self.metadata_path(checksum);
        let json = match std::fs::read_to_string(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::FileNotFound(checksum.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        Ok(serde_json::from_str(&json)?)
    }

    /// Whether shards for this checksum were ever encoded here
    pub fn has_shards(&self, checksum: &ContentId) -> bool {
        self.metadata_path(checksum).is_file()
    }
}

fn codec_error(err: reed_solomon_erasure::Error) -> StorageError {
    use reed_solomon_erasure::Error;

    match err {
        Error::TooFewShards
        | Error::TooManyShards
        | Error::TooFewDataShards
        | Error::TooManyDataShards
        | Error::TooFewParityShards
        | Error::TooManyParityShards => StorageError::Config(err.to_string()),
        other => StorageError::Reconstruction(other.to_string()),
    }
}
