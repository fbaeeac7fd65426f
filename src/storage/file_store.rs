//! Local file store - maps content identifiers to file locations on this node

use super::StorageError;
use crate::crypto::ContentId;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A single registration: the bytes for `cid` can be read at `location`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub cid: ContentId,
    pub location: PathBuf,
}

/// Thread-safe CID → location table.
///
/// Readers share the lock; a writer holds it exclusively for the duration of
/// one insert, so readers never see a half-updated map. Registration does not
/// touch the bytes themselves.
#[derive(Debug, Default)]
pub struct FileStore {
    files: RwLock<BTreeMap<ContentId, PathBuf>>,
}

impl FileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or overwrite) the location for a CID. Last write wins.
    pub fn store(&self, cid: ContentId, location: impl Into<PathBuf>) -> FileRecord {
        let location = location.into();
        let previous = self.files.write().insert(cid.clone(), location.clone());

        match previous {
            Some(old) if old != location => {
                tracing::debug!(cid = %cid, old = %old.display(), new = %location.display(), "Replaced file location")
            }
            _ => tracing::debug!(cid = %cid, location = %location.display(), "Registered file"),
        }

        FileRecord { cid, location }
    }

    /// Look up where the bytes for a CID live
    pub fn get(&self, cid: &ContentId) -> Result<PathBuf, StorageError> {
        self.files
            .read()
            .get(cid)
            .cloned()
            .ok_or_else(|| StorageError::FileNotFound(cid.to_string()))
    }

    /// Fetch the full record for a CID
    pub fn record(&self, cid: &ContentId) -> Result<FileRecord, StorageError> {
        self.get(cid).map(|location| FileRecord {
            cid: cid.clone(),
            location,
        })
    }

    pub fn contains(&self, cid: &ContentId) -> bool {
        self.files.read().contains_key(cid)
    }

    /// Drop a registration, returning its location if there was one
    pub fn remove(&self, cid: &ContentId) -> Option<PathBuf> {
        self.files.write().remove(cid)
    }

    /// Independent snapshot of every registration
    pub fn list(&self) -> BTreeMap<ContentId, PathBuf> {
        self.files.read().clone()
    }

    /// Snapshot with locations rendered as strings, the shape peers exchange
    pub fn listing(&self) -> BTreeMap<String, String> {
        self.files
            .read()
            .iter()
            .map(|(cid, location)| (cid.to_string(), display_location(location)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }
}

fn display_location(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
