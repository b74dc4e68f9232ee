//! Version manifest for cached payloads
//!
//! Maps a cache id to the version of the payload stored under it. The map
//! is mirrored to a single JSON manifest:
//!
//! ```json
//! { "files": [ { "id": "cdn.example.com_avatar.png", "version": 3 } ] }
//! ```
//!
//! Mutations only mark the store dirty; the scheduler persists a dirty
//! store once at the next tick boundary.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{LoaderError, LoaderResult};
use crate::storage::FileStore;

/// One manifest entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub id: String,
    pub version: u32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    #[serde(default)]
    files: Vec<VersionRecord>,
}

/// Persisted cache id -> version mapping
#[derive(Debug)]
pub struct VersionStore {
    path: PathBuf,
    versions: BTreeMap<String, u32>,
    loaded: bool,
    dirty: bool,
}

impl VersionStore {
    /// Create an empty, not yet loaded store backed by `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            versions: BTreeMap::new(),
            loaded: false,
            dirty: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Whether there are unsaved changes
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Load the manifest. A missing manifest is an empty store; a corrupt
    /// one is logged and discarded.
    pub fn load(&mut self, files: &dyn FileStore) {
        self.loaded = true;

        let data = match files.read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No version manifest at {:?}", self.path);
                return;
            }
            Err(e) => {
                log::warn!("Failed to read version manifest {:?}: {}", self.path, e);
                return;
            }
        };

        match serde_json::from_slice::<Manifest>(&data) {
            Ok(manifest) => {
                self.versions = manifest
                    .files
                    .into_iter()
                    .map(|record| (record.id, record.version))
                    .collect();
                log::info!(
                    "Loaded version manifest {:?}: {} entries",
                    self.path,
                    self.versions.len()
                );
            }
            Err(e) => {
                log::warn!("Invalid version manifest {:?}: {}", self.path, e);
            }
        }
    }

    /// Write the manifest and clear the dirty flag
    pub fn save(&mut self, files: &dyn FileStore) -> LoaderResult<()> {
        let manifest = Manifest {
            files: self.iter().collect(),
        };
        let json = serde_json::to_vec_pretty(&manifest)?;

        files
            .write(&self.path, &json)
            .map_err(|source| LoaderError::Persist {
                path: self.path.clone(),
                source,
            })?;

        self.dirty = false;
        log::debug!("Saved version manifest: {} entries", self.versions.len());
        Ok(())
    }

    /// Stored version for a cache id
    pub fn get(&self, id: &str) -> Option<u32> {
        self.versions.get(id).copied()
    }

    /// Record a version. Lower versions than the stored one are rejected
    /// and the stored value is kept.
    pub fn write(&mut self, id: &str, version: u32) -> LoaderResult<()> {
        match self.versions.get(id).copied() {
            Some(stored) if version < stored => {
                log::warn!(
                    "Can not update {} to a lower version: stored={} new={}",
                    id,
                    stored,
                    version
                );
                Err(LoaderError::VersionDowngradeRejected {
                    id: id.to_string(),
                    stored,
                    requested: version,
                })
            }
            Some(stored) if version == stored => Ok(()),
            _ => {
                self.versions.insert(id.to_string(), version);
                self.dirty = true;
                Ok(())
            }
        }
    }

    /// Forget a cache id; returns whether it was present
    pub fn delete(&mut self, id: &str) -> bool {
        let removed = self.versions.remove(id).is_some();
        if removed {
            self.dirty = true;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Records sorted by id
    pub fn iter(&self) -> impl Iterator<Item = VersionRecord> + '_ {
        self.versions.iter().map(|(id, &version)| VersionRecord {
            id: id.clone(),
            version,
        })
    }
}
