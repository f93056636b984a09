//! Versioned, atomically published forest artifacts.
//!
//! # Layout
//!
//! ```text
//! <namespace>/
//! ├── MANIFEST                              # names the current version (JSON)
//! └── forests/
//!     ├── 00000000000000000001.forest       # immutable, one per version
//!     ├── 00000000000000000002.forest
//!     └── ...
//! ```
//!
//! # Publish protocol
//!
//! 1. Serialize the forest into one artifact under a fresh sequence number.
//! 2. Write the artifact.
//! 3. Only then overwrite `MANIFEST` (a single atomic object write).
//!
//! Readers resolve "latest" exclusively through `MANIFEST`. Listing is used
//! for sequence allocation and garbage collection, never to pick the version
//! to serve, so a reader can never pair pieces of two different publishes.

use crate::error::{ForestError, Result};
use crate::forest::Forest;
use crate::persistence::blob_store::BlobStore;
use crate::persistence::format::{Persistable, FORMAT_VERSION};
use crate::persistence::PersistenceError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

const MANIFEST_NAME: &str = "MANIFEST";
const FORESTS_DIR: &str = "forests";
const ARTIFACT_EXT: &str = ".forest";

/// Store configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Logical index namespace: a single key segment.
    pub namespace: String,

    /// Artifacts kept by garbage collection, including the current one.
    pub retain_versions: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            retain_versions: 3,
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        let ns = &self.namespace;
        if ns.is_empty() || ns.contains('/') || ns == "." || ns == ".." {
            return Err(ForestError::InvalidParameter(format!(
                "namespace {ns:?} must be a single non-empty key segment"
            )));
        }
        if self.retain_versions == 0 {
            return Err(ForestError::InvalidParameter(
                "retain_versions must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Identity of one published artifact.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForestVersion {
    /// Monotonically increasing per namespace.
    pub sequence: u64,
    /// Publish time, Unix millis.
    pub created_at: u64,
    /// CRC32 of the whole artifact.
    pub checksum: u32,
    pub size_bytes: u64,
    pub dimension: u32,
    pub num_vectors: u64,
    pub n_trees: u32,
}

impl fmt::Display for ForestVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.sequence)
    }
}

/// The single pointer object naming the current version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub namespace: String,
    pub current: ForestVersion,
}

/// Outcome of a garbage collection pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GcReport {
    pub kept: Vec<u64>,
    pub deleted: Vec<u64>,
    pub failed: Vec<u64>,
}

/// A forest together with the version it was loaded from.
#[derive(Debug)]
pub struct LoadedForest {
    pub version: ForestVersion,
    pub forest: Forest,
}

/// Publishes and loads forests for one namespace.
pub struct IndexStore {
    blobs: Arc<dyn BlobStore>,
    config: StoreConfig,
    publish_lock: Mutex<()>,
}

impl IndexStore {
    pub fn new(blobs: Arc<dyn BlobStore>, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            blobs,
            config,
            publish_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn manifest_key(&self) -> String {
        format!("{}/{MANIFEST_NAME}", self.config.namespace)
    }

    fn artifact_prefix(&self) -> String {
        format!("{}/{FORESTS_DIR}/", self.config.namespace)
    }

    pub fn artifact_key(&self, sequence: u64) -> String {
        format!("{}{sequence:020}{ARTIFACT_EXT}", self.artifact_prefix())
    }

    /// Current manifest, if anything has been published.
    pub fn manifest(&self) -> Result<Option<Manifest>> {
        let Some(raw) = self
            .blobs
            .get(&self.manifest_key())
            .map_err(ForestError::StorageRead)?
        else {
            return Ok(None);
        };
        let manifest: Manifest = serde_json::from_slice(&raw)
            .map_err(|e| ForestError::corrupt(format!("manifest: {e}")))?;
        if manifest.format_version != FORMAT_VERSION {
            return Err(ForestError::corrupt(format!(
                "unsupported manifest format version {}",
                manifest.format_version
            )));
        }
        if manifest.namespace != self.config.namespace {
            return Err(ForestError::corrupt(format!(
                "manifest belongs to namespace {:?}",
                manifest.namespace
            )));
        }
        Ok(Some(manifest))
    }

    /// Sequence numbers of every artifact present, ascending.
    ///
    /// Includes unpublished leftovers of failed publishes. Not a source of
    /// truth for the current version; use [`IndexStore::manifest`].
    pub fn versions(&self) -> Result<Vec<u64>> {
        let prefix = self.artifact_prefix();
        let mut out: Vec<u64> = self
            .blobs
            .list(&prefix)
            .map_err(ForestError::StorageRead)?
            .iter()
            .filter_map(|key| {
                key.strip_prefix(&prefix)?
                    .strip_suffix(ARTIFACT_EXT)?
                    .parse()
                    .ok()
            })
            .collect();
        out.sort_unstable();
        Ok(out)
    }

    /// Persist `forest` as a new version and make it current.
    ///
    /// If the artifact write fails the manifest is never touched and readers
    /// keep seeing the previous version.
    pub fn publish(&self, forest: &Forest) -> Result<ForestVersion> {
        let _guard = self.publish_lock.lock();

        let current = self.manifest()?.map(|m| m.current.sequence).unwrap_or(0);
        let highest = self.versions()?.last().copied().unwrap_or(0);
        let sequence = current.max(highest) + 1;

        let bytes = forest.to_bytes();
        let version = ForestVersion {
            sequence,
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default(),
            checksum: crc32fast::hash(&bytes),
            size_bytes: bytes.len() as u64,
            dimension: forest.dimension() as u32,
            num_vectors: forest.len() as u64,
            n_trees: forest.trees().len() as u32,
        };

        let key = self.artifact_key(sequence);
        self.blobs
            .put(&key, &bytes)
            .map_err(ForestError::StorageWrite)?;
        debug!(key = %key, bytes = bytes.len(), "artifact written");

        let manifest = Manifest {
            format_version: FORMAT_VERSION,
            namespace: self.config.namespace.clone(),
            current: version.clone(),
        };
        let raw = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| ForestError::StorageWrite(PersistenceError::from(e)))?;
        self.blobs
            .put(&self.manifest_key(), &raw)
            .map_err(ForestError::StorageWrite)?;

        info!(
            namespace = %self.config.namespace,
            version = %version,
            bytes = version.size_bytes,
            checksum = %format!("{:08x}", version.checksum),
            "forest published"
        );
        Ok(version)
    }

    /// Load the version the manifest names.
    pub fn load_latest(&self) -> Result<LoadedForest> {
        let manifest = self.manifest()?.ok_or(ForestError::NoPublishedVersion)?;
        let version = manifest.current;
        let bytes = self
            .blobs
            .get(&self.artifact_key(version.sequence))
            .map_err(ForestError::StorageRead)?
            .ok_or_else(|| {
                ForestError::StorageRead(PersistenceError::NotFound(
                    self.artifact_key(version.sequence),
                ))
            })?;

        if bytes.len() as u64 != version.size_bytes || crc32fast::hash(&bytes) != version.checksum
        {
            return Err(ForestError::corrupt(format!(
                "artifact {version} does not match its manifest entry"
            )));
        }
        let forest = Forest::from_bytes(&bytes)?;
        info!(namespace = %self.config.namespace, version = %version, "forest loaded");
        Ok(LoadedForest { version, forest })
    }

    /// Load a specific version by sequence number.
    pub fn load_version(&self, sequence: u64) -> Result<Forest> {
        let bytes = self
            .blobs
            .get(&self.artifact_key(sequence))
            .map_err(ForestError::StorageRead)?
            .ok_or(ForestError::VersionNotFound(sequence))?;
        Forest::from_bytes(&bytes)
    }

    /// Delete superseded artifacts beyond the newest `retain_versions`.
    ///
    /// Best effort: individual delete failures are logged and reported, not
    /// returned. The current version and anything newer than it (an in-flight
    /// or failed publish) are never deleted.
    pub fn collect_garbage(&self) -> Result<GcReport> {
        let _guard = self.publish_lock.lock();

        let Some(manifest) = self.manifest()? else {
            return Ok(GcReport::default());
        };
        let current = manifest.current.sequence;
        let mut older: Vec<u64> = self
            .versions()?
            .into_iter()
            .filter(|&s| s < current)
            .collect();
        older.reverse();

        let mut report = GcReport {
            kept: vec![current],
            ..GcReport::default()
        };
        for (rank, sequence) in older.into_iter().enumerate() {
            if rank + 1 < self.config.retain_versions {
                report.kept.push(sequence);
                continue;
            }
            match self.blobs.delete(&self.artifact_key(sequence)) {
                Ok(()) => report.deleted.push(sequence),
                Err(e) => {
                    warn!(sequence, error = %e, "failed to delete superseded artifact");
                    report.failed.push(sequence);
                }
            }
        }
        report.kept.sort_unstable();
        report.deleted.sort_unstable();

        debug!(
            kept = report.kept.len(),
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            "garbage collection finished"
        );
        Ok(report)
    }
}
