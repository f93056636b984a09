//! Blob storage for index artifacts.
//!
//! Provides a trait-based interface over durable object storage. Keys are
//! `/`-separated relative paths (`recs/forests/00000000000000000001.forest`).
//!
//! Backends must make a single `put` atomic: a reader sees either the old
//! object or the complete new one, never a prefix. The manifest protocol in
//! [`crate::persistence::store`] relies on this for the manifest object only.
//!
//! This module provides:
//! 1. `BlobStore` trait for abstraction
//! 2. `FileBlobStore` (local directory, write-to-temp then rename)
//! 3. `MemoryBlobStore` (tests, embedded use)

use crate::persistence::error::{PersistenceError, PersistenceResult};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Trait for blob storage backends.
pub trait BlobStore: Send + Sync {
    /// Store a blob under `key`, replacing any previous value atomically.
    ///
    /// # Returns
    /// Error if storage fails (e.g., disk full, permission denied)
    fn put(&self, key: &str, blob: &[u8]) -> PersistenceResult<()>;

    /// Retrieve a blob by key.
    ///
    /// # Returns
    /// `Ok(Some(blob))` if found, `Ok(None)` if not found, `Err` on error
    fn get(&self, key: &str) -> PersistenceResult<Option<Vec<u8>>>;

    /// Delete a blob by key. Deleting a missing blob succeeds.
    fn delete(&self, key: &str) -> PersistenceResult<()>;

    /// Keys starting with `prefix`, sorted by name.
    fn list(&self, prefix: &str) -> PersistenceResult<Vec<String>>;

    /// Check if a blob exists.
    fn exists(&self, key: &str) -> PersistenceResult<bool> {
        self.get(key).map(|opt| opt.is_some())
    }
}

/// Reject keys that could escape the store root.
fn validate_key(key: &str) -> PersistenceResult<()> {
    let bad_segment = key
        .split('/')
        .any(|s| s.is_empty() || s == "." || s == ".." || s.contains('\\'));
    if key.is_empty() || bad_segment || key.ends_with(".tmp") {
        return Err(PersistenceError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// File-based blob storage implementation.
///
/// Each key maps to a file under `base_path`, using the key's `/` segments as
/// directories.
pub struct FileBlobStore {
    base_path: PathBuf,
}

impl FileBlobStore {
    /// Create a new file-based blob store.
    ///
    /// # Errors
    /// Returns error if directory cannot be created or is not writable
    pub fn new<P: AsRef<Path>>(base_path: P) -> PersistenceResult<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_path).map_err(PersistenceError::Io)?;

        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn key_to_path(&self, key: &str) -> PersistenceResult<PathBuf> {
        validate_key(key)?;
        Ok(key
            .split('/')
            .fold(self.base_path.clone(), |path, segment| path.join(segment)))
    }

    fn collect_keys(&self, dir: &Path, rel: &str, out: &mut Vec<String>) -> PersistenceResult<()> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(PersistenceError::Io(e)),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let key = if rel.is_empty() {
                name
            } else {
                format!("{rel}/{name}")
            };
            if entry.file_type()?.is_dir() {
                self.collect_keys(&entry.path(), &key, out)?;
            } else if !key.ends_with(".tmp") {
                out.push(key);
            }
        }
        Ok(())
    }
}

impl BlobStore for FileBlobStore {
    fn put(&self, key: &str, blob: &[u8]) -> PersistenceResult<()> {
        let path = self.key_to_path(key)?;

        // Create parent directories
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(PersistenceError::Io)?;
        }

        // Write to a temp file, fsync, then rename over the target
        let mut temp_name = path.as_os_str().to_owned();
        temp_name.push(".tmp");
        let temp_path = PathBuf::from(temp_name);
        {
            use std::io::Write;
            let mut file = std::fs::File::create(&temp_path)?;
            file.write_all(blob)?;
            file.sync_all()?;
        }

        if let Err(e) = std::fs::rename(&temp_path, &path) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(PersistenceError::Io(e));
        }

        Ok(())
    }

    fn get(&self, key: &str) -> PersistenceResult<Option<Vec<u8>>> {
        let path = self.key_to_path(key)?;

        match std::fs::read(&path) {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PersistenceError::Io(e)),
        }
    }

    fn delete(&self, key: &str) -> PersistenceResult<()> {
        let path = self.key_to_path(key)?;

        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()), // Already deleted
            Err(e) => Err(PersistenceError::Io(e)),
        }
    }

    fn list(&self, prefix: &str) -> PersistenceResult<Vec<String>> {
        let mut keys = Vec::new();
        self.collect_keys(&self.base_path, "", &mut keys)?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }
}

/// In-memory blob storage.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, key: &str, blob: &[u8]) -> PersistenceResult<()> {
        validate_key(key)?;
        self.blobs.write().insert(key.to_string(), blob.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> PersistenceResult<Option<Vec<u8>>> {
        validate_key(key)?;
        Ok(self.blobs.read().get(key).cloned())
    }

    fn delete(&self, key: &str) -> PersistenceResult<()> {
        validate_key(key)?;
        self.blobs.write().remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> PersistenceResult<Vec<String>> {
        Ok(self
            .blobs
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}
