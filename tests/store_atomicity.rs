//! Publish atomicity and durability tests.
//!
//! Injects storage failures at each step of the publish protocol and checks
//! that readers only ever observe complete, previously published versions.

use canopy::persistence::{
    BlobStore, FileBlobStore, MemoryBlobStore, PersistenceError, PersistenceResult,
};
use canopy::{
    ForestBuilder, ForestError, ForestParams, IndexService, IndexStore, InMemorySource,
    QueryEngine, SearchBudget, StoreConfig,
};
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use tempfile::TempDir;

/// Wraps a blob store and fails writes whose key matches a pattern.
struct FlakyStore {
    inner: MemoryBlobStore,
    fail_puts_containing: Mutex<Option<String>>,
    fail_deletes: Mutex<bool>,
}

impl FlakyStore {
    fn new() -> Self {
        Self {
            inner: MemoryBlobStore::new(),
            fail_puts_containing: Mutex::new(None),
            fail_deletes: Mutex::new(false),
        }
    }

    fn fail_puts(&self, pattern: Option<&str>) {
        *self.fail_puts_containing.lock() = pattern.map(str::to_string);
    }

    fn fail_deletes(&self, fail: bool) {
        *self.fail_deletes.lock() = fail;
    }

    fn injected() -> PersistenceError {
        PersistenceError::Io(io::Error::new(io::ErrorKind::Other, "injected failure"))
    }
}

impl BlobStore for FlakyStore {
    fn put(&self, key: &str, blob: &[u8]) -> PersistenceResult<()> {
        if let Some(pattern) = self.fail_puts_containing.lock().as_deref() {
            if key.contains(pattern) {
                return Err(Self::injected());
            }
        }
        self.inner.put(key, blob)
    }

    fn get(&self, key: &str) -> PersistenceResult<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn delete(&self, key: &str) -> PersistenceResult<()> {
        if *self.fail_deletes.lock() {
            return Err(Self::injected());
        }
        self.inner.delete(key)
    }

    fn list(&self, prefix: &str) -> PersistenceResult<Vec<String>> {
        self.inner.list(prefix)
    }
}

fn params() -> ForestParams {
    ForestParams {
        n_trees: 3,
        leaf_size: 2,
        seed: Some(11),
    }
}

fn source(offset: f32) -> InMemorySource {
    let mut source = InMemorySource::new(3);
    for i in 0..20 {
        let x = i as f32 + offset;
        source.insert(format!("item{i}"), vec![x, x * 0.5, -x]);
    }
    source
}

// =============================================================================
// Failed publishes
// =============================================================================

/// A failed artifact write must not move the manifest.
#[test]
fn failed_artifact_write_keeps_previous_version() {
    let blobs = Arc::new(FlakyStore::new());
    let store = IndexStore::new(blobs.clone(), StoreConfig::default()).expect("store");
    let svc = IndexService::new(params(), store).expect("service");

    let v1 = svc.build_and_publish(&source(0.0)).expect("first publish");

    blobs.fail_puts(Some("/forests/"));
    let err = svc.build_and_publish(&source(100.0)).unwrap_err();
    assert!(matches!(err, ForestError::StorageWrite(_)));
    assert!(!err.is_input_error());

    let loaded = svc.store().load_latest().expect("load");
    assert_eq!(loaded.version, v1);
    assert_eq!(svc.engine().version(), Some(v1.clone()));
    assert_eq!(
        loaded.forest.vector_of("item1"),
        Some(&[1.0, 0.5, -1.0][..])
    );
}

/// A failed manifest write leaves an orphan artifact that is never served.
#[test]
fn failed_manifest_write_leaves_unreferenced_artifact() {
    let blobs = Arc::new(FlakyStore::new());
    let store = IndexStore::new(blobs.clone(), StoreConfig::default()).expect("store");
    let svc = IndexService::new(params(), store).expect("service");

    let v1 = svc.build_and_publish(&source(0.0)).expect("first publish");

    blobs.fail_puts(Some("MANIFEST"));
    assert!(matches!(
        svc.build_and_publish(&source(100.0)),
        Err(ForestError::StorageWrite(_))
    ));
    assert_eq!(svc.store().versions().expect("list"), vec![1, 2]);
    assert_eq!(svc.store().load_latest().expect("load").version, v1);

    // The next publish skips past the orphan instead of overwriting it.
    blobs.fail_puts(None);
    let v3 = svc.build_and_publish(&source(200.0)).expect("publish");
    assert_eq!(v3.sequence, 3);
    assert_eq!(svc.store().load_latest().expect("load").version, v3);
}

#[test]
fn reader_keeps_serving_when_refresh_fails() {
    let blobs = Arc::new(FlakyStore::new());
    let store = IndexStore::new(blobs.clone(), StoreConfig::default()).expect("store");
    let forest = ForestBuilder::new(params())
        .build_from_source(&source(0.0))
        .expect("build");
    let v1 = store.publish(&forest).expect("publish");

    let engine = QueryEngine::new();
    engine.refresh(&store).expect("refresh");

    // Corrupt the artifact the manifest points at.
    blobs
        .inner
        .put(&store.artifact_key(v1.sequence), b"CNPY garbage")
        .expect("overwrite");
    assert!(matches!(
        engine.refresh(&store),
        Err(ForestError::CorruptArtifact(_))
    ));
    assert_eq!(engine.version(), Some(v1));

    let fresh = QueryEngine::new();
    assert!(matches!(
        fresh.refresh(&store),
        Err(ForestError::CorruptArtifact(_))
    ));
    assert!(fresh.snapshot().is_none());

    let hits = engine
        .query_by_entity("item3", 2, SearchBudget::Unbounded)
        .expect("query");
    assert_eq!(hits[0].id, "item3");
}

#[test]
fn garbage_collection_reports_failed_deletes() {
    let blobs = Arc::new(FlakyStore::new());
    let store = IndexStore::new(
        blobs.clone(),
        StoreConfig {
            namespace: "gc".to_string(),
            retain_versions: 1,
        },
    )
    .expect("store");
    let forest = ForestBuilder::new(params())
        .build_from_source(&source(0.0))
        .expect("build");
    for _ in 0..3 {
        store.publish(&forest).expect("publish");
    }

    blobs.fail_deletes(true);
    let report = store.collect_garbage().expect("gc");
    assert_eq!(report.kept, vec![3]);
    assert!(report.deleted.is_empty());
    assert_eq!(report.failed.len(), 2);
    assert_eq!(store.versions().expect("list"), vec![1, 2, 3]);

    blobs.fail_deletes(false);
    let report = store.collect_garbage().expect("gc");
    assert_eq!(report.deleted, vec![1, 2]);
    assert_eq!(store.load_latest().expect("load").version.sequence, 3);
}

// =============================================================================
// File-backed store
// =============================================================================

#[test]
fn file_store_survives_reopen() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let config = StoreConfig {
        namespace: "restaurants".to_string(),
        retain_versions: 2,
    };

    let published = {
        let blobs = Arc::new(FileBlobStore::new(dir.path())?);
        let svc = IndexService::new(params(), IndexStore::new(blobs, config.clone())?)?;
        svc.build_and_publish(&source(0.0))?;
        svc.build_and_publish(&source(1.0))?
    };

    assert!(dir.path().join("restaurants").join("MANIFEST").is_file());

    let blobs = Arc::new(FileBlobStore::new(dir.path())?);
    let svc = IndexService::new(params(), IndexStore::new(blobs, config)?)?;
    assert_eq!(svc.refresh()?, published);

    let hits = svc.query_vector(&[1.0, 0.5, -1.0], 1, SearchBudget::Unbounded)?;
    assert_eq!(hits[0].id, "item0");
    assert_eq!(hits[0].distance, 0.0);
    Ok(())
}

#[test]
fn namespaces_are_isolated() -> anyhow::Result<()> {
    let blobs = Arc::new(MemoryBlobStore::new());
    let users = IndexStore::new(
        blobs.clone(),
        StoreConfig {
            namespace: "users".to_string(),
            ..StoreConfig::default()
        },
    )?;
    let places = IndexStore::new(
        blobs,
        StoreConfig {
            namespace: "places".to_string(),
            ..StoreConfig::default()
        },
    )?;

    let forest = ForestBuilder::new(params()).build_from_source(&source(0.0))?;
    users.publish(&forest)?;
    users.publish(&forest)?;

    assert!(places.manifest()?.is_none());
    assert!(places.versions()?.is_empty());
    assert_eq!(places.publish(&forest)?.sequence, 1);
    assert_eq!(users.load_latest()?.version.sequence, 2);
    Ok(())
}
