//! Queries running while publishes and refreshes swap the served forest.
//!
//! Every query must succeed and see exactly one snapshot; the engine must end
//! on the version the manifest names.

use canopy::persistence::MemoryBlobStore;
use canopy::{ForestParams, IndexService, IndexStore, InMemorySource, SearchBudget, StoreConfig};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

fn labelled_source(label: &str, offset: f32) -> InMemorySource {
    let mut source = InMemorySource::new(2);
    for i in 0..50 {
        let x = i as f32 + offset;
        source.insert(format!("{label}-{i}"), vec![x, -x]);
    }
    source
}

fn service(blobs: Arc<MemoryBlobStore>) -> IndexService {
    let store = IndexStore::new(blobs, StoreConfig::default()).expect("store");
    IndexService::new(
        ForestParams {
            n_trees: 4,
            leaf_size: 4,
            seed: Some(5),
        },
        store,
    )
    .expect("service")
}

#[test]
fn readers_see_whole_snapshots_during_publishes() {
    let svc = service(Arc::new(MemoryBlobStore::new()));
    let sources = [labelled_source("red", 0.0), labelled_source("blue", 0.5)];
    svc.build_and_publish(&sources[0]).expect("initial publish");

    let done = AtomicBool::new(false);
    let queries = AtomicUsize::new(0);

    thread::scope(|s| {
        for reader in 0..4 {
            let (svc, done, queries) = (&svc, &done, &queries);
            s.spawn(move || {
                let mut round = 0usize;
                while !done.load(Ordering::Acquire) {
                    let x = ((reader * 7 + round) % 50) as f32;
                    let hits = svc
                        .query_vector(&[x, -x], 5, SearchBudget::Leaves(3))
                        .expect("query during swap");
                    assert!(!hits.is_empty());
                    let label = hits[0].id.split('-').next().unwrap_or_default();
                    assert!(label == "red" || label == "blue", "{}", hits[0].id);
                    assert!(
                        hits.iter().all(|n| n.id.starts_with(label)),
                        "mixed snapshots: {hits:?}"
                    );
                    queries.fetch_add(1, Ordering::Relaxed);
                    round += 1;
                }
            });
        }

        for i in 1..=10 {
            svc.build_and_publish(&sources[i % 2]).expect("publish");
        }
        done.store(true, Ordering::Release);
    });

    assert!(queries.load(Ordering::Relaxed) > 0);
    let manifest = svc.store().manifest().expect("manifest").expect("published");
    assert_eq!(manifest.current.sequence, 11);
    assert_eq!(svc.engine().version(), Some(manifest.current));
}

#[test]
fn racing_publish_and_refresh_end_on_latest() {
    let blobs = Arc::new(MemoryBlobStore::new());
    let writer = service(blobs.clone());
    let reader = service(blobs);
    let sources = [labelled_source("red", 0.0), labelled_source("blue", 0.5)];
    writer.build_and_publish(&sources[0]).expect("initial publish");

    thread::scope(|s| {
        let writer = &writer;
        let sources = &sources;
        s.spawn(move || {
            for i in 1..=8 {
                writer.build_and_publish(&sources[i % 2]).expect("publish");
            }
        });
        for _ in 0..3 {
            let reader = &reader;
            s.spawn(move || {
                let mut last = 0;
                for _ in 0..20 {
                    let served = reader.refresh().expect("refresh").sequence;
                    assert!(served >= last, "went back from v{last} to v{served}");
                    last = served;
                    reader
                        .query_vector(&[3.0, -3.0], 3, SearchBudget::Unbounded)
                        .expect("query");
                }
            });
        }
    });

    reader.refresh().expect("final refresh");
    assert_eq!(reader.engine().version().map(|v| v.sequence), Some(9));
    assert_eq!(writer.engine().version().map(|v| v.sequence), Some(9));
}
