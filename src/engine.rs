//! Serving layer: the current forest snapshot and the build/query surface.
//!
//! [`QueryEngine`] holds one `Arc<Forest>` (with its version) behind an
//! `ArcSwapOption`. Queries load the pointer once and run against that
//! snapshot without locks; a swap never waits for queries and in-flight
//! queries keep their old snapshot.
//!
//! [`IndexService`] ties a [`ForestBuilder`], an [`IndexStore`] and a
//! [`QueryEngine`] together into the two operations a request handler needs:
//! build-and-publish, and query-by-entity.

use crate::error::{ForestError, Result};
use crate::forest::{Forest, ForestBuilder, ForestParams, Neighbor, QueryTarget, SearchBudget};
use crate::persistence::{ForestVersion, IndexStore, LoadedForest};
use crate::source::VectorSource;
use arc_swap::ArcSwapOption;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// An installed forest and the version it was loaded from, swapped as one unit.
struct Snapshot {
    forest: Arc<Forest>,
    version: Option<ForestVersion>,
}

fn supersedes(candidate: &Snapshot, current: Option<&Snapshot>) -> bool {
    let Some(current) = current else {
        return true;
    };
    match (&candidate.version, &current.version) {
        (Some(new), Some(old)) => new.sequence > old.sequence,
        (Some(_), None) => true,
        (None, Some(_)) => false,
        (None, None) => true,
    }
}

/// Answers k-NN queries against the currently installed forest.
#[derive(Default)]
pub struct QueryEngine {
    current: ArcSwapOption<Snapshot>,
}

impl QueryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_forest(forest: Arc<Forest>) -> Self {
        let engine = Self::new();
        engine.install(forest, None);
        engine
    }

    /// Install a forest unless a newer one is already being served.
    ///
    /// A versioned forest replaces the current one only if its sequence is
    /// higher; an unversioned snapshot counts as older than any version. An
    /// unversioned forest replaces only an unversioned one (or nothing).
    /// Returns whether the swap happened.
    pub fn install(&self, forest: Arc<Forest>, version: Option<ForestVersion>) -> bool {
        let candidate = Arc::new(Snapshot { forest, version });
        let previous = self.current.rcu(|current| {
            if supersedes(&candidate, current.as_deref()) {
                Some(Arc::clone(&candidate))
            } else {
                current.clone()
            }
        });

        if !supersedes(&candidate, previous.as_deref()) {
            debug!(
                offered = ?candidate.version.as_ref().map(|v| v.sequence),
                current = ?previous.as_ref().and_then(|s| s.version.as_ref()).map(|v| v.sequence),
                "not installing older forest"
            );
            return false;
        }
        match &candidate.version {
            Some(version) => {
                info!(version = %version, vectors = candidate.forest.len(), "installed forest")
            }
            None => info!(vectors = candidate.forest.len(), "installed unversioned forest"),
        }
        true
    }

    /// The forest queries would use right now.
    pub fn snapshot(&self) -> Option<Arc<Forest>> {
        self.current.load_full().map(|s| Arc::clone(&s.forest))
    }

    /// Version of the installed forest, if it came from a store.
    pub fn version(&self) -> Option<ForestVersion> {
        self.current.load_full().and_then(|s| s.version.clone())
    }

    /// Load the manifest's current version and install it.
    ///
    /// Returns the version being served afterwards, which stays the same when
    /// the loaded one is not newer. On any error the previously installed
    /// forest stays in service.
    pub fn refresh(&self, store: &IndexStore) -> Result<ForestVersion> {
        match store.load_latest() {
            Ok(loaded) => {
                let LoadedForest { version, forest } = loaded;
                if self.install(Arc::new(forest), Some(version.clone())) {
                    return Ok(version);
                }
                Ok(self.version().unwrap_or(version))
            }
            Err(e) => {
                if self.current.load().is_some() {
                    warn!(error = %e, "refresh failed, keeping current forest");
                }
                Err(e)
            }
        }
    }

    pub fn query(
        &self,
        target: QueryTarget<'_>,
        k: usize,
        budget: SearchBudget,
    ) -> Result<Vec<Neighbor>> {
        let forest = self.snapshot().ok_or(ForestError::NoPublishedVersion)?;
        forest.search(target, k, budget)
    }

    pub fn query_by_entity(
        &self,
        id: &str,
        k: usize,
        budget: SearchBudget,
    ) -> Result<Vec<Neighbor>> {
        self.query(QueryTarget::Entity(id), k, budget)
    }
}

/// Build, publish and serve one index namespace.
pub struct IndexService {
    builder: ForestBuilder,
    store: IndexStore,
    engine: QueryEngine,
}

impl IndexService {
    pub fn new(params: ForestParams, store: IndexStore) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            builder: ForestBuilder::new(params),
            store,
            engine: QueryEngine::new(),
        })
    }

    pub fn store(&self) -> &IndexStore {
        &self.store
    }

    pub fn engine(&self) -> &QueryEngine {
        &self.engine
    }

    /// Build a forest from `source`, publish it, and serve it.
    ///
    /// Nothing is published if the build fails; the served forest only
    /// changes once the publish has succeeded, and never to an older version
    /// than a concurrent publish or refresh already installed.
    pub fn build_and_publish(&self, source: &dyn VectorSource) -> Result<ForestVersion> {
        let forest = self.builder.build_from_source(source)?;
        let version = self.store.publish(&forest)?;
        self.engine.install(Arc::new(forest), Some(version.clone()));
        Ok(version)
    }

    /// Serve whatever the store's manifest names.
    pub fn refresh(&self) -> Result<ForestVersion> {
        self.engine.refresh(&self.store)
    }

    pub fn query_by_entity(
        &self,
        id: &str,
        k: usize,
        budget: SearchBudget,
    ) -> Result<Vec<Neighbor>> {
        self.engine.query_by_entity(id, k, budget)
    }

    pub fn query_vector(
        &self,
        vector: &[f32],
        k: usize,
        budget: SearchBudget,
    ) -> Result<Vec<Neighbor>> {
        self.engine.query(QueryTarget::Vector(vector), k, budget)
    }
}
