//! canopy: random projection forests for approximate nearest neighbor search.
//!
//! Builds an Annoy-style forest over a fixed set of entity vectors, publishes
//! it as a single versioned artifact, and serves best-first k-NN queries from
//! an immutable, hot-swappable snapshot.
//!
//! - `forest/`: data model, construction, and search
//! - `persistence/`: artifact codec, blob backends, manifest-based publishing
//! - `engine`: serving snapshot and the build/query surface
//! - `source`: vector sources and per-user mean aggregation
//!
//! # Critical Nuances
//!
//! ## Recall Is a Budget, Not a Guarantee
//!
//! The search budget bounds how many leaves are visited. More leaves means more
//! candidates and higher recall, never lower: for a fixed forest and query the
//! visit order is deterministic, so a larger budget visits a superset of the
//! leaves a smaller one did.
//!
//! With an unbounded budget every leaf of every tree is visited, which makes the
//! result exact. That is a property of draining the queue, not of the tree
//! structure, and costs a full scan.
//!
//! ## Duplicate Vectors
//!
//! Coincident points cannot be separated by any hyperplane. The builder retries
//! a bounded number of random splits and then halves the point list by
//! position, so construction always terminates with leaves within the size
//! limit.
//!
//! ## Latest Means the Manifest
//!
//! "Current version" is whatever the namespace's manifest object names. It is
//! never inferred from listing artifacts or comparing timestamps, so a reader
//! cannot combine pieces of two different publishes.

pub mod distance;
pub mod engine;
pub mod error;
pub mod forest;
pub mod persistence;
pub mod source;

// Re-exports
pub use engine::{IndexService, QueryEngine};
pub use error::{ForestError, Result};
pub use forest::{
    Forest, ForestBuilder, ForestParams, ForestStats, Neighbor, QueryTarget, SearchBudget,
};
pub use persistence::{ForestVersion, IndexStore, StoreConfig};
pub use source::{InMemorySource, MeanAggregator, VectorSource};
