//! Durable storage for forests.
//!
//! - [`blob_store`]: byte storage backends (`BlobStore` trait, file and memory impls)
//! - [`format`]: the single-artifact binary codec for a [`crate::forest::Forest`]
//! - [`store`]: versioned publish/load through a single manifest object
//!
//! # Guarantees
//!
//! - **Atomic publish**: the manifest is written only after the artifact is
//!   fully stored; a failed publish leaves the previous version current.
//! - **Integrity**: artifacts carry a CRC32 footer and the manifest records the
//!   artifact checksum; any mismatch is a corrupt artifact, never a partial load.
//! - **Immutability**: an artifact key is never rewritten once a manifest has
//!   referenced it.

pub mod blob_store;
pub mod error;
pub mod format;
pub mod store;

pub use blob_store::{BlobStore, FileBlobStore, MemoryBlobStore};
pub use error::{PersistenceError, PersistenceResult};
pub use format::Persistable;
pub use store::{ForestVersion, GcReport, IndexStore, LoadedForest, Manifest, StoreConfig};
