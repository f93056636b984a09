//! Vector sources: where entity vectors come from.
//!
//! The forest only needs a snapshot mapping entity id to a fixed-length vector.
//! [`InMemorySource`] is the plain map; [`MeanAggregator`] derives per-user
//! vectors by averaging the vectors of the items each user saved.

use crate::error::{ForestError, Result};
use std::collections::BTreeMap;
use tracing::debug;

/// Snapshot of entity vectors supplied once per build.
pub trait VectorSource {
    /// Declared dimensionality (`N`) every vector must have.
    fn dimension(&self) -> usize;

    /// All `(entity id, vector)` pairs.
    fn entries(&self) -> Box<dyn Iterator<Item = (&str, &[f32])> + '_>;

    fn len(&self) -> usize {
        self.entries().count()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ordered in-memory source.
///
/// Iteration is by id, so internal indices are assigned deterministically.
#[derive(Clone, Debug, Default)]
pub struct InMemorySource {
    dimension: usize,
    vectors: BTreeMap<String, Vec<f32>>,
}

impl InMemorySource {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            vectors: BTreeMap::new(),
        }
    }

    /// Insert or replace an entity's vector. Length is checked at build time.
    pub fn insert(&mut self, id: impl Into<String>, vector: Vec<f32>) -> Option<Vec<f32>> {
        self.vectors.insert(id.into(), vector)
    }

    pub fn get(&self, id: &str) -> Option<&[f32]> {
        self.vectors.get(id).map(Vec::as_slice)
    }
}

impl VectorSource for InMemorySource {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn entries(&self) -> Box<dyn Iterator<Item = (&str, &[f32])> + '_> {
        Box::new(
            self.vectors
                .iter()
                .map(|(id, v)| (id.as_str(), v.as_slice())),
        )
    }

    fn len(&self) -> usize {
        self.vectors.len()
    }
}

/// Builds user vectors as the mean of their items' vectors.
///
/// Items whose vector is entirely zero carry no signal and are ignored. A
/// user with no usable items gets the zero vector of the configured
/// dimension, so every user stays queryable.
#[derive(Clone, Debug)]
pub struct MeanAggregator {
    dimension: usize,
    items: BTreeMap<String, Vec<f32>>,
}

impl MeanAggregator {
    pub fn new(dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(ForestError::InvalidParameter(
                "aggregator dimension must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            dimension,
            items: BTreeMap::new(),
        })
    }

    /// Register an item vector. All-zero vectors are dropped.
    pub fn add_item(&mut self, id: impl Into<String>, vector: Vec<f32>) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(ForestError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        if vector.iter().any(|&x| x != 0.0) {
            self.items.insert(id.into(), vector);
        }
        Ok(())
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    /// Aggregate `user -> [item ids]` into a source of user vectors.
    ///
    /// Unknown item ids are ignored.
    pub fn aggregate<U, I, S>(&self, users: U) -> InMemorySource
    where
        U: IntoIterator<Item = (S, I)>,
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut source = InMemorySource::new(self.dimension);
        let mut empty_users = 0usize;

        for (user, item_ids) in users {
            let mut sum = vec![0.0f32; self.dimension];
            let mut count = 0usize;
            for item in item_ids {
                if let Some(v) = self.items.get(item.as_ref()) {
                    sum.iter_mut().zip(v).for_each(|(s, x)| *s += x);
                    count += 1;
                }
            }
            if count == 0 {
                empty_users += 1;
            } else {
                let n = count as f32;
                sum.iter_mut().for_each(|s| *s /= n);
            }
            source.insert(user.as_ref(), sum);
        }

        debug!(
            users = source.len(),
            empty_users,
            items = self.items.len(),
            "aggregated user vectors"
        );
        source
    }
}
