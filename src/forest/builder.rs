//! Forest construction.
//!
//! Trees are built independently (in parallel with rayon), each from its own
//! `StdRng` whose seed is drawn up front from the master seed, so a fixed
//! [`ForestParams::seed`] reproduces the same forest regardless of thread
//! scheduling.
//!
//! Partitioning uses an explicit work stack of `(items, slot)` pairs instead of
//! recursion; heavily duplicated inputs produce very unbalanced trees and must
//! not grow the call stack.

use super::{Forest, ForestParams, IdentifierTable, InternalIndex, LeafItems, Node, NodeId, Tree};
use crate::distance;
use crate::error::{ForestError, Result};
use crate::source::VectorSource;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tracing::{debug, info, warn};

/// Random pairs tried before falling back to a balanced index split.
pub const MAX_SPLIT_ATTEMPTS: usize = 8;

/// Builds [`Forest`]s from entity vectors.
#[derive(Clone, Debug, Default)]
pub struct ForestBuilder {
    params: ForestParams,
}

/// A chosen split of one node's items.
struct SplitPlan {
    normal: Vec<f32>,
    offset: f32,
    left: Vec<InternalIndex>,
    right: Vec<InternalIndex>,
}

impl ForestBuilder {
    pub fn new(params: ForestParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &ForestParams {
        &self.params
    }

    /// Build a forest from `(entity id, vector)` pairs.
    ///
    /// The dimension is taken from the first usable vector. Vectors with
    /// non-finite components are skipped.
    ///
    /// # Errors
    ///
    /// - `EmptyInput` if no usable vector remains
    /// - `DimensionMismatch` if a vector's length differs from the first one
    /// - `DuplicateEntity` if an id repeats
    pub fn build<I, K>(&self, entries: I) -> Result<Forest>
    where
        I: IntoIterator<Item = (K, Vec<f32>)>,
        K: Into<String>,
    {
        self.params.validate()?;

        let mut dimension = None;
        let mut ids = IdentifierTable::new();
        let mut vectors = Vec::new();

        for (id, vector) in entries {
            let id = id.into();
            let expected = *dimension.get_or_insert(vector.len());
            if vector.len() != expected {
                return Err(ForestError::DimensionMismatch {
                    expected,
                    actual: vector.len(),
                });
            }
            if !distance::is_finite(&vector) {
                warn!(entity = %id, "skipping entity with non-finite vector");
                continue;
            }
            ids.push(id)?;
            vectors.extend_from_slice(&vector);
        }

        match dimension {
            Some(0) => Err(ForestError::InvalidParameter(
                "vectors must have at least one component".to_string(),
            )),
            Some(dimension) if !ids.is_empty() => self.assemble(dimension, vectors, ids),
            _ => Err(ForestError::EmptyInput),
        }
    }

    /// Build a forest from a [`VectorSource`], checking each vector against the
    /// source's declared dimension.
    pub fn build_from_source(&self, source: &dyn VectorSource) -> Result<Forest> {
        let dimension = source.dimension();
        if dimension == 0 {
            return Err(ForestError::InvalidParameter(
                "source dimension must be at least 1".to_string(),
            ));
        }
        let mut entries = Vec::new();
        for (id, vector) in source.entries() {
            if vector.len() != dimension {
                return Err(ForestError::DimensionMismatch {
                    expected: dimension,
                    actual: vector.len(),
                });
            }
            entries.push((id.to_string(), vector.to_vec()));
        }
        self.build(entries)
    }

    fn assemble(&self, dimension: usize, vectors: Vec<f32>, ids: IdentifierTable) -> Result<Forest> {
        let seed = self.params.seed.unwrap_or_else(|| rand::rng().random());
        let mut master = StdRng::seed_from_u64(seed);
        let tree_seeds: Vec<u64> = (0..self.params.n_trees).map(|_| master.random()).collect();

        let num_items = ids.len();
        let trees: Vec<Tree> = tree_seeds
            .into_par_iter()
            .enumerate()
            .map(|(tree_idx, tree_seed)| {
                let tree = build_tree(
                    &vectors,
                    dimension,
                    num_items,
                    self.params.leaf_size,
                    &mut StdRng::seed_from_u64(tree_seed),
                );
                debug!(
                    tree = tree_idx,
                    nodes = tree.node_count(),
                    depth = tree.depth(),
                    "built tree"
                );
                tree
            })
            .collect();

        info!(
            vectors = num_items,
            dimension,
            trees = trees.len(),
            leaf_size = self.params.leaf_size,
            "forest built"
        );

        Ok(Forest {
            dimension,
            leaf_size: self.params.leaf_size,
            vectors,
            ids,
            trees,
        })
    }
}

/// Build one tree over `0..num_items`.
fn build_tree(
    vectors: &[f32],
    dimension: usize,
    num_items: usize,
    leaf_size: usize,
    rng: &mut StdRng,
) -> Tree {
    let placeholder = || Node::Leaf {
        items: LeafItems::new(),
    };
    let mut nodes = vec![placeholder()];
    let mut work: Vec<(Vec<InternalIndex>, NodeId)> =
        vec![((0..num_items as InternalIndex).collect(), Tree::ROOT)];

    while let Some((items, slot)) = work.pop() {
        if items.len() <= leaf_size {
            nodes[slot as usize] = Node::Leaf {
                items: LeafItems::from_vec(items),
            };
            continue;
        }

        let plan = plan_split(vectors, dimension, &items, rng);
        let left = nodes.len() as NodeId;
        let right = left + 1;
        nodes.push(placeholder());
        nodes.push(placeholder());
        nodes[slot as usize] = Node::Split {
            normal: plan.normal,
            offset: plan.offset,
            left,
            right,
        };
        work.push((plan.right, right));
        work.push((plan.left, left));
    }

    Tree::from_nodes(nodes)
}

/// Choose a hyperplane for `items` (len >= 2).
///
/// Tries up to [`MAX_SPLIT_ATTEMPTS`] random bisectors; if every one leaves a
/// side empty (coincident points), splits the list in half by position under a
/// zero normal.
fn plan_split(
    vectors: &[f32],
    dimension: usize,
    items: &[InternalIndex],
    rng: &mut StdRng,
) -> SplitPlan {
    let row = |i: InternalIndex| {
        let start = i as usize * dimension;
        &vectors[start..start + dimension]
    };

    for _ in 0..MAX_SPLIT_ATTEMPTS {
        let a = rng.random_range(0..items.len());
        let mut b = rng.random_range(0..items.len() - 1);
        if b >= a {
            b += 1;
        }
        let (pa, pb) = (row(items[a]), row(items[b]));

        let mut normal: Vec<f32> = pb.iter().zip(pa).map(|(y, x)| y - x).collect();
        let len = distance::norm(&normal);
        if len <= f32::EPSILON || !len.is_finite() {
            continue;
        }
        normal.iter_mut().for_each(|v| *v /= len);
        let midpoint: Vec<f32> = pa.iter().zip(pb).map(|(x, y)| (x + y) * 0.5).collect();
        let offset = distance::dot(&normal, &midpoint);

        let (right, left): (Vec<InternalIndex>, Vec<InternalIndex>) = items
            .iter()
            .partition(|&&i| distance::margin(&normal, offset, row(i)) > 0.0);

        if !left.is_empty() && !right.is_empty() {
            return SplitPlan {
                normal,
                offset,
                left,
                right,
            };
        }
    }

    warn!(
        items = items.len(),
        "no separating hyperplane found, splitting by position"
    );
    let mid = items.len() / 2;
    SplitPlan {
        normal: vec![0.0; dimension],
        offset: 0.0,
        left: items[..mid].to_vec(),
        right: items[mid..].to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(n_trees: usize, leaf_size: usize) -> ForestParams {
        ForestParams {
            n_trees,
            leaf_size,
            seed: Some(42),
        }
    }

    fn grid(n: usize) -> Vec<(String, Vec<f32>)> {
        (0..n)
            .map(|i| {
                (
                    format!("e{i}"),
                    vec![(i % 7) as f32, (i / 7) as f32, (i * 3 % 5) as f32],
                )
            })
            .collect()
    }

    fn assert_partition(forest: &Forest) {
        for tree in forest.trees() {
            let mut seen: Vec<InternalIndex> =
                tree.leaves().into_iter().flatten().copied().collect();
            seen.sort_unstable();
            let expected: Vec<InternalIndex> = (0..forest.len() as InternalIndex).collect();
            assert_eq!(seen, expected);
        }
    }

    #[test]
    fn empty_input_is_rejected() {
        let builder = ForestBuilder::new(params(3, 2));
        let err = builder.build(Vec::<(String, Vec<f32>)>::new()).unwrap_err();
        assert!(matches!(err, ForestError::EmptyInput));
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let builder = ForestBuilder::new(params(3, 2));
        let err = builder
            .build(vec![("a", vec![0.0, 1.0]), ("b", vec![1.0])])
            .unwrap_err();
        assert!(matches!(
            err,
            ForestError::DimensionMismatch {
                expected: 2,
                actual: 1
            }
        ));
    }

    #[test]
    fn zero_dimension_is_rejected() {
        let builder = ForestBuilder::new(params(1, 1));
        let err = builder.build(vec![("a", Vec::new())]).unwrap_err();
        assert!(matches!(err, ForestError::InvalidParameter(_)));
    }

    #[test]
    fn non_finite_vectors_are_skipped() {
        let builder = ForestBuilder::new(params(2, 1));
        let forest = builder
            .build(vec![
                ("a", vec![0.0, 0.0]),
                ("bad", vec![f32::NAN, 0.0]),
                ("b", vec![1.0, 1.0]),
            ])
            .unwrap();
        assert_eq!(forest.len(), 2);
        assert!(forest.identifiers().index_of("bad").is_none());

        let err = builder.build(vec![("bad", vec![f32::INFINITY])]).unwrap_err();
        assert!(matches!(err, ForestError::EmptyInput));
    }

    #[test]
    fn leaves_respect_threshold_and_partition() {
        let forest = ForestBuilder::new(params(4, 3)).build(grid(60)).unwrap();
        assert_eq!(forest.trees().len(), 4);
        assert_partition(&forest);
        for tree in forest.trees() {
            assert!(tree.leaves().iter().all(|l| !l.is_empty() && l.len() <= 3));
        }
    }

    #[test]
    fn duplicate_points_terminate() {
        let entries: Vec<(String, Vec<f32>)> = (0..200)
            .map(|i| (format!("dup{i}"), vec![1.0, 2.0, 3.0]))
            .collect();
        let forest = ForestBuilder::new(params(2, 1)).build(entries).unwrap();
        assert_partition(&forest);
        for tree in forest.trees() {
            assert!(tree.leaves().iter().all(|l| l.len() == 1));
            // Balanced fallback keeps duplicate runs logarithmic.
            assert!(tree.depth() <= 8);
        }
    }

    #[test]
    fn same_seed_same_forest() {
        let a = ForestBuilder::new(params(3, 2)).build(grid(40)).unwrap();
        let b = ForestBuilder::new(params(3, 2)).build(grid(40)).unwrap();
        assert_eq!(a.trees(), b.trees());
    }

    #[test]
    fn split_normals_are_unit_length() {
        let forest = ForestBuilder::new(params(2, 2)).build(grid(30)).unwrap();
        for tree in forest.trees() {
            for node in &tree.nodes {
                if let Node::Split { normal, .. } = node {
                    let n = distance::norm(normal);
                    assert!(n == 0.0 || (n - 1.0).abs() < 1e-4, "norm {n}");
                }
            }
        }
    }

    #[test]
    fn build_from_source_checks_declared_dimension() {
        use crate::source::InMemorySource;

        let mut source = InMemorySource::new(3);
        source.insert("a", vec![0.0, 0.0, 0.0]);
        source.insert("b", vec![1.0, 0.0]);
        let err = ForestBuilder::new(params(1, 1))
            .build_from_source(&source)
            .unwrap_err();
        assert!(matches!(
            err,
            ForestError::DimensionMismatch {
                expected: 3,
                actual: 2
            }
        ));
    }
}
