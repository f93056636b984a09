//! Random projection forest (Annoy-style) approximate nearest neighbor index.
//!
//! A [`Forest`] is `T` independently built binary partition trees over one
//! shared vector table.
//!
//! # Algorithm
//!
//! Each tree splits its point set recursively with a random hyperplane: two
//! distinct points are sampled, and the perpendicular bisector of the segment
//! between them becomes the splitting plane. Recursion stops once a node holds
//! at most `leaf_size` points.
//!
//! At query time all trees are searched together, best first, ordered by how
//! far the query is from the hyperplanes it would have to cross to reach a
//! node. The union of the visited leaves is then ranked exactly.
//!
//! # Layout
//!
//! Nodes live in a contiguous arena per tree, addressed by [`NodeId`]. Vectors
//! are stored row-major in one flat `Vec<f32>` (`index * dimension ..`).
//! Entity ids never appear inside trees; leaves store dense internal indices
//! that the [`IdentifierTable`] maps back to ids.
//!
//! # Usage
//!
//! ```rust
//! use canopy::forest::{ForestBuilder, ForestParams, QueryTarget, SearchBudget};
//!
//! # fn main() -> canopy::Result<()> {
//! let params = ForestParams { n_trees: 5, leaf_size: 1, seed: Some(7) };
//! let forest = ForestBuilder::new(params).build(vec![
//!     ("a", vec![0.0, 0.0]),
//!     ("b", vec![1.0, 0.0]),
//!     ("c", vec![9.0, 9.0]),
//! ])?;
//!
//! let hits = forest.search(QueryTarget::Entity("a"), 2, SearchBudget::Unbounded)?;
//! assert_eq!(hits[0].id, "a");
//! assert_eq!(hits[1].id, "b");
//! # Ok(())
//! # }
//! ```
//!
//! # References
//!
//! - Dasgupta & Freund (2008): "Random projection trees and low dimensional manifolds"
//! - Bernhardsson: Annoy (Approximate Nearest Neighbors Oh Yeah)

pub mod builder;
pub mod search;

pub use builder::{ForestBuilder, MAX_SPLIT_ATTEMPTS};
pub use search::{Neighbor, QueryTarget, SearchBudget};

use crate::distance;
use crate::error::{ForestError, Result};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::HashMap;

/// Dense internal index of an entity inside one forest.
pub type InternalIndex = u32;

/// Index of a node inside a tree's arena.
pub type NodeId = u32;

/// Leaf membership list. Small leaves stay inline.
pub type LeafItems = SmallVec<[InternalIndex; 8]>;

/// Build-time parameters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForestParams {
    /// Number of independent trees (`T`).
    pub n_trees: usize,

    /// Maximum number of points per leaf (`L`).
    pub leaf_size: usize,

    /// Seed for reproducible builds. `None` draws one from the OS.
    pub seed: Option<u64>,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_trees: 10,
            leaf_size: 10,
            seed: None,
        }
    }
}

impl ForestParams {
    pub fn validate(&self) -> Result<()> {
        if self.n_trees == 0 {
            return Err(ForestError::InvalidParameter(
                "n_trees must be at least 1".to_string(),
            ));
        }
        if self.leaf_size == 0 {
            return Err(ForestError::InvalidParameter(
                "leaf_size must be at least 1".to_string(),
            ));
        }
        if self.n_trees > u32::MAX as usize || self.leaf_size > u32::MAX as usize {
            return Err(ForestError::InvalidParameter(
                "n_trees and leaf_size must fit in u32".to_string(),
            ));
        }
        Ok(())
    }
}

/// Tree node.
#[derive(Clone, Debug, PartialEq)]
pub enum Node {
    /// Terminal node holding at most `leaf_size` internal indices.
    Leaf { items: LeafItems },
    /// Splitting hyperplane `<normal, x> = offset`.
    ///
    /// Points with a positive margin live under `right`, everything else under `left`.
    Split {
        normal: Vec<f32>,
        offset: f32,
        left: NodeId,
        right: NodeId,
    },
}

/// One partition tree. The root is always node `0`.
#[derive(Clone, Debug, PartialEq)]
pub struct Tree {
    pub(crate) nodes: Vec<Node>,
}

impl Tree {
    pub const ROOT: NodeId = 0;

    pub(crate) fn from_nodes(nodes: Vec<Node>) -> Self {
        Self { nodes }
    }

    #[inline]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id as usize]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Leaf item lists in left-to-right order.
    pub fn leaves(&self) -> Vec<&[InternalIndex]> {
        let mut out = Vec::new();
        let mut stack = vec![Self::ROOT];
        while let Some(id) = stack.pop() {
            match self.node(id) {
                Node::Leaf { items } => out.push(items.as_slice()),
                Node::Split { left, right, .. } => {
                    stack.push(*right);
                    stack.push(*left);
                }
            }
        }
        out
    }

    /// Number of edges on the longest root-to-leaf path.
    pub fn depth(&self) -> usize {
        let mut max_depth = 0;
        let mut stack = vec![(Self::ROOT, 0usize)];
        while let Some((id, depth)) = stack.pop() {
            match self.node(id) {
                Node::Leaf { .. } => max_depth = max_depth.max(depth),
                Node::Split { left, right, .. } => {
                    stack.push((*left, depth + 1));
                    stack.push((*right, depth + 1));
                }
            }
        }
        max_depth
    }

    /// Check that this tree is a proper binary tree whose leaves partition `0..num_items`.
    ///
    /// Every non-root node must have exactly one parent and be reachable from the root.
    pub(crate) fn validate(&self, num_items: usize, dimension: usize) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(ForestError::corrupt("tree has no nodes"));
        }
        let mut parent_seen = vec![false; self.nodes.len()];
        let mut item_seen = vec![false; num_items];
        let mut covered = 0usize;
        let mut reached = 0usize;
        let mut stack = vec![Self::ROOT];
        parent_seen[0] = true;

        while let Some(id) = stack.pop() {
            reached += 1;
            match self.node(id) {
                Node::Leaf { items } => {
                    for &item in items {
                        let slot = item_seen.get_mut(item as usize).ok_or_else(|| {
                            ForestError::corrupt(format!(
                                "leaf references index {item} but forest has {num_items} vectors"
                            ))
                        })?;
                        if *slot {
                            return Err(ForestError::corrupt(format!(
                                "index {item} appears in more than one leaf of a tree"
                            )));
                        }
                        *slot = true;
                        covered += 1;
                    }
                }
                Node::Split {
                    normal,
                    offset,
                    left,
                    right,
                } => {
                    if normal.len() != dimension {
                        return Err(ForestError::corrupt(format!(
                            "split normal has {} components, expected {dimension}",
                            normal.len()
                        )));
                    }
                    if !offset.is_finite() {
                        return Err(ForestError::corrupt("split offset is not finite"));
                    }
                    if !distance::is_finite(normal) {
                        return Err(ForestError::corrupt("split normal is not finite"));
                    }
                    for child in [*left, *right] {
                        let seen = parent_seen.get_mut(child as usize).ok_or_else(|| {
                            ForestError::corrupt(format!("child node {child} out of range"))
                        })?;
                        if *seen {
                            return Err(ForestError::corrupt(format!(
                                "node {child} is referenced twice"
                            )));
                        }
                        *seen = true;
                        stack.push(child);
                    }
                }
            }
        }

        if reached != self.nodes.len() {
            return Err(ForestError::corrupt(format!(
                "{} nodes unreachable from the root",
                self.nodes.len() - reached
            )));
        }
        if covered != num_items {
            return Err(ForestError::corrupt(format!(
                "tree covers {covered} of {num_items} vectors"
            )));
        }
        Ok(())
    }
}

/// Bijection between dense internal indices and entity ids.
#[derive(Clone, Debug, Default)]
pub struct IdentifierTable {
    ids: Vec<String>,
    lookup: HashMap<String, InternalIndex>,
}

impl IdentifierTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an id, assigning it the next internal index.
    pub fn push(&mut self, id: String) -> Result<InternalIndex> {
        if self.lookup.contains_key(&id) {
            return Err(ForestError::DuplicateEntity(id));
        }
        let index = InternalIndex::try_from(self.ids.len()).map_err(|_| {
            ForestError::InvalidParameter("more entities than fit in u32".to_string())
        })?;
        self.lookup.insert(id.clone(), index);
        self.ids.push(id);
        Ok(index)
    }

    #[inline]
    pub fn id(&self, index: InternalIndex) -> Option<&str> {
        self.ids.get(index as usize).map(String::as_str)
    }

    #[inline]
    pub fn index_of(&self, id: &str) -> Option<InternalIndex> {
        self.lookup.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(String::as_str)
    }
}

/// Statistics about a built forest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForestStats {
    pub num_vectors: usize,
    pub dimension: usize,
    pub n_trees: usize,
    pub leaf_size: usize,
    pub total_nodes: usize,
    pub total_leaves: usize,
    pub max_depth: usize,
    pub size_bytes: usize,
}

/// Immutable ANN index: trees + vector table + identifier table.
#[derive(Clone, Debug)]
pub struct Forest {
    pub(crate) dimension: usize,
    pub(crate) leaf_size: usize,
    pub(crate) vectors: Vec<f32>,
    pub(crate) ids: IdentifierTable,
    pub(crate) trees: Vec<Tree>,
}

impl Forest {
    /// Assemble a forest and check every structural invariant.
    pub(crate) fn from_parts(
        dimension: usize,
        leaf_size: usize,
        vectors: Vec<f32>,
        ids: IdentifierTable,
        trees: Vec<Tree>,
    ) -> Result<Self> {
        if dimension == 0 {
            return Err(ForestError::corrupt("dimension is zero"));
        }
        if ids.is_empty() {
            return Err(ForestError::corrupt("identifier table is empty"));
        }
        if vectors.len() != ids.len() * dimension {
            return Err(ForestError::corrupt(format!(
                "vector table holds {} values, expected {} x {}",
                vectors.len(),
                ids.len(),
                dimension
            )));
        }
        if trees.is_empty() {
            return Err(ForestError::corrupt("forest has no trees"));
        }
        for tree in &trees {
            tree.validate(ids.len(), dimension)?;
        }
        Ok(Self {
            dimension,
            leaf_size,
            vectors,
            ids,
            trees,
        })
    }

    /// Vector dimensionality (`N`).
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of indexed entities (`M`).
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Always false for a successfully built forest.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn leaf_size(&self) -> usize {
        self.leaf_size
    }

    pub fn trees(&self) -> &[Tree] {
        &self.trees
    }

    pub fn identifiers(&self) -> &IdentifierTable {
        &self.ids
    }

    pub fn entity_ids(&self) -> impl Iterator<Item = &str> {
        self.ids.iter()
    }

    /// Vector stored at an internal index.
    #[inline]
    pub fn vector(&self, index: InternalIndex) -> &[f32] {
        let start = index as usize * self.dimension;
        &self.vectors[start..start + self.dimension]
    }

    /// Vector stored for an entity id.
    pub fn vector_of(&self, id: &str) -> Option<&[f32]> {
        self.ids.index_of(id).map(|index| self.vector(index))
    }

    pub fn stats(&self) -> ForestStats {
        let total_nodes = self.trees.iter().map(Tree::node_count).sum();
        let total_leaves = self
            .trees
            .iter()
            .flat_map(|t| t.nodes.iter())
            .filter(|n| matches!(n, Node::Leaf { .. }))
            .count();
        let max_depth = self.trees.iter().map(Tree::depth).max().unwrap_or(0);
        let split_bytes = (total_nodes - total_leaves) * (self.dimension + 1) * 4;
        let leaf_bytes = self.len() * self.trees.len() * 4;
        let id_bytes: usize = self.ids.iter().map(str::len).sum();

        ForestStats {
            num_vectors: self.len(),
            dimension: self.dimension,
            n_trees: self.trees.len(),
            leaf_size: self.leaf_size,
            total_nodes,
            total_leaves,
            max_depth,
            size_bytes: self.vectors.len() * 4 + split_bytes + leaf_bytes + id_bytes,
        }
    }
}
