//! Best-first multi-tree search.
//!
//! One priority queue is shared by all trees. A node's priority is the
//! smallest hyperplane distance the query must cross to reach it (0 along the
//! query's own descent path), so the search first walks every tree down to the
//! query's leaf and then backtracks into the nearest unexplored branches of
//! any tree.

use super::{Forest, InternalIndex, Node, NodeId, Tree};
use crate::distance;
use crate::error::{ForestError, Result};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use tracing::debug;

/// How many leaves a query may visit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SearchBudget {
    /// Drain the queue: every leaf of every tree is visited.
    Unbounded,
    /// Stop after this many leaf visits (must be at least 1).
    Leaves(usize),
}

impl SearchBudget {
    /// Map the conventional integer knob onto a budget: negative means unbounded.
    pub fn from_raw(raw: i64) -> Result<Self> {
        match raw {
            r if r < 0 => Ok(SearchBudget::Unbounded),
            0 => Err(ForestError::InvalidParameter(
                "search budget must be at least one leaf".to_string(),
            )),
            r => Ok(SearchBudget::Leaves(r as usize)),
        }
    }

    fn limit(self) -> Result<usize> {
        match self {
            SearchBudget::Unbounded => Ok(usize::MAX),
            SearchBudget::Leaves(0) => Err(ForestError::InvalidParameter(
                "search budget must be at least one leaf".to_string(),
            )),
            SearchBudget::Leaves(n) => Ok(n),
        }
    }
}

/// What to search around.
#[derive(Clone, Copy, Debug)]
pub enum QueryTarget<'a> {
    /// An entity already in the forest; its stored vector is the query.
    Entity(&'a str),
    /// An ad-hoc vector of the forest's dimension.
    Vector(&'a [f32]),
}

/// One search hit.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Neighbor {
    pub id: String,
    /// Euclidean distance to the query.
    pub distance: f32,
}

/// Unexplored node in the shared frontier.
#[derive(Clone, Copy, Debug)]
struct Frontier {
    priority: f32,
    tree: u32,
    node: NodeId,
}

impl PartialEq for Frontier {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Frontier {}

impl Ord for Frontier {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap on priority; (tree, node) makes the visit order total.
        self.priority
            .total_cmp(&other.priority)
            .then(self.tree.cmp(&other.tree))
            .then(self.node.cmp(&other.node))
            .reverse()
    }
}

impl PartialOrd for Frontier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Forest {
    /// Approximate k nearest neighbors of `target`, ascending by distance.
    ///
    /// Ties are broken by internal index. An entity query includes the entity
    /// itself (distance 0).
    ///
    /// # Errors
    ///
    /// - `UnknownEntity` if an entity target is not indexed
    /// - `DimensionMismatch` if a vector target has the wrong length
    /// - `InvalidParameter` for a zero-leaf budget or a non-finite query vector
    pub fn search(
        &self,
        target: QueryTarget<'_>,
        k: usize,
        budget: SearchBudget,
    ) -> Result<Vec<Neighbor>> {
        let query = match target {
            QueryTarget::Entity(id) => self
                .vector_of(id)
                .ok_or_else(|| ForestError::UnknownEntity(id.to_string()))?,
            QueryTarget::Vector(v) => {
                if v.len() != self.dimension {
                    return Err(ForestError::DimensionMismatch {
                        expected: self.dimension,
                        actual: v.len(),
                    });
                }
                if !distance::is_finite(v) {
                    return Err(ForestError::InvalidParameter(
                        "query vector has non-finite components".to_string(),
                    ));
                }
                v
            }
        };
        let max_leaves = budget.limit()?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let candidates = self.collect_candidates(query, max_leaves);
        let mut scored: Vec<(f32, InternalIndex)> = candidates
            .into_iter()
            .map(|i| (distance::l2_distance_squared(query, self.vector(i)), i))
            .collect();
        scored.sort_unstable_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .filter_map(|(d, i)| {
                self.ids.id(i).map(|id| Neighbor {
                    id: id.to_string(),
                    distance: d.sqrt(),
                })
            })
            .collect())
    }

    /// Distinct internal indices found in the first `max_leaves` leaves visited.
    pub(crate) fn collect_candidates(&self, query: &[f32], max_leaves: usize) -> Vec<InternalIndex> {
        let mut frontier: BinaryHeap<Frontier> = (0..self.trees.len())
            .map(|t| Frontier {
                priority: 0.0,
                tree: t as u32,
                node: Tree::ROOT,
            })
            .collect();
        let mut seen = vec![false; self.len()];
        let mut candidates = Vec::new();
        let mut leaves_visited = 0usize;

        while leaves_visited < max_leaves {
            let Some(Frontier {
                priority,
                tree,
                node,
            }) = frontier.pop()
            else {
                break;
            };

            match self.trees[tree as usize].node(node) {
                Node::Leaf { items } => {
                    leaves_visited += 1;
                    for &item in items {
                        if !std::mem::replace(&mut seen[item as usize], true) {
                            candidates.push(item);
                        }
                    }
                }
                Node::Split {
                    normal,
                    offset,
                    left,
                    right,
                } => {
                    let margin = distance::margin(normal, *offset, query);
                    let (near, far) = if margin > 0.0 {
                        (*right, *left)
                    } else {
                        (*left, *right)
                    };
                    frontier.push(Frontier {
                        priority,
                        tree,
                        node: near,
                    });
                    frontier.push(Frontier {
                        priority: priority.max(margin.abs()),
                        tree,
                        node: far,
                    });
                }
            }
        }

        debug!(
            leaves_visited,
            candidates = candidates.len(),
            "search frontier drained"
        );
        candidates
    }
}
