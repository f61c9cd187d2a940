//! Frontier: the unmerged right edge of the index tree

use serde::{Deserialize, Serialize};

use super::node::IndexNode;
use crate::error::{IndexError, IndexResult};
use crate::traits::BlockRef;

/// Where the next append folds the frontier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergePoint {
    /// First frontier position to fold
    pub start: usize,

    /// Combined weight of `[start..]`
    pub weight: u64,

    /// Combined size of `[start..]`
    pub size: u64,
}

/// Ordered index nodes plus cached aggregates
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "Vec<IndexNode>", try_from = "Vec<IndexNode>")]
pub struct Frontier {
    nodes: Vec<IndexNode>,
    weight: u64,
    size: u64,
}

impl Frontier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a frontier from nodes, validating their cached aggregates
    pub fn from_nodes(nodes: Vec<IndexNode>) -> IndexResult<Self> {
        let mut frontier = Self::new();
        for node in nodes {
            if let IndexNode::Internal(n) = &node {
                if n.weight < 2 {
                    return Err(IndexError::Invariant(format!(
                        "internal node {} has weight {}",
                        n.reference, n.weight
                    )));
                }
            }
            frontier.push(node);
        }
        Ok(frontier)
    }

    pub fn nodes(&self) -> &[IndexNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Total leaves below the frontier
    pub fn weight(&self) -> u64 {
        self.weight
    }

    /// Total primary bytes below the frontier
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Earliest block any entry may reference
    pub fn min_block(&self) -> Option<BlockRef> {
        self.nodes
            .iter()
            .map(|n| n.min_block().clone())
            .reduce(BlockRef::earliest)
    }

    /// Find the suffix the next append must fold
    ///
    /// Walks from the newest entry backward with a running weight that
    /// starts at 1 for the incoming leaf, stopping at the first entry with
    /// `weight * degree <= running`.
    pub fn merge_point(&self, degree: u64) -> Option<MergePoint> {
        let mut running = 1u64;
        let mut size = 0u64;

        for (i, node) in self.nodes.iter().enumerate().rev() {
            if node.weight().saturating_mul(degree) <= running {
                let suffix = &self.nodes[i..];
                return Some(MergePoint {
                    start: i,
                    weight: suffix.iter().map(IndexNode::weight).sum(),
                    size: size + node.size(),
                });
            }
            running += node.weight();
            size += node.size();
        }
        None
    }

    pub(crate) fn push(&mut self, node: IndexNode) {
        self.weight += node.weight();
        self.size += node.size();
        self.nodes.push(node);
    }

    /// Replace `[start..]` with a single node
    pub(crate) fn fold(&mut self, start: usize, node: IndexNode) {
        for removed in self.nodes.drain(start..) {
            self.weight -= removed.weight();
            self.size -= removed.size();
        }
        self.push(node);
    }
}

impl From<Frontier> for Vec<IndexNode> {
    fn from(f: Frontier) -> Self {
        f.nodes
    }
}

impl TryFrom<Vec<IndexNode>> for Frontier {
    type Error = IndexError;

    fn try_from(nodes: Vec<IndexNode>) -> Result<Self, Self::Error> {
        Frontier::from_nodes(nodes)
    }
}
