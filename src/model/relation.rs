//! Relation graphs between bitcode and machine-code control flow
//!
//! A relation graph ties the two renditions of one function node-for-node.
//! Each node may expose a block on either side and carries typed successor
//! lists per side; entry and progress nodes are where the two sides are
//! known to advance in lockstep.

use super::FunctionIndex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The two sides of a relation graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RgSide {
    /// Bitcode side.
    Src,
    /// Machine-code side.
    Dst,
}

impl fmt::Display for RgSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RgSide::Src => write!(f, "src"),
            RgSide::Dst => write!(f, "dst"),
        }
    }
}

/// Node classification within a relation graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationNodeKind {
    /// Function entry; both sides start here.
    Entry,
    /// Both sides advance together.
    Progress,
    /// Function exit.
    Exit,
    /// Bitcode-only stretch.
    Src,
    /// Machine-code-only stretch.
    Dst,
}

impl RelationNodeKind {
    /// Entry and progress nodes synchronize the two sides.
    pub fn is_progress(&self) -> bool {
        matches!(self, RelationNodeKind::Entry | RelationNodeKind::Progress)
    }
}

/// Handle to a relation node: owning graph index plus node index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RgNodeRef {
    pub graph: usize,
    pub node: usize,
}

/// A node of a relation graph.
#[derive(Debug, Clone)]
pub struct RelationNode {
    pub index: usize,
    pub kind: RelationNodeKind,
    /// Bitcode block index, when this node covers one.
    pub src_block: Option<usize>,
    /// Machine-code block index, when this node covers one.
    pub dst_block: Option<usize>,
    /// Successor node indices on the bitcode side.
    pub src_successors: Vec<usize>,
    /// Successor node indices on the machine-code side.
    pub dst_successors: Vec<usize>,
}

impl RelationNode {
    pub fn block(&self, side: RgSide) -> Option<usize> {
        match side {
            RgSide::Src => self.src_block,
            RgSide::Dst => self.dst_block,
        }
    }

    pub fn successors(&self, side: RgSide) -> &[usize] {
        match side {
            RgSide::Src => &self.src_successors,
            RgSide::Dst => &self.dst_successors,
        }
    }
}

/// Validity of a relation graph as reported by the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationGraphStatus {
    Valid,
    /// Repaired after a structural mismatch; usable when the build opts in.
    Corrected,
    /// Construction gave up; never usable.
    Incomplete,
}

/// Relation graph for one function pair (bitcode `src`, machine code `dst`).
#[derive(Debug, Clone)]
pub struct RelationGraph {
    pub index: usize,
    pub src: FunctionIndex,
    pub dst: FunctionIndex,
    pub status: RelationGraphStatus,
    pub nodes: Vec<RelationNode>,
}

impl RelationGraph {
    pub fn new(index: usize, src: FunctionIndex, dst: FunctionIndex, status: RelationGraphStatus) -> Self {
        Self { index, src, dst, status, nodes: Vec::new() }
    }

    pub fn add_node(
        &mut self,
        kind: RelationNodeKind,
        src_block: Option<usize>,
        dst_block: Option<usize>,
    ) -> usize {
        let index = self.nodes.len();
        self.nodes.push(RelationNode {
            index,
            kind,
            src_block,
            dst_block,
            src_successors: Vec::new(),
            dst_successors: Vec::new(),
        });
        index
    }

    pub fn add_successor(&mut self, side: RgSide, from: usize, to: usize) {
        match side {
            RgSide::Src => self.nodes[from].src_successors.push(to),
            RgSide::Dst => self.nodes[from].dst_successors.push(to),
        }
    }

    pub fn node_ref(&self, node: usize) -> RgNodeRef {
        RgNodeRef { graph: self.index, node }
    }

    /// The function exposed on the given side.
    pub fn function(&self, side: RgSide) -> FunctionIndex {
        match side {
            RgSide::Src => self.src,
            RgSide::Dst => self.dst,
        }
    }
}
