//! Global control-flow graph of atomic basic blocks
//!
//! A GCFG node wraps an ABB: a single-entry/single-exit region of
//! machine-code blocks treated as one super-node. The IPET builder splices
//! the GCFG edges into the region-internal flow conservation.

use super::{BlockRef, FunctionIndex};

/// Atomic basic block: a machine-code subregion with a designated entry
/// and exit block.
#[derive(Debug, Clone)]
pub struct Abb {
    pub function: FunctionIndex,
    /// Entry block index within `function`.
    pub entry: usize,
    /// Exit block index within `function`.
    pub exit: usize,
    /// All block indices of the region, including entry and exit.
    pub blocks: Vec<usize>,
}

impl Abb {
    pub fn contains(&self, block: usize) -> bool {
        self.blocks.contains(&block)
    }

    pub fn entry_ref(&self) -> BlockRef {
        BlockRef { function: self.function, block: self.entry }
    }

    pub fn exit_ref(&self) -> BlockRef {
        BlockRef { function: self.function, block: self.exit }
    }
}

/// A node of the GCFG.
#[derive(Debug, Clone)]
pub struct GcfgNode {
    pub index: usize,
    pub name: String,
    pub abb: Abb,
    pub successors: Vec<usize>,
    pub predecessors: Vec<usize>,
    pub may_return: bool,
}

/// The GCFG super-structure. The first node is the entry.
#[derive(Debug, Clone, Default)]
pub struct Gcfg {
    pub nodes: Vec<GcfgNode>,
}

impl Gcfg {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, name: &str, abb: Abb, may_return: bool) -> usize {
        let index = self.nodes.len();
        self.nodes.push(GcfgNode {
            index,
            name: name.to_string(),
            abb,
            successors: Vec::new(),
            predecessors: Vec::new(),
            may_return,
        });
        index
    }

    pub fn add_edge(&mut self, from: usize, to: usize) {
        self.nodes[from].successors.push(to);
    }

    pub fn entry(&self) -> Option<&GcfgNode> {
        self.nodes.first()
    }

    /// Derive predecessor lists from the successor lists, in input order.
    pub(crate) fn compute_predecessors(&mut self) {
        let mut preds: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for node in &self.nodes {
            for &succ in &node.successors {
                preds[succ].push(node.index);
            }
        }
        for (node, preds) in self.nodes.iter_mut().zip(preds) {
            node.predecessors = preds;
        }
    }
}
