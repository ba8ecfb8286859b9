//! Flow variable identity
//!
//! Every ILP decision variable is either an edge (CFG edge, synthetic exit
//! edge, call edge, relation-graph edge, GCFG super-structure edge) or a
//! call-site instruction. Identity is value-typed: two variables collide
//! exactly when they name the same flow quantity, and the qualified name
//! renders that identity for diagnostics and constraint names.

use crate::model::{BlockRef, FunctionIndex, InsnRef, Level, Program, RgNodeRef, RgSide};
use serde::{Deserialize, Serialize};

/// The level an edge variable lives at.
///
/// Relation-graph edges exist once per side; keeping the side in the level
/// tag is what makes the progress-coupling constraint non-trivial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeLevel {
    Bitcode,
    Machinecode,
    Gcfg,
    RelationSrc,
    RelationDst,
}

impl EdgeLevel {
    pub fn from_level(level: Level) -> Self {
        match level {
            Level::Bitcode => EdgeLevel::Bitcode,
            Level::Machinecode => EdgeLevel::Machinecode,
            Level::Gcfg => EdgeLevel::Gcfg,
        }
    }

    pub fn from_side(side: RgSide) -> Self {
        match side {
            RgSide::Src => EdgeLevel::RelationSrc,
            RgSide::Dst => EdgeLevel::RelationDst,
        }
    }

    /// The program level a relation side projects to.
    pub fn projected(side: RgSide) -> Level {
        match side {
            RgSide::Src => Level::Bitcode,
            RgSide::Dst => Level::Machinecode,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            EdgeLevel::Bitcode => "bitcode",
            EdgeLevel::Machinecode => "machinecode",
            EdgeLevel::Gcfg => "gcfg",
            EdgeLevel::RelationSrc => "relationgraph/src",
            EdgeLevel::RelationDst => "relationgraph/dst",
        }
    }
}

/// Source endpoint of an edge variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EdgeSource {
    Block(BlockRef),
    /// Call edges start at the call instruction.
    Instruction(InsnRef),
    RelationNode(RgNodeRef),
    GcfgNode(usize),
}

/// Target endpoint of an edge variable. `Exit` is the sentinel for
/// "function (or super-structure) return".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EdgeTarget {
    Block(BlockRef),
    /// Call edges end at the callee.
    Function(FunctionIndex),
    RelationNode(RgNodeRef),
    GcfgNode(usize),
    Exit,
}

/// Canonical identifier of one edge flow variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeId {
    pub source: EdgeSource,
    pub target: EdgeTarget,
    pub level: EdgeLevel,
}

impl EdgeId {
    /// Intra-function CFG edge.
    pub fn block_edge(level: Level, from: BlockRef, to: BlockRef) -> Self {
        EdgeId {
            source: EdgeSource::Block(from),
            target: EdgeTarget::Block(to),
            level: EdgeLevel::from_level(level),
        }
    }

    /// Synthetic edge from a block to the exit sentinel.
    pub fn exit_edge(level: Level, from: BlockRef) -> Self {
        EdgeId {
            source: EdgeSource::Block(from),
            target: EdgeTarget::Exit,
            level: EdgeLevel::from_level(level),
        }
    }

    /// Call edge from a call instruction to one possible callee.
    pub fn call_edge(level: Level, callsite: InsnRef, callee: FunctionIndex) -> Self {
        EdgeId {
            source: EdgeSource::Instruction(callsite),
            target: EdgeTarget::Function(callee),
            level: EdgeLevel::from_level(level),
        }
    }

    /// Relation-graph edge on one side.
    pub fn relation_edge(side: RgSide, from: RgNodeRef, to: RgNodeRef) -> Self {
        EdgeId {
            source: EdgeSource::RelationNode(from),
            target: EdgeTarget::RelationNode(to),
            level: EdgeLevel::from_side(side),
        }
    }

    /// GCFG super-structure edge.
    pub fn gcfg_edge(from: usize, to: usize) -> Self {
        EdgeId {
            source: EdgeSource::GcfgNode(from),
            target: EdgeTarget::GcfgNode(to),
            level: EdgeLevel::Gcfg,
        }
    }

    /// GCFG super-structure edge to the exit sentinel.
    pub fn gcfg_exit(from: usize) -> Self {
        EdgeId {
            source: EdgeSource::GcfgNode(from),
            target: EdgeTarget::Exit,
            level: EdgeLevel::Gcfg,
        }
    }

    pub fn is_exit(&self) -> bool {
        matches!(self.target, EdgeTarget::Exit)
    }

    /// Callee of a call edge.
    pub fn callee(&self) -> Option<FunctionIndex> {
        match self.target {
            EdgeTarget::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Canonical qualified name; injective over edge identities.
    pub fn qname(&self, program: &Program) -> String {
        format!(
            "{}->{}|{}",
            endpoint_name(program, &self.source),
            target_name(program, &self.target),
            self.level.label()
        )
    }
}

fn endpoint_name(program: &Program, source: &EdgeSource) -> String {
    match source {
        EdgeSource::Block(b) => program.block_qname(*b),
        EdgeSource::Instruction(i) => program.insn_qname(*i),
        EdgeSource::RelationNode(n) => rg_node_name(program, *n),
        EdgeSource::GcfgNode(n) => gcfg_node_name(program, *n),
    }
}

fn target_name(program: &Program, target: &EdgeTarget) -> String {
    match target {
        EdgeTarget::Block(b) => program.block_qname(*b),
        EdgeTarget::Function(f) => program.function_qname(*f),
        EdgeTarget::RelationNode(n) => rg_node_name(program, *n),
        EdgeTarget::GcfgNode(n) => gcfg_node_name(program, *n),
        EdgeTarget::Exit => "exit".to_string(),
    }
}

fn rg_node_name(program: &Program, node: RgNodeRef) -> String {
    let rg = &program.relation_graphs()[node.graph];
    format!("rg:{}:{}", program.function_qname(rg.dst), node.node)
}

fn gcfg_node_name(program: &Program, node: usize) -> String {
    match program.gcfg() {
        Some(gcfg) => format!("gcfg:{}", gcfg.nodes[node].name),
        None => format!("gcfg:{}", node),
    }
}

/// An ILP decision variable: an edge, or a call-site instruction whose
/// frequency is tied to its block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Variable {
    Edge(EdgeId),
    CallSite(InsnRef),
}

impl Variable {
    pub fn qname(&self, program: &Program) -> String {
        match self {
            Variable::Edge(e) => e.qname(program),
            Variable::CallSite(i) => program.insn_qname(*i),
        }
    }
}

impl From<EdgeId> for Variable {
    fn from(edge: EdgeId) -> Self {
        Variable::Edge(edge)
    }
}
