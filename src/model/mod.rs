// Program model shared by the refinement and IPET pipelines

pub mod flowfact;
pub mod gcfg;
pub mod loops;
pub mod relation;

pub use flowfact::{Context, FlowFact, ProgramPoint, Rhs, Scope, ScopePoint, Term};
pub use gcfg::{Abb, Gcfg, GcfgNode};
pub use relation::{
    RelationGraph, RelationGraphStatus, RelationNode, RelationNodeKind, RgNodeRef, RgSide,
};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Program representation level.
///
/// Machine code and bitcode functions live in the same arena and are told
/// apart by this tag; the GCFG level has no functions of its own, it is a
/// super-structure over machine code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Bitcode,
    Machinecode,
    Gcfg,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Bitcode => write!(f, "bitcode"),
            Level::Machinecode => write!(f, "machinecode"),
            Level::Gcfg => write!(f, "gcfg"),
        }
    }
}

/// Handle to a function in the program arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionIndex(pub usize);

/// Handle to a block: owning function plus block index within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockRef {
    pub function: FunctionIndex,
    pub block: usize,
}

/// Handle to an instruction within a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InsnRef {
    pub block: BlockRef,
    pub index: usize,
}

/// A function at one program level.
///
/// The first block is the entry. Blocks are stored in the order the loader
/// supplied them; that order is observable in emitted constraint names and
/// must not be changed.
#[derive(Debug, Clone)]
pub struct Function {
    pub index: FunctionIndex,
    pub name: String,
    pub address: u64,
    pub level: Level,
    pub blocks: Vec<Block>,
}

impl Function {
    /// Entry block, if the function has a body.
    pub fn entry_block(&self) -> Option<&Block> {
        self.blocks.first()
    }
}

/// A basic block.
#[derive(Debug, Clone)]
pub struct Block {
    /// Index within the owning function.
    pub index: usize,
    /// Ordered successor block indices.
    pub successors: Vec<usize>,
    /// Ordered predecessor block indices.
    pub predecessors: Vec<usize>,
    /// Predecessor indices whose edge into this block is a back edge.
    pub back_edge_preds: Vec<usize>,
    /// Headers of the loops enclosing this block, outermost first.
    pub loop_headers: Vec<usize>,
    /// Whether control may leave the function from this block.
    pub may_return: bool,
    pub instructions: Vec<Instruction>,
}

impl Block {
    /// Loop nesting depth (0 = not inside any loop).
    pub fn loopnest(&self) -> usize {
        self.loop_headers.len()
    }

    /// Whether the edge from `pred` into this block closes a loop.
    pub fn is_back_edge_from(&self, pred: usize) -> bool {
        self.back_edge_preds.contains(&pred)
    }

    /// Whether this block heads a loop.
    pub fn is_loop_header(&self) -> bool {
        !self.back_edge_preds.is_empty()
    }

    /// Instructions that are call sites (static or indirect).
    pub fn call_sites(&self) -> impl Iterator<Item = &Instruction> {
        self.instructions.iter().filter(|i| i.callees.is_some())
    }

    /// A data-only block carries constants, not code: it has an index > 0
    /// and no predecessors. Such blocks get no flow variables.
    pub fn is_data_block(&self) -> bool {
        self.index > 0 && self.predecessors.is_empty()
    }
}

/// An instruction.
///
/// `callees` distinguishes call sites: `None` is a non-call instruction,
/// `Some(names)` a call with statically known targets, `Some(vec![])` an
/// indirect call whose targets must come from flow facts.
#[derive(Debug, Clone)]
pub struct Instruction {
    pub index: usize,
    /// Symbolic marker label (bitcode only).
    pub marker: Option<String>,
    pub callees: Option<Vec<String>>,
}

impl Instruction {
    pub fn is_call(&self) -> bool {
        self.callees.is_some()
    }
}

/// The whole analyzed program: functions at all levels, relation graphs
/// tying bitcode to machine code, and an optional GCFG super-structure.
#[derive(Debug, Clone, Default)]
pub struct Program {
    functions: Vec<Function>,
    by_name: HashMap<(Level, String), FunctionIndex>,
    relation_graphs: Vec<RelationGraph>,
    rg_by_dst: HashMap<FunctionIndex, usize>,
    gcfg: Option<Gcfg>,
}

impl Program {
    pub fn builder() -> ProgramBuilder {
        ProgramBuilder::default()
    }

    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    pub fn function(&self, f: FunctionIndex) -> &Function {
        &self.functions[f.0]
    }

    pub fn block(&self, b: BlockRef) -> &Block {
        &self.functions[b.function.0].blocks[b.block]
    }

    pub fn instruction(&self, i: InsnRef) -> &Instruction {
        &self.block(i.block).instructions[i.index]
    }

    /// Look up a function by level and name.
    pub fn lookup(&self, level: Level, name: &str) -> Option<FunctionIndex> {
        self.by_name.get(&(level, name.to_string())).copied()
    }

    /// The relation graph whose machine-code side is `dst`, if any.
    pub fn relation_graph_for(&self, dst: FunctionIndex) -> Option<&RelationGraph> {
        self.rg_by_dst.get(&dst).map(|&ix| &self.relation_graphs[ix])
    }

    pub fn relation_graphs(&self) -> &[RelationGraph] {
        &self.relation_graphs
    }

    pub fn gcfg(&self) -> Option<&Gcfg> {
        self.gcfg.as_ref()
    }

    /// Reference to the entry block of a function.
    pub fn entry_block_ref(&self, f: FunctionIndex) -> Option<BlockRef> {
        if self.function(f).blocks.is_empty() {
            None
        } else {
            Some(BlockRef { function: f, block: 0 })
        }
    }

    pub fn function_qname(&self, f: FunctionIndex) -> String {
        self.function(f).name.clone()
    }

    pub fn block_qname(&self, b: BlockRef) -> String {
        format!("{}/{}", self.function(b.function).name, b.block)
    }

    pub fn insn_qname(&self, i: InsnRef) -> String {
        format!("{}/{}", self.block_qname(i.block), i.index)
    }
}

/// Incremental construction of a [`Program`].
///
/// `finish` runs the dominator-based loop analysis on every function so
/// that back edges and loop metadata are available even when the loader
/// did not supply them.
#[derive(Debug, Default)]
pub struct ProgramBuilder {
    program: Program,
}

impl ProgramBuilder {
    pub fn add_function(&mut self, level: Level, name: &str, address: u64) -> FunctionIndex {
        let index = FunctionIndex(self.program.functions.len());
        self.program.functions.push(Function {
            index,
            name: name.to_string(),
            address,
            level,
            blocks: Vec::new(),
        });
        self.program
            .by_name
            .insert((level, name.to_string()), index);
        index
    }

    pub fn add_block(&mut self, function: FunctionIndex, may_return: bool) -> BlockRef {
        let blocks = &mut self.program.functions[function.0].blocks;
        let index = blocks.len();
        blocks.push(Block {
            index,
            successors: Vec::new(),
            predecessors: Vec::new(),
            back_edge_preds: Vec::new(),
            loop_headers: Vec::new(),
            may_return,
            instructions: Vec::new(),
        });
        BlockRef { function, block: index }
    }

    /// Add a CFG edge. Both blocks must belong to the same function.
    pub fn add_edge(&mut self, from: BlockRef, to: BlockRef) {
        debug_assert_eq!(from.function, to.function);
        let blocks = &mut self.program.functions[from.function.0].blocks;
        blocks[from.block].successors.push(to.block);
        blocks[to.block].predecessors.push(from.block);
    }

    pub fn add_instruction(&mut self, block: BlockRef) -> InsnRef {
        self.push_instruction(block, None, None)
    }

    /// Add a call instruction. An empty callee list is an indirect call.
    pub fn add_call(&mut self, block: BlockRef, callees: &[&str]) -> InsnRef {
        let callees = callees.iter().map(|s| s.to_string()).collect();
        self.push_instruction(block, None, Some(callees))
    }

    /// Add a marker-carrying instruction (bitcode only).
    pub fn add_marker(&mut self, block: BlockRef, marker: &str) -> InsnRef {
        self.push_instruction(block, Some(marker.to_string()), None)
    }

    fn push_instruction(
        &mut self,
        block: BlockRef,
        marker: Option<String>,
        callees: Option<Vec<String>>,
    ) -> InsnRef {
        let blk = &mut self.program.functions[block.function.0].blocks[block.block];
        let index = blk.instructions.len();
        blk.instructions.push(Instruction { index, marker, callees });
        InsnRef { block, index }
    }

    pub fn add_relation_graph(&mut self, rg: RelationGraph) {
        let ix = self.program.relation_graphs.len();
        self.program.rg_by_dst.insert(rg.dst, ix);
        self.program.relation_graphs.push(rg);
    }

    pub fn set_gcfg(&mut self, gcfg: Gcfg) {
        self.program.gcfg = Some(gcfg);
    }

    pub fn finish(mut self) -> Program {
        for function in &mut self.program.functions {
            loops::analyze_loops(function);
        }
        if let Some(gcfg) = self.program.gcfg.as_mut() {
            gcfg.compute_predecessors();
        }
        self.program
    }
}
