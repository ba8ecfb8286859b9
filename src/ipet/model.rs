//! Per-level IPET model: structural constraint generation
//!
//! One model exists per active program level. It owns the level's
//! refinement table and the sum-incoming/sum-outgoing overrides the GCFG
//! super-structure splices in, and it knows how to phrase every structural
//! constraint family: flow conservation, infeasibility, entry
//! normalization, call sites and caller sums.

use super::edge::{EdgeId, Variable};
use super::refinement::ControlFlowRefinement;
use crate::error::UnknownVariable;
use crate::ilp::{ConstraintOp, ConstraintSink, ConstraintTag, VariableTag};
use crate::model::{BlockRef, Context, FunctionIndex, InsnRef, Level, Program};
use indexmap::IndexSet;
use std::collections::HashMap;

/// Linear combination of ILP variables.
pub type Terms = Vec<(Variable, i64)>;

/// IPET model for one program level.
pub struct IpetModel {
    level: Level,
    refinement: ControlFlowRefinement,
    sum_incoming_override: HashMap<BlockRef, Vec<EdgeId>>,
    sum_outgoing_override: HashMap<BlockRef, Vec<EdgeId>>,
}

impl IpetModel {
    pub fn new(level: Level, refinement: ControlFlowRefinement) -> Self {
        IpetModel {
            level,
            refinement,
            sum_incoming_override: HashMap::new(),
            sum_outgoing_override: HashMap::new(),
        }
    }

    pub fn level(&self) -> Level {
        self.level
    }

    pub fn refinement(&self) -> &ControlFlowRefinement {
        &self.refinement
    }

    pub fn variable_tag(&self) -> VariableTag {
        match self.level {
            Level::Bitcode => VariableTag::Bitcode,
            Level::Machinecode => VariableTag::Machinecode,
            Level::Gcfg => VariableTag::Gcfg,
        }
    }

    /// Is the block infeasible (in the global context)?
    pub fn infeasible(&self, block: BlockRef) -> bool {
        self.refinement.infeasible(block, &Context::empty())
    }

    /// Refined call targets of a call site (in the global context).
    pub fn calltargets(&self, program: &Program, callsite: InsnRef) -> Option<IndexSet<FunctionIndex>> {
        self.refinement.calltargets(program, callsite, &Context::empty())
    }

    /// Replace the incoming sum of `block` with an explicit edge list.
    pub fn set_sum_incoming(&mut self, block: BlockRef, edges: Vec<EdgeId>) {
        self.sum_incoming_override.insert(block, edges);
    }

    /// Replace the outgoing sum of `block` with an explicit edge list.
    pub fn set_sum_outgoing(&mut self, block: BlockRef, edges: Vec<EdgeId>) {
        self.sum_outgoing_override.insert(block, edges);
    }

    /// A block owns a synthetic exit edge when control may leave the
    /// function there, or when it is a sink with no successors.
    fn has_exit_edge(program: &Program, block: BlockRef) -> bool {
        let blk = program.block(block);
        blk.may_return || blk.successors.is_empty()
    }

    /// All edge variables of `function`: one per CFG edge plus the
    /// synthetic exit edges. Data-only blocks contribute nothing.
    pub fn each_edge(&self, program: &Program, function: FunctionIndex) -> Vec<EdgeId> {
        let mut edges = Vec::new();
        for block in &program.function(function).blocks {
            if block.is_data_block() {
                continue;
            }
            let source = BlockRef { function, block: block.index };
            for &succ in &block.successors {
                let target = BlockRef { function, block: succ };
                edges.push(EdgeId::block_edge(self.level, source, target));
            }
            if Self::has_exit_edge(program, source) {
                edges.push(EdgeId::exit_edge(self.level, source));
            }
        }
        edges
    }

    /// Incoming flow of `block`, honoring an override.
    pub fn sum_incoming(&self, program: &Program, block: BlockRef, factor: i64) -> Terms {
        if let Some(edges) = self.sum_incoming_override.get(&block) {
            return edges.iter().map(|e| (Variable::Edge(*e), factor)).collect();
        }
        program
            .block(block)
            .predecessors
            .iter()
            .map(|&p| {
                let pred = BlockRef { function: block.function, block: p };
                (Variable::Edge(EdgeId::block_edge(self.level, pred, block)), factor)
            })
            .collect()
    }

    /// Outgoing flow of `block` over CFG successors, honoring an override.
    /// The synthetic exit edge is not part of this sum.
    pub fn sum_outgoing(&self, program: &Program, block: BlockRef, factor: i64) -> Terms {
        if let Some(edges) = self.sum_outgoing_override.get(&block) {
            return edges.iter().map(|e| (Variable::Edge(*e), factor)).collect();
        }
        program
            .block(block)
            .successors
            .iter()
            .map(|&s| {
                let target = BlockRef { function: block.function, block: s };
                (Variable::Edge(EdgeId::block_edge(self.level, block, target)), factor)
            })
            .collect()
    }

    /// Execution frequency of a block: its outgoing flow, or the exit edge
    /// for a sink.
    pub fn block_frequency(&self, program: &Program, block: BlockRef, factor: i64) -> Terms {
        if self.sum_outgoing_override.contains_key(&block) {
            return self.sum_outgoing(program, block, factor);
        }
        if program.block(block).successors.is_empty() {
            vec![(Variable::Edge(EdgeId::exit_edge(self.level, block)), factor)]
        } else {
            self.sum_outgoing(program, block, factor)
        }
    }

    /// Execution frequency of a function: the frequency of its entry block.
    pub fn function_frequency(&self, program: &Program, function: FunctionIndex, factor: i64) -> Terms {
        match program.entry_block_ref(function) {
            Some(entry) => self.block_frequency(program, entry, factor),
            None => Vec::new(),
        }
    }

    /// Frequency of a CFG edge (`target == None` is the exit edge).
    pub fn edge_frequency(&self, source: BlockRef, target: Option<usize>, factor: i64) -> Terms {
        let edge = match target {
            Some(t) => EdgeId::block_edge(self.level, source, BlockRef { function: source.function, block: t }),
            None => EdgeId::exit_edge(self.level, source),
        };
        vec![(Variable::Edge(edge), factor)]
    }

    /// Number of times the loop headed by `header` is entered: the sum of
    /// its non-back-edge incoming edges.
    pub fn sum_loop_entry(&self, program: &Program, header: BlockRef, factor: i64) -> Terms {
        let blk = program.block(header);
        blk.predecessors
            .iter()
            .filter(|&&p| !blk.is_back_edge_from(p))
            .map(|&p| {
                let pred = BlockRef { function: header.function, block: p };
                (Variable::Edge(EdgeId::block_edge(self.level, pred, header)), factor)
            })
            .collect()
    }

    /// Flow conservation at `block`: `Σ out + exit − Σ in = 0`. Blocks
    /// with no incoming flow (entry, data) get no constraint.
    pub fn add_block_constraint(
        &self,
        program: &Program,
        sink: &mut dyn ConstraintSink,
        block: BlockRef,
    ) -> Result<(), UnknownVariable> {
        let incoming = self.sum_incoming(program, block, -1);
        if incoming.is_empty() {
            return Ok(());
        }
        let mut terms = self.sum_outgoing(program, block, 1);
        if !self.sum_outgoing_override.contains_key(&block) && Self::has_exit_edge(program, block) {
            terms.push((Variable::Edge(EdgeId::exit_edge(self.level, block)), 1));
        }
        terms.extend(incoming);
        sink.add_constraint(
            terms,
            ConstraintOp::Equal,
            0,
            format!("structural_{}", program.block_qname(block)),
            ConstraintTag::Structural,
        )
    }

    /// Constraints for an infeasible block: the structural constraint plus
    /// `Σ in = 0` and `Σ out = 0`.
    pub fn add_infeasible_block_constraint(
        &self,
        program: &Program,
        sink: &mut dyn ConstraintSink,
        block: BlockRef,
    ) -> Result<(), UnknownVariable> {
        self.add_block_constraint(program, sink, block)?;
        let qname = program.block_qname(block);
        let incoming = self.sum_incoming(program, block, 1);
        if !incoming.is_empty() {
            sink.add_constraint(
                incoming,
                ConstraintOp::Equal,
                0,
                format!("infeasible_{}_in", qname),
                ConstraintTag::Infeasible,
            )?;
        }
        let outgoing = self.sum_outgoing(program, block, 1);
        if !outgoing.is_empty() {
            sink.add_constraint(
                outgoing,
                ConstraintOp::Equal,
                0,
                format!("infeasible_{}_out", qname),
                ConstraintTag::Infeasible,
            )?;
        }
        Ok(())
    }

    /// Entry normalization: the analysis entry executes exactly once.
    pub fn add_entry_constraint(
        &self,
        program: &Program,
        sink: &mut dyn ConstraintSink,
        entry: FunctionIndex,
    ) -> Result<(), UnknownVariable> {
        sink.add_constraint(
            self.function_frequency(program, entry, 1),
            ConstraintOp::Equal,
            1,
            "structural_entry".to_string(),
            ConstraintTag::Structural,
        )
    }

    /// Register a call site: declare the instruction variable, tie it to
    /// its block, declare one call edge per target, and bound the edge sum
    /// by the instruction frequency.
    ///
    /// The bound is an inequality, not an equality: on platforms with
    /// predicated call instructions the call may be skipped, and the
    /// upper-bound objective stays safe.
    pub fn add_callsite(
        &self,
        program: &Program,
        sink: &mut dyn ConstraintSink,
        callsite: InsnRef,
        targets: &[FunctionIndex],
    ) -> Result<Vec<EdgeId>, UnknownVariable> {
        let qname = program.insn_qname(callsite);
        let var = Variable::CallSite(callsite);
        sink.add_variable(var, self.variable_tag());

        let mut terms = vec![(var, 1)];
        terms.extend(self.block_frequency(program, callsite.block, -1));
        sink.add_constraint(
            terms,
            ConstraintOp::Equal,
            0,
            format!("callsite_{}", qname),
            ConstraintTag::Instruction,
        )?;

        let mut edges = Vec::with_capacity(targets.len());
        let mut bound = vec![(var, -1)];
        for &callee in targets {
            let edge = EdgeId::call_edge(self.level, callsite, callee);
            sink.add_variable(Variable::Edge(edge), self.variable_tag());
            bound.push((Variable::Edge(edge), 1));
            edges.push(edge);
        }
        sink.add_constraint(
            bound,
            ConstraintOp::LessEqual,
            0,
            format!("calledges_{}", qname),
            ConstraintTag::Callsite,
        )?;
        Ok(edges)
    }

    /// Caller balance: a function executes as often as it is called.
    pub fn add_function_constraint(
        &self,
        program: &Program,
        sink: &mut dyn ConstraintSink,
        function: FunctionIndex,
        call_edges: &[EdgeId],
    ) -> Result<(), UnknownVariable> {
        let mut terms: Terms = call_edges.iter().map(|e| (Variable::Edge(*e), 1)).collect();
        terms.extend(self.function_frequency(program, function, -1));
        sink.add_constraint(
            terms,
            ConstraintOp::Equal,
            0,
            format!("calledges_{}", program.function_qname(function)),
            ConstraintTag::Callsite,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ilp::LinearSystem;
    use crate::model::Program;

    fn declare_all(model: &IpetModel, program: &Program, sink: &mut LinearSystem, f: FunctionIndex) {
        for edge in model.each_edge(program, f) {
            sink.add_variable(Variable::Edge(edge), model.variable_tag());
        }
    }

    fn straight_line() -> (Program, FunctionIndex, Vec<BlockRef>) {
        let mut pb = Program::builder();
        let f = pb.add_function(Level::Machinecode, "main", 0);
        let b0 = pb.add_block(f, false);
        let b1 = pb.add_block(f, false);
        let b2 = pb.add_block(f, true);
        pb.add_edge(b0, b1);
        pb.add_edge(b1, b2);
        (pb.finish(), f, vec![b0, b1, b2])
    }

    #[test]
    fn test_each_edge_includes_exit() {
        let (program, f, blocks) = straight_line();
        let model = IpetModel::new(Level::Machinecode, ControlFlowRefinement::new(Level::Machinecode));
        let edges = model.each_edge(&program, f);
        assert_eq!(
            edges,
            vec![
                EdgeId::block_edge(Level::Machinecode, blocks[0], blocks[1]),
                EdgeId::block_edge(Level::Machinecode, blocks[1], blocks[2]),
                EdgeId::exit_edge(Level::Machinecode, blocks[2]),
            ]
        );
    }

    #[test]
    fn test_block_constraint_shape() {
        let (program, f, blocks) = straight_line();
        let model = IpetModel::new(Level::Machinecode, ControlFlowRefinement::new(Level::Machinecode));
        let mut sink = LinearSystem::new();
        declare_all(&model, &program, &mut sink, f);

        // entry block has no incoming flow: no constraint
        model.add_block_constraint(&program, &mut sink, blocks[0]).unwrap();
        assert!(sink.constraints().is_empty());

        model.add_block_constraint(&program, &mut sink, blocks[1]).unwrap();
        model.add_block_constraint(&program, &mut sink, blocks[2]).unwrap();
        assert_eq!(sink.constraints().len(), 2);

        let c1 = sink.constraint_by_name("structural_main/1").unwrap();
        assert_eq!(c1.op, ConstraintOp::Equal);
        assert_eq!(c1.rhs, 0);
        // b1->b2 minus b0->b1
        assert_eq!(c1.terms.len(), 2);

        // sink block: exit edge carries the outgoing flow
        let c2 = sink.constraint_by_name("structural_main/2").unwrap();
        let exit = Variable::Edge(EdgeId::exit_edge(Level::Machinecode, blocks[2]));
        assert!(c2.terms.iter().any(|(v, c)| *v == exit && *c == 1));
    }

    #[test]
    fn test_entry_constraint_normalizes_to_one() {
        let (program, f, blocks) = straight_line();
        let model = IpetModel::new(Level::Machinecode, ControlFlowRefinement::new(Level::Machinecode));
        let mut sink = LinearSystem::new();
        declare_all(&model, &program, &mut sink, f);

        model.add_entry_constraint(&program, &mut sink, f).unwrap();
        let entry = sink.constraint_by_name("structural_entry").unwrap();
        assert_eq!(entry.rhs, 1);
        assert_eq!(
            entry.terms,
            vec![(Variable::Edge(EdgeId::block_edge(Level::Machinecode, blocks[0], blocks[1])), 1)]
        );
    }

    #[test]
    fn test_infeasible_block_constraints() {
        let (program, f, blocks) = straight_line();
        let model = IpetModel::new(Level::Machinecode, ControlFlowRefinement::new(Level::Machinecode));
        let mut sink = LinearSystem::new();
        declare_all(&model, &program, &mut sink, f);

        model.add_infeasible_block_constraint(&program, &mut sink, blocks[1]).unwrap();
        assert!(sink.constraint_by_name("structural_main/1").is_some());
        let zero_in = sink.constraint_by_name("infeasible_main/1_in").unwrap();
        assert_eq!(zero_in.tag, ConstraintTag::Infeasible);
        assert_eq!(zero_in.rhs, 0);
        assert!(sink.constraint_by_name("infeasible_main/1_out").is_some());
    }

    #[test]
    fn test_overrides_replace_sums() {
        let (program, f, blocks) = straight_line();
        let mut model = IpetModel::new(Level::Machinecode, ControlFlowRefinement::new(Level::Machinecode));
        let mut sink = LinearSystem::new();
        declare_all(&model, &program, &mut sink, f);

        let super_edge = EdgeId::gcfg_edge(0, 1);
        sink.add_variable(Variable::Edge(super_edge), VariableTag::Gcfg);
        model.set_sum_incoming(blocks[1], vec![super_edge]);

        model.add_block_constraint(&program, &mut sink, blocks[1]).unwrap();
        let c = sink.constraint_by_name("structural_main/1").unwrap();
        assert!(c.terms.contains(&(Variable::Edge(super_edge), -1)));
        // the natural incoming edge is gone
        let natural = Variable::Edge(EdgeId::block_edge(Level::Machinecode, blocks[0], blocks[1]));
        assert!(!c.terms.iter().any(|(v, _)| *v == natural));
    }

    #[test]
    fn test_sum_loop_entry_skips_back_edges() {
        let mut pb = Program::builder();
        let f = pb.add_function(Level::Machinecode, "main", 0);
        let pre = pb.add_block(f, false);
        let h = pb.add_block(f, false);
        let body = pb.add_block(f, false);
        let exit = pb.add_block(f, true);
        pb.add_edge(pre, h);
        pb.add_edge(h, body);
        pb.add_edge(body, h);
        pb.add_edge(h, exit);
        let program = pb.finish();

        let model = IpetModel::new(Level::Machinecode, ControlFlowRefinement::new(Level::Machinecode));
        let terms = model.sum_loop_entry(&program, h, 1);
        assert_eq!(
            terms,
            vec![(Variable::Edge(EdgeId::block_edge(Level::Machinecode, pre, h)), 1)]
        );
    }

    #[test]
    fn test_callsite_emits_upper_bound() {
        let mut pb = Program::builder();
        let f = pb.add_function(Level::Machinecode, "main", 0);
        let g = pb.add_function(Level::Machinecode, "g", 0x10);
        let h = pb.add_function(Level::Machinecode, "h", 0x20);
        let b0 = pb.add_block(f, true);
        let cs = pb.add_call(b0, &[]);
        let program = pb.finish();

        let model = IpetModel::new(Level::Machinecode, ControlFlowRefinement::new(Level::Machinecode));
        let mut sink = LinearSystem::new();
        declare_all(&model, &program, &mut sink, f);

        let edges = model.add_callsite(&program, &mut sink, cs, &[g, h]).unwrap();
        assert_eq!(edges.len(), 2);

        let tie = sink.constraint_by_name("callsite_main/0/0").unwrap();
        assert_eq!(tie.op, ConstraintOp::Equal);
        assert_eq!(tie.tag, ConstraintTag::Instruction);

        let bound = sink.constraint_by_name("calledges_main/0/0").unwrap();
        assert_eq!(bound.op, ConstraintOp::LessEqual);
        assert_eq!(bound.rhs, 0);
        assert!(bound.terms.contains(&(Variable::CallSite(cs), -1)));
    }
}
