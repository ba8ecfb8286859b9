//! IPET builder: orchestration of the constraint system
//!
//! Walks the reachable part of the program (transitively through refined
//! call targets), declares flow variables and structural constraints
//! through the per-level models, couples bitcode to machine code through
//! relation graphs, assembles the GCFG super-structure when requested, and
//! finally replays every flow fact as an ILP constraint.
//!
//! A builder is single-use: all state lives for one `build` call.

use super::edge::{EdgeId, EdgeLevel, Variable};
use super::model::{IpetModel, Terms};
use super::refinement::ControlFlowRefinement;
use crate::error::BuildError;
use crate::ilp::{ConstraintOp, ConstraintSink, ConstraintTag, VariableTag};
use crate::model::{
    BlockRef, FlowFact, FunctionIndex, InsnRef, Level, Program, ProgramPoint, RelationGraph,
    RelationGraphStatus, RelationNodeKind, RgSide, ScopePoint, Term,
};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Build configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildOptions {
    /// Name of the analysis entry function.
    pub entry: String,
    /// Couple bitcode control flow through relation graphs.
    pub use_bitcode: bool,
    /// Build over the GCFG super-structure instead of the entry CFG.
    pub use_gcfg: bool,
    /// Attach edge costs from the cost model.
    pub instruction_timing: bool,
    /// Accept relation graphs the loader repaired after a mismatch.
    pub accept_corrected_rgs: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        BuildOptions {
            entry: "main".to_string(),
            use_bitcode: false,
            use_gcfg: false,
            instruction_timing: true,
            accept_corrected_rgs: false,
        }
    }
}

/// Per-edge cycle cost supplied by the architectural cost model.
pub trait CostModel {
    fn edge_cost(&self, program: &Program, edge: &EdgeId) -> i64;
}

/// Cost model assigning zero to every edge.
pub struct ZeroCost;

impl CostModel for ZeroCost {
    fn edge_cost(&self, _program: &Program, _edge: &EdgeId) -> i64 {
        0
    }
}

/// What the builder discovered, for downstream reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildReport {
    /// Call edges in emission order.
    pub call_edges: Vec<EdgeId>,
    /// Functions folded into the constraint system, in discovery order.
    pub reachable_functions: Vec<FunctionIndex>,
    /// Reachable GCFG nodes (empty for a plain CFG build).
    pub gcfg_nodes: Vec<usize>,
}

/// Single-use builder of the IPET constraint system.
pub struct IpetBuilder<'a> {
    program: &'a Program,
    options: BuildOptions,
    cost: &'a dyn CostModel,
    mc_model: IpetModel,
    bc_model: Option<IpetModel>,
    markers: IndexMap<String, Vec<InsnRef>>,
    call_edges: Vec<EdgeId>,
    ff_count: usize,
    built: bool,
}

impl<'a> IpetBuilder<'a> {
    pub fn new(program: &'a Program, options: BuildOptions, cost: &'a dyn CostModel) -> Self {
        IpetBuilder {
            program,
            options,
            cost,
            mc_model: IpetModel::new(
                Level::Machinecode,
                ControlFlowRefinement::new(Level::Machinecode),
            ),
            bc_model: None,
            markers: IndexMap::new(),
            call_edges: Vec::new(),
            ff_count: 0,
            built: false,
        }
    }

    /// Call edges discovered so far.
    pub fn call_edges(&self) -> &[EdgeId] {
        &self.call_edges
    }

    /// The refinement table built for a level, after `build`.
    pub fn refinement(&self, level: Level) -> Option<&ControlFlowRefinement> {
        match level {
            Level::Machinecode => Some(self.mc_model.refinement()),
            Level::Bitcode => self.bc_model.as_ref().map(|m| m.refinement()),
            Level::Gcfg => None,
        }
    }

    /// Build the whole constraint system into `sink`.
    ///
    /// On a fatal error the partially emitted constraint set is invalid and
    /// must be discarded by the caller.
    pub fn build(
        &mut self,
        sink: &mut dyn ConstraintSink,
        flowfacts: &[FlowFact],
    ) -> Result<BuildReport, BuildError> {
        if self.built {
            return Err(BuildError::BuilderReinvocation);
        }
        self.built = true;

        if self.options.use_gcfg && self.options.use_bitcode {
            return Err(BuildError::BitcodeUnderGcfg);
        }

        // refinement tables come first, so no variable is ever emitted for
        // code the flow facts prove unreachable
        let mc_entry = self.program.lookup(Level::Machinecode, &self.options.entry);
        let mut mc_refinement = ControlFlowRefinement::new(Level::Machinecode);
        if let Some(entry) = mc_entry {
            for fact in flowfacts
                .iter()
                .filter(|ff| ff.level == Level::Machinecode && ff.globally_valid(entry))
            {
                mc_refinement.add_flowfact(self.program, fact);
            }
        }
        self.mc_model = IpetModel::new(Level::Machinecode, mc_refinement);

        if self.options.use_bitcode {
            let mut bc_refinement = ControlFlowRefinement::new(Level::Bitcode);
            if let Some(entry) = self.program.lookup(Level::Bitcode, &self.options.entry) {
                for fact in flowfacts
                    .iter()
                    .filter(|ff| ff.level == Level::Bitcode && ff.globally_valid(entry))
                {
                    bc_refinement.add_flowfact(self.program, fact);
                }
            }
            self.bc_model = Some(IpetModel::new(Level::Bitcode, bc_refinement));
        }

        if self.options.use_gcfg {
            self.build_gcfg(sink, flowfacts)
        } else {
            let entry = mc_entry
                .ok_or_else(|| BuildError::EntryNotFound(self.options.entry.clone()))?;
            self.build_cfg(sink, flowfacts, entry)
        }
    }

    fn build_cfg(
        &mut self,
        sink: &mut dyn ConstraintSink,
        flowfacts: &[FlowFact],
        entry: FunctionIndex,
    ) -> Result<BuildReport, BuildError> {
        let program = self.program;

        let reachable = self.reachable_functions(sink, vec![entry])?;
        for &f in &reachable {
            self.add_bitcode_variables(sink, f);
        }
        for &f in &reachable {
            self.add_block_constraints(sink, f)?;
            self.add_bitcode_constraints(sink, f)?;
        }

        let mut callers = IndexMap::new();
        for &f in &reachable {
            let callsites = self.collect_callsites(f);
            self.emit_callsites(sink, &callsites, &mut callers)?;
        }

        self.mc_model.add_entry_constraint(program, sink, entry)?;
        for (callee, edges) in &callers {
            self.mc_model
                .add_function_constraint(program, sink, *callee, edges)?;
        }

        for fact in flowfacts {
            self.add_flowfact(sink, fact);
        }

        Ok(BuildReport {
            call_edges: self.call_edges.clone(),
            reachable_functions: reachable,
            gcfg_nodes: Vec::new(),
        })
    }

    /// Transitive closure over refined call targets, starting at `roots`.
    /// Declares the machine-code flow variables (and costs) of every
    /// function on first visit.
    fn reachable_functions(
        &mut self,
        sink: &mut dyn ConstraintSink,
        roots: Vec<FunctionIndex>,
    ) -> Result<Vec<FunctionIndex>, BuildError> {
        let program = self.program;
        let mut seen: IndexSet<FunctionIndex> = IndexSet::new();
        let mut worklist: VecDeque<FunctionIndex> = roots.into();

        while let Some(function) = worklist.pop_front() {
            if !seen.insert(function) {
                continue;
            }
            for edge in self.mc_model.each_edge(program, function) {
                sink.add_variable(Variable::Edge(edge), self.mc_model.variable_tag());
                if self.options.instruction_timing {
                    let cost = self.cost.edge_cost(program, &edge);
                    if cost != 0 {
                        sink.add_cost(&Variable::Edge(edge), cost)
                            .map_err(BuildError::from)?;
                    }
                }
            }
            for callsite in self.collect_callsites(function) {
                for target in self.resolve_calltargets(callsite)? {
                    worklist.push_back(target);
                }
            }
        }
        Ok(seen.into_iter().collect())
    }

    /// Call sites of feasible, non-data blocks, in block order.
    fn collect_callsites(&self, function: FunctionIndex) -> Vec<InsnRef> {
        let mut callsites = Vec::new();
        for block in &self.program.function(function).blocks {
            if block.is_data_block() {
                continue;
            }
            let bref = BlockRef { function, block: block.index };
            if self.mc_model.infeasible(bref) {
                continue;
            }
            for insn in block.call_sites() {
                callsites.push(InsnRef { block: bref, index: insn.index });
            }
        }
        callsites
    }

    fn resolve_calltargets(&self, callsite: InsnRef) -> Result<Vec<FunctionIndex>, BuildError> {
        match self.mc_model.calltargets(self.program, callsite) {
            Some(targets) => Ok(targets.into_iter().collect()),
            None => Err(BuildError::UnresolvedIndirectCall {
                callsite: self.program.insn_qname(callsite),
                block: self.program.block_qname(callsite.block),
            }),
        }
    }

    fn emit_callsites(
        &mut self,
        sink: &mut dyn ConstraintSink,
        callsites: &[InsnRef],
        callers: &mut IndexMap<FunctionIndex, Vec<EdgeId>>,
    ) -> Result<(), BuildError> {
        let program = self.program;
        for &callsite in callsites {
            let targets = self.resolve_calltargets(callsite)?;
            let edges = self
                .mc_model
                .add_callsite(program, sink, callsite, &targets)?;
            for (edge, target) in edges.iter().zip(&targets) {
                callers.entry(*target).or_default().push(*edge);
            }
            self.call_edges.extend(edges);
        }
        Ok(())
    }

    /// Structural constraints for every non-data block of `function`.
    fn add_block_constraints(
        &self,
        sink: &mut dyn ConstraintSink,
        function: FunctionIndex,
    ) -> Result<(), BuildError> {
        let program = self.program;
        for block in &program.function(function).blocks {
            if block.is_data_block() {
                continue;
            }
            let bref = BlockRef { function, block: block.index };
            if self.mc_model.infeasible(bref) {
                self.mc_model
                    .add_infeasible_block_constraint(program, sink, bref)?;
            } else {
                self.mc_model.add_block_constraint(program, sink, bref)?;
            }
        }
        Ok(())
    }

    fn accepts_rg(&self, rg: &RelationGraph) -> bool {
        match rg.status {
            RelationGraphStatus::Valid => true,
            RelationGraphStatus::Corrected => self.options.accept_corrected_rgs,
            RelationGraphStatus::Incomplete => false,
        }
    }

    /// Declare bitcode and relation-graph flow variables for the machine
    /// function `dst`, and index the bitcode markers.
    fn add_bitcode_variables(&mut self, sink: &mut dyn ConstraintSink, dst: FunctionIndex) {
        let program = self.program;
        let Some(bc_model) = &self.bc_model else {
            return;
        };
        let Some(rg) = program.relation_graph_for(dst) else {
            return;
        };
        if !self.accepts_rg(rg) {
            debug!(
                function = %program.function_qname(dst),
                "skipping relation graph not accepted by the current options"
            );
            return;
        }

        for edge in bc_model.each_edge(program, rg.src) {
            sink.add_variable(Variable::Edge(edge), VariableTag::Bitcode);
        }
        for (side, from, to) in Self::each_relation_edge(rg) {
            let edge = EdgeId::relation_edge(side, rg.node_ref(from), rg.node_ref(to));
            sink.add_variable(Variable::Edge(edge), VariableTag::RelationGraph);
        }

        for block in &program.function(rg.src).blocks {
            for insn in &block.instructions {
                if let Some(marker) = &insn.marker {
                    let bref = BlockRef { function: rg.src, block: block.index };
                    self.markers
                        .entry(marker.clone())
                        .or_default()
                        .push(InsnRef { block: bref, index: insn.index });
                }
            }
        }
    }

    /// Relation edges as `(side, from_node, to_node)`, in node and
    /// successor order. An edge exists on a side when the source node
    /// exposes a block there and the target is an exit node or exposes a
    /// block there as well.
    fn each_relation_edge(rg: &RelationGraph) -> Vec<(RgSide, usize, usize)> {
        let mut edges = Vec::new();
        for node in &rg.nodes {
            for side in [RgSide::Src, RgSide::Dst] {
                if node.block(side).is_none() {
                    continue;
                }
                for &succ in node.successors(side) {
                    let target = &rg.nodes[succ];
                    if target.kind == RelationNodeKind::Exit || target.block(side).is_some() {
                        edges.push((side, node.index, succ));
                    }
                }
            }
        }
        edges
    }

    /// Bitcode block constraints plus the relation-graph coupling:
    /// every CFG edge equals the sum of relation edges projecting onto it,
    /// and at entry/progress nodes both sides flow equally.
    fn add_bitcode_constraints(
        &self,
        sink: &mut dyn ConstraintSink,
        dst: FunctionIndex,
    ) -> Result<(), BuildError> {
        let program = self.program;
        let Some(bc_model) = &self.bc_model else {
            return Ok(());
        };
        let Some(rg) = program.relation_graph_for(dst) else {
            return Ok(());
        };
        if !self.accepts_rg(rg) {
            return Ok(());
        }

        for block in &program.function(rg.src).blocks {
            if block.is_data_block() {
                continue;
            }
            let bref = BlockRef { function: rg.src, block: block.index };
            if bc_model.infeasible(bref) {
                bc_model.add_infeasible_block_constraint(program, sink, bref)?;
            } else {
                bc_model.add_block_constraint(program, sink, bref)?;
            }
        }

        let mut by_cfg_edge: IndexMap<EdgeId, Vec<EdgeId>> = IndexMap::new();
        let mut progress: IndexMap<usize, (Vec<EdgeId>, Vec<EdgeId>)> = IndexMap::new();
        for (side, from, to) in Self::each_relation_edge(rg) {
            let rg_edge = EdgeId::relation_edge(side, rg.node_ref(from), rg.node_ref(to));
            let level = EdgeLevel::projected(side);
            let function = rg.function(side);
            let source = BlockRef {
                function,
                block: rg.nodes[from].block(side).expect("relation edge source exposes a block"),
            };
            let cfg_edge = if rg.nodes[to].kind == RelationNodeKind::Exit {
                EdgeId::exit_edge(level, source)
            } else {
                let target = BlockRef {
                    function,
                    block: rg.nodes[to].block(side).expect("relation edge target exposes a block"),
                };
                EdgeId::block_edge(level, source, target)
            };
            by_cfg_edge.entry(cfg_edge).or_default().push(rg_edge);
            if rg.nodes[from].kind.is_progress() {
                let entry = progress.entry(from).or_default();
                match side {
                    RgSide::Src => entry.0.push(rg_edge),
                    RgSide::Dst => entry.1.push(rg_edge),
                }
            }
        }

        for (cfg_edge, rg_edges) in &by_cfg_edge {
            let mut terms: Terms = rg_edges.iter().map(|e| (Variable::Edge(*e), 1)).collect();
            terms.push((Variable::Edge(*cfg_edge), -1));
            sink.add_constraint(
                terms,
                ConstraintOp::Equal,
                0,
                format!("rg_edge_{}", cfg_edge.qname(program)),
                ConstraintTag::Structural,
            )?;
        }
        for (node, (src_edges, dst_edges)) in &progress {
            let mut terms: Terms = src_edges.iter().map(|e| (Variable::Edge(*e), 1)).collect();
            terms.extend(dst_edges.iter().map(|e| (Variable::Edge(*e), -1)));
            sink.add_constraint(
                terms,
                ConstraintOp::Equal,
                0,
                format!("rg_progress_{}_{}", program.function_qname(rg.dst), node),
                ConstraintTag::Structural,
            )?;
        }
        Ok(())
    }

    /// GCFG mode: the super-structure carries the outer control flow, each
    /// ABB contributes its machine subregion, and functions called from
    /// inside ABBs are folded in as ordinary functions.
    fn build_gcfg(
        &mut self,
        sink: &mut dyn ConstraintSink,
        flowfacts: &[FlowFact],
    ) -> Result<BuildReport, BuildError> {
        let program = self.program;
        let gcfg = program.gcfg().ok_or(BuildError::GcfgMissing)?;
        if gcfg.entry().is_none() {
            return Err(BuildError::GcfgMissing);
        }

        let mut seen: IndexSet<usize> = IndexSet::new();
        let mut worklist: VecDeque<usize> = VecDeque::from([0]);
        while let Some(n) = worklist.pop_front() {
            if !seen.insert(n) {
                continue;
            }
            for &succ in &gcfg.nodes[n].successors {
                worklist.push_back(succ);
            }
        }
        let reachable_nodes: Vec<usize> = seen.iter().copied().collect();

        // super-structure edges, intra-ABB edges and the splicing overrides
        let mut super_functions: IndexSet<FunctionIndex> = IndexSet::new();
        for &n in &reachable_nodes {
            let node = &gcfg.nodes[n];
            super_functions.insert(node.abb.function);

            for &succ in &node.successors {
                sink.add_variable(Variable::Edge(EdgeId::gcfg_edge(n, succ)), VariableTag::Gcfg);
            }
            if node.may_return {
                sink.add_variable(Variable::Edge(EdgeId::gcfg_exit(n)), VariableTag::Gcfg);
            }

            for &b in &node.abb.blocks {
                let source = BlockRef { function: node.abb.function, block: b };
                for &succ in &program.block(source).successors {
                    if !node.abb.contains(succ) {
                        continue;
                    }
                    let target = BlockRef { function: node.abb.function, block: succ };
                    let edge = EdgeId::block_edge(Level::Machinecode, source, target);
                    sink.add_variable(Variable::Edge(edge), VariableTag::Machinecode);
                    if self.options.instruction_timing {
                        let cost = self.cost.edge_cost(program, &edge);
                        if cost != 0 {
                            sink.add_cost(&Variable::Edge(edge), cost)
                                .map_err(BuildError::from)?;
                        }
                    }
                }
            }

            let in_edges: Vec<EdgeId> = node
                .predecessors
                .iter()
                .filter(|p| seen.contains(*p))
                .map(|&p| EdgeId::gcfg_edge(p, n))
                .collect();
            self.mc_model.set_sum_incoming(node.abb.entry_ref(), in_edges);

            let mut out_edges: Vec<EdgeId> =
                node.successors.iter().map(|&s| EdgeId::gcfg_edge(n, s)).collect();
            if node.may_return {
                out_edges.push(EdgeId::gcfg_exit(n));
            }
            self.mc_model.set_sum_outgoing(node.abb.exit_ref(), out_edges);
        }

        // the super-structure is entered exactly once
        let entry_node = &gcfg.nodes[reachable_nodes[0]];
        let mut entry_terms: Terms = entry_node
            .successors
            .iter()
            .map(|&s| (Variable::Edge(EdgeId::gcfg_edge(entry_node.index, s)), 1))
            .collect();
        if entry_node.may_return {
            entry_terms.push((Variable::Edge(EdgeId::gcfg_exit(entry_node.index)), 1));
        }
        sink.add_constraint(
            entry_terms,
            ConstraintOp::Equal,
            1,
            "structural_gcfg_entry".to_string(),
            ConstraintTag::Structural,
        )?;

        // flow conservation on the super nodes
        for &n in &reachable_nodes {
            let node = &gcfg.nodes[n];
            let in_terms: Terms = node
                .predecessors
                .iter()
                .filter(|p| seen.contains(*p))
                .map(|&p| (Variable::Edge(EdgeId::gcfg_edge(p, n)), -1))
                .collect();
            if in_terms.is_empty() {
                continue;
            }
            let mut terms: Terms = node
                .successors
                .iter()
                .map(|&s| (Variable::Edge(EdgeId::gcfg_edge(n, s)), 1))
                .collect();
            if node.may_return {
                terms.push((Variable::Edge(EdgeId::gcfg_exit(n)), 1));
            }
            terms.extend(in_terms);
            sink.add_constraint(
                terms,
                ConstraintOp::Equal,
                0,
                format!("structural_gcfg_{}", node.name),
                ConstraintTag::Structural,
            )?;
        }

        // intra-ABB flow conservation, spliced through the overrides
        for &n in &reachable_nodes {
            let node = &gcfg.nodes[n];
            for &b in &node.abb.blocks {
                let bref = BlockRef { function: node.abb.function, block: b };
                if program.block(bref).is_data_block() {
                    continue;
                }
                if self.mc_model.infeasible(bref) {
                    self.mc_model
                        .add_infeasible_block_constraint(program, sink, bref)?;
                } else {
                    self.mc_model.add_block_constraint(program, sink, bref)?;
                }
            }
        }

        // functions called from ABB-interior blocks fold in as ordinary
        // functions; reentry into super-structured code is an error
        let mut abb_callsites: Vec<InsnRef> = Vec::new();
        for &n in &reachable_nodes {
            let node = &gcfg.nodes[n];
            for &b in &node.abb.blocks {
                let bref = BlockRef { function: node.abb.function, block: b };
                if program.block(bref).is_data_block() || self.mc_model.infeasible(bref) {
                    continue;
                }
                for insn in program.block(bref).call_sites() {
                    abb_callsites.push(InsnRef { block: bref, index: insn.index });
                }
            }
        }

        let mut roots: Vec<FunctionIndex> = Vec::new();
        for &callsite in &abb_callsites {
            for target in self.resolve_calltargets(callsite)? {
                if !roots.contains(&target) {
                    roots.push(target);
                }
            }
        }
        let folded = self.reachable_functions(sink, roots)?;
        for &f in &folded {
            if super_functions.contains(&f) {
                return Err(BuildError::GcfgReentry {
                    function: program.function_qname(f),
                });
            }
        }
        for &f in &folded {
            self.add_block_constraints(sink, f)?;
        }

        let mut callers = IndexMap::new();
        self.emit_callsites(sink, &abb_callsites, &mut callers)?;
        for &f in &folded {
            let callsites = self.collect_callsites(f);
            self.emit_callsites(sink, &callsites, &mut callers)?;
        }
        for (callee, edges) in &callers {
            self.mc_model
                .add_function_constraint(program, sink, *callee, edges)?;
        }

        for fact in flowfacts {
            self.add_flowfact(sink, fact);
        }

        Ok(BuildReport {
            call_edges: self.call_edges.clone(),
            reachable_functions: folded,
            gcfg_nodes: reachable_nodes,
        })
    }

    /// Lower one flow fact onto ILP variables. Unsupported shapes drop the
    /// fact with a warning; a fact over unreachable code drops only the
    /// constraint, with a debug note.
    fn add_flowfact(&mut self, sink: &mut dyn ConstraintSink, fact: &FlowFact) {
        let program = self.program;
        let model = match fact.level {
            Level::Machinecode => &self.mc_model,
            Level::Bitcode => match &self.bc_model {
                Some(model) => model,
                None => {
                    warn!(fact = %fact.name, "dropping bitcode flow fact: bitcode level is not active");
                    return;
                }
            },
            Level::Gcfg => {
                warn!(fact = %fact.name, "dropping flow fact at unsupported level gcfg");
                return;
            }
        };

        let Some(mut rhs) = fact.rhs.constant() else {
            warn!(fact = %fact.name, "dropping flow fact with symbolic right-hand side");
            return;
        };

        let lhs: Vec<Term> = if fact.level == Level::Bitcode {
            match replace_markers(&self.markers, fact) {
                Some(lhs) => lhs,
                None => return,
            }
        } else {
            fact.lhs.clone()
        };

        let mut terms: Terms = Vec::new();
        for term in &lhs {
            if !term.context.is_empty() {
                warn!(fact = %fact.name, "dropping flow fact with context-sensitive term");
                return;
            }
            match &term.point {
                ProgramPoint::Function(f) => {
                    terms.extend(model.function_frequency(program, *f, term.factor));
                }
                ProgramPoint::Block(b) => {
                    terms.extend(model.block_frequency(program, *b, term.factor));
                }
                ProgramPoint::Edge { source, target } => {
                    terms.extend(model.edge_frequency(*source, *target, term.factor));
                }
                ProgramPoint::Loop(header) => {
                    terms.extend(model.sum_loop_entry(program, *header, term.factor));
                }
                ProgramPoint::Constant(k) => {
                    rhs -= term.factor * k;
                }
                ProgramPoint::Instruction(_) => {
                    warn!(fact = %fact.name, "dropping flow fact with instruction-level term");
                    return;
                }
                ProgramPoint::Marker(_) => {
                    warn!(fact = %fact.name, "dropping flow fact with marker outside bitcode");
                    return;
                }
            }
        }

        if !fact.scope.context.is_empty() {
            warn!(fact = %fact.name, "dropping flow fact with context-sensitive scope");
            return;
        }
        match fact.scope.point {
            ScopePoint::Function(f) => {
                terms.extend(model.function_frequency(program, f, -rhs));
            }
            ScopePoint::Loop(header) => {
                terms.extend(model.sum_loop_entry(program, header, -rhs));
            }
        }

        self.ff_count += 1;
        let name = format!("ff_{}", self.ff_count);
        if let Err(err) = sink.add_constraint(terms, fact.op, 0, name, ConstraintTag::Flowfact) {
            debug!(fact = %fact.name, %err, "dropping flow-fact constraint over unreachable code");
        }
    }
}

/// Expand every marker term into one block term per instruction carrying
/// the marker, preserving the factor. An unknown marker drops the fact.
fn replace_markers(markers: &IndexMap<String, Vec<InsnRef>>, fact: &FlowFact) -> Option<Vec<Term>> {
    let mut lhs = Vec::new();
    for term in &fact.lhs {
        if let ProgramPoint::Marker(name) = &term.point {
            let Some(insns) = markers.get(name) else {
                warn!(fact = %fact.name, marker = %name, "dropping flow fact: no instructions carry marker");
                return None;
            };
            for insn in insns {
                lhs.push(Term {
                    factor: term.factor,
                    point: ProgramPoint::Block(insn.block),
                    context: term.context.clone(),
                });
            }
        } else {
            lhs.push(term.clone());
        }
    }
    Some(lhs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ilp::LinearSystem;
    use crate::model::{Context, Program};

    #[test]
    fn test_builder_rejects_second_build() {
        let mut pb = Program::builder();
        let f = pb.add_function(Level::Machinecode, "main", 0);
        pb.add_block(f, true);
        let program = pb.finish();

        let mut builder = IpetBuilder::new(&program, BuildOptions::default(), &ZeroCost);
        let mut sink = LinearSystem::new();
        builder.build(&mut sink, &[]).unwrap();
        let err = builder.build(&mut sink, &[]).unwrap_err();
        assert!(matches!(err, BuildError::BuilderReinvocation));
    }

    #[test]
    fn test_unknown_entry_is_an_error() {
        let program = Program::builder().finish();
        let mut builder = IpetBuilder::new(&program, BuildOptions::default(), &ZeroCost);
        let mut sink = LinearSystem::new();
        let err = builder.build(&mut sink, &[]).unwrap_err();
        assert!(matches!(err, BuildError::EntryNotFound(name) if name == "main"));
    }

    #[test]
    fn test_bitcode_under_gcfg_is_rejected() {
        let program = Program::builder().finish();
        let options = BuildOptions {
            use_bitcode: true,
            use_gcfg: true,
            ..BuildOptions::default()
        };
        let mut builder = IpetBuilder::new(&program, options, &ZeroCost);
        let mut sink = LinearSystem::new();
        let err = builder.build(&mut sink, &[]).unwrap_err();
        assert!(matches!(err, BuildError::BitcodeUnderGcfg));
    }

    #[test]
    fn test_marker_expansion_preserves_factors() {
        let f = FunctionIndex(0);
        let b1 = BlockRef { function: f, block: 1 };
        let b2 = BlockRef { function: f, block: 2 };
        let mut markers: IndexMap<String, Vec<InsnRef>> = IndexMap::new();
        markers.insert(
            "lap".to_string(),
            vec![InsnRef { block: b1, index: 0 }, InsnRef { block: b2, index: 3 }],
        );

        let fact = FlowFact::new(
            "marked",
            Level::Bitcode,
            crate::model::Scope::function(f),
            vec![Term::new(7, ProgramPoint::Marker("lap".to_string()))],
            ConstraintOp::LessEqual,
            crate::model::Rhs::Constant(10),
        );

        let lhs = replace_markers(&markers, &fact).unwrap();
        assert_eq!(lhs.len(), 2);
        assert_eq!(lhs[0], Term::new(7, ProgramPoint::Block(b1)));
        assert_eq!(lhs[1], Term::new(7, ProgramPoint::Block(b2)));

        let unknown = FlowFact::new(
            "unknown",
            Level::Bitcode,
            crate::model::Scope::function(f),
            vec![Term::new(1, ProgramPoint::Marker("missing".to_string()))],
            ConstraintOp::LessEqual,
            crate::model::Rhs::Constant(10),
        );
        assert!(replace_markers(&markers, &unknown).is_none());
    }

    #[test]
    fn test_context_sensitive_fact_is_dropped() {
        let mut pb = Program::builder();
        let f = pb.add_function(Level::Machinecode, "main", 0);
        let b0 = pb.add_block(f, false);
        let b1 = pb.add_block(f, true);
        pb.add_edge(b0, b1);
        let program = pb.finish();

        let mut fact = FlowFact::new(
            "ctx",
            Level::Machinecode,
            crate::model::Scope::function(f),
            vec![Term::new(1, ProgramPoint::Block(b1))],
            ConstraintOp::LessEqual,
            crate::model::Rhs::Constant(5),
        );
        fact.scope.context = Context::new("caller->main");

        let mut builder = IpetBuilder::new(&program, BuildOptions::default(), &ZeroCost);
        let mut sink = LinearSystem::new();
        builder.build(&mut sink, &[fact]).unwrap();
        // the fact was dropped: no flowfact constraint emitted
        assert_eq!(sink.constraints_tagged(ConstraintTag::Flowfact).count(), 0);
    }
}
