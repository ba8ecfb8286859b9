//! Control-flow refinement from flow facts
//!
//! Runs before any ILP variable is emitted: flow facts that restrict
//! feasibility are absorbed into per-level tables answering "is this block
//! infeasible in this context?" and "what may this call site call in this
//! context?". Infeasibility is propagated to a fixed point over the CFG.

use crate::model::{BlockRef, Context, FlowFact, FunctionIndex, InsnRef, Level, Program};
use indexmap::{IndexMap, IndexSet};
use std::collections::HashMap;
use std::hash::Hash;
use tracing::debug;

/// Nested mapping `key -> context -> value` with insert-or-merge semantics.
///
/// Presence under the empty context means the refinement holds globally.
#[derive(Debug, Clone)]
pub(crate) struct RefinementTable<K, V> {
    entries: HashMap<K, IndexMap<Context, V>>,
}

impl<K: Eq + Hash, V> RefinementTable<K, V> {
    fn new() -> Self {
        RefinementTable { entries: HashMap::new() }
    }

    /// Insert `value` at `(key, context)`, merging with an existing entry.
    fn add<F: FnOnce(&mut V, V)>(&mut self, key: K, context: Context, value: V, merge: F) {
        let by_context = self.entries.entry(key).or_default();
        match by_context.get_mut(&context) {
            Some(existing) => merge(existing, value),
            None => {
                by_context.insert(context, value);
            }
        }
    }

    fn get(&self, key: &K, context: &Context) -> Option<&V> {
        self.entries.get(key)?.get(context)
    }

    /// Entry under the empty context, the universal refinement.
    fn get_global(&self, key: &K) -> Option<&V> {
        self.get(key, &Context::empty())
    }
}

/// Per-level feasibility and call-target refinement.
///
/// Built once from the globally valid flow facts, read-only afterwards.
#[derive(Debug, Clone)]
pub struct ControlFlowRefinement {
    level: Level,
    infeasible: RefinementTable<BlockRef, ()>,
    calltargets: RefinementTable<InsnRef, IndexSet<FunctionIndex>>,
}

impl ControlFlowRefinement {
    pub fn new(level: Level) -> Self {
        ControlFlowRefinement {
            level,
            infeasible: RefinementTable::new(),
            calltargets: RefinementTable::new(),
        }
    }

    pub fn level(&self) -> Level {
        self.level
    }

    /// Absorb one flow fact. Facts that are neither a call-target
    /// restriction nor a block-infeasibility statement are ignored here;
    /// they are lowered onto the ILP later.
    pub fn add_flowfact(&mut self, program: &Program, fact: &FlowFact) {
        if let Some((callsite, targets)) = fact.calltarget_restriction() {
            debug!(fact = %fact.name, "refining call targets from flow fact");
            self.add_calltargets(callsite, fact.scope.context.clone(), targets.into_iter().collect());
        } else if let Some(block) = fact.block_infeasible() {
            debug!(fact = %fact.name, "marking block infeasible from flow fact");
            self.set_infeasible(program, block, &fact.scope.context);
        }
    }

    /// Intersect `targets` into the set at `(callsite, context)`.
    pub fn add_calltargets(
        &mut self,
        callsite: InsnRef,
        context: Context,
        targets: IndexSet<FunctionIndex>,
    ) {
        self.calltargets.add(callsite, context, targets, |existing, new| {
            existing.retain(|f| new.contains(f));
        });
    }

    /// Mark `(block, context)` infeasible and propagate to a fixed point.
    ///
    /// A block dies when all its successors are dead, or when all its
    /// non-back-edge predecessors are dead. Back edges do not keep a loop
    /// header alive from below, and they do not kill it either.
    // XXX: ad-hoc propagation, does not consider loop contexts
    pub fn set_infeasible(&mut self, program: &Program, block: BlockRef, context: &Context) {
        self.mark_infeasible(block, context);
        let mut worklist = vec![block];

        while let Some(current) = worklist.pop() {
            let function = current.function;
            let blk = program.block(current);

            for &succ_ix in &blk.successors {
                let succ = BlockRef { function, block: succ_ix };
                if self.infeasible(succ, context) {
                    continue;
                }
                let succ_blk = program.block(succ);
                let preds_closed = succ_blk.predecessors.iter().all(|&p| {
                    succ_blk.is_back_edge_from(p)
                        || self.infeasible(BlockRef { function, block: p }, context)
                });
                if preds_closed {
                    self.mark_infeasible(succ, context);
                    worklist.push(succ);
                }
            }

            for &pred_ix in &blk.predecessors {
                let pred = BlockRef { function, block: pred_ix };
                if self.infeasible(pred, context) {
                    continue;
                }
                let pred_blk = program.block(pred);
                let succs_closed = pred_blk
                    .successors
                    .iter()
                    .all(|&s| self.infeasible(BlockRef { function, block: s }, context));
                if succs_closed {
                    self.mark_infeasible(pred, context);
                    worklist.push(pred);
                }
            }
        }
    }

    fn mark_infeasible(&mut self, block: BlockRef, context: &Context) {
        self.infeasible.add(block, context.clone(), (), |_, _| {});
    }

    /// Whether `block` is infeasible: marked under the empty context, or
    /// under the queried context.
    pub fn infeasible(&self, block: BlockRef, context: &Context) -> bool {
        if self.infeasible.get_global(&block).is_some() {
            return true;
        }
        !context.is_empty() && self.infeasible.get(&block, context).is_some()
    }

    /// Resolved call targets at `(callsite, context)`: the intersection of
    /// the statically declared callees, the global refinement and the
    /// context-specific refinement. `None` means no source of targets
    /// exists at all (an unresolved indirect call).
    pub fn calltargets(
        &self,
        program: &Program,
        callsite: InsnRef,
        context: &Context,
    ) -> Option<IndexSet<FunctionIndex>> {
        let mut sets: Vec<IndexSet<FunctionIndex>> = Vec::new();

        let insn = program.instruction(callsite);
        if let Some(callees) = insn.callees.as_ref().filter(|c| !c.is_empty()) {
            let resolved: IndexSet<FunctionIndex> = callees
                .iter()
                .filter_map(|name| {
                    let f = program.lookup(self.level, name);
                    if f.is_none() {
                        debug!(callee = %name, "static callee not present in program model");
                    }
                    f
                })
                .collect();
            sets.push(resolved);
        }
        if let Some(global) = self.calltargets.get_global(&callsite) {
            sets.push(global.clone());
        }
        if !context.is_empty() {
            if let Some(specific) = self.calltargets.get(&callsite, context) {
                sets.push(specific.clone());
            }
        }

        let mut iter = sets.into_iter();
        let mut result = iter.next()?;
        for set in iter {
            result.retain(|f| set.contains(f));
        }
        Some(result)
    }
}
