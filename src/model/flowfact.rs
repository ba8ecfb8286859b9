//! Flow facts: quantitative constraints on execution frequencies
//!
//! A flow fact states `Σ factor·frequency(programpoint) op rhs` within a
//! scope (a function or a loop). Two special shapes are recognized before
//! ILP construction: call-target restrictions and block infeasibility.

use super::{BlockRef, FunctionIndex, InsnRef, Level};
use crate::ilp::ConstraintOp;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Calling context. The empty context means "globally".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Context(pub String);

impl Context {
    pub fn empty() -> Self {
        Context(String::new())
    }

    pub fn new(s: &str) -> Self {
        Context(s.to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "<global>")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Program point a flow-fact term can talk about.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProgramPoint {
    Function(FunctionIndex),
    Block(BlockRef),
    /// CFG edge; `target == None` is the exit sentinel.
    Edge { source: BlockRef, target: Option<usize> },
    /// Loop, identified by its header block.
    Loop(BlockRef),
    Instruction(InsnRef),
    /// Symbolic marker on a bitcode instruction; resolved before lowering.
    Marker(String),
    /// Integer constant; moves to the right-hand side during lowering.
    Constant(i64),
}

/// One term of a flow-fact left-hand side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Term {
    pub factor: i64,
    pub point: ProgramPoint,
    pub context: Context,
}

impl Term {
    pub fn new(factor: i64, point: ProgramPoint) -> Self {
        Term { factor, point, context: Context::empty() }
    }
}

/// Scope program point: the region a fact is relative to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopePoint {
    Function(FunctionIndex),
    /// Loop, identified by its header block.
    Loop(BlockRef),
}

/// Scoped program point of a flow fact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub point: ScopePoint,
    pub context: Context,
}

impl Scope {
    pub fn function(f: FunctionIndex) -> Self {
        Scope { point: ScopePoint::Function(f), context: Context::empty() }
    }

    pub fn of_loop(header: BlockRef) -> Self {
        Scope { point: ScopePoint::Loop(header), context: Context::empty() }
    }
}

/// Right-hand side of a flow fact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rhs {
    Constant(i64),
    Symbolic(String),
}

impl Rhs {
    pub fn constant(&self) -> Option<i64> {
        match self {
            Rhs::Constant(c) => Some(*c),
            Rhs::Symbolic(_) => None,
        }
    }
}

/// A flow fact.
#[derive(Debug, Clone)]
pub struct FlowFact {
    /// Diagnostic identity, named in warnings when the fact is dropped.
    pub name: String,
    /// Level the fact's program points live at.
    pub level: Level,
    pub scope: Scope,
    pub lhs: Vec<Term>,
    pub op: ConstraintOp,
    pub rhs: Rhs,
}

impl FlowFact {
    pub fn new(name: &str, level: Level, scope: Scope, lhs: Vec<Term>, op: ConstraintOp, rhs: Rhs) -> Self {
        FlowFact { name: name.to_string(), level, scope, lhs, op, rhs }
    }

    /// Whether this fact holds on every execution entering at `entry`:
    /// context-insensitive and scoped to the entry function itself.
    pub fn globally_valid(&self, entry: FunctionIndex) -> bool {
        self.scope.context.is_empty()
            && matches!(self.scope.point, ScopePoint::Function(f) if f == entry)
    }

    /// Recognize the call-target restriction shape: exactly one `+1`
    /// instruction term, the rest `-1` function terms, constant zero RHS.
    /// Returns the call site and the permitted targets.
    pub fn calltarget_restriction(&self) -> Option<(InsnRef, Vec<FunctionIndex>)> {
        if self.rhs.constant()? != 0 {
            return None;
        }
        let mut callsite = None;
        let mut targets = Vec::new();
        for term in &self.lhs {
            if !term.context.is_empty() {
                return None;
            }
            match (&term.point, term.factor) {
                (ProgramPoint::Instruction(i), 1) if callsite.is_none() => callsite = Some(*i),
                (ProgramPoint::Function(f), -1) => targets.push(*f),
                _ => return None,
            }
        }
        Some((callsite?, targets))
    }

    /// Recognize the block-infeasibility shape: a single positive block
    /// term equal to a constant zero RHS. Returns the dead block.
    pub fn block_infeasible(&self) -> Option<BlockRef> {
        if self.op != ConstraintOp::Equal || self.rhs.constant()? != 0 || self.lhs.len() != 1 {
            return None;
        }
        let term = &self.lhs[0];
        if term.factor != 1 || !term.context.is_empty() {
            return None;
        }
        match term.point {
            ProgramPoint::Block(b) => Some(b),
            _ => None,
        }
    }
}
