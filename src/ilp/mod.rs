//! Constraint sink: the contract between the IPET builder and an ILP solver
//!
//! The builder only ever appends: variables, linear constraints, objective
//! cost coefficients. [`LinearSystem`] is the in-memory implementation used
//! by the tests and handed to downstream solver bindings; variable indices
//! and constraint order reproduce the emission order exactly, so two builds
//! on identical inputs produce identical systems.

pub mod export;

pub use export::{ConstraintExport, SystemExport, VariableExport};

use crate::error::UnknownVariable;
use crate::ipet::edge::Variable;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Comparison operator of a linear constraint (and of a flow fact).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConstraintOp {
    Equal,
    LessEqual,
}

impl fmt::Display for ConstraintOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstraintOp::Equal => write!(f, "="),
            ConstraintOp::LessEqual => write!(f, "<="),
        }
    }
}

/// Category of a constraint, used by downstream tooling to filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConstraintTag {
    Structural,
    Callsite,
    Instruction,
    Infeasible,
    Flowfact,
}

/// Level tag attached to a declared variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableTag {
    Machinecode,
    Bitcode,
    Gcfg,
    RelationGraph,
}

/// Facade over an external ILP solver. All methods are append-only; the
/// builder calls them sequentially.
pub trait ConstraintSink {
    /// Declare a decision variable. Re-declaring is a no-op.
    fn add_variable(&mut self, var: Variable, tag: VariableTag);

    fn has_variable(&self, var: &Variable) -> bool;

    /// Append `Σ coeff·var op rhs`. Referencing an undeclared variable is
    /// a recoverable error; the caller decides whether to drop or abort.
    fn add_constraint(
        &mut self,
        terms: Vec<(Variable, i64)>,
        op: ConstraintOp,
        rhs: i64,
        name: String,
        tag: ConstraintTag,
    ) -> Result<(), UnknownVariable>;

    /// Accumulate an objective coefficient onto a declared variable.
    fn add_cost(&mut self, var: &Variable, cost: i64) -> Result<(), UnknownVariable>;
}

/// One recorded constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraint {
    pub name: String,
    pub tag: ConstraintTag,
    pub terms: Vec<(Variable, i64)>,
    pub op: ConstraintOp,
    pub rhs: i64,
}

/// In-memory recording of the constraint system.
#[derive(Debug, Clone, Default)]
pub struct LinearSystem {
    variables: IndexMap<Variable, VariableTag>,
    constraints: Vec<Constraint>,
    costs: IndexMap<Variable, i64>,
}

impl LinearSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declared variables in declaration order.
    pub fn variables(&self) -> impl Iterator<Item = (&Variable, &VariableTag)> {
        self.variables.iter()
    }

    pub fn num_variables(&self) -> usize {
        self.variables.len()
    }

    /// Position of a variable in declaration order.
    pub fn variable_index(&self, var: &Variable) -> Option<usize> {
        self.variables.get_index_of(var)
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    /// Constraints carrying the given tag.
    pub fn constraints_tagged(&self, tag: ConstraintTag) -> impl Iterator<Item = &Constraint> {
        self.constraints.iter().filter(move |c| c.tag == tag)
    }

    pub fn constraint_by_name(&self, name: &str) -> Option<&Constraint> {
        self.constraints.iter().find(|c| c.name == name)
    }

    /// Accumulated objective coefficient of a variable.
    pub fn cost(&self, var: &Variable) -> i64 {
        self.costs.get(var).copied().unwrap_or(0)
    }

    /// Objective entries in first-touch order.
    pub fn objective(&self) -> impl Iterator<Item = (&Variable, &i64)> {
        self.costs.iter()
    }
}

impl ConstraintSink for LinearSystem {
    fn add_variable(&mut self, var: Variable, tag: VariableTag) {
        self.variables.entry(var).or_insert(tag);
    }

    fn has_variable(&self, var: &Variable) -> bool {
        self.variables.contains_key(var)
    }

    fn add_constraint(
        &mut self,
        terms: Vec<(Variable, i64)>,
        op: ConstraintOp,
        rhs: i64,
        name: String,
        tag: ConstraintTag,
    ) -> Result<(), UnknownVariable> {
        // merge coefficients of repeated variables, keeping first-touch order
        let mut merged: IndexMap<Variable, i64> = IndexMap::new();
        for (var, coeff) in terms {
            if !self.variables.contains_key(&var) {
                return Err(UnknownVariable { variable: format!("{var:?}") });
            }
            *merged.entry(var).or_insert(0) += coeff;
        }
        let terms = merged.into_iter().collect();
        self.constraints.push(Constraint { name, tag, terms, op, rhs });
        Ok(())
    }

    fn add_cost(&mut self, var: &Variable, cost: i64) -> Result<(), UnknownVariable> {
        if !self.variables.contains_key(var) {
            return Err(UnknownVariable { variable: format!("{var:?}") });
        }
        *self.costs.entry(*var).or_insert(0) += cost;
        Ok(())
    }
}
