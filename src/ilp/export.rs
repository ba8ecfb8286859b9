//! Constraint system export to lp_solve and JSON formats

use super::{ConstraintOp, ConstraintTag, LinearSystem, VariableTag};
use crate::model::Program;
use serde::{Deserialize, Serialize};
use std::fmt::Write;

/// Export a constraint system in lp_solve text format.
///
/// Variables are named `x{i}` by declaration index; the qualified names are
/// emitted as comments so the listing stays readable. All flow variables
/// are integral.
pub fn export_lp(system: &LinearSystem, program: &Program) -> String {
    let mut lp = String::from("/* IPET constraint system */\n");

    for (ix, (var, _)) in system.variables().enumerate() {
        writeln!(lp, "/* x{} = {} */", ix, var.qname(program)).ok();
    }

    // Objective: maximize accumulated cycle cost
    let objective: Vec<String> = system
        .objective()
        .filter(|(_, &cost)| cost != 0)
        .map(|(var, cost)| format!("{} x{}", cost, system.variable_index(var).unwrap()))
        .collect();
    if objective.is_empty() {
        lp.push_str("max: 0;\n");
    } else {
        writeln!(lp, "max: {};", objective.join(" + ")).ok();
    }

    for constraint in system.constraints() {
        let terms: Vec<String> = constraint
            .terms
            .iter()
            .map(|(var, coeff)| {
                format!("{:+} x{}", coeff, system.variable_index(var).unwrap())
            })
            .collect();
        writeln!(
            lp,
            "{}: {} {} {};",
            sanitize_name(&constraint.name),
            terms.join(" "),
            constraint.op,
            constraint.rhs
        )
        .ok();
    }

    if system.num_variables() > 0 {
        let names: Vec<String> = (0..system.num_variables()).map(|i| format!("x{}", i)).collect();
        writeln!(lp, "int {};", names.join(", ")).ok();
    }

    lp
}

// lp_solve identifiers must not contain separators from qualified names
fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Complete constraint system export for JSON serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemExport {
    pub variables: Vec<VariableExport>,
    pub constraints: Vec<ConstraintExport>,
    pub objective: Vec<(String, i64)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableExport {
    pub index: usize,
    pub name: String,
    pub tag: VariableTag,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstraintExport {
    pub name: String,
    pub tag: ConstraintTag,
    pub terms: Vec<(String, i64)>,
    pub op: ConstraintOp,
    pub rhs: i64,
}

/// Export a constraint system to a JSON-serializable form.
pub fn export_json(system: &LinearSystem, program: &Program) -> SystemExport {
    let variables = system
        .variables()
        .enumerate()
        .map(|(index, (var, tag))| VariableExport {
            index,
            name: var.qname(program),
            tag: *tag,
        })
        .collect();

    let constraints = system
        .constraints()
        .iter()
        .map(|c| ConstraintExport {
            name: c.name.clone(),
            tag: c.tag,
            terms: c
                .terms
                .iter()
                .map(|(var, coeff)| (var.qname(program), *coeff))
                .collect(),
            op: c.op,
            rhs: c.rhs,
        })
        .collect();

    let objective = system
        .objective()
        .map(|(var, cost)| (var.qname(program), *cost))
        .collect();

    SystemExport { variables, constraints, objective }
}
