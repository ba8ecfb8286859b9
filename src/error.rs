//! Error taxonomy for constraint building
//!
//! Fatal conditions abort the build and invalidate whatever was already
//! emitted to the constraint sink. Recoverable conditions (unsupported flow
//! fact shapes, unknown markers, constraints over unreachable code) never
//! surface here; they are logged and the offending fact or constraint is
//! dropped.

use thiserror::Error;

/// Fatal errors raised while building the IPET constraint system.
///
/// On any of these the partially built constraint set must be discarded by
/// the caller.
#[derive(Debug, Error)]
pub enum BuildError {
    /// A call site has neither a static callee list nor a flow-fact
    /// provided target set.
    #[error("unresolved indirect call at {callsite} (in block {block})")]
    UnresolvedIndirectCall {
        /// Qualified name of the call instruction.
        callsite: String,
        /// Qualified name of the enclosing block, as a source hint.
        block: String,
    },

    /// A builder instance was asked to build twice.
    #[error("IPET builder invoked twice; builders are single-use")]
    BuilderReinvocation,

    /// The configured analysis entry does not exist in the program model.
    #[error("entry function '{0}' not found in program model")]
    EntryNotFound(String),

    /// A GCFG build was requested but the program model carries no GCFG.
    #[error("global control-flow graph requested but program model has none")]
    GcfgMissing,

    /// Bitcode coupling and the GCFG super-structure cannot be combined.
    #[error("bitcode coupling is not supported together with a global control-flow graph")]
    BitcodeUnderGcfg,

    /// A function folded in through an ordinary call is already part of the
    /// GCFG super-structure.
    #[error("function {function} is reachable both through the super-structure and an ordinary call")]
    GcfgReentry { function: String },

    /// A structural constraint referenced a variable that was never
    /// declared. Indicates a builder bug, not bad input.
    #[error(transparent)]
    UnknownVariable(#[from] UnknownVariable),
}

/// Recoverable error from the ILP facade: a constraint or cost referenced a
/// variable that was never declared.
///
/// Constraint builders catch this for flow-fact constraints (the fact may
/// mention code that proved unreachable) and drop the constraint.
#[derive(Debug, Clone, Error)]
#[error("constraint references undeclared variable {variable}")]
pub struct UnknownVariable {
    /// Debug rendering of the offending variable.
    pub variable: String,
}
