// ipet: IPET constraint builder for WCET analysis
//
// Turns control-flow graphs, relation graphs, an optional GCFG of atomic
// basic blocks and a set of flow facts into an integer linear program
// whose objective value upper-bounds the execution time of an entry
// procedure. Solving the program is the caller's business.

pub mod error;
pub mod ilp;
pub mod ipet;
pub mod model;

pub use error::{BuildError, UnknownVariable};
pub use ilp::{ConstraintOp, ConstraintSink, ConstraintTag, LinearSystem, VariableTag};
pub use ipet::{BuildOptions, BuildReport, CostModel, EdgeId, IpetBuilder, Variable, ZeroCost};
