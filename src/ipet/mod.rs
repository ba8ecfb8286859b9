// IPET constraint construction: flow variables, refinement, per-level
// models and the orchestrating builder

pub mod builder;
pub mod edge;
pub mod model;
pub mod refinement;

pub use builder::{BuildOptions, BuildReport, CostModel, IpetBuilder, ZeroCost};
pub use edge::{EdgeId, EdgeLevel, EdgeSource, EdgeTarget, Variable};
pub use model::IpetModel;
pub use refinement::ControlFlowRefinement;
