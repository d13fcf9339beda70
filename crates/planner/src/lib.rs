//! Plan node tree shared by stage fragmentation, dispatch and explain.
//!
//! Key modules:
//! - [`plan_node`]: operator variants and their config
//! - [`visitor`]: per-variant visitation contract
//! - [`explain`]: operator text and stage-local tree rendering

pub mod explain;
pub mod plan_node;
pub mod visitor;

pub use explain::explain_tree;
pub use plan_node::*;
pub use visitor::PlanNodeVisitor;
