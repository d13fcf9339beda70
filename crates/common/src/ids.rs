//! Typed identifiers shared across planner/dispatch components.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable stage identifier within a query. Stage `0` is always the root stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StageId(
    /// Raw numeric id value.
    pub u32,
);

impl StageId {
    /// Id of the root (result-collecting) stage.
    pub const ROOT: StageId = StageId(0);
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Worker identifier local to one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkerId(
    /// Raw numeric id value.
    pub u32,
);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Plan node identifier, unique within one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PlanNodeId(
    /// Raw numeric id value.
    pub u32,
);

impl fmt::Display for PlanNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
