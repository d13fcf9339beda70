//! Multi-stage distributed plan model and physical explain.
//!
//! [`DistributedPlanner::plan`] runs the full pipeline over a plan tree with
//! exchange markers:
//! 1. [`stage::fragment`] cuts the tree into stages,
//! 2. [`assignment::assign_workers`] places stage workers on the cluster,
//! 3. [`mailbox::assign_mailboxes`] wires the stage edges,
//! 4. [`DispatchablePlan::from_components`] validates the result.
//!
//! [`explain`] renders the resulting plan annotated with stage and worker
//! placement.

pub mod assignment;
pub mod dispatchable;
pub mod explain;
pub mod mailbox;
pub mod routing;
pub mod stage;

use msq_common::{DispatchConfig, Result};
use msq_planner::PlanNode;
use tracing::debug;

pub use assignment::{ServerWorkers, WorkerAssignment, assign_workers};
pub use dispatchable::{DispatchablePlan, DispatchableStage};
pub use explain::{explain, explain_from, explain_from_worker};
pub use mailbox::{MailboxInfo, WorkerMetadata, assign_mailboxes};
pub use routing::{ClusterState, ServerInstance, StaticCluster};
pub use stage::{Stage, fragment};

/// Turns logical plan trees into validated [`DispatchablePlan`]s.
#[derive(Debug, Clone, Default)]
pub struct DistributedPlanner {
    config: DispatchConfig,
}

impl DistributedPlanner {
    pub fn new(config: DispatchConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn plan(&self, root: PlanNode, cluster: &dyn ClusterState) -> Result<DispatchablePlan> {
        debug!(
            root = root.kind_name(),
            workers_per_server = self.config.intermediate_workers_per_server,
            operator = "DistributedPlanner",
            "planning query"
        );
        let stages = fragment(root)?;
        let assignments = assign_workers(&stages, cluster, &self.config)?;
        let mailboxes = assign_mailboxes(&stages, &assignments)?;
        DispatchablePlan::from_components(stages, assignments, mailboxes)
    }
}
