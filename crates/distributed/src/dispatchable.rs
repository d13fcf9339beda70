//! The fully resolved, immutable distributed plan handed to explain and to
//! the dispatcher.
//!
//! Construction validates every structural invariant up front:
//! - the root stage exists and runs exactly one worker;
//! - every stage is reachable from the root and has a non-empty worker set;
//! - every node carries the id of the stage holding it, node ids are unique;
//! - each mailbox-receive names an existing stage rooted at a mailbox-send
//!   that lists the receiving stage, and vice versa;
//! - worker metadata exists for exactly the assigned workers, with sorted
//!   endpoints for every receiver stage.
//!
//! There is no mutating API; a plan is shared by reference once built.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use msq_common::{MsqError, PlanNodeId, Result, StageId, WorkerId};
use msq_planner::{
    AggregateNode, ExplainedNode, FilterNode, JoinNode, MailboxReceiveNode, MailboxSendNode,
    NodeKind, PlanNode, PlanNodeVisitor, ProjectNode, SetOpNode, SortNode, TableScanNode,
    ValueNode, WindowNode,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::assignment::WorkerAssignment;
use crate::mailbox::{MailboxInfo, WorkerMetadata};
use crate::stage::Stage;

/// One stage with its workers and their mailboxes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchableStage {
    pub stage: Stage,
    pub assignment: WorkerAssignment,
    pub workers: BTreeMap<WorkerId, WorkerMetadata>,
}

impl DispatchableStage {
    pub fn worker_metadata(&self, worker_id: WorkerId) -> Result<&WorkerMetadata> {
        self.workers.get(&worker_id).ok_or_else(|| {
            MsqError::StructuralInconsistency(format!(
                "stage {} has no metadata for worker {worker_id}",
                self.stage.id
            ))
        })
    }

    /// Endpoints `worker_id` sends to for `receiver`.
    pub fn send_mailboxes(&self, worker_id: WorkerId, receiver: StageId) -> Result<&[MailboxInfo]> {
        self.worker_metadata(worker_id)?
            .send_mailboxes
            .get(&receiver)
            .map(Vec::as_slice)
            .ok_or_else(|| {
                MsqError::StructuralInconsistency(format!(
                    "stage {} worker {worker_id} has no mailbox entry for receiver stage {receiver}",
                    self.stage.id
                ))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PlanParts")]
pub struct DispatchablePlan {
    root_stage_id: StageId,
    stages: BTreeMap<StageId, DispatchableStage>,
}

#[derive(Deserialize)]
struct PlanParts {
    root_stage_id: StageId,
    stages: BTreeMap<StageId, DispatchableStage>,
}

impl TryFrom<PlanParts> for DispatchablePlan {
    type Error = MsqError;

    fn try_from(parts: PlanParts) -> Result<Self> {
        DispatchablePlan::new(parts.root_stage_id, parts.stages)
    }
}

impl DispatchablePlan {
    /// Validates and wraps a stage map. An empty map is the empty plan.
    pub fn new(
        root_stage_id: StageId,
        stages: BTreeMap<StageId, DispatchableStage>,
    ) -> Result<Self> {
        let plan = Self {
            root_stage_id,
            stages,
        };
        plan.validate()?;
        Ok(plan)
    }

    pub fn empty() -> Self {
        Self {
            root_stage_id: StageId::ROOT,
            stages: BTreeMap::new(),
        }
    }

    /// Joins the planning outputs stage by stage and validates the result.
    pub fn from_components(
        stages: Vec<Stage>,
        mut assignments: BTreeMap<StageId, WorkerAssignment>,
        mut mailboxes: BTreeMap<StageId, BTreeMap<WorkerId, WorkerMetadata>>,
    ) -> Result<Self> {
        let mut out = BTreeMap::new();
        for stage in stages {
            let assignment = assignments.remove(&stage.id).ok_or_else(|| {
                MsqError::StructuralInconsistency(format!(
                    "no worker assignment for stage {}",
                    stage.id
                ))
            })?;
            let workers = mailboxes.remove(&stage.id).ok_or_else(|| {
                MsqError::StructuralInconsistency(format!(
                    "no mailbox metadata for stage {}",
                    stage.id
                ))
            })?;
            out.insert(
                stage.id,
                DispatchableStage {
                    stage,
                    assignment,
                    workers,
                },
            );
        }
        if let Some(stage_id) = assignments.keys().chain(mailboxes.keys()).next() {
            return Err(MsqError::StructuralInconsistency(format!(
                "assignment or mailbox metadata for unknown stage {stage_id}"
            )));
        }
        let plan = Self::new(StageId::ROOT, out)?;
        info!(
            stages = plan.stages.len(),
            workers = plan.worker_count(),
            operator = "DispatchablePlan",
            "dispatchable plan built"
        );
        Ok(plan)
    }

    /// Builds without validation, so tests can inject faults.
    #[cfg(test)]
    pub(crate) fn from_parts_unchecked(
        root_stage_id: StageId,
        stages: BTreeMap<StageId, DispatchableStage>,
    ) -> Self {
        Self {
            root_stage_id,
            stages,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn root_stage_id(&self) -> StageId {
        self.root_stage_id
    }

    pub fn root_stage(&self) -> Result<&DispatchableStage> {
        self.stage(self.root_stage_id)
    }

    pub fn stage(&self, stage_id: StageId) -> Result<&DispatchableStage> {
        self.stages.get(&stage_id).ok_or_else(|| {
            MsqError::StructuralInconsistency(format!("stage {stage_id} is not part of the plan"))
        })
    }

    pub fn stages(&self) -> impl Iterator<Item = &DispatchableStage> {
        self.stages.values()
    }

    pub fn worker_count(&self) -> usize {
        self.stages.values().map(|s| s.assignment.worker_count()).sum()
    }

    /// The mailbox-send feeding `receive`, which must sit in `receiver_stage`.
    pub fn sender_of(
        &self,
        receive: &MailboxReceiveNode,
        receiver_stage: StageId,
    ) -> Result<(&PlanNode, &MailboxSendNode)> {
        let sender_stage = self.stage(receive.sender_stage_id)?;
        let root = &sender_stage.stage.root;
        match &root.kind {
            NodeKind::MailboxSend(send) if send.receiver_stage_ids.contains(&receiver_stage) => {
                Ok((root, send))
            }
            NodeKind::MailboxSend(_) => Err(MsqError::StructuralInconsistency(format!(
                "mailbox send of stage {} does not feed stage {receiver_stage}",
                receive.sender_stage_id
            ))),
            _ => Err(MsqError::StructuralInconsistency(format!(
                "stage {} is received by stage {receiver_stage} but is rooted at {}",
                receive.sender_stage_id,
                root.kind_name()
            ))),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Ok(());
        }
        let root = self.root_stage()?;
        if root.assignment.worker_count() != 1 {
            return Err(MsqError::StructuralInconsistency(format!(
                "root stage {} must run exactly one worker, found {}",
                self.root_stage_id,
                root.assignment.worker_count()
            )));
        }

        let mut seen_nodes = HashSet::new();
        for (stage_id, stage) in &self.stages {
            if stage.stage.id != *stage_id {
                return Err(MsqError::StructuralInconsistency(format!(
                    "stage {} is registered under id {stage_id}",
                    stage.stage.id
                )));
            }
            if stage.assignment.stage_id != *stage_id {
                return Err(MsqError::StructuralInconsistency(format!(
                    "stage {stage_id} carries the worker assignment of stage {}",
                    stage.assignment.stage_id
                )));
            }
            if stage.assignment.is_empty() {
                return Err(MsqError::StructuralInconsistency(format!(
                    "stage {stage_id} has no workers"
                )));
            }
            let validator = StageValidator {
                plan: self,
                stage_id: *stage_id,
            };
            stage.stage.root.visit(
                &validator,
                ValidationState {
                    is_stage_root: true,
                    seen_nodes: &mut seen_nodes,
                },
            )?;
            self.validate_workers(stage)?;
        }
        self.validate_reachability()
    }

    fn validate_workers(&self, stage: &DispatchableStage) -> Result<()> {
        let stage_id = stage.stage.id;
        let assigned: BTreeSet<WorkerId> = stage.assignment.worker_ids().into_iter().collect();
        let described: BTreeSet<WorkerId> = stage.workers.keys().copied().collect();
        if assigned != described {
            return Err(MsqError::StructuralInconsistency(format!(
                "stage {stage_id} assigns workers {assigned:?} but describes {described:?}"
            )));
        }
        for (worker_id, metadata) in &stage.workers {
            if metadata.worker_id != *worker_id {
                return Err(MsqError::StructuralInconsistency(format!(
                    "stage {stage_id} worker {worker_id} metadata is labelled {}",
                    metadata.worker_id
                )));
            }
            if stage.assignment.server_of(*worker_id) != Some(&metadata.server) {
                return Err(MsqError::StructuralInconsistency(format!(
                    "stage {stage_id} worker {worker_id} metadata names server {}",
                    metadata.server
                )));
            }
            for &receiver in stage.stage.receiver_stage_ids() {
                let endpoints = stage.send_mailboxes(*worker_id, receiver)?;
                if endpoints.is_empty() || !endpoints.is_sorted() {
                    return Err(MsqError::StructuralInconsistency(format!(
                        "stage {stage_id} worker {worker_id} endpoints to stage {receiver} are empty or unordered"
                    )));
                }
            }
        }
        Ok(())
    }

    fn validate_reachability(&self) -> Result<()> {
        let mut reached = BTreeSet::new();
        let mut pending = vec![self.root_stage_id];
        while let Some(stage_id) = pending.pop() {
            if !reached.insert(stage_id) {
                continue;
            }
            pending.extend(self.stage(stage_id)?.stage.sender_stage_ids());
        }
        if let Some(orphan) = self.stages.keys().find(|id| !reached.contains(*id)) {
            return Err(MsqError::StructuralInconsistency(format!(
                "stage {orphan} is not reachable from root stage {}",
                self.root_stage_id
            )));
        }
        Ok(())
    }
}

struct ValidationState<'a> {
    is_stage_root: bool,
    seen_nodes: &'a mut HashSet<PlanNodeId>,
}

/// Checks one stage's nodes; never crosses into other stages.
struct StageValidator<'p> {
    plan: &'p DispatchablePlan,
    stage_id: StageId,
}

impl StageValidator<'_> {
    fn check_node(&self, node: &PlanNode, state: &mut ValidationState<'_>) -> Result<()> {
        if node.stage_id != self.stage_id {
            return Err(MsqError::StructuralInconsistency(format!(
                "{} node {} claims stage {} but sits in stage {}",
                node.kind_name(),
                node.id,
                node.stage_id,
                self.stage_id
            )));
        }
        if !state.seen_nodes.insert(node.id) {
            return Err(MsqError::StructuralInconsistency(format!(
                "node id {} appears more than once",
                node.id
            )));
        }
        node.check_arity()
    }

    fn check_inputs(&self, node: &PlanNode, mut state: ValidationState<'_>) -> Result<()> {
        self.check_node(node, &mut state)?;
        for input in &node.inputs {
            input.visit(
                self,
                ValidationState {
                    is_stage_root: false,
                    seen_nodes: &mut *state.seen_nodes,
                },
            )?;
        }
        Ok(())
    }
}

impl<'a> PlanNodeVisitor<ValidationState<'a>> for StageValidator<'_> {
    type Output = ();

    fn visit_table_scan(
        &self,
        node: &PlanNode,
        _: &TableScanNode,
        state: ValidationState<'a>,
    ) -> Result<()> {
        self.check_inputs(node, state)
    }

    fn visit_value(&self, node: &PlanNode, _: &ValueNode, state: ValidationState<'a>) -> Result<()> {
        self.check_inputs(node, state)
    }

    fn visit_filter(
        &self,
        node: &PlanNode,
        _: &FilterNode,
        state: ValidationState<'a>,
    ) -> Result<()> {
        self.check_inputs(node, state)
    }

    fn visit_project(
        &self,
        node: &PlanNode,
        _: &ProjectNode,
        state: ValidationState<'a>,
    ) -> Result<()> {
        self.check_inputs(node, state)
    }

    fn visit_aggregate(
        &self,
        node: &PlanNode,
        _: &AggregateNode,
        state: ValidationState<'a>,
    ) -> Result<()> {
        self.check_inputs(node, state)
    }

    fn visit_window(
        &self,
        node: &PlanNode,
        _: &WindowNode,
        state: ValidationState<'a>,
    ) -> Result<()> {
        self.check_inputs(node, state)
    }

    fn visit_sort(&self, node: &PlanNode, _: &SortNode, state: ValidationState<'a>) -> Result<()> {
        self.check_inputs(node, state)
    }

    fn visit_set_op(
        &self,
        node: &PlanNode,
        _: &SetOpNode,
        state: ValidationState<'a>,
    ) -> Result<()> {
        self.check_inputs(node, state)
    }

    fn visit_join(&self, node: &PlanNode, _: &JoinNode, state: ValidationState<'a>) -> Result<()> {
        self.check_inputs(node, state)
    }

    fn visit_mailbox_send(
        &self,
        node: &PlanNode,
        send: &MailboxSendNode,
        state: ValidationState<'a>,
    ) -> Result<()> {
        if !state.is_stage_root {
            return Err(MsqError::StructuralInconsistency(format!(
                "mailbox send {} is not the root of stage {}",
                node.id, self.stage_id
            )));
        }
        if send.receiver_stage_ids.is_empty() || !send.receiver_stage_ids.is_sorted() {
            return Err(MsqError::StructuralInconsistency(format!(
                "mailbox send {} has empty or unordered receivers {:?}",
                node.id, send.receiver_stage_ids
            )));
        }
        for &receiver in &send.receiver_stage_ids {
            let receiver_stage = self.plan.stage(receiver)?;
            if !receiver_stage.stage.sender_stage_ids().contains(&self.stage_id) {
                return Err(MsqError::StructuralInconsistency(format!(
                    "stage {receiver} has no mailbox receive for sender stage {}",
                    self.stage_id
                )));
            }
        }
        self.check_inputs(node, state)
    }

    fn visit_mailbox_receive(
        &self,
        node: &PlanNode,
        receive: &MailboxReceiveNode,
        mut state: ValidationState<'a>,
    ) -> Result<()> {
        self.check_node(node, &mut state)?;
        if receive.sender_stage_id == self.stage_id {
            return Err(MsqError::StructuralInconsistency(format!(
                "mailbox receive {} reads from its own stage {}",
                node.id, self.stage_id
            )));
        }
        self.plan.sender_of(receive, self.stage_id).map(|_| ())
    }

    fn visit_explained(
        &self,
        node: &PlanNode,
        _: &ExplainedNode,
        state: ValidationState<'a>,
    ) -> Result<()> {
        self.check_inputs(node, state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assignment::assign_workers;
    use crate::mailbox::assign_mailboxes;
    use crate::routing::{ServerInstance, StaticCluster};
    use crate::stage::fragment;
    use msq_common::DispatchConfig;
    use msq_planner::{DistributionType, JoinType};

    fn cluster() -> StaticCluster {
        StaticCluster::new(
            ServerInstance::new("broker", 1, 2),
            vec![
                ServerInstance::new("s1", 3, 4),
                ServerInstance::new("s2", 5, 6),
            ],
        )
        .with_segments("a", "Server_s1_3", &["a_0"])
        .with_segments("a", "Server_s2_5", &["a_1"])
        .with_segments("b", "Server_s2_5", &["b_0"])
    }

    fn parts() -> (
        Vec<Stage>,
        BTreeMap<StageId, WorkerAssignment>,
        BTreeMap<StageId, BTreeMap<WorkerId, WorkerMetadata>>,
    ) {
        let stages = fragment(PlanNode::join(
            JoinType::Inner,
            &[("a.k", "b.k")],
            PlanNode::exchange(DistributionType::Hash, &["k"], PlanNode::table_scan("a", &["k"])),
            PlanNode::exchange(
                DistributionType::Broadcast,
                &[],
                PlanNode::table_scan("b", &["k"]),
            ),
        ))
        .unwrap();
        let assignments = assign_workers(&stages, &cluster(), &DispatchConfig::default()).unwrap();
        let mailboxes = assign_mailboxes(&stages, &assignments).unwrap();
        (stages, assignments, mailboxes)
    }

    fn stage_map() -> BTreeMap<StageId, DispatchableStage> {
        let (stages, assignments, mailboxes) = parts();
        let plan = DispatchablePlan::from_components(stages, assignments, mailboxes).unwrap();
        plan.stages
    }

    #[test]
    fn builds_valid_plan() {
        let (stages, assignments, mailboxes) = parts();
        let plan = DispatchablePlan::from_components(stages, assignments, mailboxes).unwrap();
        assert_eq!(plan.root_stage_id(), StageId(0));
        assert_eq!(plan.stages().count(), 4);
        // broker + 2 join workers + 2 scan(a) workers + 1 scan(b) worker
        assert_eq!(plan.worker_count(), 6);
        assert!(!plan.is_empty());
        assert!(DispatchablePlan::empty().is_empty());
        DispatchablePlan::empty().validate().unwrap();
    }

    #[test]
    fn rejects_missing_sender_stage() {
        let mut stages = stage_map();
        stages.remove(&StageId(3));
        let err = DispatchablePlan::new(StageId(0), stages).unwrap_err();
        assert!(matches!(err, MsqError::StructuralInconsistency(_)));
    }

    #[test]
    fn rejects_root_with_several_workers() {
        let mut stages = stage_map();
        let root = stages.get_mut(&StageId(0)).unwrap();
        let extra = root.assignment.add_worker(&ServerInstance::new("s1", 3, 4), None);
        root.workers.insert(
            extra,
            WorkerMetadata {
                worker_id: extra,
                server: ServerInstance::new("s1", 3, 4),
                send_mailboxes: BTreeMap::new(),
                receive_mailboxes: BTreeMap::new(),
            },
        );
        assert!(matches!(
            DispatchablePlan::new(StageId(0), stages),
            Err(MsqError::StructuralInconsistency(_))
        ));
    }

    #[test]
    fn rejects_missing_mailbox_entry() {
        let mut stages = stage_map();
        let scan = stages.get_mut(&StageId(2)).unwrap();
        scan.workers
            .get_mut(&WorkerId(0))
            .unwrap()
            .send_mailboxes
            .clear();
        assert!(matches!(
            DispatchablePlan::new(StageId(0), stages),
            Err(MsqError::StructuralInconsistency(_))
        ));
    }

    #[test]
    fn rejects_node_in_wrong_stage_and_unreachable_stage() {
        let mut stages = stage_map();
        stages.get_mut(&StageId(1)).unwrap().stage.root.inputs[0].stage_id = StageId(2);
        assert!(DispatchablePlan::new(StageId(0), stages).is_err());

        let mut stages = stage_map();
        let mut orphan = stages[&StageId(3)].clone();
        orphan.stage.id = StageId(9);
        orphan.assignment.stage_id = StageId(9);
        stages.insert(StageId(9), orphan);
        assert!(DispatchablePlan::new(StageId(0), stages).is_err());
    }

    #[test]
    fn rejects_unfragmented_exchange() {
        let mut stages = stage_map();
        let root = &mut stages.get_mut(&StageId(2)).unwrap().stage.root;
        let scan = root.inputs.remove(0);
        let mut exchange = PlanNode::exchange(DistributionType::Random, &[], scan);
        exchange.id = PlanNodeId(1000);
        exchange.stage_id = StageId(2);
        root.inputs.push(exchange);
        assert!(matches!(
            DispatchablePlan::new(StageId(0), stages),
            Err(MsqError::UnsupportedTraversal(_))
        ));
    }

    #[test]
    fn deserialization_validates() {
        let (stages, assignments, mailboxes) = parts();
        let plan = DispatchablePlan::from_components(stages, assignments, mailboxes).unwrap();
        let json = serde_json::to_string(&plan).unwrap();
        let back: DispatchablePlan = serde_json::from_str(&json).unwrap();
        assert_eq!(back, plan);

        let mut value: serde_json::Value = serde_json::from_str(&json).unwrap();
        value["root_stage_id"] = serde_json::json!(7);
        assert!(serde_json::from_value::<DispatchablePlan>(value).is_err());
    }
}
