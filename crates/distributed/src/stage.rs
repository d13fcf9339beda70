//! Stage fragmentation: cutting a plan tree at exchange boundaries.
//!
//! Stage `0` is always the root stage: a single `MAIL_RECEIVE(SINGLETON)` fed
//! by stage `1`, whose root is a `MAIL_SEND(SINGLETON)` over the query root.
//! Every [`NodeKind::Exchange`] becomes a receive in the current stage and
//! opens a new stage rooted at a send over the exchange's input. Stage ids
//! and node ids are allocated in pre-order.

use std::collections::BTreeMap;

use msq_common::{MsqError, PlanNodeId, Result, StageId};
use msq_planner::{
    DistributionType, MailboxReceiveNode, MailboxSendNode, NodeKind, PlanNode, explain_tree,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A maximal subtree executed as one distributed unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub id: StageId,
    pub root: PlanNode,
}

impl Stage {
    /// Whether any operator of this stage scans a table.
    pub fn is_scan_stage(&self) -> bool {
        self.root.contains_table_scan()
    }

    /// Stages this stage sends to; empty for the root stage.
    pub fn receiver_stage_ids(&self) -> &[StageId] {
        match &self.root.kind {
            NodeKind::MailboxSend(send) => &send.receiver_stage_ids,
            _ => &[],
        }
    }

    /// Stages this stage receives from, in pre-order.
    pub fn sender_stage_ids(&self) -> Vec<StageId> {
        let mut out = Vec::new();
        collect_senders(&self.root, &mut out);
        out
    }
}

fn collect_senders(node: &PlanNode, out: &mut Vec<StageId>) {
    if let NodeKind::MailboxReceive(receive) = &node.kind {
        out.push(receive.sender_stage_id);
    }
    for input in &node.inputs {
        collect_senders(input, out);
    }
}

/// Splits `root` into stages ordered by id.
pub fn fragment(root: PlanNode) -> Result<Vec<Stage>> {
    let mut fragmenter = Fragmenter::default();
    let root_stage = fragmenter.next_stage_id();
    let receive_id = fragmenter.next_node_id();
    let plan_stage = fragmenter.next_stage_id();
    fragmenter.open_stage(
        plan_stage,
        root_stage,
        DistributionType::Singleton,
        Vec::new(),
        root,
    )?;
    fragmenter.stages.insert(
        root_stage,
        Stage {
            id: root_stage,
            root: PlanNode {
                id: receive_id,
                stage_id: root_stage,
                kind: NodeKind::MailboxReceive(MailboxReceiveNode {
                    sender_stage_id: plan_stage,
                    distribution: DistributionType::Singleton,
                }),
                inputs: vec![],
            },
        },
    );

    let stages: Vec<Stage> = fragmenter.stages.into_values().collect();
    for stage in &stages {
        debug!(
            stage_id = %stage.id,
            receivers = ?stage.receiver_stage_ids(),
            operator = "StageFragmenter",
            "stage cut\n{}",
            explain_tree(&stage.root)
        );
    }
    Ok(stages)
}

#[derive(Default)]
struct Fragmenter {
    stages: BTreeMap<StageId, Stage>,
    next_stage: u32,
    next_node: u32,
}

impl Fragmenter {
    fn next_stage_id(&mut self) -> StageId {
        let id = StageId(self.next_stage);
        self.next_stage += 1;
        id
    }

    fn next_node_id(&mut self) -> PlanNodeId {
        let id = PlanNodeId(self.next_node);
        self.next_node += 1;
        id
    }

    fn open_stage(
        &mut self,
        stage_id: StageId,
        receiver: StageId,
        distribution: DistributionType,
        keys: Vec<String>,
        input: PlanNode,
    ) -> Result<()> {
        let send_id = self.next_node_id();
        let input = self.rewrite(input, stage_id)?;
        self.stages.insert(
            stage_id,
            Stage {
                id: stage_id,
                root: PlanNode {
                    id: send_id,
                    stage_id,
                    kind: NodeKind::MailboxSend(MailboxSendNode {
                        receiver_stage_ids: vec![receiver],
                        distribution,
                        keys,
                    }),
                    inputs: vec![input],
                },
            },
        );
        Ok(())
    }

    fn rewrite(&mut self, node: PlanNode, stage_id: StageId) -> Result<PlanNode> {
        node.check_arity()?;
        let PlanNode { kind, inputs, .. } = node;
        match kind {
            NodeKind::Exchange(exchange) => {
                let receive_id = self.next_node_id();
                let sender_stage_id = self.next_stage_id();
                let input = inputs.into_iter().next().ok_or_else(|| {
                    MsqError::StructuralInconsistency("exchange without input".to_string())
                })?;
                self.open_stage(
                    sender_stage_id,
                    stage_id,
                    exchange.distribution,
                    exchange.keys,
                    input,
                )?;
                Ok(PlanNode {
                    id: receive_id,
                    stage_id,
                    kind: NodeKind::MailboxReceive(MailboxReceiveNode {
                        sender_stage_id,
                        distribution: exchange.distribution,
                    }),
                    inputs: vec![],
                })
            }
            NodeKind::MailboxSend(_) | NodeKind::MailboxReceive(_) => Err(MsqError::Planning(
                "plan is already fragmented: found a mailbox node before stage cutting"
                    .to_string(),
            )),
            kind => {
                let id = self.next_node_id();
                let inputs = inputs
                    .into_iter()
                    .map(|input| self.rewrite(input, stage_id))
                    .collect::<Result<Vec<_>>>()?;
                Ok(PlanNode {
                    id,
                    stage_id,
                    kind,
                    inputs,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use msq_planner::{AggType, JoinType};
    use std::collections::HashSet;

    fn node_ids(node: &PlanNode, out: &mut Vec<PlanNodeId>) {
        out.push(node.id);
        for input in &node.inputs {
            node_ids(input, out);
        }
    }

    #[test]
    fn single_stage_without_exchange() {
        let stages = fragment(PlanNode::table_scan("t", &["a"])).unwrap();
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].id, StageId(0));
        assert!(matches!(
            stages[0].root.kind,
            NodeKind::MailboxReceive(MailboxReceiveNode {
                sender_stage_id: StageId(1),
                distribution: DistributionType::Singleton,
            })
        ));
        assert_eq!(stages[1].receiver_stage_ids(), &[StageId(0)]);
        assert!(stages[1].is_scan_stage());
        assert!(!stages[0].is_scan_stage());
        assert_eq!(stages[1].root.inputs[0].explain(), "TABLE SCAN (t)");
    }

    #[test]
    fn cuts_stage_at_exchange() {
        let plan = PlanNode::aggregate(
            AggType::Final,
            &["k"],
            &["SUM(v)"],
            PlanNode::exchange(
                DistributionType::Hash,
                &["k"],
                PlanNode::aggregate(
                    AggType::Leaf,
                    &["k"],
                    &["SUM(v)"],
                    PlanNode::table_scan("t", &["k", "v"]),
                ),
            ),
        );
        let stages = fragment(plan).unwrap();
        assert_eq!(stages.len(), 3);

        let final_agg = &stages[1].root.inputs[0];
        assert_eq!(final_agg.explain(), "AGGREGATE_FINAL");
        assert!(matches!(
            final_agg.inputs[0].kind,
            NodeKind::MailboxReceive(MailboxReceiveNode {
                sender_stage_id: StageId(2),
                distribution: DistributionType::Hash,
            })
        ));
        assert_eq!(stages[2].receiver_stage_ids(), &[StageId(1)]);
        assert_eq!(stages[1].sender_stage_ids(), vec![StageId(2)]);
        assert!(stages[2].is_scan_stage());
        assert!(!stages[1].is_scan_stage());
    }

    #[test]
    fn join_sides_get_their_own_stages_and_ids_are_unique() {
        let plan = PlanNode::join(
            JoinType::Inner,
            &[("a.k", "b.k")],
            PlanNode::exchange(DistributionType::Hash, &["k"], PlanNode::table_scan("a", &["k"])),
            PlanNode::exchange(DistributionType::Hash, &["k"], PlanNode::table_scan("b", &["k"])),
        );
        let stages = fragment(plan).unwrap();
        assert_eq!(stages.len(), 4);
        assert_eq!(stages[1].sender_stage_ids(), vec![StageId(2), StageId(3)]);
        assert_eq!(stages[2].root.inputs[0].explain(), "TABLE SCAN (a)");
        assert_eq!(stages[3].root.inputs[0].explain(), "TABLE SCAN (b)");

        let mut ids = Vec::new();
        for stage in &stages {
            node_ids(&stage.root, &mut ids);
            // every node belongs to the stage that holds it
            let mut stack = vec![&stage.root];
            while let Some(n) = stack.pop() {
                assert_eq!(n.stage_id, stage.id);
                stack.extend(n.inputs.iter());
            }
        }
        let unique: HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
    }

    #[test]
    fn rejects_prefragmented_input_and_bad_arity() {
        let stages = fragment(PlanNode::table_scan("t", &["a"])).unwrap();
        let already = stages[1].root.clone();
        assert!(matches!(fragment(already), Err(MsqError::Planning(_))));

        let mut broken = PlanNode::filter("a", PlanNode::table_scan("t", &["a"]));
        broken.inputs.clear();
        assert!(matches!(
            fragment(broken),
            Err(MsqError::StructuralInconsistency(_))
        ));
    }
}
