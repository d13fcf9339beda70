//! Mailbox topology: one channel per (producer worker, consumer worker) pair
//! on every stage edge.
//!
//! Endpoint lists are kept sorted by `(port, hostname, worker_id)`, so two
//! reads of the same plan always observe the same order.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use msq_common::{MsqError, Result, StageId, WorkerId};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::assignment::WorkerAssignment;
use crate::routing::ServerInstance;
use crate::stage::Stage;

/// Address of one mailbox: the worker on the other side of a stage edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MailboxInfo {
    pub hostname: String,
    pub port: u16,
    pub worker_id: WorkerId,
}

impl MailboxInfo {
    pub fn for_worker(server: &ServerInstance, worker_id: WorkerId) -> Self {
        Self {
            hostname: server.hostname.clone(),
            port: server.mailbox_port,
            worker_id,
        }
    }
}

impl Ord for MailboxInfo {
    fn cmp(&self, other: &Self) -> Ordering {
        self.port
            .cmp(&other.port)
            .then_with(|| self.hostname.cmp(&other.hostname))
            .then_with(|| self.worker_id.cmp(&other.worker_id))
    }
}

impl PartialOrd for MailboxInfo {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for MailboxInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}|[{}]", self.hostname, self.port, self.worker_id)
    }
}

/// Everything a single worker of a stage needs to wire its mailboxes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerMetadata {
    pub worker_id: WorkerId,
    pub server: ServerInstance,
    /// receiver stage id -> consumer endpoints this worker sends to
    #[serde(default)]
    pub send_mailboxes: BTreeMap<StageId, Vec<MailboxInfo>>,
    /// sender stage id -> producer endpoints this worker receives from
    #[serde(default)]
    pub receive_mailboxes: BTreeMap<StageId, Vec<MailboxInfo>>,
}

/// Materializes per-worker mailbox endpoints for every stage edge.
pub fn assign_mailboxes(
    stages: &[Stage],
    assignments: &BTreeMap<StageId, WorkerAssignment>,
) -> Result<BTreeMap<StageId, BTreeMap<WorkerId, WorkerMetadata>>> {
    let mut out: BTreeMap<StageId, BTreeMap<WorkerId, WorkerMetadata>> = BTreeMap::new();
    for stage in stages {
        let assignment = assignment_of(assignments, stage.id)?;
        let workers = assignment
            .destinations()
            .into_iter()
            .map(|(server, worker_id)| {
                (
                    worker_id,
                    WorkerMetadata {
                        worker_id,
                        server: server.clone(),
                        send_mailboxes: BTreeMap::new(),
                        receive_mailboxes: BTreeMap::new(),
                    },
                )
            })
            .collect();
        out.insert(stage.id, workers);
    }

    for stage in stages {
        let producer = assignment_of(assignments, stage.id)?;
        let producer_endpoints = endpoints(producer);
        for &receiver in stage.receiver_stage_ids() {
            let consumer = assignment_of(assignments, receiver)?;
            let consumer_endpoints = endpoints(consumer);
            debug!(
                sender_stage = %stage.id,
                receiver_stage = %receiver,
                producers = producer_endpoints.len(),
                consumers = consumer_endpoints.len(),
                operator = "MailboxAssignment",
                "stage edge wired"
            );

            let senders = out.get_mut(&stage.id).ok_or_else(|| missing_stage(stage.id))?;
            for metadata in senders.values_mut() {
                metadata
                    .send_mailboxes
                    .insert(receiver, consumer_endpoints.clone());
            }
            let receivers = out.get_mut(&receiver).ok_or_else(|| missing_stage(receiver))?;
            for metadata in receivers.values_mut() {
                metadata
                    .receive_mailboxes
                    .insert(stage.id, producer_endpoints.clone());
            }
        }
    }
    Ok(out)
}

fn endpoints(assignment: &WorkerAssignment) -> Vec<MailboxInfo> {
    let mut out: Vec<MailboxInfo> = assignment
        .destinations()
        .into_iter()
        .map(|(server, worker_id)| MailboxInfo::for_worker(server, worker_id))
        .collect();
    out.sort();
    out
}

fn assignment_of(
    assignments: &BTreeMap<StageId, WorkerAssignment>,
    stage_id: StageId,
) -> Result<&WorkerAssignment> {
    assignments.get(&stage_id).ok_or_else(|| {
        MsqError::StructuralInconsistency(format!("no worker assignment for stage {stage_id}"))
    })
}

fn missing_stage(stage_id: StageId) -> MsqError {
    MsqError::StructuralInconsistency(format!("stage {stage_id} is not part of the plan"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assignment::assign_workers;
    use crate::routing::StaticCluster;
    use crate::stage::fragment;
    use msq_common::DispatchConfig;
    use msq_planner::{DistributionType, PlanNode};

    #[test]
    fn endpoints_sort_by_port_then_host() {
        let mut infos = vec![
            MailboxInfo {
                hostname: "a".to_string(),
                port: 3,
                worker_id: WorkerId(0),
            },
            MailboxInfo {
                hostname: "b".to_string(),
                port: 1,
                worker_id: WorkerId(1),
            },
            MailboxInfo {
                hostname: "a".to_string(),
                port: 1,
                worker_id: WorkerId(2),
            },
        ];
        infos.sort();
        let rendered: Vec<_> = infos.iter().map(|i| i.to_string()).collect();
        assert_eq!(rendered, vec!["a:1|[2]", "b:1|[1]", "a:3|[0]"]);
    }

    #[test]
    fn every_producer_worker_reaches_every_consumer_worker() {
        let cluster = StaticCluster::new(
            ServerInstance::new("broker", 10, 11),
            vec![
                ServerInstance::new("s1", 20, 21),
                ServerInstance::new("s2", 30, 31),
            ],
        )
        .with_segments("t", "Server_s1_20", &["t_0"])
        .with_segments("t", "Server_s2_30", &["t_1"]);
        let stages = fragment(PlanNode::project(
            &["k"],
            PlanNode::exchange(DistributionType::Hash, &["k"], PlanNode::table_scan("t", &["k"])),
        ))
        .unwrap();
        let config = DispatchConfig {
            intermediate_workers_per_server: 2,
            ..DispatchConfig::default()
        };
        let assignments = assign_workers(&stages, &cluster, &config).unwrap();
        let mailboxes = assign_mailboxes(&stages, &assignments).unwrap();

        // stage 2 (scan, 2 workers) -> stage 1 (project, 4 workers)
        let scan_workers = &mailboxes[&StageId(2)];
        assert_eq!(scan_workers.len(), 2);
        for metadata in scan_workers.values() {
            let to_project = &metadata.send_mailboxes[&StageId(1)];
            assert_eq!(to_project.len(), 4);
            assert!(to_project.windows(2).all(|w| w[0] <= w[1]));
            assert_eq!(to_project[0].to_string(), "s1:21|[0]");
            assert_eq!(to_project[3].to_string(), "s2:31|[3]");
        }
        let project_workers = &mailboxes[&StageId(1)];
        for metadata in project_workers.values() {
            assert_eq!(metadata.receive_mailboxes[&StageId(2)].len(), 2);
            assert_eq!(metadata.send_mailboxes[&StageId(0)].len(), 1);
            assert_eq!(
                metadata.send_mailboxes[&StageId(0)][0].to_string(),
                "broker:11|[0]"
            );
        }
        assert!(mailboxes[&StageId(0)][&WorkerId(0)].send_mailboxes.is_empty());
    }

    #[test]
    fn missing_assignment_is_structural() {
        let stages = fragment(PlanNode::value(vec![])).unwrap();
        let assignments = BTreeMap::new();
        assert!(matches!(
            assign_mailboxes(&stages, &assignments),
            Err(MsqError::StructuralInconsistency(_))
        ));
    }
}
