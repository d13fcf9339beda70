//! Worker assignment: which server instances and local worker ids execute
//! each stage, and which segments every scan worker reads.
//!
//! Placement policy is owned by [`ClusterState`]; this module only turns it
//! into per-stage worker lists:
//! - root stage: exactly one worker on the broker;
//! - scan stage: one worker per server holding segments of the scanned
//!   tables, recording that server's segments;
//! - other stages: `intermediate_workers_per_server` workers on each server.
//!
//! Worker ids are dense, start at `0`, and ascend in server order.

use std::collections::{BTreeMap, BTreeSet};

use msq_common::{DispatchConfig, MsqError, Result, StageId, WorkerId};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::routing::{ClusterState, ServerInstance};
use crate::stage::Stage;

/// Worker ids hosted by one server for one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerWorkers {
    pub server: ServerInstance,
    pub worker_ids: Vec<WorkerId>,
}

/// Workers of one stage, ordered by server then worker id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerAssignment {
    pub stage_id: StageId,
    servers: Vec<ServerWorkers>,
    #[serde(default)]
    segments: BTreeMap<WorkerId, BTreeSet<String>>,
}

impl WorkerAssignment {
    pub fn new(stage_id: StageId) -> Self {
        Self {
            stage_id,
            servers: Vec::new(),
            segments: BTreeMap::new(),
        }
    }

    /// Adds a worker on `server` with the next free id, keeping servers
    /// ordered. Segments are recorded for scan workers only.
    pub fn add_worker(
        &mut self,
        server: &ServerInstance,
        segments: Option<BTreeSet<String>>,
    ) -> WorkerId {
        let worker_id = WorkerId(self.worker_count() as u32);
        match self.servers.binary_search_by(|s| s.server.cmp(server)) {
            Ok(idx) => self.servers[idx].worker_ids.push(worker_id),
            Err(idx) => self.servers.insert(
                idx,
                ServerWorkers {
                    server: server.clone(),
                    worker_ids: vec![worker_id],
                },
            ),
        }
        if let Some(segments) = segments {
            self.segments.insert(worker_id, segments);
        }
        worker_id
    }

    pub fn servers(&self) -> &[ServerWorkers] {
        &self.servers
    }

    pub fn worker_count(&self) -> usize {
        self.servers.iter().map(|s| s.worker_ids.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.iter().all(|s| s.worker_ids.is_empty())
    }

    /// Every `(server, worker)` pair in server-then-worker order.
    pub fn destinations(&self) -> Vec<(&ServerInstance, WorkerId)> {
        self.servers
            .iter()
            .flat_map(|s| s.worker_ids.iter().map(move |w| (&s.server, *w)))
            .collect()
    }

    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.destinations().into_iter().map(|(_, w)| w).collect()
    }

    pub fn server_of(&self, worker_id: WorkerId) -> Option<&ServerInstance> {
        self.servers
            .iter()
            .find(|s| s.worker_ids.contains(&worker_id))
            .map(|s| &s.server)
    }

    pub fn workers_on(&self, server: &ServerInstance) -> Option<&[WorkerId]> {
        self.servers
            .iter()
            .find(|s| &s.server == server)
            .map(|s| s.worker_ids.as_slice())
    }

    /// Segments read by a scan worker.
    pub fn segments_of(&self, worker_id: WorkerId) -> Option<&BTreeSet<String>> {
        self.segments.get(&worker_id)
    }

    pub fn segments(&self) -> &BTreeMap<WorkerId, BTreeSet<String>> {
        &self.segments
    }
}

/// Assigns workers to every stage. Stage [`StageId::ROOT`] is the root stage.
pub fn assign_workers(
    stages: &[Stage],
    cluster: &dyn ClusterState,
    config: &DispatchConfig,
) -> Result<BTreeMap<StageId, WorkerAssignment>> {
    config.validate()?;
    let mut out = BTreeMap::new();
    for stage in stages {
        let assignment = if stage.id == StageId::ROOT {
            assign_root(stage, cluster)
        } else if stage.is_scan_stage() {
            assign_scan(stage, cluster)?
        } else {
            assign_intermediate(stage, cluster, config)?
        };
        debug!(
            stage_id = %stage.id,
            workers = assignment.worker_count(),
            servers = assignment.servers().len(),
            scan = stage.is_scan_stage(),
            operator = "WorkerAssignment",
            "stage workers assigned"
        );
        out.insert(stage.id, assignment);
    }
    Ok(out)
}

fn assign_root(stage: &Stage, cluster: &dyn ClusterState) -> WorkerAssignment {
    let mut assignment = WorkerAssignment::new(stage.id);
    assignment.add_worker(cluster.broker(), None);
    assignment
}

fn assign_scan(stage: &Stage, cluster: &dyn ClusterState) -> Result<WorkerAssignment> {
    let mut per_server: BTreeMap<ServerInstance, BTreeSet<String>> = BTreeMap::new();
    for table in stage.root.scanned_tables() {
        for (server, segments) in cluster.table_segments(table)? {
            per_server.entry(server).or_default().extend(segments);
        }
    }
    if per_server.is_empty() {
        return Err(MsqError::Planning(format!(
            "no server holds segments for stage {} tables {:?}",
            stage.id,
            stage.root.scanned_tables()
        )));
    }
    let mut assignment = WorkerAssignment::new(stage.id);
    for (server, segments) in per_server {
        assignment.add_worker(&server, Some(segments));
    }
    Ok(assignment)
}

fn assign_intermediate(
    stage: &Stage,
    cluster: &dyn ClusterState,
    config: &DispatchConfig,
) -> Result<WorkerAssignment> {
    let mut servers = cluster.servers();
    if let Some(max) = config.max_intermediate_servers {
        servers.truncate(max);
    }
    if servers.is_empty() {
        return Err(MsqError::Planning(format!(
            "no servers available for intermediate stage {}",
            stage.id
        )));
    }
    let mut assignment = WorkerAssignment::new(stage.id);
    for server in servers {
        for _ in 0..config.intermediate_workers_per_server {
            assignment.add_worker(server, None);
        }
    }
    Ok(assignment)
}
