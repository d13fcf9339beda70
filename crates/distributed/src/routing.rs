//! Cluster view consumed by worker assignment.
//!
//! Server discovery and segment placement are decided elsewhere; this module
//! only defines what the planner needs to read from them.

use std::collections::BTreeMap;
use std::fmt;

use msq_common::{MsqError, Result};
use serde::{Deserialize, Serialize};

/// One query server process.
///
/// Ordering is by `(hostname, query_service_port, mailbox_port, instance_id)`,
/// which fixes the server order used for worker ids and explain output.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerInstance {
    pub hostname: String,
    /// Port rendered on explain lines.
    pub query_service_port: u16,
    /// Port mailbox endpoints point at.
    pub mailbox_port: u16,
    pub instance_id: String,
}

impl ServerInstance {
    pub fn new(hostname: &str, query_service_port: u16, mailbox_port: u16) -> Self {
        Self {
            hostname: hostname.to_string(),
            query_service_port,
            mailbox_port,
            instance_id: format!("Server_{hostname}_{query_service_port}"),
        }
    }
}

impl fmt::Display for ServerInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.query_service_port)
    }
}

/// Read-only cluster state supplied by the caller.
pub trait ClusterState {
    /// Server that runs the root stage and collects the final result.
    fn broker(&self) -> &ServerInstance;

    /// Servers eligible for intermediate stages, in [`ServerInstance`] order.
    fn servers(&self) -> Vec<&ServerInstance>;

    /// Segment placement of a table: every server holding segments of it, in
    /// [`ServerInstance`] order, with that server's segment ids.
    fn table_segments(&self, table: &str) -> Result<Vec<(ServerInstance, Vec<String>)>>;
}

/// Fixed cluster description, typically loaded from JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticCluster {
    pub broker: ServerInstance,
    pub servers: Vec<ServerInstance>,
    /// table -> instance id -> segment ids
    #[serde(default)]
    pub tables: BTreeMap<String, BTreeMap<String, Vec<String>>>,
}

impl StaticCluster {
    pub fn new(broker: ServerInstance, servers: Vec<ServerInstance>) -> Self {
        Self {
            broker,
            servers,
            tables: BTreeMap::new(),
        }
    }

    /// Places `segments` of `table` on the server with `instance_id`.
    pub fn with_segments(mut self, table: &str, instance_id: &str, segments: &[&str]) -> Self {
        self.tables
            .entry(table.to_string())
            .or_default()
            .entry(instance_id.to_string())
            .or_default()
            .extend(segments.iter().map(|s| s.to_string()));
        self
    }
}

impl ClusterState for StaticCluster {
    fn broker(&self) -> &ServerInstance {
        &self.broker
    }

    fn servers(&self) -> Vec<&ServerInstance> {
        let mut servers: Vec<&ServerInstance> = self.servers.iter().collect();
        servers.sort();
        servers.dedup();
        servers
    }

    fn table_segments(&self, table: &str) -> Result<Vec<(ServerInstance, Vec<String>)>> {
        let placement = self
            .tables
            .get(table)
            .ok_or_else(|| MsqError::Planning(format!("unknown table: {table}")))?;
        let mut out = Vec::with_capacity(placement.len());
        for (instance_id, segments) in placement {
            if segments.is_empty() {
                continue;
            }
            let server = self
                .servers
                .iter()
                .find(|s| &s.instance_id == instance_id)
                .ok_or_else(|| {
                    MsqError::Planning(format!(
                        "table {table} has segments on unknown server {instance_id}"
                    ))
                })?;
            out.push((server.clone(), segments.clone()));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster() -> StaticCluster {
        StaticCluster::new(
            ServerInstance::new("broker", 8000, 8001),
            vec![
                ServerInstance::new("host2", 9000, 9001),
                ServerInstance::new("host1", 9000, 9001),
            ],
        )
        .with_segments("t", "Server_host2_9000", &["t_1"])
        .with_segments("t", "Server_host1_9000", &["t_0", "t_2"])
    }

    #[test]
    fn servers_are_ordered_by_host_then_ports() {
        let c = cluster();
        let hosts: Vec<_> = c.servers().iter().map(|s| s.hostname.clone()).collect();
        assert_eq!(hosts, vec!["host1", "host2"]);
        assert_eq!(c.broker().to_string(), "broker:8000");
    }

    #[test]
    fn table_segments_resolve_instances_in_server_order() {
        let placement = cluster().table_segments("t").unwrap();
        assert_eq!(placement.len(), 2);
        assert_eq!(placement[0].0.hostname, "host1");
        assert_eq!(placement[0].1, vec!["t_0", "t_2"]);
        assert_eq!(placement[1].1, vec!["t_1"]);
    }

    #[test]
    fn unknown_table_or_instance_is_a_planning_error() {
        assert!(matches!(
            cluster().table_segments("missing"),
            Err(MsqError::Planning(_))
        ));
        let bad = cluster().with_segments("u", "Server_nowhere_1", &["u_0"]);
        assert!(matches!(bad.table_segments("u"), Err(MsqError::Planning(_))));
    }

    #[test]
    fn loads_from_json() {
        let json = r#"{
            "broker": {"hostname": "b", "query_service_port": 1, "mailbox_port": 2, "instance_id": "b"},
            "servers": [{"hostname": "s", "query_service_port": 3, "mailbox_port": 4, "instance_id": "s"}],
            "tables": {"t": {"s": ["seg0"]}}
        }"#;
        let c: StaticCluster = serde_json::from_str(json).unwrap();
        assert_eq!(c.table_segments("t").unwrap()[0].1, vec!["seg0"]);
    }
}
