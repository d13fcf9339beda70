use std::env;
use std::fs;

use msq_common::{DispatchConfig, MsqError};
use msq_distributed::{DispatchablePlan, DistributedPlanner, StaticCluster, explain};
use msq_planner::PlanNode;
use serde::Deserialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Plan tree with exchange markers plus the cluster to place it on.
#[derive(Deserialize)]
struct PlanRequest {
    plan: PlanNode,
    cluster: StaticCluster,
    config: Option<DispatchConfig>,
}

fn usage() -> String {
    "usage: msq-explain [--dispatchable] <file.json>".to_string()
}

fn load_plan(path: &str, dispatchable: bool) -> Result<DispatchablePlan, MsqError> {
    let raw = fs::read_to_string(path)?;
    if dispatchable {
        return serde_json::from_str(&raw)
            .map_err(|e| MsqError::InvalidConfig(format!("{path}: {e}")));
    }
    let request: PlanRequest = serde_json::from_str(&raw)
        .map_err(|e| MsqError::InvalidConfig(format!("{path}: {e}")))?;
    let config = match request.config {
        Some(config) => config,
        None => DispatchConfig::from_env()?,
    };
    DistributedPlanner::new(config)?.plan(request.plan, &request.cluster)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let mut dispatchable = false;
    let mut path = None;
    for arg in env::args().skip(1) {
        match arg.as_str() {
            "--dispatchable" => dispatchable = true,
            "-h" | "--help" => {
                println!("{}", usage());
                return Ok(());
            }
            _ if path.is_none() => path = Some(arg),
            _ => return Err(usage().into()),
        }
    }
    let path = path.ok_or_else(usage)?;

    let plan = load_plan(&path, dispatchable)?;
    info!(
        path = %path,
        stages = plan.stages().count(),
        workers = plan.worker_count(),
        operator = "MsqExplain",
        "plan loaded"
    );
    print!("{}", explain(&plan)?);
    Ok(())
}
