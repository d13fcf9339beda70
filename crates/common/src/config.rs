use std::env;

use serde::{Deserialize, Serialize};

use crate::error::{MsqError, Result};

/// Knobs for turning a fragmented plan into a dispatchable one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Workers placed on each server for stages that do not scan tables.
    pub intermediate_workers_per_server: u32,
    /// Cap on servers used by intermediate stages. `None` uses every server.
    pub max_intermediate_servers: Option<usize>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            intermediate_workers_per_server: 1,
            max_intermediate_servers: None,
        }
    }
}

impl DispatchConfig {
    /// Defaults overridden by `MSQ_INTERMEDIATE_WORKERS_PER_SERVER` and
    /// `MSQ_MAX_INTERMEDIATE_SERVERS` when set.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        if let Ok(v) = env::var("MSQ_INTERMEDIATE_WORKERS_PER_SERVER") {
            cfg.intermediate_workers_per_server = v.trim().parse().map_err(|e| {
                MsqError::InvalidConfig(format!(
                    "MSQ_INTERMEDIATE_WORKERS_PER_SERVER={v:?} is not a number: {e}"
                ))
            })?;
        }
        if let Ok(v) = env::var("MSQ_MAX_INTERMEDIATE_SERVERS") {
            let n: usize = v.trim().parse().map_err(|e| {
                MsqError::InvalidConfig(format!(
                    "MSQ_MAX_INTERMEDIATE_SERVERS={v:?} is not a number: {e}"
                ))
            })?;
            cfg.max_intermediate_servers = Some(n);
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.intermediate_workers_per_server == 0 {
            return Err(MsqError::InvalidConfig(
                "intermediate_workers_per_server must be at least 1".to_string(),
            ));
        }
        if self.max_intermediate_servers == Some(0) {
            return Err(MsqError::InvalidConfig(
                "max_intermediate_servers must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        let cfg = DispatchConfig::default();
        assert_eq!(cfg.intermediate_workers_per_server, 1);
        assert!(cfg.max_intermediate_servers.is_none());
        cfg.validate().expect("default config");
    }

    #[test]
    fn rejects_zero_workers() {
        let cfg = DispatchConfig {
            intermediate_workers_per_server: 0,
            ..DispatchConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(MsqError::InvalidConfig(_))));
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let cfg: DispatchConfig =
            serde_json::from_str(r#"{"max_intermediate_servers": 2}"#).unwrap();
        assert_eq!(cfg.intermediate_workers_per_server, 1);
        assert_eq!(cfg.max_intermediate_servers, Some(2));
    }
}
