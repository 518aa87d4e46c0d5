//! Server configuration: layered environment-variable and TOML-file source
//! (spec §10.3), following the teacher's load → merge → validate shape in
//! `config/loader.rs`, simplified to this runtime's flat knob set.

use crate::error::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use stepflow_core::Policy;

const ENV_PREFIX: &str = "STEPFLOW_";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Address the external API binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Root directory under which each run gets its own subdirectory
    /// (spec §6 persistence layout).
    #[serde(default = "default_runs_root")]
    pub runs_root: String,

    /// Upper bound on runs the runtime will drive concurrently.
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,

    /// Default policy applied to a flow graph that doesn't specify its own.
    #[serde(default)]
    pub default_policy: Policy,
}

fn default_bind_addr() -> String {
    "127.0.0.1:4600".to_string()
}

fn default_runs_root() -> String {
    "./runs".to_string()
}

fn default_max_concurrent_runs() -> usize {
    64
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            runs_root: default_runs_root(),
            max_concurrent_runs: default_max_concurrent_runs(),
            default_policy: Policy::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load config starting from defaults, optionally merging a TOML file,
    /// then applying `STEPFLOW_`-prefixed environment variable overrides —
    /// env wins, matching the teacher's "later source overrides earlier"
    /// merge order.
    pub fn load(toml_path: Option<&Path>) -> Result<Self> {
        let mut config = match toml_path {
            Some(path) if path.exists() => {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| OrchestratorError::InvalidParams(format!("reading {path:?}: {e}")))?;
                toml::from_str(&text)
                    .map_err(|e| OrchestratorError::InvalidParams(format!("parsing {path:?}: {e}")))?
            }
            _ => RuntimeConfig::default(),
        };

        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}BIND_ADDR")) {
            config.bind_addr = v;
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}RUNS_ROOT")) {
            config.runs_root = v;
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}MAX_CONCURRENT_RUNS")) {
            config.max_concurrent_runs = v
                .parse()
                .map_err(|_| OrchestratorError::InvalidParams(format!("invalid {ENV_PREFIX}MAX_CONCURRENT_RUNS: {v}")))?;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.max_concurrent_runs == 0 {
            return Err(OrchestratorError::InvalidParams(
                "max_concurrent_runs must be at least 1".to_string(),
            ));
        }
        if self.bind_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(OrchestratorError::InvalidParams(format!(
                "invalid bind_addr: {}",
                self.bind_addr
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = RuntimeConfig::default();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn env_override_wins_over_default() {
        std::env::set_var("STEPFLOW_BIND_ADDR", "0.0.0.0:9000");
        let cfg = RuntimeConfig::load(None).unwrap();
        assert_eq!(cfg.bind_addr, "0.0.0.0:9000");
        std::env::remove_var("STEPFLOW_BIND_ADDR");
    }

    #[test]
    fn rejects_zero_max_concurrent_runs() {
        std::env::set_var("STEPFLOW_MAX_CONCURRENT_RUNS", "0");
        let err = RuntimeConfig::load(None).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidParams(_)));
        std::env::remove_var("STEPFLOW_MAX_CONCURRENT_RUNS");
    }
}
