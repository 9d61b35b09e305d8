//! Runner configuration: the options recognized by the bootstrap, loaded
//! from a TOML file on disk.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::defaults::{
    default_broker_is_worker, default_module_name, default_nprocs_per_worker,
    default_spawn_workers, default_verbose,
};
use crate::error::DistwqError;

/// Options recognized by the runner bootstrap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Namespace the user's `main` (and any worker-init function) is looked
    /// up in.
    #[serde(default = "default_module_name")]
    pub module_name: String,

    /// Enable info-level logging for the serve loops.
    #[serde(default = "default_verbose")]
    pub verbose: bool,

    /// Force the spawn/broker path even for a single rank per worker.
    #[serde(default = "default_spawn_workers")]
    pub spawn_workers: bool,

    /// Size of each spawned collective-worker sub-group.
    #[serde(default = "default_nprocs_per_worker")]
    pub nprocs_per_worker: usize,

    /// Whether the broker itself contributes a task result.
    #[serde(default = "default_broker_is_worker")]
    pub broker_is_worker: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            module_name: default_module_name(),
            verbose: default_verbose(),
            spawn_workers: default_spawn_workers(),
            nprocs_per_worker: default_nprocs_per_worker(),
            broker_is_worker: default_broker_is_worker(),
        }
    }
}

impl RunnerConfig {
    /// Load and validate a `RunnerConfig` from a TOML file on disk.
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: RunnerConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid config at {}: {e}", path.display()))?;
        Ok(config)
    }

    /// Reject configurations that are internally inconsistent: spawning is
    /// forced, each sub-group would have exactly one rank, and the broker
    /// is also meant to be that one worker — there would be nothing left
    /// to spawn.
    pub fn validate(&self) -> std::result::Result<(), DistwqError> {
        if self.nprocs_per_worker == 0 {
            return Err(DistwqError::ConfigInvalid(
                "nprocs_per_worker must be >= 1".to_string(),
            ));
        }
        if self.spawn_workers && self.nprocs_per_worker == 1 && self.broker_is_worker {
            return Err(DistwqError::ConfigInvalid(
                "cannot spawn workers when nprocs_per_worker=1 and broker_is_worker=true"
                    .to_string(),
            ));
        }
        Ok(())
    }
}
