//! Rollout tunables
//!
//! Loaded from an optional YAML file, then overridden from the process
//! environment. Every field has a default so an empty file is valid.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

const ENV_WAIT_FOR_LIVE: &str = "KUBERNETES_WAIT_FOR_LIVE";
const ENV_WAIT_FOR_PREREQUISITES: &str = "KUBERNETES_WAIT_FOR_PREREQUISITES";
const ENV_STABILITY_CHECK_DURATION: &str = "KUBERNETES_STABILITY_CHECK_DURATION";
const ENV_STABILITY_CHECK_TICK: &str = "KUBERNETES_STABILITY_CHECK_TICK";
const ENV_LOG_LINES: &str = "KUBERNETES_LOG_LINES";
const ENV_LOG_TIMEOUT: &str = "KUBERNETES_LOG_TIMEOUT";
const ENV_DEPLOY_CONCURRENCY: &str = "KUBERNETES_DEPLOY_CONCURRENCY";

/// Timing and budget configuration for a rollout
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeployerConfig {
    /// How long pods may take to become live before the rollout times out
    #[serde(default = "default_wait_for_live")]
    pub wait_for_live_secs: u64,

    /// Live-wait timeout for the prerequisite batch (defaults to `waitForLiveSecs`)
    #[serde(default)]
    pub wait_for_prerequisites_secs: Option<u64>,

    /// How long all pods must stay live before the rollout succeeds
    #[serde(default = "default_stability_check")]
    pub stability_check_secs: u64,

    /// Poll interval
    #[serde(default = "default_tick")]
    pub tick_secs: u64,

    /// Minimum time between two status dumps
    #[serde(default = "default_status_print_interval")]
    pub status_print_interval_secs: u64,

    /// Log lines printed per container when diagnosing a failure
    #[serde(default = "default_log_lines")]
    pub log_lines: usize,

    /// Deadline for fetching one container's logs
    #[serde(default = "default_log_timeout")]
    pub log_timeout_secs: u64,

    /// Size of the worker pool used for applies and diagnostic queries
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Retries for connection failures while reading from a cluster
    #[serde(default = "default_transient_retries")]
    pub transient_retries: u32,
}

fn default_wait_for_live() -> u64 {
    600
}

fn default_stability_check() -> u64 {
    60
}

fn default_tick() -> u64 {
    2
}

fn default_status_print_interval() -> u64 {
    10
}

fn default_log_lines() -> usize {
    50
}

fn default_log_timeout() -> u64 {
    20
}

fn default_concurrency() -> usize {
    10
}

fn default_transient_retries() -> u32 {
    3
}

impl Default for DeployerConfig {
    fn default() -> Self {
        Self {
            wait_for_live_secs: default_wait_for_live(),
            wait_for_prerequisites_secs: None,
            stability_check_secs: default_stability_check(),
            tick_secs: default_tick(),
            status_print_interval_secs: default_status_print_interval(),
            log_lines: default_log_lines(),
            log_timeout_secs: default_log_timeout(),
            concurrency: default_concurrency(),
            transient_retries: default_transient_retries(),
        }
    }
}

impl DeployerConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(&content)?;
        debug!(path = %path.display(), "Loaded deployer configuration");
        Ok(config)
    }

    /// Apply `KUBERNETES_*` environment overrides on top of this config
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_number(ENV_WAIT_FOR_LIVE) {
            self.wait_for_live_secs = v;
        }
        if let Some(v) = env_number(ENV_WAIT_FOR_PREREQUISITES) {
            self.wait_for_prerequisites_secs = Some(v);
        }
        if let Some(v) = env_number(ENV_STABILITY_CHECK_DURATION) {
            self.stability_check_secs = v;
        }
        if let Some(v) = env_number(ENV_STABILITY_CHECK_TICK) {
            self.tick_secs = v;
        }
        if let Some(v) = env_number(ENV_LOG_LINES) {
            self.log_lines = v;
        }
        if let Some(v) = env_number(ENV_LOG_TIMEOUT) {
            self.log_timeout_secs = v;
        }
        if let Some(v) = env_number(ENV_DEPLOY_CONCURRENCY) {
            self.concurrency = v;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_secs == 0 {
            return Err(Error::Config("tickSecs must be greater than 0".to_string()));
        }
        if self.concurrency == 0 {
            return Err(Error::Config(
                "concurrency must be greater than 0".to_string(),
            ));
        }
        if self.stability_check_secs != 0 && self.stability_check_secs < self.tick_secs {
            return Err(Error::Config(format!(
                "stabilityCheckSecs ({}) must be at least one tick ({}s)",
                self.stability_check_secs, self.tick_secs
            )));
        }
        Ok(())
    }

    pub fn wait_for_live(&self) -> Duration {
        Duration::from_secs(self.wait_for_live_secs)
    }

    pub fn wait_for_prerequisites(&self) -> Duration {
        Duration::from_secs(
            self.wait_for_prerequisites_secs
                .unwrap_or(self.wait_for_live_secs),
        )
    }

    pub fn stability_check(&self) -> Duration {
        Duration::from_secs(self.stability_check_secs)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    pub fn status_print_interval(&self) -> Duration {
        Duration::from_secs(self.status_print_interval_secs)
    }

    pub fn log_timeout(&self) -> Duration {
        Duration::from_secs(self.log_timeout_secs)
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring non-numeric environment override");
            None
        }
    }
}
