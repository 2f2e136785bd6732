//! Orchestrator configuration, loaded from `gazette.toml`.
//!
//! The routing tables are read once at startup and passed to the worker as a
//! value; a claimed task never consults this file again (its routing is
//! frozen into the task row).

use crate::routing::{AgentRoutes, Profile, ProfileModels, RoutingConfig};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Worker loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Sleep between empty claim polls in continuous mode.
    pub poll_interval_secs: u64,
    /// Consecutive empty polls before a bounded run exits.
    pub max_idle_polls: u32,
    /// Base for exponential retry backoff.
    pub retry_base_secs: u64,
    /// Cap on a single backoff delay.
    pub retry_max_secs: u64,
    /// Cap on per-attempt timeout growth after timeouts.
    pub timeout_retry_cap_secs: u64,
    /// A claim whose heartbeat is older than this is reclaimable.
    pub stale_claim_secs: u64,
    /// Heartbeat refresh cadence while an attempt is in flight.
    pub heartbeat_interval_secs: u64,
    /// Grace between the graceful stop signal and the forced kill.
    pub term_grace_secs: u64,
    /// Wait after the forced kill before giving up on the process.
    pub kill_grace_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 2,
            max_idle_polls: 1,
            retry_base_secs: 30,
            retry_max_secs: 900,
            timeout_retry_cap_secs: 1800,
            stale_claim_secs: 1800,
            heartbeat_interval_secs: 30,
            term_grace_secs: 10,
            kill_grace_secs: 2,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn term_grace(&self) -> Duration {
        Duration::from_secs(self.term_grace_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }
}

/// Top-level configuration (parsed from gazette.toml).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_workdir_root")]
    pub workdir_root: PathBuf,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(flatten)]
    pub routing: RoutingConfig,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("gazette.redb")
}

fn default_workdir_root() -> PathBuf {
    PathBuf::from("workdirs")
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let mut agents = HashMap::new();
        agents.insert(
            "claude".to_string(),
            AgentRoutes {
                command_template: "claude -p {prompt_file} --model {model} --output-format text"
                    .into(),
                default_profile: Profile::Fast,
                models: ProfileModels {
                    fast: Some("claude-3-5-haiku-latest".into()),
                    quality: Some("claude-sonnet-4-5".into()),
                },
            },
        );
        agents.insert(
            "codex".to_string(),
            AgentRoutes {
                command_template: "codex exec --model {model} --manifest {manifest}".into(),
                default_profile: Profile::Quality,
                models: ProfileModels {
                    fast: Some("gpt-5-mini".into()),
                    quality: Some("gpt-5".into()),
                },
            },
        );
        Self {
            db_path: default_db_path(),
            workdir_root: default_workdir_root(),
            worker: WorkerConfig::default(),
            routing: RoutingConfig {
                default_agent: "claude".into(),
                agents,
            },
        }
    }
}

impl OrchestratorConfig {
    /// Load from a TOML file; a missing file yields the defaults.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: OrchestratorConfig = toml::from_str(&content)
            .with_context(|| format!("invalid config at {}", path.display()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_have_claude_routing() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.routing.default_agent, "claude");
        assert!(config.routing.agent("claude").is_some());
        assert_eq!(config.worker.poll_interval_secs, 2);
    }

    #[test]
    fn load_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = OrchestratorConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.db_path, PathBuf::from("gazette.redb"));
    }

    #[test]
    fn load_toml_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gazette.toml");
        std::fs::write(
            &path,
            r#"
db_path = "queue.redb"
default_agent = "gemini"

[worker]
poll_interval_secs = 5
stale_claim_secs = 600

[agents.gemini]
command_template = "gemini run --model {model} {prompt}"
default_profile = "quality"

[agents.gemini.models]
fast = "gemini-flash"
quality = "gemini-pro"
"#,
        )
        .unwrap();

        let config = OrchestratorConfig::load(&path).unwrap();
        assert_eq!(config.db_path, PathBuf::from("queue.redb"));
        assert_eq!(config.routing.default_agent, "gemini");
        assert_eq!(config.worker.poll_interval_secs, 5);
        assert_eq!(config.worker.stale_claim_secs, 600);
        let gemini = config.routing.agent("gemini").unwrap();
        assert_eq!(gemini.default_profile, Profile::Quality);
        assert_eq!(gemini.models.quality.as_deref(), Some("gemini-pro"));
        // Unlisted worker keys keep their defaults.
        assert_eq!(config.worker.retry_base_secs, 30);
    }
}
