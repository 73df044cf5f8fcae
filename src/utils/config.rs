// src/utils/config.rs
//! Application configuration
//!
//! Loaded from an optional TOML file and then from `AGENT_ORCH__*`
//! environment variables, e.g. `AGENT_ORCH__ORCHESTRATOR__MAX_CONCURRENT_RUNS=4`.
//! Every field has a default, so an empty file is a valid configuration.

use crate::events::broadcaster::DEFAULT_SUBSCRIBER_QUEUE;
use crate::runtime::orchestrator::OrchestratorConfig;
use crate::runtime::reconciler::ReconcilerConfig;
use crate::runtime::terminator::TerminatorConfig;
use crate::utils::errors::Result;
use crate::utils::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "AGENT_ORCH_CONFIG";

/// Default config file location (optional)
pub const DEFAULT_CONFIG_PATH: &str = "config/orchestrator.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub orchestrator: OrchestratorSettings,
    pub terminator: TerminatorSettings,
    pub reconciler: ReconcilerSettings,
    pub broadcaster: BroadcasterSettings,
    pub storage: StorageSettings,
    pub sandbox: SandboxSettings,
    pub runners: RunnerSettings,
    pub logging: LoggingSettings,

    /// YAML file of profiles to seed at startup
    pub profiles_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    /// Per-run ceiling when the profile omits one
    pub default_timeout_secs: u64,

    /// Admission cap
    pub max_concurrent_runs: usize,

    /// Applied when a profile does not say whether it needs a sandbox
    pub require_sandbox_by_default: bool,

    /// Attempts for event-store appends
    pub append_retry_attempts: u32,

    /// Base backoff for event-store appends
    pub append_retry_base_ms: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            default_timeout_secs: 30 * 60,
            max_concurrent_runs: 10,
            require_sandbox_by_default: true,
            append_retry_attempts: 5,
            append_retry_base_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminatorSettings {
    pub graceful_timeout_ms: u64,
    pub sigterm_grace_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for TerminatorSettings {
    fn default() -> Self {
        Self {
            graceful_timeout_ms: 10_000,
            sigterm_grace_ms: 5_000,
            poll_interval_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerSettings {
    pub interval_secs: u64,
    pub stale_threshold_secs: u64,
    pub orphan_grace_secs: u64,
    pub max_stale_runs: usize,
    pub kill_orphans: bool,
    pub auto_recover: bool,

    /// Runs inspected in parallel per pass
    pub concurrency: usize,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            stale_threshold_secs: 120,
            orphan_grace_secs: 300,
            max_stale_runs: 10,
            kill_orphans: true,
            auto_recover: true,
            concurrency: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcasterSettings {
    /// Per-subscriber queue bound; overflow disconnects the subscriber
    pub subscriber_queue: usize,
}

impl Default for BroadcasterSettings {
    fn default() -> Self {
        Self {
            subscriber_queue: DEFAULT_SUBSCRIBER_QUEUE,
        }
    }
}

/// Storage backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub backend: StorageBackend,

    /// SQLite database file
    pub path: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            path: PathBuf::from("data/orchestrator.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    /// Root under which per-run workspaces are created
    pub base_dir: PathBuf,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            base_dir: std::env::temp_dir().join("agent-orchestrator").join("sandboxes"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSettings {
    pub claude_code_binary: String,
    pub codex_binary: String,
    pub opencode_binary: String,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            claude_code_binary: "claude".to_string(),
            codex_binary: "codex".to_string(),
            opencode_binary: "opencode".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Load from `AGENT_ORCH_CONFIG` (or the default path) plus the environment
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        Self::load_from(path)
    }

    /// Load from a specific file (missing file is fine) plus the environment
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(
                config::File::from(path.as_ref())
                    .format(config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix("AGENT_ORCH")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        let o = &self.orchestrator;
        OrchestratorConfig {
            default_timeout: Duration::from_secs(o.default_timeout_secs),
            max_concurrent_runs: o.max_concurrent_runs,
            require_sandbox_by_default: o.require_sandbox_by_default,
            append_retry: RetryPolicy {
                max_attempts: o.append_retry_attempts.max(1),
                base_delay: Duration::from_millis(o.append_retry_base_ms),
                ..Default::default()
            },
        }
    }

    pub fn terminator_config(&self) -> TerminatorConfig {
        let t = &self.terminator;
        TerminatorConfig {
            graceful_timeout: Duration::from_millis(t.graceful_timeout_ms),
            sigterm_grace: Duration::from_millis(t.sigterm_grace_ms),
            poll_interval: Duration::from_millis(t.poll_interval_ms.max(1)),
        }
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        let r = &self.reconciler;
        ReconcilerConfig {
            interval: Duration::from_secs(r.interval_secs.max(1)),
            stale_threshold: Duration::from_secs(r.stale_threshold_secs),
            orphan_grace: Duration::from_secs(r.orphan_grace_secs),
            max_stale_runs: r.max_stale_runs,
            kill_orphans: r.kill_orphans,
            auto_recover: r.auto_recover,
            concurrency: r.concurrency.max(1),
        }
    }
}
