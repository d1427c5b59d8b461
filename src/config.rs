//! Engine configuration.
//!
//! All defaults are resolved once at construction; nothing re-reads the
//! ambient environment mid-execution. One immutable [`EngineConfig`] is
//! shared (via `Arc`) by the scheduler, watchdogs, and engine façade.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment-variable policy applied to the spawned agent process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvPolicy {
    /// Start from an empty environment (PATH and HOME are retained so the
    /// binary can be located and the agent can find its own config).
    InheritNone,
    /// Start from an empty environment, then copy the named variables
    /// from the parent process.
    AllowList(Vec<String>),
    /// Pass the parent environment through unchanged.
    InheritAll,
}

impl Default for EnvPolicy {
    fn default() -> Self {
        Self::InheritNone
    }
}

/// Sandbox level forwarded to the agent binary via `--sandbox=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxMode {
    ReadOnly,
    WorkspaceWrite,
    DangerFullAccess,
}

impl SandboxMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadOnly => "read-only",
            Self::WorkspaceWrite => "workspace-write",
            Self::DangerFullAccess => "danger-full-access",
        }
    }
}

/// Timeout supervision parameters for one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// Abort when no activity has been recorded for this long.
    pub idle_timeout: Duration,
    /// Abort unconditionally this long after construction.
    pub hard_timeout: Duration,
    /// Emit a warning when remaining idle budget drops below this.
    pub warning_lead: Duration,
    /// Delay between the graceful kill and the forced kill.
    pub kill_grace: Duration,
    /// Supervision poll resolution.
    pub check_interval: Duration,
    /// Interval of the long-running-task progress heartbeat.
    pub progress_interval: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(5 * 60),
            hard_timeout: Duration::from_secs(20 * 60),
            warning_lead: Duration::from_secs(30),
            kill_grace: Duration::from_secs(5),
            check_interval: Duration::from_secs(1),
            progress_interval: Duration::from_secs(30),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Path or name of the delegated agent binary.
    pub agent_binary: PathBuf,
    /// Maximum number of agent subprocesses running at once.
    pub max_concurrency: usize,
    /// Default environment policy for spawned agents.
    pub env_policy: EnvPolicy,
    /// Per-execution timeout supervision parameters.
    pub watchdog: WatchdogConfig,
    /// Poll-frequency hint stamped on new task rows, in milliseconds.
    pub default_poll_hint_ms: u64,
    /// Default keep-alive window granted to new tasks.
    pub default_keep_alive: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            agent_binary: PathBuf::from("codex"),
            max_concurrency: 3,
            env_policy: EnvPolicy::default(),
            watchdog: WatchdogConfig::default(),
            default_poll_hint_ms: 5_000,
            default_keep_alive: Duration::from_secs(10 * 60),
        }
    }
}
