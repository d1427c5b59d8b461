//! Error taxonomy for the execution engine.
//!
//! Process-level failures (spawn errors, kills, bad exits, timeouts) are
//! captured into [`ExecutionResult`](crate::scheduler::ExecutionResult) as
//! structured [`FailureInfo`] payloads so every execution path yields a
//! result object. `EngineError` is returned only for contract violations
//! and storage failures, conditions the caller must handle directly.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::watchdog::{TimeoutInfo, TimeoutKind};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to spawn agent process: {0}")]
    Spawn(String),

    #[error("watchdog already aborted")]
    AlreadyAborted,

    #[error("unknown task: {0}")]
    TaskNotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("storage error: {0}")]
    Storage(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

/// Stable machine-readable failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCode {
    /// The agent binary could not be started (missing, unauthorized).
    SpawnError,
    /// The agent process was terminated by a signal, ours or external.
    ProcessKilled,
    /// Non-zero exit with no more specific cause found.
    ExitError,
    /// The agent emitted an explicit `turn.failed` event.
    TurnFailed,
    /// Our own supervision fired: inactivity, deadline, or manual abort.
    Timeout,
}

/// User-visible failure descriptor stored in results and the task ledger.
///
/// Always carries a stable code and a human-readable message; partial
/// output collected before the failure is attached whenever available so
/// a timeout or crash never yields an empty-handed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureInfo {
    pub code: FailureCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial: Option<Value>,
}

impl FailureInfo {
    pub fn new(code: FailureCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            partial: None,
        }
    }

    pub fn spawn(message: impl Into<String>) -> Self {
        Self::new(FailureCode::SpawnError, message)
    }

    pub fn killed(signal: Option<i32>) -> Self {
        let message = match signal {
            Some(sig) => format!("agent process killed by signal {}", sig),
            None => "agent process killed".to_string(),
        };
        Self::new(FailureCode::ProcessKilled, message)
    }

    pub fn exit(code: i32) -> Self {
        Self::new(FailureCode::ExitError, format!("agent exited with code {}", code))
    }

    pub fn turn_failed(message: impl Into<String>) -> Self {
        Self::new(FailureCode::TurnFailed, message)
    }

    pub fn timeout(info: &TimeoutInfo) -> Self {
        let message = match info.kind {
            TimeoutKind::Inactivity => format!(
                "no activity from the agent for {} ms",
                info.idle_ms
            ),
            TimeoutKind::Deadline => format!(
                "hard deadline reached after {} ms",
                info.elapsed_ms
            ),
            TimeoutKind::Manual => "execution aborted by caller".to_string(),
        };
        Self::new(FailureCode::Timeout, message)
    }

    /// Attach a serialized partial-result snapshot.
    pub fn with_partial(mut self, partial: Value) -> Self {
        self.partial = Some(partial);
        self
    }
}
