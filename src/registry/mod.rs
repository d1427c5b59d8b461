//! Durable task ledger.
//!
//! Every submitted task gets one row, written at submission and on every
//! status or progress transition, synchronously; there is no
//! write-behind window that could lose a transition on crash. Three
//! implementations share the [`TaskStore`] contract: the SQLite ledger
//! for production, an in-memory store for tests, and a file-backed
//! fallback (whole-document read-modify-rewrite) for simple task lists.

pub mod file;
pub mod memory;
pub mod sqlite;

pub use file::JsonFileTaskStore;
pub use memory::InMemoryTaskStore;
pub use sqlite::SqliteTaskStore;

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineResult;

/// Where a task executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskOrigin {
    Local,
    Cloud,
}

impl TaskOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Cloud => "cloud",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local" => Some(Self::Local),
            "cloud" => Some(Self::Cloud),
            _ => None,
        }
    }
}

/// Task lifecycle. Mostly-forward: `pending → working → terminal`, with
/// `unknown` as the lost-contact sentinel for any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Working,
    Completed,
    CompletedWithWarnings,
    CompletedWithErrors,
    Failed,
    Canceled,
    Unknown,
}

impl TaskStatus {
    /// Terminal states are absorbing: no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed
                | Self::CompletedWithWarnings
                | Self::CompletedWithErrors
                | Self::Failed
                | Self::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Working => "working",
            Self::Completed => "completed",
            Self::CompletedWithWarnings => "completed_with_warnings",
            Self::CompletedWithErrors => "completed_with_errors",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "working" => Some(Self::Working),
            "completed" => Some(Self::Completed),
            "completed_with_warnings" => Some(Self::CompletedWithWarnings),
            "completed_with_errors" => Some(Self::CompletedWithErrors),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }

    pub fn non_terminal() -> &'static [TaskStatus] {
        &[Self::Pending, Self::Working, Self::Unknown]
    }
}

/// One ledger row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Immutable, globally unique, sortable by creation time.
    pub id: String,
    pub origin: TaskOrigin,
    pub status: TaskStatus,
    pub instruction: String,
    pub working_dir: String,
    pub environment: Option<String>,
    pub model: Option<String>,
    pub mode: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Non-decreasing.
    pub updated_at: DateTime<Utc>,
    /// Set exactly once, on the transition into a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
    /// Serialized [`ProgressSnapshot`](crate::progress::ProgressSnapshot).
    pub progress: Option<Value>,
    pub poll_hint_ms: Option<u64>,
    pub keep_alive_until: Option<DateTime<Utc>>,
    /// Agent thread id, for session resumption.
    pub thread_id: Option<String>,
    pub user_id: Option<String>,
    pub result: Option<Value>,
    pub error: Option<Value>,
    pub metadata: Value,
}

impl TaskRecord {
    pub fn new(
        id: impl Into<String>,
        origin: TaskOrigin,
        instruction: impl Into<String>,
        working_dir: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            origin,
            status: TaskStatus::Pending,
            instruction: instruction.into(),
            working_dir: working_dir.into(),
            environment: None,
            model: None,
            mode: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            last_event_at: None,
            progress: None,
            poll_hint_ms: None,
            keep_alive_until: None,
            thread_id: None,
            user_id: None,
            result: None,
            error: None,
            metadata: Value::Object(serde_json::Map::new()),
        }
    }

    /// Apply a status transition in place. Returns false when the record
    /// is already terminal (absorbing) and the transition was ignored.
    pub(crate) fn apply_status(&mut self, status: TaskStatus, error: Option<Value>) -> bool {
        if self.status.is_terminal() && status != self.status {
            tracing::warn!(
                "Ignoring status transition {} -> {} for terminal task {}",
                self.status.as_str(),
                status.as_str(),
                self.id
            );
            return false;
        }
        self.status = status;
        if let Some(error) = error {
            self.error = Some(error);
        }
        let now = Utc::now();
        self.updated_at = self.updated_at.max(now);
        if status.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(now);
        }
        true
    }

    /// Apply a partial field update in place.
    pub(crate) fn apply_update(&mut self, update: TaskUpdate) {
        if let Some(progress) = update.progress {
            self.progress = Some(progress);
        }
        if let Some(at) = update.last_event_at {
            self.last_event_at = Some(at);
        }
        if let Some(thread_id) = update.thread_id {
            self.thread_id = Some(thread_id);
        }
        if let Some(result) = update.result {
            self.result = Some(result);
        }
        if let Some(error) = update.error {
            self.error = Some(error);
        }
        if let Some(hint) = update.poll_hint_ms {
            self.poll_hint_ms = Some(hint);
        }
        if let Some(until) = update.keep_alive_until {
            self.keep_alive_until = Some(until);
        }
        if let Some(metadata) = update.metadata {
            self.metadata = metadata;
        }
        self.updated_at = self.updated_at.max(Utc::now());
    }
}

/// Partial update applied to a row; unset fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub progress: Option<Value>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub thread_id: Option<String>,
    pub result: Option<Value>,
    pub error: Option<Value>,
    pub poll_hint_ms: Option<u64>,
    pub keep_alive_until: Option<DateTime<Utc>>,
    pub metadata: Option<Value>,
}

/// General filtered/paginated query.
#[derive(Debug, Clone, Default)]
pub struct TaskQuery {
    pub origin: Option<TaskOrigin>,
    pub statuses: Vec<TaskStatus>,
    pub working_dir: Option<String>,
    pub environment: Option<String>,
    pub thread_id: Option<String>,
    pub user_id: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: usize,
}

/// The ledger contract. Mutations are durable before the call returns.
pub trait TaskStore: Send + Sync {
    /// Insert a new row. The id must be unused.
    fn register(&self, record: &TaskRecord) -> EngineResult<()>;

    fn get(&self, id: &str) -> EngineResult<Option<TaskRecord>>;

    /// Transition a row's status, stamping `completed_at` exactly once
    /// when the new status is terminal. Transitions out of a terminal
    /// status are ignored (terminal states are absorbing).
    fn update_status(
        &self,
        id: &str,
        status: TaskStatus,
        error: Option<Value>,
    ) -> EngineResult<TaskRecord>;

    /// Apply a partial field update.
    fn update(&self, id: &str, update: TaskUpdate) -> EngineResult<TaskRecord>;

    /// Tasks created within the window, newest-first, at most `limit`.
    fn recent(&self, within: Duration, limit: usize) -> EngineResult<Vec<TaskRecord>>;

    /// Non-terminal tasks, optionally scoped to a working directory,
    /// most recently updated first.
    fn running(&self, working_dir: Option<&str>) -> EngineResult<Vec<TaskRecord>>;

    fn query(&self, query: &TaskQuery) -> EngineResult<Vec<TaskRecord>>;

    /// Delete terminal rows whose completion is older than `older_than`.
    /// Returns the number of rows removed.
    fn sweep(&self, older_than: Duration) -> EngineResult<usize>;
}

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

fn to_base36(mut n: u128) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while n > 0 {
        digits.push(BASE36[(n % 36) as usize]);
        n /= 36;
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}

/// Generate a task id: `T-{origin}-{base36 millis}{4 random chars}`.
/// Sortable by creation time within an origin.
pub fn generate_task_id(origin: TaskOrigin) -> String {
    let millis = Utc::now().timestamp_millis().max(0) as u128;
    let mut rng = rand::thread_rng();
    let suffix: String = (0..4)
        .map(|_| BASE36[rng.gen_range(0..36)] as char)
        .collect();
    format!("T-{}-{}{}", origin.as_str(), to_base36(millis), suffix)
}

/// Shared in-process filtering used by the memory and file stores; the
/// SQLite store expresses the same predicates in SQL.
pub(crate) fn matches_query(record: &TaskRecord, query: &TaskQuery) -> bool {
    if let Some(origin) = query.origin {
        if record.origin != origin {
            return false;
        }
    }
    if !query.statuses.is_empty() && !query.statuses.contains(&record.status) {
        return false;
    }
    if let Some(dir) = &query.working_dir {
        if &record.working_dir != dir {
            return false;
        }
    }
    if let Some(env) = &query.environment {
        if record.environment.as_deref() != Some(env.as_str()) {
            return false;
        }
    }
    if let Some(thread) = &query.thread_id {
        if record.thread_id.as_deref() != Some(thread.as_str()) {
            return false;
        }
    }
    if let Some(user) = &query.user_id {
        if record.user_id.as_deref() != Some(user.as_str()) {
            return false;
        }
    }
    if let Some(after) = query.created_after {
        if record.created_at < after {
            return false;
        }
    }
    if let Some(before) = query.created_before {
        if record.created_at > before {
            return false;
        }
    }
    true
}

/// `now - within`, saturating at the epoch floor for oversized windows.
pub(crate) fn window_cutoff(within: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(within)
        .ok()
        .and_then(|within| Utc::now().checked_sub_signed(within))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
