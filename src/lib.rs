//! # Agent Delegate
//!
//! An asynchronous task-execution engine that delegates coding tasks to
//! an external CLI agent and supervises the runs.
//!
//! This library provides:
//! - A fire-and-poll task lifecycle backed by a durable ledger
//! - Line-oriented parsing of the agent's JSON event stream
//! - Progress inference from turn and item events
//! - Idle and hard-deadline watchdogs with partial-result capture
//! - FIFO scheduling under a bounded concurrency ceiling
//!
//! ## Task Flow
//! 1. Submit an instruction via [`TaskEngine::submit`]; get a task id back
//! 2. The scheduler spawns the agent subprocess when a slot frees up
//! 3. Events stream into the progress tracker and the ledger as they land
//! 4. Poll [`TaskEngine::status`] until the task settles in a terminal state
//!
//! ## Modules
//! - `engine`: the façade tying scheduling, supervision, and storage together
//! - `events`: wire-format types and the stream parser
//! - `progress`: the pure progress reducer
//! - `watchdog`: per-execution timeout supervision
//! - `scheduler`: the bounded-concurrency queue and subprocess executor
//! - `registry`: the task ledger (SQLite, in-memory, JSON file)

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod progress;
pub mod registry;
pub mod scheduler;
pub mod watchdog;

pub use config::{EngineConfig, EnvPolicy, SandboxMode, WatchdogConfig};
pub use engine::{TaskEngine, TaskSubmission};
pub use error::{EngineError, EngineResult, FailureCode, FailureInfo};
pub use events::{AgentEvent, EventStreamParser, ParserStats};
pub use progress::{ProgressSnapshot, ProgressTracker};
pub use registry::{
    InMemoryTaskStore, JsonFileTaskStore, SqliteTaskStore, TaskOrigin, TaskQuery, TaskRecord,
    TaskStatus, TaskStore, TaskUpdate,
};
pub use scheduler::{AgentExecutor, ExecutionHooks, ExecutionRequest, ExecutionResult};
pub use watchdog::{
    KillStatus, PartialResults, TimeoutInfo, TimeoutKind, TimeoutWatchdog, WatchdogSignal,
};
