//! The task engine façade.
//!
//! Ties the pieces together: a submission registers a ledger row, queues
//! an execution, and returns immediately with the task id. A background
//! supervision task drains the event stream into the progress tracker,
//! persists every transition, and stamps the final status when the
//! subprocess resolves. Callers poll [`TaskEngine::status`] (or query
//! the ledger) rather than holding a handle to the execution.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult, FailureInfo};
use crate::events::AgentEvent;
use crate::progress::ProgressTracker;
use crate::registry::{
    generate_task_id, TaskOrigin, TaskQuery, TaskRecord, TaskStatus, TaskStore, TaskUpdate,
};
use crate::scheduler::{AgentExecutor, ExecutionHooks, ExecutionRequest, ExecutionResult};
use crate::watchdog::TimeoutKind;

/// Everything needed to start one delegated task.
#[derive(Debug, Clone)]
pub struct TaskSubmission {
    pub origin: TaskOrigin,
    pub execution: ExecutionRequest,
    pub environment: Option<String>,
    pub user_id: Option<String>,
    pub metadata: Value,
}

impl TaskSubmission {
    pub fn new(instruction: impl Into<String>, working_dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            origin: TaskOrigin::Local,
            execution: ExecutionRequest::new(instruction, working_dir),
            environment: None,
            user_id: None,
            metadata: Value::Object(serde_json::Map::new()),
        }
    }
}

pub struct TaskEngine {
    config: Arc<EngineConfig>,
    store: Arc<dyn TaskStore>,
    executor: Arc<AgentExecutor>,
    /// Cancel handles for tasks whose execution is live in this process.
    cancels: Arc<Mutex<HashMap<String, oneshot::Sender<()>>>>,
}

impl TaskEngine {
    /// Build the engine over a ledger. Any non-terminal rows left behind
    /// by a previous process are marked `unknown`: their subprocesses
    /// died with that process, but whatever they wrote may have landed,
    /// so the rows are preserved rather than failed outright.
    pub fn new(config: EngineConfig, store: Arc<dyn TaskStore>) -> EngineResult<Self> {
        let orphaned = store.running(None)?;
        for record in &orphaned {
            tracing::warn!(
                "Task {} was {} at shutdown; marking as unknown",
                record.id,
                record.status.as_str()
            );
            store.update_status(&record.id, TaskStatus::Unknown, None)?;
        }

        let config = Arc::new(config);
        let executor = Arc::new(AgentExecutor::new(Arc::clone(&config)));
        Ok(Self {
            config,
            store,
            executor,
            cancels: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register and start a task. Returns the freshly registered record;
    /// the execution itself runs in the background, gated by the
    /// concurrency ceiling.
    pub fn submit(&self, submission: TaskSubmission) -> EngineResult<TaskRecord> {
        if submission.execution.instruction.trim().is_empty() {
            return Err(EngineError::InvalidRequest(
                "task instruction must not be empty".to_string(),
            ));
        }

        let id = generate_task_id(submission.origin);
        let mut record = TaskRecord::new(
            id.clone(),
            submission.origin,
            submission.execution.instruction.clone(),
            submission.execution.working_dir.display().to_string(),
        );
        record.environment = submission.environment;
        record.user_id = submission.user_id;
        record.model = submission.execution.model.clone();
        record.mode = submission.execution.sandbox.map(|s| s.as_str().to_string());
        record.poll_hint_ms = Some(self.config.default_poll_hint_ms);
        record.keep_alive_until =
            chrono::Duration::from_std(self.config.default_keep_alive)
                .ok()
                .map(|ttl| Utc::now() + ttl);
        record.metadata = submission.metadata;
        record.thread_id = submission.execution.resume_thread.clone();
        self.store.register(&record)?;
        tracing::info!("Task {} registered in {}", id, record.working_dir);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let (started_tx, started_rx) = oneshot::channel();
        self.lock_cancels().insert(id.clone(), cancel_tx);

        // Flip pending -> working once a concurrency slot is acquired.
        {
            let store = Arc::clone(&self.store);
            let id = id.clone();
            tokio::spawn(async move {
                if started_rx.await.is_ok() {
                    if let Err(e) = store.update_status(&id, TaskStatus::Working, None) {
                        tracing::error!("Failed to mark task {} working: {}", id, e);
                    }
                }
            });
        }

        let hooks = ExecutionHooks {
            events: Some(event_tx),
            cancel: Some(cancel_rx),
            started: Some(started_tx),
        };
        let request = submission.execution;
        let executor = Arc::clone(&self.executor);
        let store = Arc::clone(&self.store);
        let cancels = Arc::clone(&self.cancels);
        tokio::spawn(async move {
            let (result, tracker) = tokio::join!(
                executor.execute(request, hooks),
                drain_events(Arc::clone(&store), id.clone(), event_rx),
            );
            match cancels.lock() {
                Ok(mut map) => {
                    map.remove(&id);
                }
                Err(poisoned) => {
                    poisoned.into_inner().remove(&id);
                }
            }
            if let Err(e) = finalize(&*store, &id, &result, &tracker) {
                tracing::error!("Failed to finalize task {}: {}", id, e);
            }
        });

        Ok(record)
    }

    pub fn status(&self, id: &str) -> EngineResult<TaskRecord> {
        self.store
            .get(id)?
            .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))
    }

    /// The terminal result payload, once the task has settled.
    pub fn result(&self, id: &str) -> EngineResult<Option<Value>> {
        Ok(self.status(id)?.result)
    }

    /// Cancel a task. A live execution is aborted through its watchdog
    /// and will settle as `canceled`; a non-terminal row with no live
    /// execution (an `unknown` orphan) is marked canceled directly.
    /// Canceling an already-terminal task is a no-op.
    pub fn cancel(&self, id: &str) -> EngineResult<TaskRecord> {
        if let Some(tx) = self.lock_cancels().remove(id) {
            tracing::info!("Canceling running task {}", id);
            let _ = tx.send(());
            return self.status(id);
        }
        let record = self.status(id)?;
        if record.status.is_terminal() {
            return Ok(record);
        }
        self.store.update_status(
            id,
            TaskStatus::Canceled,
            Some(json!({"message": "canceled with no live execution"})),
        )
    }

    /// Extend a task's keep-alive window; `None` uses the engine default.
    pub fn touch(&self, id: &str, ttl: Option<Duration>) -> EngineResult<TaskRecord> {
        let ttl = ttl.unwrap_or(self.config.default_keep_alive);
        let until = chrono::Duration::from_std(ttl)
            .map(|ttl| Utc::now() + ttl)
            .map_err(|e| EngineError::InvalidRequest(format!("bad keep-alive: {}", e)))?;
        self.store.update(
            id,
            TaskUpdate {
                keep_alive_until: Some(until),
                ..TaskUpdate::default()
            },
        )
    }

    pub fn recent(&self, within: Duration, limit: usize) -> EngineResult<Vec<TaskRecord>> {
        self.store.recent(within, limit)
    }

    pub fn running(&self, working_dir: Option<&str>) -> EngineResult<Vec<TaskRecord>> {
        self.store.running(working_dir)
    }

    pub fn query(&self, query: &TaskQuery) -> EngineResult<Vec<TaskRecord>> {
        self.store.query(query)
    }

    /// Delete finished rows older than the retention window.
    pub fn sweep(&self, older_than: Duration) -> EngineResult<usize> {
        self.store.sweep(older_than)
    }

    /// Abort every live execution and terminate its subprocess. Used at
    /// host shutdown.
    pub fn shutdown(&self) {
        let handles: Vec<(String, oneshot::Sender<()>)> =
            self.lock_cancels().drain().collect();
        for (id, tx) in handles {
            tracing::info!("Shutdown: canceling task {}", id);
            let _ = tx.send(());
        }
        self.executor.kill_all();
    }

    fn lock_cancels(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<()>>> {
        match self.cancels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Fold the live event stream into a progress tracker, persisting the
/// snapshot after each event so pollers always see current progress.
async fn drain_events(
    store: Arc<dyn TaskStore>,
    id: String,
    mut event_rx: mpsc::UnboundedReceiver<AgentEvent>,
) -> ProgressTracker {
    let mut tracker = ProgressTracker::new();
    while let Some(event) = event_rx.recv().await {
        tracker.process_event(&event);
        let mut update = TaskUpdate {
            last_event_at: Some(Utc::now()),
            ..TaskUpdate::default()
        };
        if let AgentEvent::ThreadStarted { thread_id: Some(thread_id) } = &event {
            update.thread_id = Some(thread_id.clone());
        }
        match serde_json::to_value(tracker.progress()) {
            Ok(snapshot) => update.progress = Some(snapshot),
            Err(e) => tracing::error!("Failed to serialize progress for {}: {}", id, e),
        }
        if let Err(e) = store.update(&id, update) {
            tracing::error!("Failed to persist progress for {}: {}", id, e);
        }
    }
    tracker
}

/// Map an execution outcome onto the ledger's terminal statuses.
fn finalize(
    store: &dyn TaskStore,
    id: &str,
    result: &ExecutionResult,
    tracker: &ProgressTracker,
) -> EngineResult<()> {
    let (status, error) = final_status(result, tracker);
    tracing::info!("Task {} finished: {}", id, status.as_str());

    let snapshot = serde_json::to_value(tracker.progress())?;
    let payload = json!({
        "message": tracker.last_agent_message(),
        "events": result.events.len(),
        "exit_code": result.exit_code,
        "progress": snapshot.clone(),
    });
    store.update(
        id,
        TaskUpdate {
            result: Some(payload),
            progress: Some(snapshot),
            ..TaskUpdate::default()
        },
    )?;
    let error = error.map(serde_json::to_value).transpose()?;
    store.update_status(id, status, error)?;
    Ok(())
}

fn final_status(
    result: &ExecutionResult,
    tracker: &ProgressTracker,
) -> (TaskStatus, Option<FailureInfo>) {
    if let Some(timeout) = &result.timeout {
        let mut error = result
            .error
            .clone()
            .unwrap_or_else(|| FailureInfo::timeout(timeout));
        if let Some(partial) = &result.partial {
            if !partial.is_empty() {
                if let Ok(partial) = serde_json::to_value(partial) {
                    error = error.with_partial(partial);
                }
            }
        }
        let status = match timeout.kind {
            TimeoutKind::Manual => TaskStatus::Canceled,
            _ => TaskStatus::Failed,
        };
        return (status, Some(error));
    }

    if !result.success {
        return (TaskStatus::Failed, result.error.clone());
    }

    // Exit 0: the agent considers itself done, but the event stream can
    // still demote the outcome.
    if tracker.last_turn_failed() {
        let message = tracker
            .turn_failure()
            .unwrap_or("turn failed")
            .to_string();
        return (TaskStatus::Failed, Some(FailureInfo::turn_failed(message)));
    }
    if tracker.has_failed() {
        // An earlier turn failed but a later one completed: the work
        // landed, with scars.
        return (TaskStatus::CompletedWithErrors, None);
    }
    if result.parse_errors > 0 || !result.stderr.trim().is_empty() {
        return (TaskStatus::CompletedWithWarnings, None);
    }
    (TaskStatus::Completed, None)
}
