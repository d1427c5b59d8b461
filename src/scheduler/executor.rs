//! Spawns and supervises one delegated-agent subprocess per execution.
//!
//! The executor builds the agent's argument vector (always a list, never
//! a shell string), spawns it with stdin closed and both pipes captured,
//! and wires the subprocess to a fresh parser + watchdog pair. Every
//! path (normal exit, watchdog abort, spawn failure) resolves to a
//! normalized [`ExecutionResult`]; nothing is thrown past this boundary.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

use crate::config::{EngineConfig, EnvPolicy, SandboxMode};
use crate::error::FailureInfo;
use crate::events::{AgentEvent, EventStreamParser};
use crate::scheduler::queue::ExecutionQueue;
use crate::watchdog::{
    signal_process_group, PartialResults, TimeoutInfo, TimeoutKind, TimeoutWatchdog,
    WatchdogSignal,
};

const READ_CHUNK_SIZE: usize = 8192;

/// A structured request to run one delegated task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Free-text instruction passed to the agent.
    pub instruction: String,
    pub working_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxMode>,
    /// JSON schema forwarded via `--output-schema`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    /// Extra `-c key=value` configuration overrides, in order.
    #[serde(default)]
    pub config_overrides: Vec<(String, String)>,
    /// Environment policy; `None` falls back to the engine default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_policy: Option<EnvPolicy>,
    /// Resume an existing agent thread instead of starting fresh.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_thread: Option<String>,
}

impl ExecutionRequest {
    pub fn new(instruction: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            instruction: instruction.into(),
            working_dir: working_dir.into(),
            model: None,
            sandbox: None,
            output_schema: None,
            config_overrides: Vec::new(),
            env_policy: None,
            resume_thread: None,
        }
    }
}

/// Normalized outcome of one execution. Owned by the call that produced
/// it and never mutated after return.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub events: Vec<AgentEvent>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial: Option<PartialResults>,
    /// Lines on stdout that were not parseable as events.
    pub parse_errors: u64,
}

impl ExecutionResult {
    fn spawn_failure(error: FailureInfo) -> Self {
        Self {
            success: false,
            events: Vec::new(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            signal: None,
            error: Some(error),
            timeout: None,
            partial: None,
            parse_errors: 0,
        }
    }
}

/// Side channels for one execution.
#[derive(Debug, Default)]
pub struct ExecutionHooks {
    /// Receives every parsed event, in stdout order.
    pub events: Option<mpsc::UnboundedSender<AgentEvent>>,
    /// Resolving this aborts the execution (manual timeout).
    pub cancel: Option<oneshot::Receiver<()>>,
    /// Resolved once the execution has acquired a concurrency slot.
    pub started: Option<oneshot::Sender<()>>,
}

enum StreamChunk {
    Stdout(String),
    Stderr(String),
}

/// Launches agent subprocesses under the concurrency ceiling.
#[derive(Debug)]
pub struct AgentExecutor {
    config: Arc<EngineConfig>,
    queue: ExecutionQueue,
    active: Mutex<HashMap<u64, u32>>,
    next_token: AtomicU64,
}

impl AgentExecutor {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        let queue = ExecutionQueue::new(config.max_concurrency);
        Self {
            config,
            queue,
            active: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    pub fn queue(&self) -> &ExecutionQueue {
        &self.queue
    }

    /// Run one request to completion, waiting for a free slot first.
    pub async fn execute(&self, request: ExecutionRequest, hooks: ExecutionHooks) -> ExecutionResult {
        self.queue.run(self.execute_inner(request, hooks)).await
    }

    /// Best-effort termination of every currently tracked subprocess.
    /// Used at host shutdown only.
    pub fn kill_all(&self) {
        let pids: Vec<u32> = self.lock_active().values().copied().collect();
        if pids.is_empty() {
            return;
        }
        tracing::warn!("Shutting down: terminating {} agent process(es)", pids.len());
        for pid in pids {
            signal_process_group(pid, libc::SIGTERM);
        }
    }

    /// Argument vector for the agent binary. Arguments are passed as a
    /// list so task text can never be interpreted by a shell.
    fn build_args(&self, request: &ExecutionRequest) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        if let Some(thread) = &request.resume_thread {
            args.push("resume".to_string());
            args.push(thread.clone());
        }
        args.push("--json".to_string());
        if let Some(sandbox) = request.sandbox {
            args.push(format!("--sandbox={}", sandbox.as_str()));
        }
        if let Some(model) = &request.model {
            args.push(format!("--model={}", model));
        }
        if let Some(schema) = &request.output_schema {
            args.push(format!("--output-schema={}", schema));
        }
        for (key, value) in &request.config_overrides {
            args.push("-c".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(request.instruction.clone());
        args
    }

    fn apply_env_policy(cmd: &mut Command, policy: &EnvPolicy) {
        match policy {
            EnvPolicy::InheritAll => {}
            EnvPolicy::InheritNone => {
                cmd.env_clear();
                // Binary lookup and agent config discovery need these.
                for key in ["PATH", "HOME"] {
                    if let Ok(value) = std::env::var(key) {
                        cmd.env(key, value);
                    }
                }
            }
            EnvPolicy::AllowList(names) => {
                cmd.env_clear();
                for name in names {
                    if let Ok(value) = std::env::var(name) {
                        cmd.env(name, value);
                    }
                }
            }
        }
    }

    async fn execute_inner(
        &self,
        request: ExecutionRequest,
        mut hooks: ExecutionHooks,
    ) -> ExecutionResult {
        if let Some(started) = hooks.started.take() {
            let _ = started.send(());
        }

        let args = self.build_args(&request);
        let policy = request
            .env_policy
            .clone()
            .unwrap_or_else(|| self.config.env_policy.clone());

        tracing::info!(
            "Spawning agent in {}: {} {:?}",
            request.working_dir.display(),
            self.config.agent_binary.display(),
            &args[..args.len().saturating_sub(1)]
        );

        let mut cmd = Command::new(&self.config.agent_binary);
        cmd.args(&args)
            .current_dir(&request.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        Self::apply_env_policy(&mut cmd, &policy);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let message = if e.kind() == std::io::ErrorKind::NotFound {
                    format!(
                        "agent binary '{}' not found; install it or set agent_binary",
                        self.config.agent_binary.display()
                    )
                } else {
                    format!("failed to spawn '{}': {}", self.config.agent_binary.display(), e)
                };
                tracing::error!("{}", message);
                return ExecutionResult::spawn_failure(FailureInfo::spawn(message));
            }
        };

        let pid = child.id();
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        if let Some(pid) = pid {
            self.lock_active().insert(token, pid);
        }

        let (watchdog, mut signal_rx) = TimeoutWatchdog::spawn(self.config.watchdog.clone(), pid);

        let (chunk_tx, mut chunk_rx) = mpsc::channel::<StreamChunk>(64);
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, chunk_tx.clone(), StreamChunk::Stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, chunk_tx.clone(), StreamChunk::Stderr);
        }
        drop(chunk_tx);

        let mut parser = EventStreamParser::new();
        let mut events: Vec<AgentEvent> = Vec::new();
        let mut stdout_acc = String::new();
        let mut stderr_acc = String::new();
        let mut streams_closed = false;
        let mut exited = false;
        let mut watchdog_gone = false;
        let mut exit_code: Option<i32> = None;
        let mut signal: Option<i32> = None;
        let mut cancel = hooks.cancel.take();

        loop {
            if streams_closed && exited {
                break;
            }
            tokio::select! {
                maybe_chunk = chunk_rx.recv(), if !streams_closed => match maybe_chunk {
                    Some(StreamChunk::Stdout(chunk)) => {
                        watchdog.record_stdout(&chunk);
                        stdout_acc.push_str(&chunk);
                        for event in parser.feed(&chunk) {
                            watchdog.record_event(&event);
                            if let Some(tx) = &hooks.events {
                                let _ = tx.send(event.clone());
                            }
                            events.push(event);
                        }
                    }
                    Some(StreamChunk::Stderr(chunk)) => {
                        watchdog.record_stderr(&chunk);
                        stderr_acc.push_str(&chunk);
                    }
                    None => streams_closed = true,
                },
                status = child.wait(), if !exited => {
                    exited = true;
                    match status {
                        Ok(status) => {
                            exit_code = status.code();
                            signal = exit_signal(&status);
                        }
                        Err(e) => {
                            tracing::warn!("Failed to reap agent process: {}", e);
                        }
                    }
                },
                maybe_signal = signal_rx.recv(), if !watchdog_gone => match maybe_signal {
                    Some(WatchdogSignal::Timeout(info)) => {
                        let partial = watchdog.partial_results();
                        self.lock_active().remove(&token);
                        let error = FailureInfo::timeout(&info);
                        return ExecutionResult {
                            success: false,
                            events,
                            stdout: stdout_acc,
                            stderr: stderr_acc,
                            exit_code: None,
                            signal: None,
                            error: Some(error),
                            timeout: Some(info),
                            partial: Some(partial),
                            parse_errors: parser.stats().parse_errors,
                        };
                    }
                    Some(WatchdogSignal::IdleWarning { idle, remaining }) => {
                        tracing::warn!(
                            "Agent idle for {:?}; abort in {:?} without output",
                            idle,
                            remaining
                        );
                    }
                    Some(WatchdogSignal::Progress { elapsed, .. }) => {
                        tracing::debug!("Agent execution running for {:?}", elapsed);
                    }
                    None => watchdog_gone = true,
                },
                cancelled = async {
                    match cancel.as_mut() {
                        Some(rx) => rx.await,
                        None => std::future::pending().await,
                    }
                }, if cancel.is_some() => {
                    cancel = None;
                    if cancelled.is_ok() {
                        // The Timeout signal arrives on signal_rx next.
                        let _ = watchdog.abort(TimeoutKind::Manual);
                    }
                }
            }
        }

        if let Some(event) = parser.flush() {
            watchdog.record_event(&event);
            if let Some(tx) = &hooks.events {
                let _ = tx.send(event.clone());
            }
            events.push(event);
        }
        watchdog.stop();
        self.lock_active().remove(&token);

        let success = exit_code == Some(0);
        let error = if success {
            None
        } else if signal.is_some() {
            Some(FailureInfo::killed(signal))
        } else if let Some(message) = last_turn_failure(&events) {
            Some(FailureInfo::turn_failed(message))
        } else {
            Some(FailureInfo::exit(exit_code.unwrap_or(-1)))
        };

        tracing::info!(
            "Agent exited: code={:?} signal={:?} events={} stdout={}B stderr={}B",
            exit_code,
            signal,
            events.len(),
            stdout_acc.len(),
            stderr_acc.len()
        );

        ExecutionResult {
            success,
            events,
            stdout: stdout_acc,
            stderr: stderr_acc,
            exit_code,
            signal,
            error,
            timeout: None,
            partial: None,
            parse_errors: parser.stats().parse_errors,
        }
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashMap<u64, u32>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn spawn_reader<R>(
    mut reader: R,
    tx: mpsc::Sender<StreamChunk>,
    wrap: fn(String) -> StreamChunk,
) where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; READ_CHUNK_SIZE];
        let mut pending: Vec<u8> = Vec::new();
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    pending.extend_from_slice(&buf[..n]);
                    let chunk = take_complete_utf8(&mut pending);
                    if !chunk.is_empty() && tx.send(wrap(chunk)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!("Agent pipe read ended: {}", e);
                    break;
                }
            }
        }
        // Stream ended mid-character: nothing more is coming.
        if !pending.is_empty() {
            let chunk = String::from_utf8_lossy(&pending).into_owned();
            let _ = tx.send(wrap(chunk)).await;
        }
    });
}

/// Drain `pending` up to the last complete UTF-8 character. A multi-byte
/// character split across reads stays buffered until its remaining bytes
/// arrive; genuinely invalid bytes are lossy-converted.
fn take_complete_utf8(pending: &mut Vec<u8>) -> String {
    let boundary = match std::str::from_utf8(pending) {
        Ok(_) => pending.len(),
        // An unterminated sequence at the end of the buffer.
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => pending.len(),
    };
    let chunk = String::from_utf8_lossy(&pending[..boundary]).into_owned();
    pending.drain(..boundary);
    chunk
}

fn last_turn_failure(events: &[AgentEvent]) -> Option<String> {
    events.iter().rev().find_map(|event| match event {
        AgentEvent::TurnFailed { message, .. } => Some(message.clone()),
        _ => None,
    })
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WatchdogConfig;
    use crate::error::FailureCode;
    use serde_json::json;
    use std::time::Duration;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn executor_for(binary: &std::path::Path, watchdog: Option<WatchdogConfig>) -> AgentExecutor {
        init_tracing();
        let mut config = EngineConfig {
            agent_binary: binary.to_path_buf(),
            ..EngineConfig::default()
        };
        if let Some(wd) = watchdog {
            config.watchdog = wd;
        }
        AgentExecutor::new(Arc::new(config))
    }

    #[cfg(unix)]
    fn write_script(dir: &std::path::Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-agent.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_build_args_order() {
        let executor = executor_for(std::path::Path::new("codex"), None);
        let mut request = ExecutionRequest::new("fix the tests", "/tmp");
        request.sandbox = Some(SandboxMode::WorkspaceWrite);
        request.model = Some("gpt-5-codex".to_string());
        request.output_schema = Some(json!({"type": "object"}));
        request.config_overrides = vec![("approval_policy".to_string(), "never".to_string())];

        let args = executor.build_args(&request);
        assert_eq!(
            args,
            vec![
                "exec",
                "--json",
                "--sandbox=workspace-write",
                "--model=gpt-5-codex",
                "--output-schema={\"type\":\"object\"}",
                "-c",
                "approval_policy=never",
                "fix the tests",
            ]
        );
    }

    #[test]
    fn test_build_args_resume() {
        let executor = executor_for(std::path::Path::new("codex"), None);
        let mut request = ExecutionRequest::new("continue", "/tmp");
        request.resume_thread = Some("th-42".to_string());

        let args = executor.build_args(&request);
        assert_eq!(args[..4], ["exec", "resume", "th-42", "--json"]);
    }

    #[tokio::test]
    async fn test_spawn_failure_yields_structured_result() {
        let executor =
            executor_for(std::path::Path::new("/nonexistent/definitely-missing-agent"), None);
        let result = executor
            .execute(
                ExecutionRequest::new("anything", std::env::temp_dir()),
                ExecutionHooks::default(),
            )
            .await;
        assert!(!result.success);
        let error = result.error.unwrap();
        assert_eq!(error.code, FailureCode::SpawnError);
        assert!(error.message.contains("not found"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_run_parses_events() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            concat!(
                "echo '{\"type\":\"thread.started\",\"thread_id\":\"th-1\"}'\n",
                "echo '{\"type\":\"turn.started\",\"data\":{\"id\":\"t1\"}}'\n",
                "echo 'stray diagnostic line'\n",
                "echo '{\"type\":\"item.started\",\"data\":{\"id\":\"i1\",\"type\":\"command_execution\",\"command\":\"ls\"}}'\n",
                "echo '{\"type\":\"item.completed\",\"data\":{\"id\":\"i1\",\"type\":\"command_execution\"}}'\n",
                "echo '{\"type\":\"turn.completed\",\"data\":{\"id\":\"t1\"}}'\n",
                "echo 'warning: something' 1>&2",
            ),
        );
        let executor = executor_for(&script, None);
        let result = executor
            .execute(
                ExecutionRequest::new("demo", dir.path()),
                ExecutionHooks::default(),
            )
            .await;

        assert!(result.success, "stderr: {}", result.stderr);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.events.len(), 5);
        assert_eq!(result.parse_errors, 1);
        assert!(result.stdout.contains("stray diagnostic line"));
        assert!(result.stderr.contains("warning: something"));
        assert!(result.error.is_none());
        assert!(result.timeout.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_events_forwarded_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            concat!(
                "echo '{\"type\":\"turn.started\",\"data\":{\"id\":\"t1\"}}'\n",
                "echo '{\"type\":\"turn.completed\",\"data\":{\"id\":\"t1\"}}'",
            ),
        );
        let executor = executor_for(&script, None);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = executor
            .execute(
                ExecutionRequest::new("demo", dir.path()),
                ExecutionHooks { events: Some(tx), ..Default::default() },
            )
            .await;
        assert!(result.success);

        let mut forwarded = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            forwarded.push(ev);
        }
        assert_eq!(forwarded, result.events);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_maps_to_exit_error() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "exit 3");
        let executor = executor_for(&script, None);
        let result = executor
            .execute(
                ExecutionRequest::new("demo", dir.path()),
                ExecutionHooks::default(),
            )
            .await;
        assert!(!result.success);
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.error.unwrap().code, FailureCode::ExitError);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_turn_failed_takes_precedence_over_exit_error() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            concat!(
                "echo '{\"type\":\"turn.started\",\"data\":{\"id\":\"t1\"}}'\n",
                "echo '{\"type\":\"turn.failed\",\"data\":{\"id\":\"t1\",\"error\":{\"message\":\"boom\"}}}'\n",
                "exit 1",
            ),
        );
        let executor = executor_for(&script, None);
        let result = executor
            .execute(
                ExecutionRequest::new("demo", dir.path()),
                ExecutionHooks::default(),
            )
            .await;
        let error = result.error.unwrap();
        assert_eq!(error.code, FailureCode::TurnFailed);
        assert_eq!(error.message, "boom");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_idle_timeout_returns_partial_results() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            concat!(
                "echo '{\"type\":\"turn.started\",\"data\":{\"id\":\"t1\"}}'\n",
                "sleep 30",
            ),
        );
        let watchdog = WatchdogConfig {
            idle_timeout: Duration::from_millis(300),
            hard_timeout: Duration::from_secs(10),
            warning_lead: Duration::from_millis(100),
            kill_grace: Duration::from_millis(100),
            check_interval: Duration::from_millis(50),
            progress_interval: Duration::from_secs(30),
        };
        let executor = executor_for(&script, Some(watchdog));

        let started = std::time::Instant::now();
        let result = executor
            .execute(
                ExecutionRequest::new("demo", dir.path()),
                ExecutionHooks::default(),
            )
            .await;
        assert!(started.elapsed() < Duration::from_secs(5), "abort must not block");

        assert!(!result.success);
        let timeout = result.timeout.unwrap();
        assert_eq!(timeout.kind, TimeoutKind::Inactivity);
        let partial = result.partial.unwrap();
        assert!(partial.stdout.contains("turn.started"));
        assert_eq!(result.events.len(), 1);
        assert_eq!(result.error.unwrap().code, FailureCode::Timeout);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_hook_aborts_manually() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "sleep 30");
        let watchdog = WatchdogConfig {
            kill_grace: Duration::from_millis(100),
            check_interval: Duration::from_millis(50),
            ..WatchdogConfig::default()
        };
        let executor = executor_for(&script, Some(watchdog));

        let (cancel_tx, cancel_rx) = oneshot::channel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let _ = cancel_tx.send(());
        });
        let result = executor
            .execute(
                ExecutionRequest::new("demo", dir.path()),
                ExecutionHooks { cancel: Some(cancel_rx), ..Default::default() },
            )
            .await;

        assert!(!result.success);
        assert_eq!(result.timeout.unwrap().kind, TimeoutKind::Manual);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_env_policy_allow_list() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            concat!(
                "echo \"ALLOWED=${AGENT_DELEGATE_TEST_VAR:-unset}\"\n",
                "echo \"BLOCKED=${AGENT_DELEGATE_OTHER_VAR:-unset}\"",
            ),
        );
        std::env::set_var("AGENT_DELEGATE_TEST_VAR", "visible");
        std::env::set_var("AGENT_DELEGATE_OTHER_VAR", "hidden");

        let executor = executor_for(&script, None);
        let mut request = ExecutionRequest::new("demo", dir.path());
        request.env_policy = Some(EnvPolicy::AllowList(vec![
            "AGENT_DELEGATE_TEST_VAR".to_string(),
        ]));
        let result = executor.execute(request, ExecutionHooks::default()).await;

        assert!(result.stdout.contains("ALLOWED=visible"));
        assert!(result.stdout.contains("BLOCKED=unset"));
    }

    #[test]
    fn test_utf8_split_character_is_carried_over() {
        let bytes = "h\u{00E9}llo".as_bytes();
        let mut pending = Vec::new();

        // First read ends inside the two-byte character.
        pending.extend_from_slice(&bytes[..2]);
        assert_eq!(take_complete_utf8(&mut pending), "h");
        assert_eq!(pending.len(), 1);

        pending.extend_from_slice(&bytes[2..]);
        assert_eq!(take_complete_utf8(&mut pending), "\u{00E9}llo");
        assert!(pending.is_empty());
    }

    #[test]
    fn test_utf8_invalid_bytes_are_replaced_not_buffered() {
        let mut pending = vec![b'a', 0xFF, b'b'];
        let chunk = take_complete_utf8(&mut pending);
        assert!(chunk.starts_with('a') && chunk.ends_with('b'));
        assert!(pending.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_multibyte_text_survives_read_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        // Pad the line so the emoji's four bytes straddle the read size.
        let prefix =
            "{\"type\":\"item.completed\",\"data\":{\"id\":\"m1\",\"type\":\"agent_message\",\"text\":\"";
        let padding = "a".repeat(READ_CHUNK_SIZE - 2 - prefix.len());
        let line = format!("{prefix}{padding}\u{1F600}tail\"}}}}");
        let payload = dir.path().join("events.jsonl");
        std::fs::write(&payload, format!("{}\n", line)).unwrap();
        let script = write_script(dir.path(), &format!("cat '{}'", payload.display()));

        let executor = executor_for(&script, None);
        let result = executor
            .execute(
                ExecutionRequest::new("demo", dir.path()),
                ExecutionHooks::default(),
            )
            .await;

        assert!(result.success, "stderr: {}", result.stderr);
        assert_eq!(result.events.len(), 1);
        assert_eq!(result.parse_errors, 0);
        match &result.events[0] {
            AgentEvent::ItemCompleted { item } => {
                let text = item.detail["text"].as_str().unwrap();
                assert!(text.contains('\u{1F600}'), "emoji was mangled");
                assert!(text.ends_with("\u{1F600}tail"));
                assert!(!text.contains('\u{FFFD}'));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(!result.stdout.contains('\u{FFFD}'));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_started_hook_fires() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "exit 0");
        let executor = executor_for(&script, None);
        let (started_tx, started_rx) = oneshot::channel();
        let result = executor
            .execute(
                ExecutionRequest::new("demo", dir.path()),
                ExecutionHooks { started: Some(started_tx), ..Default::default() },
            )
            .await;
        assert!(result.success);
        assert!(started_rx.await.is_ok());
    }
}
