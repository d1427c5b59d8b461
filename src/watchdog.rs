//! Per-execution timeout supervision and partial-result capture.
//!
//! Each agent subprocess gets its own [`TimeoutWatchdog`]: it tracks
//! activity (output chunks and parsed events), arms an idle deadline and
//! a hard deadline, warns shortly before an idle abort, and keeps bounded
//! buffers of recent output so a timed-out execution can still return
//! something useful. Abort is single-use: the second call is a contract
//! violation, not a recoverable condition.
//!
//! All timing goes through `tokio::time`, so tests drive the watchdog
//! under `start_paused` simulated time.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

use crate::config::WatchdogConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::AgentEvent;

/// Combined byte cap for each captured stream buffer.
const STREAM_BUFFER_CAP: usize = 64 * 1024;
/// Number of recent events retained for partial results.
const EVENT_BUFFER_CAP: usize = 50;

/// Why an execution was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutKind {
    /// No activity for the idle-timeout duration.
    Inactivity,
    /// Hard deadline elapsed, regardless of activity.
    Deadline,
    /// Aborted explicitly by the caller.
    Manual,
}

impl std::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Inactivity => "inactivity",
            Self::Deadline => "deadline",
            Self::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// Whether and how the subprocess was signalled during abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillStatus {
    /// Graceful termination was requested; a forced kill is scheduled
    /// after the grace period if the process is still alive.
    TermSent,
    /// No process handle to signal.
    NoProcess,
}

/// Descriptor attached to a timed-out execution result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutInfo {
    pub kind: TimeoutKind,
    /// Wall-clock time since the watchdog was constructed, in ms.
    pub elapsed_ms: u64,
    /// Time since the last recorded activity, in ms.
    pub idle_ms: u64,
    pub pid: Option<u32>,
    pub kill: KillStatus,
}

/// Immutable snapshot of everything captured before (or after) an abort.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialResults {
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    /// Most recent parsed events (bounded window).
    pub events: Vec<AgentEvent>,
    /// Total events observed, including evicted ones.
    pub events_seen: usize,
    pub last_activity: DateTime<Utc>,
    pub captured_at: DateTime<Utc>,
}

impl PartialResults {
    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty() && self.events_seen == 0
    }
}

/// Notifications pushed to the owning execution.
#[derive(Debug, Clone)]
pub enum WatchdogSignal {
    /// Idle budget is nearly exhausted; clears on the next activity.
    IdleWarning { idle: Duration, remaining: Duration },
    /// Periodic heartbeat for long-running executions.
    Progress {
        elapsed: Duration,
        hard_remaining: Duration,
        since_last_activity: Duration,
    },
    /// The watchdog aborted the execution.
    Timeout(TimeoutInfo),
}

/// Ring buffer of output chunks: oldest-chunk-first eviction, always
/// retaining at least the newest chunk.
#[derive(Debug, Default)]
struct BoundedChunks {
    chunks: VecDeque<String>,
    bytes: usize,
    evicted: bool,
}

impl BoundedChunks {
    fn push(&mut self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        self.bytes += chunk.len();
        self.chunks.push_back(chunk.to_string());
        while self.bytes > STREAM_BUFFER_CAP && self.chunks.len() > 1 {
            if let Some(old) = self.chunks.pop_front() {
                self.bytes -= old.len();
                self.evicted = true;
            }
        }
    }

    fn snapshot(&self) -> String {
        self.chunks.iter().map(String::as_str).collect()
    }
}

#[derive(Debug)]
struct Inner {
    config: WatchdogConfig,
    pid: Option<u32>,
    started: Instant,
    last_activity: Instant,
    last_activity_wall: DateTime<Utc>,
    last_progress: Instant,
    warned: bool,
    aborted: Option<TimeoutKind>,
    stopped: bool,
    stdout: BoundedChunks,
    stderr: BoundedChunks,
    events: VecDeque<AgentEvent>,
    events_seen: usize,
    signal_tx: mpsc::UnboundedSender<WatchdogSignal>,
}

/// Cheap-to-clone handle; state is shared with the supervision task.
#[derive(Debug, Clone)]
pub struct TimeoutWatchdog {
    inner: Arc<Mutex<Inner>>,
}

enum TickAction {
    Nothing,
    Stop,
    Warn { idle: Duration, remaining: Duration },
    Heartbeat {
        elapsed: Duration,
        hard_remaining: Duration,
        since_last_activity: Duration,
    },
    Abort(TimeoutKind),
}

impl TimeoutWatchdog {
    /// Create a watchdog bound to the given subprocess (by pid) and start
    /// its supervision task. Signals arrive on the returned receiver.
    pub fn spawn(
        config: WatchdogConfig,
        pid: Option<u32>,
    ) -> (Self, mpsc::UnboundedReceiver<WatchdogSignal>) {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        let watchdog = Self {
            inner: Arc::new(Mutex::new(Inner {
                config,
                pid,
                started: now,
                last_activity: now,
                last_activity_wall: Utc::now(),
                last_progress: now,
                warned: false,
                aborted: None,
                stopped: false,
                stdout: BoundedChunks::default(),
                stderr: BoundedChunks::default(),
                events: VecDeque::new(),
                events_seen: 0,
                signal_tx,
            })),
        };
        tokio::spawn(watchdog.clone().supervise());
        (watchdog, signal_rx)
    }

    /// Reset the idle deadline and clear any pending warning. Called on
    /// every stdout/stderr chunk and every parsed event.
    pub fn record_activity(&self) {
        let mut inner = self.lock();
        if inner.stopped {
            return;
        }
        inner.last_activity = Instant::now();
        inner.last_activity_wall = Utc::now();
        inner.warned = false;
    }

    /// Capture a stdout chunk and record activity.
    pub fn record_stdout(&self, chunk: &str) {
        let mut inner = self.lock();
        if inner.stopped {
            return;
        }
        inner.stdout.push(chunk);
        inner.last_activity = Instant::now();
        inner.last_activity_wall = Utc::now();
        inner.warned = false;
    }

    /// Capture a stderr chunk and record activity.
    pub fn record_stderr(&self, chunk: &str) {
        let mut inner = self.lock();
        if inner.stopped {
            return;
        }
        inner.stderr.push(chunk);
        inner.last_activity = Instant::now();
        inner.last_activity_wall = Utc::now();
        inner.warned = false;
    }

    /// Capture a parsed event and record activity.
    pub fn record_event(&self, event: &AgentEvent) {
        let mut inner = self.lock();
        if inner.stopped {
            return;
        }
        inner.events.push_back(event.clone());
        while inner.events.len() > EVENT_BUFFER_CAP {
            inner.events.pop_front();
        }
        inner.events_seen += 1;
        inner.last_activity = Instant::now();
        inner.last_activity_wall = Utc::now();
        inner.warned = false;
    }

    /// Immutable snapshot of captured buffers; usable before and after
    /// an abort.
    pub fn partial_results(&self) -> PartialResults {
        let inner = self.lock();
        PartialResults {
            stdout: inner.stdout.snapshot(),
            stderr: inner.stderr.snapshot(),
            stdout_truncated: inner.stdout.evicted,
            stderr_truncated: inner.stderr.evicted,
            events: inner.events.iter().cloned().collect(),
            events_seen: inner.events_seen,
            last_activity: inner.last_activity_wall,
            captured_at: Utc::now(),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.lock().aborted.is_some()
    }

    /// Stop supervision after a normal exit. Idempotent; not an abort.
    pub fn stop(&self) {
        self.lock().stopped = true;
    }

    /// Abort the execution: stop timers, request graceful termination of
    /// the whole process group, schedule a forced kill after the grace
    /// period, and emit [`WatchdogSignal::Timeout`]. Does not wait for
    /// OS-level process death.
    ///
    /// Calling this on an already-aborted watchdog is a contract
    /// violation and returns [`EngineError::AlreadyAborted`].
    pub fn abort(&self, kind: TimeoutKind) -> EngineResult<TimeoutInfo> {
        let (info, grace, tx) = {
            let mut inner = self.lock();
            if inner.aborted.is_some() {
                return Err(EngineError::AlreadyAborted);
            }
            inner.aborted = Some(kind);
            inner.stopped = true;
            let now = Instant::now();
            let info = TimeoutInfo {
                kind,
                elapsed_ms: now.duration_since(inner.started).as_millis() as u64,
                idle_ms: now.duration_since(inner.last_activity).as_millis() as u64,
                pid: inner.pid,
                kill: if inner.pid.is_some() {
                    KillStatus::TermSent
                } else {
                    KillStatus::NoProcess
                },
            };
            (info, inner.config.kill_grace, inner.signal_tx.clone())
        };

        tracing::warn!(
            "Aborting execution ({}): elapsed={}ms idle={}ms pid={:?}",
            info.kind,
            info.elapsed_ms,
            info.idle_ms,
            info.pid
        );

        if let Some(pid) = info.pid {
            signal_process_group(pid, libc::SIGTERM);
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                if process_alive(pid) {
                    tracing::warn!("Process {} survived grace period, sending SIGKILL", pid);
                    signal_process_group(pid, libc::SIGKILL);
                }
            });
        }

        let _ = tx.send(WatchdogSignal::Timeout(info.clone()));
        Ok(info)
    }

    async fn supervise(self) {
        let interval = self.lock().config.check_interval;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // First tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match self.check() {
                TickAction::Nothing => {}
                TickAction::Stop => break,
                TickAction::Warn { idle, remaining } => {
                    tracing::warn!(
                        "Execution idle for {:?}, aborting in {:?} without activity",
                        idle,
                        remaining
                    );
                    let tx = self.lock().signal_tx.clone();
                    let _ = tx.send(WatchdogSignal::IdleWarning { idle, remaining });
                }
                TickAction::Heartbeat {
                    elapsed,
                    hard_remaining,
                    since_last_activity,
                } => {
                    tracing::info!(
                        "Execution still running: elapsed={:?} remaining={:?} last_activity={:?} ago",
                        elapsed,
                        hard_remaining,
                        since_last_activity
                    );
                    let tx = self.lock().signal_tx.clone();
                    let _ = tx.send(WatchdogSignal::Progress {
                        elapsed,
                        hard_remaining,
                        since_last_activity,
                    });
                }
                TickAction::Abort(kind) => {
                    // Lost the race with an external abort at worst.
                    let _ = self.abort(kind);
                    break;
                }
            }
        }
    }

    /// Evaluate deadlines under the lock; act outside it.
    fn check(&self) -> TickAction {
        let mut inner = self.lock();
        if inner.stopped || inner.aborted.is_some() {
            return TickAction::Stop;
        }

        let now = Instant::now();
        let elapsed = now.duration_since(inner.started);
        let idle = now.duration_since(inner.last_activity);

        if elapsed >= inner.config.hard_timeout {
            return TickAction::Abort(TimeoutKind::Deadline);
        }
        if idle >= inner.config.idle_timeout {
            return TickAction::Abort(TimeoutKind::Inactivity);
        }

        let remaining = inner.config.idle_timeout - idle;
        if remaining <= inner.config.warning_lead && !inner.warned {
            inner.warned = true;
            return TickAction::Warn { idle, remaining };
        }

        if now.duration_since(inner.last_progress) >= inner.config.progress_interval {
            inner.last_progress = now;
            return TickAction::Heartbeat {
                elapsed,
                hard_remaining: inner.config.hard_timeout - elapsed,
                since_last_activity: idle,
            };
        }

        TickAction::Nothing
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(unix)]
pub(crate) fn signal_process_group(pid: u32, signal: i32) {
    // Negative pid targets the whole process group.
    let ret = unsafe { libc::kill(-(pid as i32), signal) };
    if ret != 0 {
        // Group may be gone already; fall back to the process itself.
        unsafe { libc::kill(pid as i32, signal) };
    }
}

#[cfg(not(unix))]
pub(crate) fn signal_process_group(_pid: u32, _signal: i32) {}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{AgentEvent, RawEvent};

    fn fast_config() -> WatchdogConfig {
        WatchdogConfig::default()
    }

    fn sample_event() -> AgentEvent {
        AgentEvent::from_raw(RawEvent {
            kind: "turn.started".to_string(),
            timestamp: None,
            data: Some(serde_json::json!({"id": "t1"})),
            extra: serde_json::Map::new(),
        })
    }

    async fn drain(rx: &mut mpsc::UnboundedReceiver<WatchdogSignal>) -> Vec<WatchdogSignal> {
        let mut signals = Vec::new();
        while let Ok(sig) = rx.try_recv() {
            signals.push(sig);
        }
        signals
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_fires_after_warning() {
        let (wd, mut rx) = TimeoutWatchdog::spawn(fast_config(), None);

        tokio::time::sleep(Duration::from_secs(301)).await;

        let signals = drain(&mut rx).await;
        assert!(matches!(signals.first(), Some(WatchdogSignal::IdleWarning { .. })));
        match signals.last() {
            Some(WatchdogSignal::Timeout(info)) => {
                assert_eq!(info.kind, TimeoutKind::Inactivity);
                assert!(info.idle_ms >= 300_000);
                assert_eq!(info.kill, KillStatus::NoProcess);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(wd.is_aborted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_resets_idle_clock() {
        let (wd, mut rx) = TimeoutWatchdog::spawn(fast_config(), None);

        // Stay just under the warning threshold for a long stretch.
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_secs(250)).await;
            wd.record_activity();
        }
        tokio::time::sleep(Duration::from_secs(100)).await;

        let signals = drain(&mut rx).await;
        assert!(
            !signals.iter().any(|s| matches!(s, WatchdogSignal::Timeout(_))),
            "no abort may fire within idle_timeout of the last activity"
        );
        wd.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_deadline_fires_under_continuous_activity() {
        let (wd, mut rx) = TimeoutWatchdog::spawn(fast_config(), None);

        for _ in 0..13 {
            tokio::time::sleep(Duration::from_secs(100)).await;
            wd.record_activity();
        }

        let signals = drain(&mut rx).await;
        match signals.iter().find(|s| matches!(s, WatchdogSignal::Timeout(_))) {
            Some(WatchdogSignal::Timeout(info)) => {
                assert_eq!(info.kind, TimeoutKind::Deadline);
                assert!(info.elapsed_ms >= 1_200_000);
            }
            _ => panic!("hard deadline did not fire"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_warning_fires_once_per_idle_episode() {
        let (wd, mut rx) = TimeoutWatchdog::spawn(fast_config(), None);

        tokio::time::sleep(Duration::from_secs(275)).await;
        wd.record_activity();
        tokio::time::sleep(Duration::from_secs(275)).await;
        wd.stop();
        tokio::time::sleep(Duration::from_secs(2)).await;

        let warnings = drain(&mut rx)
            .await
            .into_iter()
            .filter(|s| matches!(s, WatchdogSignal::IdleWarning { .. }))
            .count();
        assert_eq!(warnings, 2, "one warning per idle episode");
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_heartbeat() {
        let (wd, mut rx) = TimeoutWatchdog::spawn(fast_config(), None);

        for _ in 0..10 {
            tokio::time::sleep(Duration::from_secs(10)).await;
            wd.record_activity();
        }
        wd.stop();

        let heartbeats = drain(&mut rx)
            .await
            .into_iter()
            .filter(|s| matches!(s, WatchdogSignal::Progress { .. }))
            .count();
        assert!(heartbeats >= 3, "expected ~1 heartbeat per 30s, got {}", heartbeats);
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_abort_is_a_contract_violation() {
        let (wd, _rx) = TimeoutWatchdog::spawn(fast_config(), None);
        let info = wd.abort(TimeoutKind::Manual).unwrap();
        assert_eq!(info.kind, TimeoutKind::Manual);

        match wd.abort(TimeoutKind::Manual) {
            Err(EngineError::AlreadyAborted) => {}
            other => panic!("expected AlreadyAborted, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_results_before_and_after_abort() {
        let (wd, _rx) = TimeoutWatchdog::spawn(fast_config(), None);
        wd.record_stdout("hello ");
        wd.record_stdout("world\n");
        wd.record_stderr("warning: deprecated\n");
        wd.record_event(&sample_event());

        let before = wd.partial_results();
        assert_eq!(before.stdout, "hello world\n");
        assert_eq!(before.stderr, "warning: deprecated\n");
        assert_eq!(before.events_seen, 1);
        assert!(!before.is_empty());

        wd.abort(TimeoutKind::Manual).unwrap();

        let after = wd.partial_results();
        assert_eq!(after.stdout, before.stdout);
        assert_eq!(after.events.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_buffer_evicts_oldest_chunks() {
        let (wd, _rx) = TimeoutWatchdog::spawn(fast_config(), None);
        let chunk_a = "a".repeat(40 * 1024);
        let chunk_b = "b".repeat(40 * 1024);
        wd.record_stdout(&chunk_a);
        wd.record_stdout(&chunk_b);

        let snapshot = wd.partial_results();
        assert!(snapshot.stdout_truncated);
        assert_eq!(snapshot.stdout, chunk_b, "oldest chunk is evicted first");
    }

    #[tokio::test(start_paused = true)]
    async fn test_newest_chunk_always_retained() {
        let (wd, _rx) = TimeoutWatchdog::spawn(fast_config(), None);
        let oversized = "x".repeat(100 * 1024);
        wd.record_stdout(&oversized);

        let snapshot = wd.partial_results();
        assert_eq!(snapshot.stdout.len(), 100 * 1024);
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_buffer_is_bounded() {
        let (wd, _rx) = TimeoutWatchdog::spawn(fast_config(), None);
        for _ in 0..60 {
            wd.record_event(&sample_event());
        }
        let snapshot = wd.partial_results();
        assert_eq!(snapshot.events.len(), 50);
        assert_eq!(snapshot.events_seen, 60);
    }
}
