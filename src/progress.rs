//! Progress inference over the agent event stream.
//!
//! A pure reducer: feed it parsed events in stdout order and ask for a
//! snapshot at any point. File and command counters are incremented when
//! the corresponding item *starts*: progress reflects intent-to-act, so
//! the percentage never stalls waiting for completion events that a
//! misbehaving agent might never emit.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::{AgentEvent, ItemKind, ItemRef, TurnRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Started,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Turn,
    Item,
}

/// One tracked unit of work (a turn or an item).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressStep {
    pub kind: StepKind,
    pub description: String,
    pub status: StepStatus,
    pub last_seen: DateTime<Utc>,
    pub detail: Value,
}

/// Point-in-time summary produced by [`ProgressTracker::progress`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub percentage: u8,
    pub current_action: Option<String>,
    pub files_changed: u32,
    pub commands_executed: u32,
    pub total_steps: usize,
    pub completed_steps: usize,
    pub in_progress_steps: usize,
    pub is_complete: bool,
    pub has_failed: bool,
}

/// Accumulates progress state from an ordered event sequence.
///
/// Deterministic: identical input yields identical output. Duplicate or
/// out-of-order ids are tolerated: the first `*.started` establishes an
/// entry, later detail merges are last-write-wins, and entries are never
/// deleted during a task's lifetime.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    turns: HashMap<String, ProgressStep>,
    items: HashMap<String, ProgressStep>,
    /// (kind, id) in start order, for current-action lookup.
    started_order: Vec<(StepKind, String)>,
    current_turn: Option<String>,
    files_changed: u32,
    commands_executed: u32,
    is_complete: bool,
    has_failed: bool,
    turn_failure: Option<String>,
    last_agent_message: Option<String>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process_event(&mut self, event: &AgentEvent) {
        match event {
            AgentEvent::TurnStarted { turn } => self.turn_started(turn),
            AgentEvent::TurnCompleted { turn } => self.turn_finished(turn, StepStatus::Completed),
            AgentEvent::TurnFailed { turn, message } => {
                self.turn_finished(turn, StepStatus::Failed);
                self.has_failed = true;
                self.turn_failure = Some(message.clone());
            }
            AgentEvent::ItemStarted { item } => self.item_started(item),
            AgentEvent::ItemUpdated { item } => self.item_updated(item),
            AgentEvent::ItemCompleted { item } => self.item_completed(item),
            AgentEvent::ThreadStarted { .. } | AgentEvent::Unknown { .. } => {}
        }
    }

    pub fn progress(&self) -> ProgressSnapshot {
        let total = self.turns.len() + self.items.len();
        let completed = self.count(StepStatus::Completed);
        let in_progress = self.count(StepStatus::Started);

        let percentage = if self.is_complete {
            100
        } else {
            let raw = 100.0 * (completed as f64 + 0.5 * in_progress as f64)
                / total.max(1) as f64;
            raw.round().min(100.0) as u8
        };

        ProgressSnapshot {
            percentage,
            current_action: self.current_action(),
            files_changed: self.files_changed,
            commands_executed: self.commands_executed,
            total_steps: total,
            completed_steps: completed,
            in_progress_steps: in_progress,
            is_complete: self.is_complete,
            has_failed: self.has_failed,
        }
    }

    /// Message from the most recent `turn.failed`, if any.
    pub fn turn_failure(&self) -> Option<&str> {
        self.turn_failure.as_deref()
    }

    pub fn has_failed(&self) -> bool {
        self.has_failed
    }

    /// True when the most recently tracked turn ended in failure.
    pub fn last_turn_failed(&self) -> bool {
        self.current_turn
            .as_ref()
            .and_then(|id| self.turns.get(id))
            .map(|t| t.status == StepStatus::Failed)
            .unwrap_or(false)
    }

    /// Text of the agent's final answer, when it emitted one.
    pub fn last_agent_message(&self) -> Option<&str> {
        self.last_agent_message.as_deref()
    }

    fn turn_started(&mut self, turn: &TurnRef) {
        let step = ProgressStep {
            kind: StepKind::Turn,
            description: format!("Turn {}", turn.id),
            status: StepStatus::Started,
            last_seen: Utc::now(),
            detail: Value::Null,
        };
        if self.turns.insert(turn.id.clone(), step).is_none() {
            self.started_order.push((StepKind::Turn, turn.id.clone()));
        }
        self.current_turn = Some(turn.id.clone());
    }

    fn turn_finished(&mut self, turn: &TurnRef, status: StepStatus) {
        let entry = self.turns.entry(turn.id.clone()).or_insert_with(|| {
            ProgressStep {
                kind: StepKind::Turn,
                description: format!("Turn {}", turn.id),
                status,
                last_seen: Utc::now(),
                detail: Value::Null,
            }
        });
        entry.status = status;
        entry.last_seen = Utc::now();
        self.current_turn = Some(turn.id.clone());
        // Either outcome ends the agent's loop as far as we can tell.
        self.is_complete = true;
    }

    fn item_started(&mut self, item: &ItemRef) {
        if self.items.contains_key(&item.id) {
            // Duplicate start: refresh detail, do not re-count.
            self.item_updated(item);
            return;
        }
        match item.kind {
            ItemKind::FileChange => self.files_changed += 1,
            ItemKind::CommandExecution => self.commands_executed += 1,
            _ => {}
        }
        self.items.insert(
            item.id.clone(),
            ProgressStep {
                kind: StepKind::Item,
                description: item.description.clone().unwrap_or_default(),
                status: StepStatus::Started,
                last_seen: Utc::now(),
                detail: item.detail.clone(),
            },
        );
        self.started_order.push((StepKind::Item, item.id.clone()));
    }

    fn item_updated(&mut self, item: &ItemRef) {
        self.note_agent_message(item);
        let Some(entry) = self.items.get_mut(&item.id) else {
            return;
        };
        merge_detail(&mut entry.detail, &item.detail);
        if let Some(desc) = &item.description {
            entry.description = desc.clone();
        }
        entry.last_seen = Utc::now();
    }

    fn item_completed(&mut self, item: &ItemRef) {
        self.note_agent_message(item);
        let entry = self.items.entry(item.id.clone()).or_insert_with(|| {
            ProgressStep {
                kind: StepKind::Item,
                description: item.description.clone().unwrap_or_default(),
                status: StepStatus::Completed,
                last_seen: Utc::now(),
                detail: Value::Null,
            }
        });
        entry.status = StepStatus::Completed;
        merge_detail(&mut entry.detail, &item.detail);
        entry.last_seen = Utc::now();
    }

    fn note_agent_message(&mut self, item: &ItemRef) {
        if item.kind != ItemKind::AgentMessage {
            return;
        }
        if let Some(text) = item.detail.get("text").and_then(|v| v.as_str()) {
            self.last_agent_message = Some(text.to_string());
        }
    }

    fn count(&self, status: StepStatus) -> usize {
        self.turns
            .values()
            .chain(self.items.values())
            .filter(|s| s.status == status)
            .count()
    }

    /// Description of the most recently started still-open step.
    fn current_action(&self) -> Option<String> {
        for (kind, id) in self.started_order.iter().rev() {
            let step = match kind {
                StepKind::Turn => self.turns.get(id),
                StepKind::Item => self.items.get(id),
            };
            if let Some(step) = step {
                if step.status == StepStatus::Started && !step.description.is_empty() {
                    return Some(step.description.clone());
                }
            }
        }
        None
    }
}

/// Shallow object merge, last write wins; non-objects replace outright.
fn merge_detail(existing: &mut Value, incoming: &Value) {
    if incoming.is_null() {
        return;
    }
    match (existing.as_object_mut(), incoming.as_object()) {
        (Some(target), Some(source)) => {
            for (key, value) in source {
                target.insert(key.clone(), value.clone());
            }
        }
        _ => *existing = incoming.clone(),
    }
}
