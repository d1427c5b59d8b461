//! Structured events emitted by the delegated agent.
//!
//! The agent's `--json` mode writes one JSON object per line:
//! `{ "type": "...", "timestamp": "...", "data": { ... } }`. A small fixed
//! set of `type` values is recognized; anything else is preserved as an
//! [`AgentEvent::Unknown`] with its raw payload intact, so newer agent
//! versions never break the stream.

pub mod parser;

pub use parser::{EventStreamParser, ParserStats};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One line of agent output exactly as it appeared on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Subtype of a work item, carried in `data.type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ItemKind {
    FileChange,
    CommandExecution,
    AgentMessage,
    Other(String),
}

impl From<String> for ItemKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "file_change" => Self::FileChange,
            "command_execution" => Self::CommandExecution,
            "agent_message" => Self::AgentMessage,
            _ => Self::Other(s),
        }
    }
}

impl From<ItemKind> for String {
    fn from(kind: ItemKind) -> Self {
        match kind {
            ItemKind::FileChange => "file_change".to_string(),
            ItemKind::CommandExecution => "command_execution".to_string(),
            ItemKind::AgentMessage => "agent_message".to_string(),
            ItemKind::Other(s) => s,
        }
    }
}

/// A turn reference extracted from `turn.*` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// An item reference extracted from `item.*` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRef {
    pub id: String,
    pub kind: ItemKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Opaque subtype payload (`data`), preserved verbatim.
    pub detail: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// A recognized agent event, or an unknown one with its raw payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    ThreadStarted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
    },
    TurnStarted { turn: TurnRef },
    TurnCompleted { turn: TurnRef },
    TurnFailed { turn: TurnRef, message: String },
    ItemStarted { item: ItemRef },
    ItemUpdated { item: ItemRef },
    ItemCompleted { item: ItemRef },
    Unknown { raw: RawEvent },
}

impl AgentEvent {
    /// Classify a wire event into the typed union.
    pub fn from_raw(raw: RawEvent) -> Self {
        match raw.kind.as_str() {
            "thread.started" => Self::ThreadStarted {
                thread_id: str_field(&raw, &["thread_id", "id"]),
            },
            "turn.started" => Self::TurnStarted { turn: turn_ref(&raw) },
            "turn.completed" => Self::TurnCompleted { turn: turn_ref(&raw) },
            "turn.failed" => {
                let message = failure_message(&raw)
                    .unwrap_or_else(|| "turn failed".to_string());
                Self::TurnFailed { turn: turn_ref(&raw), message }
            }
            "item.started" => Self::ItemStarted { item: item_ref(&raw) },
            "item.updated" => Self::ItemUpdated { item: item_ref(&raw) },
            "item.completed" => Self::ItemCompleted { item: item_ref(&raw) },
            _ => Self::Unknown { raw },
        }
    }

    /// The event's kind string as it appeared on the wire.
    pub fn kind(&self) -> &str {
        match self {
            Self::ThreadStarted { .. } => "thread.started",
            Self::TurnStarted { .. } => "turn.started",
            Self::TurnCompleted { .. } => "turn.completed",
            Self::TurnFailed { .. } => "turn.failed",
            Self::ItemStarted { .. } => "item.started",
            Self::ItemUpdated { .. } => "item.updated",
            Self::ItemCompleted { .. } => "item.completed",
            Self::Unknown { raw } => &raw.kind,
        }
    }
}

fn str_field(raw: &RawEvent, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(v) = raw
            .data
            .as_ref()
            .and_then(|d| d.get(*key))
            .and_then(|v| v.as_str())
        {
            return Some(v.to_string());
        }
        if let Some(v) = raw.extra.get(*key).and_then(|v| v.as_str()) {
            return Some(v.to_string());
        }
    }
    None
}

fn turn_ref(raw: &RawEvent) -> TurnRef {
    TurnRef {
        id: str_field(raw, &["id", "turn_id"]).unwrap_or_default(),
        timestamp: raw.timestamp.clone(),
    }
}

fn item_ref(raw: &RawEvent) -> ItemRef {
    let data = raw.data.clone().unwrap_or(Value::Null);
    let kind = data
        .get("type")
        .and_then(|v| v.as_str())
        .map(|s| ItemKind::from(s.to_string()))
        .unwrap_or_else(|| ItemKind::Other(String::new()));
    ItemRef {
        id: str_field(raw, &["id", "item_id"]).unwrap_or_default(),
        description: describe_item(&kind, &data),
        kind,
        detail: data,
        timestamp: raw.timestamp.clone(),
    }
}

/// Best-effort one-line description of an item for progress reporting.
fn describe_item(kind: &ItemKind, data: &Value) -> Option<String> {
    if let Some(desc) = data.get("description").and_then(|v| v.as_str()) {
        return Some(desc.to_string());
    }
    match kind {
        ItemKind::CommandExecution => data
            .get("command")
            .and_then(|v| v.as_str())
            .map(|c| format!("Running: {}", c)),
        ItemKind::FileChange => data
            .get("path")
            .and_then(|v| v.as_str())
            .map(|p| format!("Editing: {}", p)),
        ItemKind::AgentMessage => Some("Writing response".to_string()),
        ItemKind::Other(name) if !name.is_empty() => Some(name.clone()),
        ItemKind::Other(_) => None,
    }
}

fn failure_message(raw: &RawEvent) -> Option<String> {
    let data = raw.data.as_ref()?;
    if let Some(msg) = data
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(|v| v.as_str())
    {
        return Some(msg.to_string());
    }
    data.get("message")
        .or_else(|| data.get("error").filter(|e| e.is_string()))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}
