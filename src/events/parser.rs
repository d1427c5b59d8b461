//! Tolerant line-oriented parser for the agent's JSON event stream.
//!
//! The agent shares its stdout between JSON events (one per line) and
//! whatever diagnostic text the tools it runs happen to print. A line
//! that fails to parse is therefore not an error: it is counted and
//! dropped. The parser never raises on malformed input.

use super::{AgentEvent, RawEvent};

/// Counters exposed by [`EventStreamParser::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ParserStats {
    /// Events successfully parsed so far.
    pub parsed_events: u64,
    /// Lines that failed to parse and were dropped.
    pub parse_errors: u64,
    /// Bytes currently held in the partial-line buffer.
    pub buffered_bytes: usize,
}

/// Incremental parser over raw stdout chunks.
///
/// Chunks may split lines at arbitrary byte boundaries; the trailing
/// incomplete segment is retained until the next `feed` (or `flush`).
#[derive(Debug, Default)]
pub struct EventStreamParser {
    buffer: String,
    parsed_events: u64,
    parse_errors: u64,
}

impl EventStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every complete event it finished.
    pub fn feed(&mut self, chunk: &str) -> Vec<AgentEvent> {
        self.buffer.push_str(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            if let Some(event) = self.parse_line(line.trim()) {
                events.push(event);
            }
        }
        events
    }

    /// Attempt to parse any trailing unterminated line. Called once at
    /// stream end; the buffer is cleared whether or not parsing succeeds.
    pub fn flush(&mut self) -> Option<AgentEvent> {
        let line = std::mem::take(&mut self.buffer);
        self.parse_line(line.trim())
    }

    pub fn stats(&self) -> ParserStats {
        ParserStats {
            parsed_events: self.parsed_events,
            parse_errors: self.parse_errors,
            buffered_bytes: self.buffer.len(),
        }
    }

    /// Clear all buffered state and counters.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.parsed_events = 0;
        self.parse_errors = 0;
    }

    fn parse_line(&mut self, line: &str) -> Option<AgentEvent> {
        if line.is_empty() {
            return None;
        }
        match serde_json::from_str::<RawEvent>(line) {
            Ok(raw) => {
                self.parsed_events += 1;
                Some(AgentEvent::from_raw(raw))
            }
            Err(e) => {
                // Interleaved diagnostic text on the same stream.
                self.parse_errors += 1;
                tracing::debug!("Dropped unparseable agent output line: {}", e);
                None
            }
        }
    }
}
