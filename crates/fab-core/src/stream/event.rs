//! Offset-stamped events served to attached clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::ChatEntry;
use crate::supervisor::ProcessState;

/// Discriminant of an [`EventPayload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventType {
    Output,
    State,
    ChatEntry,
    Error,
}

/// What an agent produced.
///
/// Serialized adjacently tagged: `{"type": "...", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EventPayload {
    /// Raw stdout line.
    Output { line: String },
    State {
        previous: ProcessState,
        state: ProcessState,
    },
    ChatEntry(ChatEntry),
    Error { message: String },
}

impl EventPayload {
    pub fn event_type(&self) -> StreamEventType {
        match self {
            EventPayload::Output { .. } => StreamEventType::Output,
            EventPayload::State { .. } => StreamEventType::State,
            EventPayload::ChatEntry(_) => StreamEventType::ChatEntry,
            EventPayload::Error { .. } => StreamEventType::Error,
        }
    }
}

/// One buffered event. Offsets are dense and start at 1 per agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub agent_id: String,
    pub offset: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl StreamEvent {
    pub fn event_type(&self) -> StreamEventType {
        self.payload.event_type()
    }
}
