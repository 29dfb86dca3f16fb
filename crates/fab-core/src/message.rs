//! Canonical message model shared by every backend.
//!
//! Each adapter turns its CLI's stdout vocabulary into [`StreamMessage`]
//! values. The supervisor then derives human-facing [`ChatEntry`] records
//! from them with [`chat_entries`], independent of the raw protocol.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Top-level kind of a canonical message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    System,
    Assistant,
    User,
    Result,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageType::System => "system",
            MessageType::Assistant => "assistant",
            MessageType::User => "user",
            MessageType::Result => "result",
        };
        f.write_str(s)
    }
}

/// One unit of agent output in the backend-agnostic shape.
///
/// System messages carry a `subtype` ("init", "warning", ...) instead of
/// nested content. Result messages carry `result` and `is_error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<NestedMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    /// Resumable conversation identifier, when the backend reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl StreamMessage {
    /// A system message with the given subtype and no content.
    pub fn system(subtype: impl Into<String>) -> Self {
        Self {
            kind: MessageType::System,
            subtype: Some(subtype.into()),
            message: None,
            result: None,
            is_error: false,
            session_id: None,
        }
    }

    /// An assistant message holding the given blocks.
    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self::with_nested(MessageType::Assistant, "assistant", content)
    }

    /// A user message holding the given blocks (tool results, echoed input).
    pub fn user(content: Vec<ContentBlock>) -> Self {
        Self::with_nested(MessageType::User, "user", content)
    }

    /// A result message.
    pub fn result(text: impl Into<String>, is_error: bool) -> Self {
        Self {
            kind: MessageType::Result,
            subtype: None,
            message: None,
            result: Some(text.into()),
            is_error,
            session_id: None,
        }
    }

    fn with_nested(kind: MessageType, role: &str, content: Vec<ContentBlock>) -> Self {
        Self {
            kind,
            subtype: None,
            message: Some(NestedMessage {
                role: role.to_string(),
                content,
                usage: None,
            }),
            result: None,
            is_error: false,
            session_id: None,
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Token usage carried by the nested message, if any.
    pub fn usage(&self) -> Option<&Usage> {
        self.message.as_ref().and_then(|m| m.usage.as_ref())
    }
}

/// Role, ordered content and optional usage of an assistant/user turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NestedMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default, deserialize_with = "deserialize_content")]
    pub content: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// Nested content is either an array of blocks or, in the user-turn input
/// shape, a bare string. A bare string becomes a single text block.
fn deserialize_content<'de, D>(deserializer: D) -> Result<Vec<ContentBlock>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Content {
        Text(String),
        Blocks(Vec<ContentBlock>),
        Null(()),
    }

    Ok(match Content::deserialize(deserializer)? {
        Content::Text(text) => vec![ContentBlock::Text { text }],
        Content::Blocks(blocks) => blocks,
        Content::Null(()) => Vec::new(),
    })
}

/// A single block inside a nested message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        #[serde(default)]
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        #[serde(default)]
        tool_use_id: String,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        content: FlexContent,
    },
    /// Block kinds we do not model (thinking, images, ...).
    #[serde(other)]
    Unknown,
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }
}

/// Tool-result content, normalized to one string at parse time.
///
/// The wire value may be a plain string or an array of typed parts. Decoding
/// takes the first that fits: string, array of text parts joined by `\n`,
/// then the raw JSON text as a fallback. Decoding never fails.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlexContent(pub String);

impl FlexContent {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Normalize an arbitrary JSON value.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::String(s) => Self(s.clone()),
            Value::Null => Self::default(),
            Value::Array(parts) => match text_parts(parts) {
                Some(joined) => Self(joined),
                None => Self(value.to_string()),
            },
            other => Self(other.to_string()),
        }
    }
}

fn text_parts(parts: &[Value]) -> Option<String> {
    let texts = parts
        .iter()
        .map(|part| part.get("text").and_then(Value::as_str))
        .collect::<Option<Vec<_>>>()?;
    Some(texts.join("\n"))
}

impl From<&str> for FlexContent {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for FlexContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for FlexContent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for FlexContent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(Self::from_value(&value))
    }
}

/// Token accounting for one turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default, alias = "cached_input_tokens")]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

/// One human-facing history record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEntry {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

impl ChatEntry {
    pub fn new(role: impl Into<String>, content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            timestamp,
            tool_name: None,
        }
    }
}

/// Derive chat entries from a message: one per text block, one per tool use
/// and one per tool result. Messages without nested content yield nothing.
pub fn chat_entries(message: &StreamMessage, timestamp: DateTime<Utc>) -> Vec<ChatEntry> {
    let Some(nested) = &message.message else {
        return Vec::new();
    };
    let role = if nested.role.is_empty() {
        message.kind.to_string()
    } else {
        nested.role.clone()
    };

    nested
        .content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(ChatEntry::new(role.clone(), text.clone(), timestamp)),
            ContentBlock::ToolUse { name, input, .. } => Some(ChatEntry {
                role: role.clone(),
                content: tool_use_summary(name, input),
                timestamp,
                tool_name: Some(name.clone()),
            }),
            ContentBlock::ToolResult { content, .. } => {
                Some(ChatEntry::new(role.clone(), content.as_str(), timestamp))
            }
            ContentBlock::Unknown => None,
        })
        .collect()
}

fn tool_use_summary(name: &str, input: &Value) -> String {
    match input {
        Value::Null => name.to_string(),
        Value::Object(map) if map.is_empty() => name.to_string(),
        other => format!("{name}: {other}"),
    }
}
