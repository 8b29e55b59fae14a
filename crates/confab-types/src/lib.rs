use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

/// One entry of the prompt history. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub images: Vec<String>,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            images: Vec::new(),
        }
    }

    pub fn with_images(role: MessageRole, content: impl Into<String>, images: Vec<String>) -> Self {
        Self {
            role,
            content: content.into(),
            images,
        }
    }
}

/// Persisted unit of conversation history. `from_id` is `None` for
/// system and assistant entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadMessage {
    pub id: Uuid,
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub images: Vec<String>,
    pub from_id: Option<i64>,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub created_at: DateTime<Utc>,
}

impl ThreadMessage {
    pub fn from_message(message: Message, from_id: Option<i64>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role: message.role,
            content: message.content,
            images: message.images,
            from_id,
            tool_calls: None,
            created_at: Utc::now(),
        }
    }

    pub fn as_message(&self) -> Message {
        Message {
            role: self.role,
            content: self.content.clone(),
            images: self.images.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    String,
    Number,
}

impl ParameterKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ParameterKind::String => "string",
            ParameterKind::Number => "number",
        }
    }
}

/// One named argument of a tool, as advertised in the system prompt and
/// compiled into the decoding grammar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolParameterSpec {
    pub name: String,
    pub kind: ParameterKind,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ToolParameterSpec>,
}

/// Scalar tool argument. Non-scalar JSON values are dropped during
/// parsing rather than carried through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Number(i64),
    Text(String),
}

impl ParameterValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ParameterValue::Text(value) => Some(value),
            ParameterValue::Number(_) => None,
        }
    }

    pub fn render(&self) -> String {
        match self {
            ParameterValue::Text(value) => value.clone(),
            ParameterValue::Number(value) => value.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub parameters: BTreeMap<String, ParameterValue>,
}

impl ToolCall {
    pub fn param(&self, name: &str) -> Option<&ParameterValue> {
        self.parameters.get(name)
    }

    /// Argument rendered as text, numbers included.
    pub fn param_text(&self, name: &str) -> Option<String> {
        self.parameters.get(name).map(ParameterValue::render)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Finalized output of one generation round.
///
/// `raw` is the canonical re-serialization of the parsed sections and is
/// what gets persisted; `unprocessed` is the verbatim accumulated stream,
/// used by internal sub-agent calls that skip section parsing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateResult {
    pub message: String,
    pub thoughts: String,
    pub tool: Option<ToolCall>,
    pub image: Option<String>,
    pub raw: String,
    pub tokens_used: u64,
    pub unprocessed: String,
}

/// Per-chat configuration owned by the persistence layer; read-only here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatPreferences {
    #[serde(default)]
    pub nsfw: bool,
    pub extreme_state: Option<String>,
    pub show_limit: Option<u32>,
    pub show_thoughts: Option<bool>,
    pub memory: Option<Vec<String>>,
}

/// Result of a full conversational turn, potentially spanning several
/// generation rounds. `new_history` carries every message the engine
/// appended during the turn so the caller can persist them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnOutcome {
    pub message: String,
    pub thoughts: String,
    pub image: Option<String>,
    pub raw: String,
    pub new_history: Vec<ThreadMessage>,
    pub tokens_used: u64,
    pub forced: bool,
}
