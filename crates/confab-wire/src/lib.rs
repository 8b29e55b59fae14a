use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{json, Value};

use confab_types::{ParameterValue, ToolCall};

/// Reserved two-codepoint wrapper bracketing every tag name. It sits
/// outside the model's ordinary vocabulary, so a delimiter can never be
/// produced inside free text, and the grammar's free-text productions
/// exclude it explicitly.
pub const TAG_WRAPPER: &str = "σ̌";

pub const METADATA_START: &str = "σ̌metadata_startσ̌";
pub const METADATA_END: &str = "σ̌metadata_endσ̌";
pub const THOUGHTS_START: &str = "σ̌think_startσ̌";
pub const THOUGHTS_END: &str = "σ̌think_endσ̌";
pub const MESSAGE_START: &str = "σ̌message_startσ̌";
pub const MESSAGE_END: &str = "σ̌message_endσ̌";
pub const TOOL_START: &str = "σ̌tool_call_startσ̌";
pub const TOOL_END: &str = "σ̌tool_call_endσ̌";
pub const ATTACHMENT_START: &str = "σ̌attachment_startσ̌";
pub const ATTACHMENT_END: &str = "σ̌attachment_endσ̌";
pub const TOOL_RESPONSE_START: &str = "σ̌tool_response_startσ̌";
pub const TOOL_RESPONSE_END: &str = "σ̌tool_response_endσ̌";
pub const TOOL_GUIDE_START: &str = "σ̌tool_guide_startσ̌";
pub const TOOL_GUIDE_END: &str = "σ̌tool_guide_endσ̌";

/// The four sections that may appear in a streamed assistant turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    Thoughts,
    Message,
    Tool,
    Attachment,
}

impl SectionKind {
    pub const ALL: [SectionKind; 4] = [
        SectionKind::Thoughts,
        SectionKind::Message,
        SectionKind::Tool,
        SectionKind::Attachment,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SectionKind::Thoughts => "thoughts",
            SectionKind::Message => "message",
            SectionKind::Tool => "tool",
            SectionKind::Attachment => "attachment",
        }
    }

    pub fn delimiters(self) -> (&'static str, &'static str) {
        match self {
            SectionKind::Thoughts => (THOUGHTS_START, THOUGHTS_END),
            SectionKind::Message => (MESSAGE_START, MESSAGE_END),
            SectionKind::Tool => (TOOL_START, TOOL_END),
            SectionKind::Attachment => (ATTACHMENT_START, ATTACHMENT_END),
        }
    }
}

/// Incremental view over one section of the accumulated stream.
///
/// The open delimiter offset is remembered once found, so each update
/// only rescans the section tail instead of the whole stream. Content
/// grows as soon as the open delimiter is present; the section is
/// complete once the close delimiter appears.
#[derive(Debug)]
pub struct SectionTracker {
    kind: SectionKind,
    open_at: Option<usize>,
    closed: bool,
    content: String,
    emitted_len: usize,
    chunks: usize,
}

impl SectionTracker {
    pub fn new(kind: SectionKind) -> Self {
        Self {
            kind,
            open_at: None,
            closed: false,
            content: String::new(),
            emitted_len: 0,
            chunks: 1,
        }
    }

    pub fn kind(&self) -> SectionKind {
        self.kind
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn is_complete(&self) -> bool {
        self.closed
    }

    fn update(&mut self, accumulated: &str) {
        let (open, close) = self.kind.delimiters();
        if self.open_at.is_none() {
            if let Some(idx) = accumulated.find(open) {
                self.open_at = Some(idx + open.len());
            }
        }
        let Some(start) = self.open_at else {
            return;
        };
        if self.closed {
            return;
        }
        let tail = &accumulated[start..];
        match tail.find(close) {
            Some(end) => {
                self.content = tail[..end].trim().to_string();
                self.closed = true;
            }
            None => {
                self.content = tail.trim().to_string();
            }
        }
    }

    /// Re-locates the section in the accumulated stream and returns its
    /// content when a partial update is due: the content grew since the
    /// last emission and crossed the next multiple of `chunk_size`.
    pub fn poll(&mut self, accumulated: &str, chunk_size: usize) -> Option<String> {
        self.update(accumulated);
        if self.content.len() > self.emitted_len && self.content.len() > chunk_size * self.chunks {
            self.chunks += 1;
            self.emitted_len = self.content.len();
            return Some(self.content.clone());
        }
        None
    }

    /// Final emission for content that changed after the last threshold
    /// crossing. Returns `None` when the last emitted value is current.
    pub fn flush(&mut self) -> Option<String> {
        if self.content.len() > self.emitted_len {
            self.emitted_len = self.content.len();
            return Some(self.content.clone());
        }
        None
    }
}

/// Demultiplexes the raw token stream into the known sections. The tool
/// section is tracked but never partially emitted: a half-formed tool
/// call is useless to the caller.
#[derive(Debug)]
pub struct SectionDemux {
    trackers: Vec<SectionTracker>,
}

impl Default for SectionDemux {
    fn default() -> Self {
        Self::new()
    }
}

impl SectionDemux {
    pub fn new() -> Self {
        Self {
            trackers: SectionKind::ALL.iter().map(|&k| SectionTracker::new(k)).collect(),
        }
    }

    pub fn poll(&mut self, accumulated: &str, chunk_size: usize) -> Vec<(SectionKind, String)> {
        let mut updates = Vec::new();
        for tracker in &mut self.trackers {
            let kind = tracker.kind();
            match tracker.poll(accumulated, chunk_size) {
                Some(content) if kind != SectionKind::Tool => updates.push((kind, content)),
                _ => {}
            }
        }
        updates
    }

    pub fn flush(&mut self) -> Vec<(SectionKind, String)> {
        let mut updates = Vec::new();
        for tracker in &mut self.trackers {
            let kind = tracker.kind();
            match tracker.flush() {
                Some(content) if kind != SectionKind::Tool => updates.push((kind, content)),
                _ => {}
            }
        }
        updates
    }

    pub fn content(&self, kind: SectionKind) -> &str {
        self.trackers
            .iter()
            .find(|t| t.kind() == kind)
            .map(|t| t.content())
            .unwrap_or("")
    }
}

/// Extracts one delimited section from `text`, trimmed. Empty when the
/// open delimiter is absent; runs to end of input when the close
/// delimiter is absent.
pub fn extract_section(text: &str, open: &str, close: &str) -> String {
    let Some(idx) = text.find(open) else {
        return String::new();
    };
    let tail = &text[idx + open.len()..];
    match tail.find(close) {
        Some(end) => tail[..end].trim().to_string(),
        None => tail.trim().to_string(),
    }
}

/// Wire form of a parsed tool call, as it appears inside the tool
/// section: `{"tool_name":"...","parameters":{...}}`.
pub fn tool_call_json(call: &ToolCall) -> String {
    json!({
        "tool_name": call.name,
        "parameters": call.parameters,
    })
    .to_string()
}

/// Parses the completed tool section. Parse failures and missing fields
/// are logged and mapped to `None`; the round is then treated as
/// tool-absent rather than failed.
pub fn parse_tool_call(text: &str) -> Option<ToolCall> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    let value: Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(error = %err, raw = trimmed, "failed to parse tool call");
            return None;
        }
    };
    let Some(name) = value.get("tool_name").and_then(|v| v.as_str()) else {
        tracing::warn!(raw = trimmed, "tool call without tool_name");
        return None;
    };
    let Some(raw_parameters) = value.get("parameters").and_then(|v| v.as_object()) else {
        tracing::warn!(raw = trimmed, "tool call without parameters object");
        return None;
    };

    let mut parameters = BTreeMap::new();
    for (key, raw) in raw_parameters {
        match raw {
            Value::String(text) => {
                parameters.insert(key.clone(), ParameterValue::Text(text.clone()));
            }
            Value::Number(number) => {
                if let Some(number) = number.as_i64() {
                    parameters.insert(key.clone(), ParameterValue::Number(number));
                }
            }
            _ => {}
        }
    }

    Some(ToolCall {
        name: name.to_string(),
        parameters,
    })
}

/// Deterministic re-serialization of a finalized round. This is the
/// persisted form of the assistant message, delimiter-consistent even
/// when the model emitted extra whitespace. Section order follows the
/// grammar: thoughts, tool, message, attachment.
pub fn canonical_raw(
    thoughts: &str,
    message: &str,
    tool: Option<&ToolCall>,
    image: Option<&str>,
) -> String {
    let mut raw = format!("{THOUGHTS_START}\n{thoughts}\n{THOUGHTS_END}");
    if let Some(call) = tool {
        raw.push_str(&format!("\n{TOOL_START}\n{}\n{TOOL_END}", tool_call_json(call)));
    }
    raw.push_str(&format!("\n{MESSAGE_START}\n{message}\n{MESSAGE_END}"));
    if let Some(url) = image {
        raw.push_str(&format!("\n{ATTACHMENT_START}\n{url}\n{ATTACHMENT_END}"));
    }
    raw
}

/// Tool result envelope pushed back into history: a response block
/// wrapping the tool output, then a guidance block telling the model
/// what to do next. Distinct delimiters keep it from being mistaken for
/// user or assistant content on replay.
pub fn tool_envelope(prefix: &str, body: &str, guide: &str) -> String {
    format!(
        "{TOOL_RESPONSE_START}\n{prefix}```\n{body}\n```\n{TOOL_RESPONSE_END}\n{TOOL_GUIDE_START}\n{guide}\n{TOOL_GUIDE_END}"
    )
}

/// Pulls the first markdown image URL out of message text, for the
/// attachment fallback when the model inlines an image instead of using
/// the attachment section.
pub fn extract_markdown_image(text: &str) -> Option<String> {
    let start = text.find("![")?;
    let tail = &text[start..];
    let open = tail.find("](")?;
    let rest = &tail[open + 2..];
    let close = rest.find(')')?;
    let url = rest[..close].trim();
    if url.starts_with("http") {
        Some(url.to_string())
    } else {
        None
    }
}
