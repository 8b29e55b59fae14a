use std::{pin::Pin, str};

use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use confab_types::{Message, TokenUsage};

#[derive(Debug, Clone)]
pub enum StreamEvent {
    Delta(String),
    Done {
        finish_reason: String,
        usage: Option<TokenUsage>,
    },
}

pub type CompletionStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamEvent>> + Send>>;

/// Streaming completion seam. The engine only ever talks to this trait,
/// so tests drive the full turn loop with scripted streams.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn stream_chat(
        &self,
        messages: Vec<Message>,
        grammar: Option<String>,
        cancel: CancellationToken,
    ) -> anyhow::Result<CompletionStream>;
}

/// Client for a local llama.cpp-style server: one POST with
/// `{stream: true, messages, grammar?}`, response as `data: <json>`
/// SSE frames carrying `choices[0].delta.content` and, on the final
/// frame, `finish_reason` plus `usage.total_tokens`.
pub struct LlamaServerClient {
    api_url: String,
    client: Client,
}

impl LlamaServerClient {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            client: Client::new(),
        }
    }
}

#[async_trait]
impl CompletionBackend for LlamaServerClient {
    async fn stream_chat(
        &self,
        messages: Vec<Message>,
        grammar: Option<String>,
        cancel: CancellationToken,
    ) -> anyhow::Result<CompletionStream> {
        let wire_messages = messages
            .iter()
            .map(|m| {
                if m.images.is_empty() {
                    json!({"role": m.role.as_str(), "content": m.content})
                } else {
                    json!({"role": m.role.as_str(), "content": m.content, "images": m.images})
                }
            })
            .collect::<Vec<_>>();

        let mut body = json!({
            "stream": true,
            "messages": wire_messages,
        });
        if let Some(grammar) = grammar {
            body["grammar"] = json!(grammar);
        }

        let resp = self.client.post(&self.api_url).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!(
                "completion request failed with status {}: {}",
                status,
                truncate_for_error(&text, 500)
            );
        }

        let mut bytes = resp.bytes_stream();
        let stream = try_stream! {
            let mut buffer = String::new();
            // network chunks may split multi-byte characters
            let mut pending: Vec<u8> = Vec::new();
            while let Some(chunk) = bytes.next().await {
                if cancel.is_cancelled() {
                    yield StreamEvent::Done {
                        finish_reason: "cancelled".to_string(),
                        usage: None,
                    };
                    break;
                }

                let chunk = chunk?;
                pending.extend_from_slice(&chunk);
                let valid_len = match str::from_utf8(&pending) {
                    Ok(text) => {
                        buffer.push_str(text);
                        pending.len()
                    }
                    Err(err) => {
                        let valid = err.valid_up_to();
                        buffer.push_str(str::from_utf8(&pending[..valid]).unwrap_or_default());
                        valid
                    }
                };
                pending.drain(..valid_len);

                while let Some(pos) = buffer.find("\n\n") {
                    let frame = buffer[..pos].to_string();
                    buffer = buffer[pos + 2..].to_string();
                    for event in parse_frame(&frame) {
                        yield event;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

fn parse_frame(frame: &str) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    for line in frame.lines() {
        let Some(payload) = line.strip_prefix("data: ") else {
            continue;
        };
        let payload = payload.trim();
        if payload == "[DONE]" {
            events.push(StreamEvent::Done {
                finish_reason: "stop".to_string(),
                usage: None,
            });
            continue;
        }

        let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) else {
            continue;
        };
        let Some(choice) = value.get("choices").and_then(|v| v.get(0)) else {
            continue;
        };

        if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
            if !reason.is_empty() {
                events.push(StreamEvent::Done {
                    finish_reason: reason.to_string(),
                    usage: extract_usage(&value),
                });
                continue;
            }
        }

        if let Some(text) = choice
            .get("delta")
            .and_then(|d| d.get("content"))
            .and_then(|v| v.as_str())
        {
            if !text.is_empty() {
                events.push(StreamEvent::Delta(text.to_string()));
            }
        }
    }
    events
}

fn extract_usage(value: &serde_json::Value) -> Option<TokenUsage> {
    let usage = value.get("usage")?;
    let prompt_tokens = usage
        .get("prompt_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let completion_tokens = usage
        .get("completion_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let total_tokens = usage
        .get("total_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(prompt_tokens.saturating_add(completion_tokens));
    Some(TokenUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens,
    })
}

fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        return input.to_string();
    }
    let mut end = max_len;
    while !input.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &input[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_frame_extracts_content_delta() {
        let frame = r#"data: {"choices":[{"delta":{"content":"hel"}}]}"#;
        let events = parse_frame(frame);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::Delta(text) if text == "hel"));
    }

    #[test]
    fn parse_frame_extracts_finish_and_usage() {
        let frame = r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}],"usage":{"total_tokens":321}}"#;
        let events = parse_frame(frame);
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::Done {
                finish_reason,
                usage,
            } => {
                assert_eq!(finish_reason, "stop");
                assert_eq!(usage.as_ref().map(|u| u.total_tokens), Some(321));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn parse_frame_skips_non_data_lines_and_bad_json() {
        let frame = ": keep-alive\nevent: ping\ndata: {not json}";
        assert!(parse_frame(frame).is_empty());
    }

    #[test]
    fn parse_frame_handles_done_marker() {
        let events = parse_frame("data: [DONE]");
        assert!(matches!(
            &events[0],
            StreamEvent::Done { finish_reason, .. } if finish_reason == "stop"
        ));
    }

    #[test]
    fn usage_total_falls_back_to_sum() {
        let value: serde_json::Value =
            serde_json::from_str(r#"{"usage":{"prompt_tokens":10,"completion_tokens":5}}"#)
                .expect("json");
        let usage = extract_usage(&value).expect("usage");
        assert_eq!(usage.total_tokens, 15);
    }
}
