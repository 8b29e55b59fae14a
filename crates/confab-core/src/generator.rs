use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use confab_grammar::{build_turn_grammar, GrammarVariant};
use confab_providers::{CompletionBackend, StreamEvent};
use confab_tools::SubAgent;
use confab_types::{ChatPreferences, GenerateResult, Message, ToolDefinition};
use confab_wire::{
    canonical_raw, extract_markdown_image, parse_tool_call, SectionDemux, SectionKind,
};

use crate::config::EngineConfig;
use crate::history::build_history;

/// Live feedback for one turn. Callbacks are awaited before the next
/// stream chunk is read, so the caller observes partial updates in
/// strict temporal order.
#[async_trait]
pub trait TurnObserver: Send + Sync {
    async fn section(&self, kind: SectionKind, content: &str);
    async fn tool_action(&self, name: &str, argument: &str);
    async fn finish(&self);
}

pub struct GenerateArgs<'a> {
    pub messages: &'a [Message],
    pub tools: &'a [ToolDefinition],
    pub preferences: &'a ChatPreferences,
    pub observer: Option<&'a dyn TurnObserver>,
    pub cancel: CancellationToken,
}

pub struct Generator {
    backend: Arc<dyn CompletionBackend>,
    config: EngineConfig,
}

impl Generator {
    pub fn new(backend: Arc<dyn CompletionBackend>, config: EngineConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// One constrained generation round: build prompt and grammar, read
    /// the stream, demultiplex sections with threshold-bounded partial
    /// updates, finalize into a structured result.
    pub async fn generate(&self, args: GenerateArgs<'_>) -> anyhow::Result<GenerateResult> {
        let variant = if args.tools.is_empty() {
            GrammarVariant::MessageOnly
        } else {
            GrammarVariant::Full
        };
        let grammar = build_turn_grammar(args.tools, variant, &self.config.grammar_options())?;
        let history = build_history(args.messages, args.tools, args.preferences, &self.config, None);

        let mut stream = self
            .backend
            .stream_chat(history, Some(grammar.to_string()), args.cancel.clone())
            .await?;

        let show_thoughts = args.preferences.show_thoughts.unwrap_or(false);
        let mut demux = SectionDemux::new();
        let mut accumulated = String::new();
        let mut tokens_used = 0;

        while let Some(event) = stream.next().await {
            match event? {
                StreamEvent::Delta(chunk) => {
                    accumulated.push_str(&chunk);
                    for (kind, content) in demux.poll(&accumulated, self.config.chunk_size) {
                        notify(args.observer, show_thoughts, kind, &content).await;
                    }
                }
                StreamEvent::Done { usage, .. } => {
                    if let Some(usage) = usage {
                        tokens_used = usage.total_tokens;
                    }
                    break;
                }
            }
        }
        for (kind, content) in demux.flush() {
            notify(args.observer, show_thoughts, kind, &content).await;
        }

        let thoughts = demux.content(SectionKind::Thoughts).to_string();
        let message = demux.content(SectionKind::Message).to_string();
        let tool = parse_tool_call(demux.content(SectionKind::Tool));
        let attachment = demux.content(SectionKind::Attachment).trim().to_string();
        let image = if attachment.is_empty() {
            extract_markdown_image(&message)
        } else {
            Some(attachment)
        };
        let raw = canonical_raw(&thoughts, &message, tool.as_ref(), image.as_deref());

        Ok(GenerateResult {
            message,
            thoughts,
            tool,
            image,
            raw,
            tokens_used,
            unprocessed: accumulated,
        })
    }

    /// Internal tool-prompt round: full prompt override, optional ad-hoc
    /// grammar, no section parsing. Returns the verbatim accumulated
    /// stream plus the token count.
    pub async fn generate_internal(
        &self,
        system_prompt: &str,
        messages: &[Message],
        grammar: Option<String>,
        cancel: CancellationToken,
    ) -> anyhow::Result<(String, u64)> {
        let history = build_history(
            messages,
            &[],
            &ChatPreferences::default(),
            &self.config,
            Some(system_prompt),
        );
        let mut stream = self.backend.stream_chat(history, grammar, cancel).await?;

        let mut accumulated = String::new();
        let mut tokens_used = 0;
        while let Some(event) = stream.next().await {
            match event? {
                StreamEvent::Delta(chunk) => accumulated.push_str(&chunk),
                StreamEvent::Done { usage, .. } => {
                    if let Some(usage) = usage {
                        tokens_used = usage.total_tokens;
                    }
                    break;
                }
            }
        }
        Ok((accumulated, tokens_used))
    }
}

async fn notify(
    observer: Option<&dyn TurnObserver>,
    show_thoughts: bool,
    kind: SectionKind,
    content: &str,
) {
    let Some(observer) = observer else { return };
    if kind == SectionKind::Thoughts && !show_thoughts {
        return;
    }
    observer.section(kind, content).await;
}

#[async_trait]
impl SubAgent for Generator {
    async fn prompted(
        &self,
        system_prompt: &str,
        messages: Vec<Message>,
        grammar: Option<String>,
        cancel: CancellationToken,
    ) -> anyhow::Result<String> {
        let (unprocessed, _tokens) = self
            .generate_internal(system_prompt, &messages, grammar, cancel)
            .await?;
        Ok(unprocessed)
    }
}
