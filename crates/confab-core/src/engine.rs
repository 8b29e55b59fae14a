use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::Level;
use uuid::Uuid;

use confab_observability::{emit_event, ObservabilityEvent, ProcessKind};
use confab_providers::LlamaServerClient;
use confab_tools::{standard_registry, PageFetcher, SubAgent, ToolRegistry, SEARCH_RESULTS_PREFIX};
use confab_types::{
    ChatPreferences, Message, MessageRole, ThreadMessage, ToolCall, ToolDefinition, TurnOutcome,
};
use confab_wire::{tool_envelope, TOOL_RESPONSE_START};

use crate::config::EngineConfig;
use crate::generator::{GenerateArgs, Generator, TurnObserver};
use crate::prompt::{TOOL_LIMIT_PROMPT, TOOL_UNAVAILABLE_GUIDE, TOOL_UNAVAILABLE_PROMPT};

/// Dispatcher states for one chat turn. A turn always ends in `Done` or
/// `ForcedDone`; `ForcedDone` marks a turn whose tool budget ran out.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnState {
    Generating,
    Dispatching(ToolCall),
    Done,
    ForcedDone,
}

pub struct TurnArgs<'a> {
    pub history: Vec<Message>,
    pub preferences: ChatPreferences,
    pub observer: Option<&'a dyn TurnObserver>,
    pub cancel: CancellationToken,
}

pub struct TurnEngine {
    generator: Arc<Generator>,
    registry: Arc<ToolRegistry>,
    config: EngineConfig,
}

/// Wires the stock engine: llama-server backend, a generator that doubles
/// as the tools' sub-agent, and the standard tool catalogue.
pub fn build_engine(config: EngineConfig, fetcher: Arc<dyn PageFetcher>) -> TurnEngine {
    let backend = Arc::new(LlamaServerClient::new(&config.api_url));
    let generator = Arc::new(Generator::new(backend, config.clone()));
    let agent: Arc<dyn SubAgent> = generator.clone();
    let registry = Arc::new(standard_registry(
        &config.search_url,
        config.article_chunk_len,
        fetcher,
        agent,
    ));
    TurnEngine::new(generator, registry, config)
}

impl TurnEngine {
    pub fn new(
        generator: Arc<Generator>,
        registry: Arc<ToolRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            generator,
            registry,
            config,
        }
    }

    /// Runs the bounded generate/dispatch loop for one incoming chat
    /// message. Each dispatch appends exactly one system envelope message
    /// to the working history and surfaces it in `new_history`; the final
    /// round's canonical sections fill the rest of the outcome.
    pub async fn answer_chat_message(&self, args: TurnArgs<'_>) -> anyhow::Result<TurnOutcome> {
        let turn_id = Uuid::new_v4().to_string();
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "turn.start",
                component: "engine",
                turn_id: Some(&turn_id),
                chat_id: None,
                round: None,
                tool: None,
                section: None,
                status: None,
                error_code: None,
                detail: None,
            },
        );

        let mut working = args.history;
        let mut new_history: Vec<ThreadMessage> = Vec::new();
        let mut tools: Vec<ToolDefinition> = self.registry.catalogue();
        let mut dispatches: u32 = 0;
        let mut forced = false;
        let mut round: u32 = 0;
        let mut tokens_used: u64 = 0;
        let mut outcome = TurnOutcome::default();
        let mut state = TurnState::Generating;
        let forced_done;

        loop {
            match state {
                TurnState::Generating => {
                    if args.cancel.is_cancelled() {
                        state = if forced {
                            TurnState::ForcedDone
                        } else {
                            TurnState::Done
                        };
                        continue;
                    }
                    round += 1;
                    let round_label = round.to_string();
                    let result = match self
                        .generator
                        .generate(GenerateArgs {
                            messages: &working,
                            tools: &tools,
                            preferences: &args.preferences,
                            observer: args.observer,
                            cancel: args.cancel.clone(),
                        })
                        .await
                    {
                        Ok(result) => result,
                        Err(err) => {
                            emit_event(
                                Level::ERROR,
                                ProcessKind::Engine,
                                ObservabilityEvent {
                                    event: "turn.error",
                                    component: "engine",
                                    turn_id: Some(&turn_id),
                                    chat_id: None,
                                    round: Some(&round_label),
                                    tool: None,
                                    section: None,
                                    status: Some("error"),
                                    error_code: None,
                                    detail: Some(&err.to_string()),
                                },
                            );
                            return Err(err);
                        }
                    };
                    tokens_used += result.tokens_used;
                    outcome.message = result.message;
                    outcome.thoughts = result.thoughts;
                    outcome.image = result.image;
                    outcome.raw = result.raw;

                    state = match result.tool {
                        Some(call) if !forced => TurnState::Dispatching(call),
                        Some(_) => TurnState::ForcedDone,
                        None if forced => TurnState::ForcedDone,
                        None => TurnState::Done,
                    };
                }
                TurnState::Dispatching(call) => {
                    let round_label = round.to_string();
                    if let Some(observer) = args.observer {
                        observer
                            .tool_action(&call.name, &primary_argument(&call))
                            .await;
                    }

                    let response = match self.registry.get(&call.name) {
                        Some(tool) => {
                            emit_event(
                                Level::INFO,
                                ProcessKind::Engine,
                                ObservabilityEvent {
                                    event: "tool.dispatch",
                                    component: "engine",
                                    turn_id: Some(&turn_id),
                                    chat_id: None,
                                    round: Some(&round_label),
                                    tool: Some(&call.name),
                                    section: None,
                                    status: None,
                                    error_code: None,
                                    detail: None,
                                },
                            );
                            tool.invoke(&call, &working, args.cancel.clone()).await
                        }
                        None => {
                            emit_event(
                                Level::WARN,
                                ProcessKind::Engine,
                                ObservabilityEvent {
                                    event: "tool.unknown",
                                    component: "engine",
                                    turn_id: Some(&turn_id),
                                    chat_id: None,
                                    round: Some(&round_label),
                                    tool: Some(&call.name),
                                    section: None,
                                    status: Some("unavailable"),
                                    error_code: None,
                                    detail: None,
                                },
                            );
                            tool_envelope("", TOOL_UNAVAILABLE_PROMPT, TOOL_UNAVAILABLE_GUIDE)
                        }
                    };

                    pop_stale_search_results(&mut working, &mut new_history);

                    let envelope = Message::new(MessageRole::System, response);
                    working.push(envelope.clone());
                    let mut entry = ThreadMessage::from_message(envelope, None);
                    entry.tool_calls = Some(vec![call.clone()]);
                    new_history.push(entry);

                    dispatches += 1;
                    if dispatches >= self.config.tool_use_limit {
                        let directive = Message::new(MessageRole::System, TOOL_LIMIT_PROMPT);
                        working.push(directive.clone());
                        new_history.push(ThreadMessage::from_message(directive, None));
                        tools = Vec::new();
                        forced = true;
                    } else {
                        tools = self.registry.tools_after(&call.name);
                    }
                    state = TurnState::Generating;
                }
                TurnState::Done => {
                    forced_done = false;
                    break;
                }
                TurnState::ForcedDone => {
                    forced_done = true;
                    break;
                }
            }
        }

        outcome.new_history = new_history;
        outcome.tokens_used = tokens_used;
        outcome.forced = forced_done;

        if let Some(observer) = args.observer {
            observer.finish().await;
        }
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "turn.finish",
                component: "engine",
                turn_id: Some(&turn_id),
                chat_id: None,
                round: Some(&round.to_string()),
                tool: None,
                section: None,
                status: Some(if outcome.forced { "forced" } else { "ok" }),
                error_code: None,
                detail: None,
            },
        );
        Ok(outcome)
    }
}

/// The argument shown to chat members while a tool runs.
fn primary_argument(call: &ToolCall) -> String {
    call.param_text("query")
        .or_else(|| call.param_text("url"))
        .or_else(|| call.parameters.values().next().map(|v| v.render()))
        .unwrap_or_default()
}

/// Only the latest URL-result list matters; older ones just burn context,
/// so the previous list is dropped before a new envelope goes in. Only
/// system-role tool envelopes qualify; user text quoting the marker
/// stays untouched.
fn is_search_results_envelope(message: &Message) -> bool {
    message.role == MessageRole::System
        && message.content.starts_with(TOOL_RESPONSE_START)
        && message.content.contains(SEARCH_RESULTS_PREFIX)
}

fn pop_stale_search_results(working: &mut Vec<Message>, new_history: &mut Vec<ThreadMessage>) {
    if let Some(pos) = working.iter().rposition(|m| is_search_results_envelope(m)) {
        let stale = working.remove(pos);
        if let Some(entry) = new_history
            .iter()
            .rposition(|m| m.content == stale.content)
        {
            new_history.remove(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use confab_types::ParameterValue;

    fn call(name: &str, key: &str, value: &str) -> ToolCall {
        let mut parameters = std::collections::BTreeMap::new();
        parameters.insert(key.to_string(), ParameterValue::Text(value.to_string()));
        ToolCall {
            name: name.to_string(),
            parameters,
        }
    }

    #[test]
    fn primary_argument_prefers_query_then_url() {
        assert_eq!(
            primary_argument(&call("search_web", "query", "weather Oslo")),
            "weather Oslo"
        );
        assert_eq!(
            primary_argument(&call("read_article", "url", "https://a.example")),
            "https://a.example"
        );
        assert_eq!(primary_argument(&call("other", "topic", "cats")), "cats");
    }

    fn listing_envelope() -> String {
        tool_envelope(
            &format!("{SEARCH_RESULTS_PREFIX} pick one: "),
            "- url=`http://a`,title=`a`",
            "Read the best one.",
        )
    }

    #[test]
    fn stale_search_results_are_dropped_once() {
        let listing = listing_envelope();
        let mut working = vec![
            Message::new(MessageRole::User, "hi"),
            Message::new(MessageRole::System, listing.clone()),
            Message::new(MessageRole::System, "summary text"),
        ];
        let mut new_history = vec![
            ThreadMessage::from_message(Message::new(MessageRole::System, listing), None),
            ThreadMessage::from_message(Message::new(MessageRole::System, "summary text"), None),
        ];
        pop_stale_search_results(&mut working, &mut new_history);
        assert_eq!(working.len(), 2);
        assert_eq!(new_history.len(), 1);
        assert!(working.iter().all(|m| !m.content.contains(SEARCH_RESULTS_PREFIX)));

        pop_stale_search_results(&mut working, &mut new_history);
        assert_eq!(working.len(), 2);
    }

    #[test]
    fn user_text_quoting_the_results_marker_is_never_evicted() {
        let quote = format!("what does {SEARCH_RESULTS_PREFIX} mean?");
        let mut working = vec![
            Message::new(MessageRole::User, quote.clone()),
            Message::new(MessageRole::System, listing_envelope()),
        ];
        let mut new_history = Vec::new();
        pop_stale_search_results(&mut working, &mut new_history);
        assert_eq!(working.len(), 1);
        assert_eq!(working[0].content, quote);

        // user text alone never qualifies, even if it contains the marker
        let mut only_user = vec![Message::new(MessageRole::User, quote.clone())];
        pop_stale_search_results(&mut only_user, &mut new_history);
        assert_eq!(only_user.len(), 1);
    }
}
