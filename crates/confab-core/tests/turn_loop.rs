use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use confab_core::{
    EngineConfig, Generator, TurnArgs, TurnEngine, TurnObserver, TOOL_LIMIT_PROMPT,
    TOOL_UNAVAILABLE_PROMPT,
};
use confab_providers::{CompletionBackend, CompletionStream, StreamEvent};
use confab_tools::{Tool, ToolRegistry, SEARCH_RESULTS_PREFIX};
use confab_types::{
    Message, MessageRole, ParameterKind, TokenUsage, ToolCall, ToolDefinition, ToolParameterSpec,
};
use confab_wire::{
    tool_envelope, SectionKind, MESSAGE_END, MESSAGE_START, THOUGHTS_END, THOUGHTS_START,
    TOOL_END, TOOL_START,
};

/// Serves one pre-scripted stream per call and records what each call
/// received: the grammar text and the prompt length.
struct ScriptedBackend {
    scripts: Mutex<VecDeque<Vec<StreamEvent>>>,
    calls: Mutex<Vec<(Option<String>, usize)>>,
}

impl ScriptedBackend {
    fn new(rounds: Vec<(String, u64)>) -> Self {
        let scripts = rounds
            .into_iter()
            .map(|(text, tokens)| {
                let chars: Vec<char> = text.chars().collect();
                let mut events: Vec<StreamEvent> = chars
                    .chunks(32)
                    .map(|chunk| StreamEvent::Delta(chunk.iter().collect()))
                    .collect();
                events.push(StreamEvent::Done {
                    finish_reason: "stop".to_string(),
                    usage: Some(TokenUsage {
                        prompt_tokens: 0,
                        completion_tokens: 0,
                        total_tokens: tokens,
                    }),
                });
                events
            })
            .collect();
        Self {
            scripts: Mutex::new(scripts),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn recorded(&self) -> Vec<(Option<String>, usize)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    async fn stream_chat(
        &self,
        messages: Vec<Message>,
        grammar: Option<String>,
        _cancel: CancellationToken,
    ) -> anyhow::Result<CompletionStream> {
        self.calls.lock().unwrap().push((grammar, messages.len()));
        let events = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();
        Ok(Box::pin(futures::stream::iter(events.into_iter().map(Ok))))
    }
}

struct StubTool {
    name: &'static str,
    response: String,
}

#[async_trait]
impl Tool for StubTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.to_string(),
            description: "stub".to_string(),
            parameters: vec![ToolParameterSpec {
                name: "query".to_string(),
                kind: ParameterKind::String,
                description: "stub".to_string(),
            }],
        }
    }

    async fn invoke(
        &self,
        _call: &ToolCall,
        _history: &[Message],
        _cancel: CancellationToken,
    ) -> String {
        self.response.clone()
    }
}

#[derive(Default)]
struct RecordingObserver {
    actions: Mutex<Vec<(String, String)>>,
    finished: Mutex<bool>,
}

#[async_trait]
impl TurnObserver for RecordingObserver {
    async fn section(&self, _kind: SectionKind, _content: &str) {}
    async fn tool_action(&self, name: &str, argument: &str) {
        self.actions
            .lock()
            .unwrap()
            .push((name.to_string(), argument.to_string()));
    }
    async fn finish(&self) {
        *self.finished.lock().unwrap() = true;
    }
}

fn tool_round(name: &str, arguments: &str, lead_in: &str) -> String {
    format!(
        "{THOUGHTS_START}\nneed a tool\n{THOUGHTS_END}\n{TOOL_START}\n{{\"tool_name\":\"{name}\",\"parameters\":{arguments}}}\n{TOOL_END}\n{MESSAGE_START}\n{lead_in}\n{MESSAGE_END}\n"
    )
}

fn message_round(message: &str) -> String {
    format!("{THOUGHTS_START}\ndone\n{THOUGHTS_END}\n{MESSAGE_START}\n{message}\n{MESSAGE_END}\n")
}

fn stock_registry() -> Arc<ToolRegistry> {
    let listing = tool_envelope(
        &format!("{SEARCH_RESULTS_PREFIX} pick one: "),
        "- url=`https://vg.example/oslo`,title=`Oslo weather`",
        "Use read_article on the best URL.",
    );
    let summary = tool_envelope(
        "Article summary: ",
        "Oslo is 4C and raining today.",
        "Answer the user using this summary.",
    );
    let mut registry = ToolRegistry::default();
    registry.register(
        Arc::new(StubTool {
            name: "search_web",
            response: listing,
        }),
        &["read_article"],
    );
    registry.register(
        Arc::new(StubTool {
            name: "read_article",
            response: summary,
        }),
        &["search_web"],
    );
    Arc::new(registry)
}

fn engine(backend: Arc<ScriptedBackend>, registry: Arc<ToolRegistry>, config: EngineConfig) -> TurnEngine {
    let generator = Arc::new(Generator::new(backend, config.clone()));
    TurnEngine::new(generator, registry, config)
}

fn user_turn(text: &str) -> Vec<Message> {
    vec![Message::new(MessageRole::User, text)]
}

#[tokio::test]
async fn three_round_search_then_read_then_answer() {
    let backend = Arc::new(ScriptedBackend::new(vec![
        (
            tool_round(
                "search_web",
                "{\"query\":\"weather Oslo\",\"category\":\"text\"}",
                "Let me check",
            ),
            10,
        ),
        (
            tool_round("read_article", "{\"url\":\"https://vg.example/oslo\"}", "Reading"),
            20,
        ),
        (message_round("It is 4C and raining in Oslo right now."), 30),
    ]));
    let observer = RecordingObserver::default();
    let turn_engine = engine(backend.clone(), stock_registry(), EngineConfig::default());

    let outcome = turn_engine
        .answer_chat_message(TurnArgs {
            history: user_turn("What's the weather in Oslo right now?"),
            preferences: Default::default(),
            observer: Some(&observer),
            cancel: CancellationToken::new(),
        })
        .await
        .expect("turn");

    assert_eq!(outcome.message, "It is 4C and raining in Oslo right now.");
    assert_eq!(outcome.tokens_used, 60);
    assert!(!outcome.forced);

    // Second round may only pick read_article, third only search_web.
    let calls = backend.recorded();
    assert_eq!(calls.len(), 3);
    let round2 = calls[1].0.as_deref().unwrap();
    assert!(round2.contains("tool-read-article"));
    assert!(!round2.contains("tool-search-web"));
    let round3 = calls[2].0.as_deref().unwrap();
    assert!(round3.contains("tool-search-web"));
    assert!(!round3.contains("tool-read-article"));

    // The stale URL listing is replaced by the article summary.
    assert_eq!(outcome.new_history.len(), 1);
    assert!(outcome.new_history[0].content.contains("4C and raining"));
    assert_eq!(
        outcome.new_history[0].tool_calls.as_ref().unwrap()[0].name,
        "read_article"
    );

    let actions = observer.actions.lock().unwrap().clone();
    assert_eq!(actions[0], ("search_web".to_string(), "weather Oslo".to_string()));
    assert_eq!(
        actions[1],
        ("read_article".to_string(), "https://vg.example/oslo".to_string())
    );
    assert!(*observer.finished.lock().unwrap());
}

#[tokio::test]
async fn dispatch_limit_forces_a_tool_free_final_round() {
    let search = tool_round(
        "search_web",
        "{\"query\":\"first\",\"category\":\"text\"}",
        "Searching",
    );
    let read = tool_round("read_article", "{\"url\":\"https://vg.example/a\"}", "Reading");
    let backend = Arc::new(ScriptedBackend::new(vec![
        (search, 5),
        (read, 5),
        (message_round("Here is what I found anyway."), 5),
    ]));
    let config = EngineConfig {
        tool_use_limit: 2,
        ..Default::default()
    };
    let turn_engine = engine(backend.clone(), stock_registry(), config);

    let outcome = turn_engine
        .answer_chat_message(TurnArgs {
            history: user_turn("dig deep"),
            preferences: Default::default(),
            observer: None,
            cancel: CancellationToken::new(),
        })
        .await
        .expect("turn");

    assert!(outcome.forced);
    assert_eq!(outcome.message, "Here is what I found anyway.");

    let calls = backend.recorded();
    assert_eq!(calls.len(), 3);
    // After the second dispatch the grammar offers no tool section at all.
    let final_grammar = calls[2].0.as_deref().unwrap();
    assert!(!final_grammar.contains("sec-tool"));

    let directive = outcome
        .new_history
        .last()
        .expect("limit directive recorded");
    assert_eq!(directive.content, TOOL_LIMIT_PROMPT);
    assert_eq!(directive.role, MessageRole::System);
}

#[tokio::test]
async fn unknown_tool_gets_an_unavailable_envelope_and_the_loop_continues() {
    let backend = Arc::new(ScriptedBackend::new(vec![
        (
            tool_round("time_machine", "{\"query\":\"1066\",\"category\":\"text\"}", "Hold on"),
            7,
        ),
        (message_round("I can't time travel, sorry."), 8),
    ]));
    let turn_engine = engine(backend.clone(), stock_registry(), EngineConfig::default());

    let outcome = turn_engine
        .answer_chat_message(TurnArgs {
            history: user_turn("go to 1066"),
            preferences: Default::default(),
            observer: None,
            cancel: CancellationToken::new(),
        })
        .await
        .expect("turn");

    assert_eq!(outcome.message, "I can't time travel, sorry.");
    assert_eq!(outcome.tokens_used, 15);
    assert_eq!(outcome.new_history.len(), 1);
    assert!(outcome.new_history[0].content.contains(TOOL_UNAVAILABLE_PROMPT));
    assert_eq!(backend.recorded().len(), 2);
}

#[tokio::test]
async fn malformed_tool_json_ends_the_turn_without_a_dispatch() {
    let text = format!(
        "{THOUGHTS_START}\nhm\n{THOUGHTS_END}\n{TOOL_START}\n{{\"tool_name\":\"search_web\",\n{TOOL_END}\n{MESSAGE_START}\nNever mind.\n{MESSAGE_END}\n"
    );
    let backend = Arc::new(ScriptedBackend::new(vec![(text, 9)]));
    let turn_engine = engine(backend.clone(), stock_registry(), EngineConfig::default());

    let outcome = turn_engine
        .answer_chat_message(TurnArgs {
            history: user_turn("search something"),
            preferences: Default::default(),
            observer: None,
            cancel: CancellationToken::new(),
        })
        .await
        .expect("turn");

    assert_eq!(outcome.message, "Never mind.");
    assert!(outcome.new_history.is_empty());
    assert!(!outcome.forced);
    assert_eq!(backend.recorded().len(), 1);
}

#[tokio::test]
async fn cancelled_turn_returns_without_calling_the_backend() {
    let backend = Arc::new(ScriptedBackend::new(vec![(
        message_round("never read"),
        1,
    )]));
    let turn_engine = engine(backend.clone(), stock_registry(), EngineConfig::default());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = turn_engine
        .answer_chat_message(TurnArgs {
            history: user_turn("hello"),
            preferences: Default::default(),
            observer: None,
            cancel,
        })
        .await
        .expect("turn");

    assert!(outcome.message.is_empty());
    assert_eq!(outcome.tokens_used, 0);
    assert!(backend.recorded().is_empty());
}
