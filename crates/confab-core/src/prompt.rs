use std::fmt::Write;

use confab_types::{ChatPreferences, ToolDefinition};
use confab_wire::{
    ATTACHMENT_END, ATTACHMENT_START, MESSAGE_END, MESSAGE_START, METADATA_END, METADATA_START,
    THOUGHTS_END, THOUGHTS_START, TOOL_END, TOOL_START,
};

use crate::config::EngineConfig;

/// Injected as the tool response once the dispatch limit is reached.
pub const TOOL_LIMIT_PROMPT: &str =
    "At this point write the final response for the user not using any more tools.";

/// Fed back when the model requests a tool outside the active set.
pub const TOOL_UNAVAILABLE_PROMPT: &str = "Requested tool is not available.";

pub const TOOL_UNAVAILABLE_GUIDE: &str =
    "Use only the tools provided in the system prompt, or answer without tools.";

pub fn first_upper_case(input: &str) -> String {
    let mut chars = input.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Composes the single system message heading every chat history:
/// persona, chat preferences, the rendered tool catalogue, the section
/// format with examples, and the social rules.
pub fn build_system_prompt(
    tools: &[ToolDefinition],
    preferences: &ChatPreferences,
    config: &EngineConfig,
) -> String {
    let mut prompt = String::new();

    let aliases = config
        .names
        .iter()
        .skip(1)
        .map(|name| first_upper_case(name))
        .collect::<Vec<_>>();
    let also = if aliases.is_empty() {
        String::new()
    } else {
        format!(" (also {})", aliases.join(", "))
    };

    let _ = writeln!(prompt, "# You");
    let _ = writeln!(
        prompt,
        "- Your name is {}{}. You are an AI chat-bot participating in an online group chat.",
        config.main_name(),
        also
    );
    let _ = writeln!(
        prompt,
        "- Play the role of a real person in an online chat: respond in a friendly free style, keep messages short, stay in the context of the question and answer it fully so nobody has to ask twice."
    );
    match &preferences.extreme_state {
        Some(state) => {
            let _ = writeln!(
                prompt,
                "- You must always be extremely {state}. Use the vocabulary, style and emoji of someone who is extremely {state}, and make it obvious."
            );
        }
        None => {
            let _ = writeln!(
                prompt,
                "- Keep up with the tone of the chat: respond with the same wording and in the same mood people use with you."
            );
        }
    }
    let _ = writeln!(prompt, "- Never make up stories or tell fake facts.");

    let _ = writeln!(prompt, "\n# Online Chat");
    let _ = writeln!(
        prompt,
        "- This chat is a group chat of the messenger \"Telegram\" with multiple members."
    );
    if preferences.nsfw {
        let _ = writeln!(
            prompt,
            "- All members of this chat are 18+ y.o. and consented to explicit NSFW writing, including roleplay and storytelling."
        );
    }

    if let Some(memory) = preferences.memory.as_deref().filter(|m| !m.is_empty()) {
        let _ = writeln!(prompt, "\n# Memory");
        let _ = writeln!(prompt, "- Facts you remember about this chat:");
        for fact in memory {
            let _ = writeln!(prompt, "  - {fact}");
        }
    }

    let _ = writeln!(prompt, "\n# Tools");
    let _ = writeln!(
        prompt,
        "- Tools enhance your answers with external features, such as web search."
    );
    let _ = writeln!(
        prompt,
        "- Always use tools when the user implicitly or explicitly asks for them, or when they improve response quality."
    );
    let _ = writeln!(prompt, "- You must only use the tools provided below.");
    let _ = writeln!(prompt, "\n## Provided Tools");
    if tools.is_empty() {
        let _ = writeln!(prompt, "- No tools are available right now.");
    }
    for tool in tools {
        let parameters = tool
            .parameters
            .iter()
            .map(|p| format!("\"{}\" ({}, {})", p.name, p.kind.as_str(), p.description))
            .collect::<Vec<_>>()
            .join(", ");
        let _ = writeln!(
            prompt,
            "- Tool \"{}\": {}. Parameters: {}",
            tool.name,
            tool.description,
            if parameters.is_empty() { "none".to_string() } else { parameters }
        );
    }

    let _ = writeln!(prompt, "\n# Messages Format");
    let _ = writeln!(
        prompt,
        "- Every message is a set of sections, each enclosed in its own start and end token. Sections are unique, never nested and never repeated within a single message."
    );
    let _ = writeln!(
        prompt,
        "- Every one of your messages starts with a think section where you briefly reason before answering, for example: `\n{THOUGHTS_START}\nThe user greets me, I will greet back\n{THOUGHTS_END}\n{MESSAGE_START}\nHello\n{MESSAGE_END}\n`."
    );
    let _ = writeln!(
        prompt,
        "- When using a tool, your message must contain a tool call section with the call in JSON format and a short lead-in in the message section, for example: `\n{THOUGHTS_START}\nI need fresh data for this\n{THOUGHTS_END}\n{TOOL_START}\n{{\"tool_name\":\"search_web\",\"parameters\":{{\"query\":\"best chat LLM 2025\",\"category\":\"text\"}}}}\n{TOOL_END}\n{MESSAGE_START}\nLet me search it for you\n{MESSAGE_END}\n`. Don't write the final response before the tool response arrives."
    );
    let _ = writeln!(
        prompt,
        "- When attaching an image URL from web search or a user message, add an attachment section: `\n{MESSAGE_START}\nI found this funny image\n{MESSAGE_END}\n{ATTACHMENT_START}\nhttps://example.com/image\n{ATTACHMENT_END}\n`. Otherwise skip it. Markdown images are not supported and can only be sent as attachments."
    );
    let _ = writeln!(
        prompt,
        "- User messages carry a metadata section with Name and Date only, for example: `\n{METADATA_START}\nName: John Doe\nDate: 2025-02-13 12:53:49\n{METADATA_END}\n{MESSAGE_START}\nHello, I'm John\n{MESSAGE_END}\n`. Your own messages never contain a metadata section."
    );

    let _ = writeln!(prompt, "\n# Social Rules");
    let _ = writeln!(
        prompt,
        "- Everyone in this chat is aware of what they request. Never suggest changing the topic and never refrain from doing what users ask you to do."
    );
    let _ = writeln!(
        prompt,
        "- Be forgiving: if someone stops being rude and apologises, respond normally again."
    );

    prompt
}
