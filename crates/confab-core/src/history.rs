use chrono::{DateTime, Utc};

use confab_types::{ChatPreferences, Message, MessageRole, ToolDefinition};
use confab_wire::{MESSAGE_END, MESSAGE_START, METADATA_END, METADATA_START};

use crate::config::EngineConfig;
use crate::prompt::build_system_prompt;

/// Prepends exactly one system message to the conversation. An override
/// prompt replaces the composed one wholesale; internal sub-agent calls
/// use that path.
pub fn build_history(
    messages: &[Message],
    tools: &[ToolDefinition],
    preferences: &ChatPreferences,
    config: &EngineConfig,
    override_prompt: Option<&str>,
) -> Vec<Message> {
    let system = match override_prompt {
        Some(prompt) => prompt.to_string(),
        None => build_system_prompt(tools, preferences, config),
    };
    let mut history = Vec::with_capacity(messages.len() + 1);
    history.push(Message::new(MessageRole::System, system));
    history.extend_from_slice(messages);
    history
}

/// User message with the metadata header the model expects: sender name
/// and send date, then the message section.
pub fn build_user_message(
    text: &str,
    sender_name: &str,
    images: Vec<String>,
    sent_at: DateTime<Utc>,
) -> Message {
    let content = format!(
        "{METADATA_START}\nName: {sender_name}\nDate: {}\n{METADATA_END}\n{MESSAGE_START}\n{text}\n{MESSAGE_END}",
        sent_at.format("%Y-%m-%d %H:%M:%S"),
    );
    Message::with_images(MessageRole::User, content, images)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn history_starts_with_one_system_message() {
        let messages = vec![
            Message::new(MessageRole::User, "hi"),
            Message::new(MessageRole::Assistant, "hello"),
        ];
        let history = build_history(
            &messages,
            &[],
            &ChatPreferences::default(),
            &EngineConfig::default(),
            None,
        );
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].role, MessageRole::System);
        assert!(history[1..]
            .iter()
            .all(|m| m.role != MessageRole::System));
    }

    #[test]
    fn override_prompt_replaces_the_composed_one() {
        let history = build_history(
            &[],
            &[],
            &ChatPreferences::default(),
            &EngineConfig::default(),
            Some("You are a header generator."),
        );
        assert_eq!(history[0].content, "You are a header generator.");
    }

    #[test]
    fn user_message_carries_metadata_header() {
        let sent_at = Utc.with_ymd_and_hms(2025, 2, 13, 12, 53, 49).unwrap();
        let message = build_user_message("Hello, I'm John", "John Doe", Vec::new(), sent_at);
        assert_eq!(message.role, MessageRole::User);
        assert!(message.content.starts_with(METADATA_START));
        assert!(message.content.contains("Name: John Doe"));
        assert!(message.content.contains("Date: 2025-02-13 12:53:49"));
        assert!(message.content.contains("Hello, I'm John"));
    }
}
