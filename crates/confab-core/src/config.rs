use confab_grammar::GrammarOptions;

use crate::prompt::first_upper_case;

/// Immutable engine configuration. Built once at the edge (usually via
/// `from_env`) and passed into the generator and engine constructors;
/// nothing below this struct reads the process environment.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Streaming chat-completions endpoint of the local inference server.
    pub api_url: String,
    /// Search backend URL, already carrying its fixed query parameters.
    pub search_url: String,
    /// Minimum section growth before another partial update is emitted.
    pub chunk_size: usize,
    /// Hard cap on tool dispatches within one turn.
    pub tool_use_limit: u32,
    /// Repetition bound for free-text grammar productions.
    pub max_section_len: usize,
    /// Page text is split into chunks of this many characters before
    /// summarization.
    pub article_chunk_len: usize,
    /// Extra characters excluded from the grammar's free text.
    pub banned_chars: Vec<char>,
    /// Bot names; the first one is the primary persona name.
    pub names: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:8080/v1/chat/completions".to_string(),
            search_url: "http://127.0.0.1:8888/search?format=json".to_string(),
            chunk_size: 250,
            tool_use_limit: 5,
            max_section_len: 2000,
            article_chunk_len: 10_000,
            banned_chars: Vec::new(),
            names: vec!["laylo".to_string()],
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = std::env::var("CONFAB_API_URL") {
            if !value.trim().is_empty() {
                config.api_url = value.trim().to_string();
            }
        }
        if let Ok(value) = std::env::var("CONFAB_SEARCH_URL") {
            if !value.trim().is_empty() {
                config.search_url = value.trim().to_string();
            }
        }
        if let Ok(value) = std::env::var("CONFAB_CHUNK_SIZE") {
            if let Ok(parsed) = value.trim().parse::<usize>() {
                config.chunk_size = parsed.max(1);
            }
        }
        if let Ok(value) = std::env::var("CONFAB_TOOL_USE_LIMIT") {
            if let Ok(parsed) = value.trim().parse::<u32>() {
                config.tool_use_limit = parsed.max(1);
            }
        }
        if let Ok(value) = std::env::var("CONFAB_NAMES") {
            let names = value
                .split(',')
                .map(|name| name.trim().to_lowercase())
                .filter(|name| !name.is_empty())
                .collect::<Vec<_>>();
            if !names.is_empty() {
                config.names = names;
            }
        }
        config
    }

    pub fn main_name(&self) -> String {
        first_upper_case(self.names.first().map(String::as_str).unwrap_or("laylo"))
    }

    pub fn grammar_options(&self) -> GrammarOptions {
        GrammarOptions {
            max_section_len: self.max_section_len,
            banned_chars: self.banned_chars.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = EngineConfig::default();
        assert_eq!(config.chunk_size, 250);
        assert_eq!(config.tool_use_limit, 5);
        assert_eq!(config.article_chunk_len, 10_000);
        assert_eq!(config.main_name(), "Laylo");
    }

    #[test]
    fn grammar_options_carry_section_settings() {
        let config = EngineConfig {
            max_section_len: 321,
            banned_chars: vec!['`'],
            ..Default::default()
        };
        let options = config.grammar_options();
        assert_eq!(options.max_section_len, 321);
        assert_eq!(options.banned_chars, vec!['`']);
    }
}
