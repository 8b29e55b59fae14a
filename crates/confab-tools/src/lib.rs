use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use confab_grammar::{index_selection_grammar, title_grammar};
use confab_types::{
    Message, MessageRole, ParameterKind, ToolCall, ToolDefinition, ToolParameterSpec,
};
use confab_wire::tool_envelope;

/// Marks a search-result list in history so a stale list can be dropped
/// before the next one is appended.
pub const SEARCH_RESULTS_PREFIX: &str = "[Your Web Browser: URL Results]";

const READ_SUCCESS_GUIDE: &str = "Now use this extra knowledge to answer the last user message in the chat, read another article from search results or search again with another query if something is still missing. Consider adding a source hyperlink to the message section.";
const READ_FAILURE_GUIDE: &str = "Tell the user that the article you tried to read is invalid or unavailable. Use read_article again with another URL from search results or ask the user how to proceed.";
const SEARCH_TEXT_GUIDE: &str = "Use read_article to read the most relevant URL. This list is supplied by your internal web browser, not the user, so don't ask which URL to use, pick one yourself by title relevancy.";
const SEARCH_IMAGE_GUIDE: &str = "You are not allowed to use read_article now. Pick the image_url with the most relevant title for the user request, write a response and attach that image in the attachment section.";

const SUMMARY_PROMPT: &str = "Given raw website contents, write a concise and structured summary without missing anything important. Ignore metadata irrelevant to the page topic. Ensure that the summary contains all exact numbers, objects, events, people, details and facts! If there is an error, provide a detailed explanation of the error along with the unmodified error message. If the content provided is empty, write 'Article is unavailable'.";

/// A tool never fails outward: network errors, bad arguments and empty
/// results all come back as formatted response text the model can react
/// to on the next round.
#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;
    async fn invoke(
        &self,
        call: &ToolCall,
        history: &[Message],
        cancel: CancellationToken,
    ) -> String;
}

/// Internal generation seam used by tool pipelines (chunk titling,
/// header selection, summarization). Returns the verbatim model output.
#[async_trait]
pub trait SubAgent: Send + Sync {
    async fn prompted(
        &self,
        system_prompt: &str,
        messages: Vec<Message>,
        grammar: Option<String>,
        cancel: CancellationToken,
    ) -> anyhow::Result<String>;
}

#[derive(Debug, Clone)]
pub struct Page {
    pub text: String,
    pub title: String,
}

/// External page-fetch collaborator, specified only at this boundary.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, url: &str) -> anyhow::Result<Page>;
}

/// Immutable tool set plus the adjacency policy restricting which tools
/// may be offered right after a given tool was used.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    adjacency: HashMap<String, Vec<String>>,
}

impl ToolRegistry {
    pub fn register(&mut self, tool: Arc<dyn Tool>, followers: &[&str]) {
        let name = tool.definition().name;
        self.adjacency
            .insert(name, followers.iter().map(|s| s.to_string()).collect());
        self.tools.push(tool);
    }

    pub fn catalogue(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition()).collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .iter()
            .find(|t| t.definition().name == name)
            .cloned()
    }

    /// Tool set for the round following a use of `name`. Unmapped names
    /// fall back to the full catalogue.
    pub fn tools_after(&self, name: &str) -> Vec<ToolDefinition> {
        match self.adjacency.get(name) {
            Some(followers) => self
                .tools
                .iter()
                .map(|t| t.definition())
                .filter(|d| followers.contains(&d.name))
                .collect(),
            None => self.catalogue(),
        }
    }
}

/// The stock catalogue: web search and article reading, each allowed to
/// follow the other.
pub fn standard_registry(
    search_url: &str,
    article_chunk_len: usize,
    fetcher: Arc<dyn PageFetcher>,
    agent: Arc<dyn SubAgent>,
) -> ToolRegistry {
    let mut registry = ToolRegistry::default();
    registry.register(Arc::new(WebSearchTool::new(search_url)), &["read_article"]);
    registry.register(
        Arc::new(ReadArticleTool::new(fetcher, agent, article_chunk_len)),
        &["search_web"],
    );
    registry
}

#[derive(Debug, Deserialize)]
struct SearchEntry {
    url: String,
    title: String,
    content: Option<String>,
    img_src: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchApiResponse {
    results: Vec<SearchEntry>,
}

pub struct WebSearchTool {
    search_url: String,
    client: Client,
}

impl WebSearchTool {
    pub fn new(search_url: impl Into<String>) -> Self {
        Self {
            search_url: search_url.into(),
            client: Client::new(),
        }
    }

    async fn search(&self, query: &str, image: bool) -> anyhow::Result<Vec<SearchEntry>> {
        let mut request = self.client.get(&self.search_url).query(&[("q", query)]);
        if image {
            request = request.query(&[("categories", "images")]);
        }
        let response: SearchApiResponse = request
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.results)
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "search_web".to_string(),
            description: "Search the Internet for unknown knowledge, news, info, public contact info, weather, realtime data, etc. Always use this when asked about recent events or updates. Don't ask the user for specific search terms. For image search set category to \"image\"".to_string(),
            parameters: vec![
                ToolParameterSpec {
                    name: "query".to_string(),
                    kind: ParameterKind::String,
                    description: "Search query".to_string(),
                },
                ToolParameterSpec {
                    name: "category".to_string(),
                    kind: ParameterKind::String,
                    description: "Can only be \"text\" or \"image\"".to_string(),
                },
            ],
        }
    }

    async fn invoke(
        &self,
        call: &ToolCall,
        _history: &[Message],
        _cancel: CancellationToken,
    ) -> String {
        let query = call.param_text("query").unwrap_or_else(|| "<empty>".to_string());
        let image = call
            .param_text("category")
            .map(|category| category == "image")
            .unwrap_or(false);

        let entries = match self.search(&query, image).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(error = %err, query = %query, "web search failed");
                return tool_envelope(
                    "Search Web failed: ",
                    &err.to_string(),
                    "Tell the user the search failed, or try again with another query.",
                );
            }
        };

        let kind = if image { "image" } else { "URL" };
        let prefix = format!(
            "{SEARCH_RESULTS_PREFIX} Based on the user request, select the most relevant {kind} from this list by its description: "
        );
        let guide = if image {
            SEARCH_IMAGE_GUIDE
        } else {
            SEARCH_TEXT_GUIDE
        };
        tool_envelope(&prefix, &format_results(&entries, image), guide)
    }
}

fn format_results(entries: &[SearchEntry], image: bool) -> String {
    entries
        .iter()
        .take(5)
        .map(|entry| {
            if image {
                format!(
                    "- source=`{}`,title=`{} ({})`,image_url=`{}`",
                    entry.url,
                    entry.title,
                    entry.content.as_deref().unwrap_or("no description"),
                    entry.img_src.as_deref().unwrap_or("unknown"),
                )
            } else {
                format!("- url=`{}`,title=`{}`", entry.url, entry.title)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub struct ReadArticleTool {
    fetcher: Arc<dyn PageFetcher>,
    agent: Arc<dyn SubAgent>,
    chunk_len: usize,
}

impl ReadArticleTool {
    pub fn new(fetcher: Arc<dyn PageFetcher>, agent: Arc<dyn SubAgent>, chunk_len: usize) -> Self {
        Self {
            fetcher,
            agent,
            chunk_len,
        }
    }

    /// Chunked summarization pipeline: title every chunk, have the model
    /// pick the 1-2 most relevant titles given the live conversation,
    /// then summarize just the selected chunks.
    async fn summarize(
        &self,
        page: &Page,
        history: &[Message],
        cancel: CancellationToken,
    ) -> anyhow::Result<Option<String>> {
        let chunks = split_chunks(&page.text, self.chunk_len);

        let mut headers: Vec<(String, String)> = Vec::new();
        for chunk in chunks {
            if cancel.is_cancelled() {
                anyhow::bail!("turn cancelled");
            }
            let raw = self
                .agent
                .prompted(
                    &title_system_prompt(&page.title),
                    vec![Message::new(
                        MessageRole::User,
                        format!("Chunk: ```{chunk}```"),
                    )],
                    Some(title_grammar().to_string()),
                    cancel.clone(),
                )
                .await?;
            let title = parse_title(&raw);
            if title != "_empty" {
                headers.push((title, chunk));
            }
        }
        if headers.is_empty() {
            return Ok(None);
        }

        let header_list = headers
            .iter()
            .enumerate()
            .map(|(idx, (title, _))| format!("{}. {}", idx + 1, title))
            .collect::<Vec<_>>()
            .join("\n");
        let mut selection_history = history.to_vec();
        selection_history.push(Message::new(
            MessageRole::System,
            format!(
                "Given the following titles, select 1 or 2 (select 2 only if 1 would not be enough) which are the most relevant to the user's question and respond with a comma-separated array of indices:\n```{header_list}```"
            ),
        ));
        let selection = self
            .agent
            .prompted(
                "",
                selection_history,
                Some(index_selection_grammar().to_string()),
                cancel.clone(),
            )
            .await?;

        let mut selected = parse_selection(&selection)
            .into_iter()
            .filter_map(|idx| headers.get(idx.checked_sub(1)?))
            .map(|(_, chunk)| chunk.clone())
            .collect::<Vec<_>>();
        if selected.is_empty() {
            selected = headers
                .iter()
                .take(2)
                .map(|(_, chunk)| chunk.clone())
                .collect();
        }
        let content = selected.join("\n\n");

        let summary = self
            .agent
            .prompted(
                SUMMARY_PROMPT,
                vec![Message::new(
                    MessageRole::User,
                    format!(
                        "Contents: ```{content}```. If this is empty or there is an error, write it in your summary."
                    ),
                )],
                None,
                cancel,
            )
            .await?;
        Ok(Some(summary))
    }
}

#[async_trait]
impl Tool for ReadArticleTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "read_article".to_string(),
            description: "Extract contents from an article by URL. Only use this when you were given a URL.".to_string(),
            parameters: vec![ToolParameterSpec {
                name: "url".to_string(),
                kind: ParameterKind::String,
                description: "URL of the page to get text contents from.".to_string(),
            }],
        }
    }

    async fn invoke(
        &self,
        call: &ToolCall,
        history: &[Message],
        cancel: CancellationToken,
    ) -> String {
        let Some(url) = call.param_text("url") else {
            return tool_envelope(
                "Article request is missing a URL. ",
                "<error>",
                READ_FAILURE_GUIDE,
            );
        };

        let page = match self.fetcher.fetch_page(&url).await {
            Ok(page) => page,
            Err(err) => {
                tracing::warn!(error = %err, url = %url, "page fetch failed");
                return unavailable_envelope(&url);
            }
        };

        match self.summarize(&page, history, cancel).await {
            Ok(Some(summary)) => tool_envelope(
                &format!("Contents of the article \"{url}\": "),
                &summary,
                READ_SUCCESS_GUIDE,
            ),
            Ok(None) => unavailable_envelope(&url),
            Err(err) => {
                tracing::warn!(error = %err, url = %url, "article summarization failed");
                unavailable_envelope(&url)
            }
        }
    }
}

fn unavailable_envelope(url: &str) -> String {
    tool_envelope(
        &format!("Article \"{url}\" is either invalid or unavailable. "),
        "<error>",
        READ_FAILURE_GUIDE,
    )
}

fn title_system_prompt(page_title: &str) -> String {
    format!(
        "You are a header generator. The user sends you a chunk of the \"{page_title}\" page and you must write a title for it.\n- Ignore any metadata, references and citations, and respond in JSON format with a single field \"title\" describing in a few words (max 5) what the actual text in the chunk is about.\n- If there is only metadata, references and citations, or the chunk is empty, respond with title \"_empty\".\n- Do not add any additional information or context to the title and don't add \"{page_title}\" to it."
    )
}

fn parse_title(raw: &str) -> String {
    serde_json::from_str::<serde_json::Value>(raw.trim())
        .ok()
        .and_then(|value| {
            value
                .get("title")
                .and_then(|t| t.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "_empty".to_string())
}

/// One-based indices out of the `[1,2]`-shaped selection answer.
fn parse_selection(raw: &str) -> Vec<usize> {
    raw.trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split(',')
        .filter_map(|part| part.trim().parse::<usize>().ok())
        .collect()
}

fn split_chunks(text: &str, chunk_len: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(chunk_len.max(1))
        .map(|chunk| chunk.iter().collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::Mutex;

    use confab_types::ParameterValue;
    use confab_wire::{extract_section, TOOL_GUIDE_END, TOOL_GUIDE_START};

    struct ScriptedAgent {
        answers: Mutex<VecDeque<String>>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedAgent {
        fn new(answers: &[&str]) -> Self {
            Self {
                answers: Mutex::new(answers.iter().map(|s| s.to_string()).collect()),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SubAgent for ScriptedAgent {
        async fn prompted(
            &self,
            system_prompt: &str,
            _messages: Vec<Message>,
            _grammar: Option<String>,
            _cancel: CancellationToken,
        ) -> anyhow::Result<String> {
            self.prompts.lock().unwrap().push(system_prompt.to_string());
            self.answers
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("script exhausted"))
        }
    }

    struct FixedPage(Page);

    #[async_trait]
    impl PageFetcher for FixedPage {
        async fn fetch_page(&self, _url: &str) -> anyhow::Result<Page> {
            Ok(self.0.clone())
        }
    }

    struct FailingFetcher;

    #[async_trait]
    impl PageFetcher for FailingFetcher {
        async fn fetch_page(&self, url: &str) -> anyhow::Result<Page> {
            anyhow::bail!("navigation to {url} failed")
        }
    }

    fn call(name: &str, params: &[(&str, &str)]) -> ToolCall {
        let mut parameters = BTreeMap::new();
        for (key, value) in params {
            parameters.insert(key.to_string(), ParameterValue::Text(value.to_string()));
        }
        ToolCall {
            name: name.to_string(),
            parameters,
        }
    }

    #[test]
    fn split_chunks_is_char_safe() {
        let text = "ab".repeat(3) + "é";
        let chunks = split_chunks(&text, 4);
        assert_eq!(chunks, vec!["abab".to_string(), "abé".to_string()]);
        assert!(split_chunks("", 10).is_empty());
    }

    #[test]
    fn parse_selection_reads_index_arrays() {
        assert_eq!(parse_selection("[1]"), vec![1]);
        assert_eq!(parse_selection("[2,5]"), vec![2, 5]);
        assert_eq!(parse_selection("garbage"), Vec::<usize>::new());
    }

    #[test]
    fn parse_title_falls_back_to_empty_marker() {
        assert_eq!(parse_title(r#"{"title":"Weather data"}"#), "Weather data");
        assert_eq!(parse_title("not json"), "_empty");
    }

    #[test]
    fn format_results_text_and_image_variants() {
        let entries = vec![SearchEntry {
            url: "http://a".to_string(),
            title: "Oslo weather".to_string(),
            content: Some("forecast".to_string()),
            img_src: Some("http://a/img.png".to_string()),
        }];
        assert_eq!(
            format_results(&entries, false),
            "- url=`http://a`,title=`Oslo weather`"
        );
        assert_eq!(
            format_results(&entries, true),
            "- source=`http://a`,title=`Oslo weather (forecast)`,image_url=`http://a/img.png`"
        );
    }

    #[test]
    fn registry_adjacency_restricts_next_round() {
        let agent = Arc::new(ScriptedAgent::new(&[]));
        let fetcher = Arc::new(FailingFetcher);
        let registry = standard_registry("http://search", 10_000, fetcher, agent);

        let after_search = registry.tools_after("search_web");
        assert_eq!(after_search.len(), 1);
        assert_eq!(after_search[0].name, "read_article");

        let after_read = registry.tools_after("read_article");
        assert_eq!(after_read.len(), 1);
        assert_eq!(after_read[0].name, "search_web");

        // unmapped names fall back to the full catalogue
        assert_eq!(registry.tools_after("make_coffee").len(), 2);
        assert!(registry.get("make_coffee").is_none());
    }

    #[tokio::test]
    async fn read_article_reports_unreachable_urls() {
        let tool = ReadArticleTool::new(
            Arc::new(FailingFetcher),
            Arc::new(ScriptedAgent::new(&[])),
            10_000,
        );
        let response = tool
            .invoke(
                &call("read_article", &[("url", "http://nowhere")]),
                &[],
                CancellationToken::new(),
            )
            .await;
        assert!(response.contains("invalid or unavailable"));
        assert_eq!(
            extract_section(&response, TOOL_GUIDE_START, TOOL_GUIDE_END),
            READ_FAILURE_GUIDE
        );
    }

    #[tokio::test]
    async fn read_article_summarizes_selected_chunks() {
        let page = Page {
            text: "Current temperature in Oslo is 12C with light rain.".to_string(),
            title: "Oslo weather".to_string(),
        };
        let agent = Arc::new(ScriptedAgent::new(&[
            r#"{"title":"Temperature report"}"#,
            "[1]",
            "Oslo is currently 12C with light rain.",
        ]));
        let tool = ReadArticleTool::new(Arc::new(FixedPage(page)), agent.clone(), 10_000);

        let response = tool
            .invoke(
                &call("read_article", &[("url", "http://weather.example/oslo")]),
                &[Message::new(MessageRole::User, "weather in Oslo?")],
                CancellationToken::new(),
            )
            .await;

        assert!(response.contains("Contents of the article \"http://weather.example/oslo\""));
        assert!(response.contains("Oslo is currently 12C"));
        assert_eq!(
            extract_section(&response, TOOL_GUIDE_START, TOOL_GUIDE_END),
            READ_SUCCESS_GUIDE
        );
        // chunk titling, selection, summary: three internal calls
        assert_eq!(agent.prompts.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn read_article_with_only_empty_chunks_is_unavailable() {
        let page = Page {
            text: "[1] ref [2] ref".to_string(),
            title: "refs".to_string(),
        };
        let agent = Arc::new(ScriptedAgent::new(&[r#"{"title":"_empty"}"#]));
        let tool = ReadArticleTool::new(Arc::new(FixedPage(page)), agent, 10_000);
        let response = tool
            .invoke(
                &call("read_article", &[("url", "http://a")]),
                &[],
                CancellationToken::new(),
            )
            .await;
        assert!(response.contains("invalid or unavailable"));
    }

    #[tokio::test]
    async fn web_search_failure_is_formatted_not_thrown() {
        let tool = WebSearchTool::new("http://127.0.0.1:9/search?format=json");
        let response = tool
            .invoke(
                &call("search_web", &[("query", "oslo"), ("category", "text")]),
                &[],
                CancellationToken::new(),
            )
            .await;
        assert!(response.contains("Search Web failed"));
    }
}
