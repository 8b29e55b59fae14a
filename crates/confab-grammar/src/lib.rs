use std::fmt;

use confab_types::{ParameterKind, ToolDefinition};
use confab_wire::{
    ATTACHMENT_END, ATTACHMENT_START, MESSAGE_END, MESSAGE_START, TAG_WRAPPER, THOUGHTS_END,
    THOUGHTS_START, TOOL_END, TOOL_START,
};

/// One named GBNF production.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Production {
    pub name: String,
    pub rule: String,
}

/// A grammar as an ordered list of productions. Serialized into the
/// `name ::= rule` form the inference server consumes; built through
/// the structured model so that adding a tool is idempotent and the
/// result can be inspected production by production.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Grammar {
    productions: Vec<Production>,
}

impl Grammar {
    pub fn push(&mut self, name: impl Into<String>, rule: impl Into<String>) {
        self.productions.push(Production {
            name: name.into(),
            rule: rule.into(),
        });
    }

    pub fn production(&self, name: &str) -> Option<&Production> {
        self.productions.iter().find(|p| p.name == name)
    }

    pub fn productions(&self) -> &[Production] {
        &self.productions
    }
}

impl fmt::Display for Grammar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for production in &self.productions {
            writeln!(f, "{} ::= {}", production.name, production.rule)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrammarError {
    pub tool_name: String,
    pub reason: String,
}

impl fmt::Display for GrammarError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid tool `{}`: {}", self.tool_name, self.reason)
    }
}

impl std::error::Error for GrammarError {}

#[derive(Debug, Clone)]
pub struct GrammarOptions {
    /// Repetition bound for the free-text productions.
    pub max_section_len: usize,
    /// Extra characters excluded from free text, on top of the tag wrapper.
    pub banned_chars: Vec<char>,
}

impl Default for GrammarOptions {
    fn default() -> Self {
        Self {
            max_section_len: 2000,
            banned_chars: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrammarVariant {
    /// Thoughts mandatory, tool and message sections per the root orderings.
    Full,
    /// Tools withdrawn: thoughts plus a mandatory message, no tool section.
    MessageOnly,
}

/// Compiles the tool catalogue and the static section rules into the
/// decoding grammar. The tool section body must exactly match one of the
/// per-tool sub-grammars, so malformed tool JSON is structurally
/// impossible at decoding time.
pub fn build_turn_grammar(
    tools: &[ToolDefinition],
    variant: GrammarVariant,
    options: &GrammarOptions,
) -> Result<Grammar, GrammarError> {
    validate_tools(tools)?;

    let with_tools = variant == GrammarVariant::Full && !tools.is_empty();

    let mut grammar = Grammar::default();
    grammar.push("root", root_rule(with_tools));
    grammar.push("par-any", char_class(options, false));
    grammar.push("par-text", char_class(options, true));
    grammar.push("par-string", "(\"\\\"\" par-text \"\\\"\")");
    grammar.push("par-number", "([0-9]+)");
    grammar.push("par-url", "(\"http\" par-text)");
    grammar.push("sec-thoughts", section_rule(THOUGHTS_START, THOUGHTS_END, "par-any"));
    grammar.push("sec-message", section_rule(MESSAGE_START, MESSAGE_END, "par-any"));

    if with_tools {
        let mut alternatives = Vec::new();
        for tool in tools {
            let production = tool_production(tool);
            alternatives.push(production.name.clone());
            grammar.productions.push(production);
        }
        grammar.push("par-tool", format!("({})", alternatives.join(" | ")));
        grammar.push("sec-tool", section_rule(TOOL_START, TOOL_END, "par-tool"));
    }

    grammar.push(
        "sec-attachment",
        format!(
            "\"{}\\n\" (par-url | \"\") \"\\n{}\"",
            ATTACHMENT_START, ATTACHMENT_END
        ),
    );

    Ok(grammar)
}

fn root_rule(with_tools: bool) -> String {
    if with_tools {
        [
            "(sec-thoughts sec-tool)",
            "(sec-thoughts sec-message)",
            "(sec-thoughts sec-tool sec-message)",
            "(sec-thoughts sec-message sec-attachment)",
            "(sec-thoughts sec-tool sec-message sec-attachment)",
        ]
        .join(" | ")
    } else {
        ["(sec-thoughts sec-message)", "(sec-thoughts sec-message sec-attachment)"].join(" | ")
    }
}

fn section_rule(open: &str, close: &str, body: &str) -> String {
    format!("\"{open}\\n\" {body} \"\\n{close}\\n\"")
}

fn char_class(options: &GrammarOptions, exclude_quote: bool) -> String {
    let mut excluded = String::from(TAG_WRAPPER);
    if exclude_quote {
        excluded.push('"');
    }
    for &ch in &options.banned_chars {
        match ch {
            ']' | '\\' | '^' => {
                excluded.push('\\');
                excluded.push(ch);
            }
            _ => excluded.push(ch),
        }
    }
    format!("([^{excluded}]{{1,{}}})", options.max_section_len)
}

/// Exact sub-grammar for one tool: the tool-name literal plus a JSON
/// object whose keys are the declared parameter names, in order.
fn tool_production(tool: &ToolDefinition) -> Production {
    let name = format!("tool-{}", tool.name.replace('_', "-"));

    let mut tokens: Vec<String> = Vec::new();
    let mut literal = format!("{{\"tool_name\":\"{}\",\"parameters\":{{", tool.name);
    for (idx, parameter) in tool.parameters.iter().enumerate() {
        if idx > 0 {
            literal.push(',');
        }
        literal.push_str(&format!("\"{}\":", parameter.name));
        tokens.push(quote_literal(&literal));
        literal.clear();
        tokens.push(
            match parameter.kind {
                ParameterKind::String => "par-string",
                ParameterKind::Number => "par-number",
            }
            .to_string(),
        );
    }
    literal.push_str("}}");
    tokens.push(quote_literal(&literal));

    Production {
        name,
        rule: format!("({})", tokens.join(" ")),
    }
}

fn quote_literal(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for ch in text.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            _ => out.push(ch),
        }
    }
    out.push('"');
    out
}

fn validate_tools(tools: &[ToolDefinition]) -> Result<(), GrammarError> {
    for (idx, tool) in tools.iter().enumerate() {
        if tool.name.is_empty()
            || !tool
                .name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c == '_')
        {
            return Err(GrammarError {
                tool_name: tool.name.clone(),
                reason: "tool name must be non-empty lowercase ascii with underscores".to_string(),
            });
        }
        if tools[..idx].iter().any(|other| other.name == tool.name) {
            return Err(GrammarError {
                tool_name: tool.name.clone(),
                reason: "duplicate tool name".to_string(),
            });
        }
        for parameter in &tool.parameters {
            if parameter.name.is_empty()
                || !parameter
                    .name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                return Err(GrammarError {
                    tool_name: tool.name.clone(),
                    reason: format!("invalid parameter name `{}`", parameter.name),
                });
            }
        }
    }
    Ok(())
}

/// Grammar for the chunk-title sub-agent: a single-field JSON object
/// with a short alphanumeric title.
pub fn title_grammar() -> Grammar {
    let mut grammar = Grammar::default();
    grammar.push("root", "\"{\\\"title\\\":\\\"\" [A-Za-z0-9_ ]{1,40} \"\\\"}\"");
    grammar
}

/// Grammar for the header-selection sub-agent: a one- or two-element
/// array of indices.
pub fn index_selection_grammar() -> Grammar {
    let mut grammar = Grammar::default();
    grammar.push("root", "\"[\" [0-9]+ ((\",\" [0-9]+) | \"\") \"]\"");
    grammar
}
