//! Prompt construction and model output parsing.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

use crate::traits::llm::Prompt;

const SYSTEM_PROMPT: &str = "You extract structured data from web page content. \
Respond with a single JSON value and nothing else. \
Use null for fields the page does not provide. Do not invent values.";

lazy_static! {
    static ref CODE_FENCE: Regex =
        Regex::new(r"(?s)^\s*```[A-Za-z0-9_-]*\s*\n?(.*?)\n?\s*```\s*$").unwrap();
}

/// Truncate to at most `max_chars` characters on a char boundary.
pub fn truncate_content(content: &str, max_chars: usize) -> (&str, bool) {
    match content.char_indices().nth(max_chars) {
        Some((idx, _)) => (&content[..idx], true),
        None => (content, false),
    }
}

/// Build the extraction prompt for a page.
pub fn extraction_prompt(
    url: &str,
    instructions: &str,
    schema: Option<&Value>,
    content: &str,
    truncated: bool,
) -> Prompt {
    let mut user = format!("## Instructions\n{instructions}\n\n");
    if let Some(schema) = schema {
        let rendered = serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string());
        user.push_str(&format!(
            "## Output schema\nThe JSON must conform to this schema:\n{rendered}\n\n"
        ));
    }
    user.push_str(&format!("## Source\nURL: {url}\n"));
    if truncated {
        user.push_str("(content truncated)\n");
    }
    user.push_str(&format!("\n## Content\n{content}"));

    Prompt::new(SYSTEM_PROMPT, user)
}

/// Parse model output as JSON, tolerating a surrounding code fence.
pub fn parse_json_output(output: &str) -> Result<Value, serde_json::Error> {
    let trimmed = output.trim();
    let body = CODE_FENCE
        .captures(trimmed)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .unwrap_or(trimmed);
    serde_json::from_str(body)
}
