// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{Tool, ToolCall, ToolCtx, ToolError, ToolOutput};

/// Default character cap for fetched page content.
const DEFAULT_MAX_CHARS: usize = 50_000;

/// Lightweight page fetch used by research flows and the agentic-fetch
/// sub-agent.  Always converts HTML to readable text; needs no permission
/// (read-only GET) so unattended child sessions can use it.
pub struct WebFetchTool;

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetch a webpage and convert it to readable text.\n\
         Read-only GET; content capped at 50,000 characters by default.\n\
         Use fetch when you need raw HTML or a specific format."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The URL to fetch (http or https)"
                },
                "max_chars": {
                    "type": "integer",
                    "description": "Maximum characters to return (default 50000)"
                }
            },
            "required": ["url"],
            "additionalProperties": false
        })
    }

    fn parallel_safe(&self) -> bool {
        true
    }

    async fn invoke(&self, ctx: &ToolCtx, call: &ToolCall) -> Result<ToolOutput, ToolError> {
        let url = match call.args.get("url").and_then(|v| v.as_str()) {
            Some(u) => u.to_string(),
            None => return Ok(ToolOutput::err(&call.id, "missing 'url'")),
        };
        let max_chars = call
            .args
            .get("max_chars")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_MAX_CHARS as u64) as usize;

        debug!(url = %url, "web_fetch tool");

        let result = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                return Ok(ToolOutput::err(&call.id, "fetch canceled"));
            }
            r = fetch_page_text(&url, max_chars) => r,
        };
        match result {
            Ok(content) => Ok(ToolOutput::ok(&call.id, content)),
            Err(e) => Ok(ToolOutput::err(&call.id, format!("fetch error: {e}"))),
        }
    }
}

/// Fetch `url` and return readable text, capped at `max_chars`.
pub async fn fetch_page_text(url: &str, max_chars: usize) -> anyhow::Result<String> {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        anyhow::bail!("invalid URL: {url}");
    }
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .redirect(reqwest::redirect::Policy::limited(3))
        .user_agent("quill-agent/0.4")
        .build()?;

    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        anyhow::bail!("request failed with status {}", response.status());
    }
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_lowercase();
    let body = response.text().await?;

    let content = if content_type.contains("html") {
        html2text::from_read(body.as_bytes(), 100)
    } else if content_type.contains("json") {
        match serde_json::from_str::<Value>(&body) {
            Ok(v) => serde_json::to_string_pretty(&v).unwrap_or(body),
            Err(_) => body,
        }
    } else {
        body
    };

    if content.len() > max_chars {
        let mut cut = max_chars;
        while !content.is_char_boundary(cut) {
            cut -= 1;
        }
        Ok(format!(
            "{}...[truncated at {max_chars} chars; total {} chars]",
            &content[..cut],
            content.len()
        ))
    } else {
        Ok(content)
    }
}

/// Web search over the Brave Search API.
pub struct WebSearchTool {
    pub api_key: Option<String>,
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web and return titles, URLs, and snippets.\n\
         Use web_fetch on a result URL to read the full page.\n\
         count: number of results (default 5, max 10)."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Search query"
                },
                "count": {
                    "type": "integer",
                    "description": "Number of results to return (default 5, max 10)"
                }
            },
            "required": ["query"],
            "additionalProperties": false
        })
    }

    fn parallel_safe(&self) -> bool {
        true
    }

    async fn invoke(&self, _ctx: &ToolCtx, call: &ToolCall) -> Result<ToolOutput, ToolError> {
        let query = match call.args.get("query").and_then(|v| v.as_str()) {
            Some(q) => q.to_string(),
            None => return Ok(ToolOutput::err(&call.id, "missing 'query'")),
        };
        let count = call
            .args
            .get("count")
            .and_then(|v| v.as_u64())
            .unwrap_or(5)
            .min(10) as usize;

        debug!(query = %query, count, "web_search tool");

        let api_key = self
            .api_key
            .clone()
            .or_else(|| std::env::var("BRAVE_API_KEY").ok());
        let Some(api_key) = api_key else {
            return Ok(ToolOutput::err(
                &call.id,
                "No search API key configured. Set the BRAVE_API_KEY environment variable.",
            ));
        };

        match brave_search(&query, count, &api_key).await {
            Ok(results) => Ok(ToolOutput::ok(&call.id, results)),
            Err(e) => Ok(ToolOutput::err(&call.id, format!("search error: {e}"))),
        }
    }
}

async fn brave_search(query: &str, count: usize, api_key: &str) -> anyhow::Result<String> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(15))
        .user_agent("quill-agent/0.4")
        .build()?;

    let url = format!(
        "https://api.search.brave.com/res/v1/web/search?q={}&count={count}",
        urlencode(query)
    );

    let resp = client
        .get(&url)
        .header("Accept", "application/json")
        .header("X-Subscription-Token", api_key)
        .send()
        .await?;

    if !resp.status().is_success() {
        anyhow::bail!("search API returned status {}", resp.status());
    }

    let json: Value = resp.json().await?;
    let results = json
        .get("web")
        .and_then(|w| w.get("results"))
        .and_then(|r| r.as_array())
        .map(|arr| arr.as_slice())
        .unwrap_or(&[]);

    if results.is_empty() {
        return Ok("(no results)".to_string());
    }

    let mut output = Vec::new();
    for (i, r) in results.iter().enumerate().take(count) {
        let title = r.get("title").and_then(|v| v.as_str()).unwrap_or("(no title)");
        let url = r.get("url").and_then(|v| v.as_str()).unwrap_or("");
        let desc = r.get("description").and_then(|v| v.as_str()).unwrap_or("");
        output.push(format!("{}. **{title}**\n   {url}\n   {desc}", i + 1));
    }
    Ok(output.join("\n\n"))
}

fn urlencode(s: &str) -> String {
    let mut encoded = String::new();
    for c in s.chars() {
        match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '-' | '_' | '.' | '~' => encoded.push(c),
            ' ' => encoded.push('+'),
            c => {
                for byte in c.to_string().as_bytes() {
                    encoded.push_str(&format!("%{byte:02X}"));
                }
            }
        }
    }
    encoded
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urlencode_escapes_specials() {
        assert_eq!(urlencode("a b"), "a+b");
        assert_eq!(urlencode("a&b"), "a%26b");
        assert_eq!(urlencode("rust-lang"), "rust-lang");
    }

    #[tokio::test]
    async fn invalid_scheme_is_rejected() {
        let res = fetch_page_text("file:///etc/passwd", 1000).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn search_without_key_is_validation_error() {
        // Ensure the env var does not leak into the test.
        std::env::remove_var("BRAVE_API_KEY");
        let t = WebSearchTool { api_key: None };
        let out = t
            .invoke(
                &crate::tool::test_ctx(),
                &ToolCall {
                    id: "s1".into(),
                    name: "web_search".into(),
                    args: json!({"query": "rust"}),
                },
            )
            .await
            .unwrap();
        assert!(out.is_error);
        assert!(out.content.contains("BRAVE_API_KEY"));
    }

    #[test]
    fn schema_requires_query() {
        let t = WebSearchTool { api_key: None };
        let schema = t.parameters_schema();
        let required = schema["required"].as_array().unwrap();
        assert!(required.iter().any(|v| v.as_str() == Some("query")));
    }
}
