// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{Tool, ToolCall, ToolCtx, ToolError, ToolOutput};

const DEFAULT_ENDPOINT: &str = "https://sourcegraph.com/.api/graphql";
const DEFAULT_COUNT: usize = 10;
const MAX_COUNT: usize = 100;

/// Search public code via the Sourcegraph GraphQL API and format the
/// matches as a Markdown report with per-match context windows.
pub struct SourcegraphTool {
    pub endpoint: Option<String>,
}

#[async_trait]
impl Tool for SourcegraphTool {
    fn name(&self) -> &str {
        "sourcegraph"
    }

    fn description(&self) -> &str {
        "Search public code on Sourcegraph.\n\
         query uses Sourcegraph search syntax, e.g. 'repo:^github\\.com/rust-lang\\b fn spawn'.\n\
         count: max results (default 10, cap 100).\n\
         context_window: lines of context shown around each match (default 5)."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Sourcegraph search query"
                },
                "count": {
                    "type": "integer",
                    "description": "Maximum number of results (default 10)"
                },
                "context_window": {
                    "type": "integer",
                    "description": "Context lines around each match (default 5)"
                },
                "timeout": {
                    "type": "integer",
                    "description": "Request timeout in seconds (default 30)"
                }
            },
            "required": ["query"],
            "additionalProperties": false
        })
    }

    fn parallel_safe(&self) -> bool {
        true
    }

    async fn invoke(&self, ctx: &ToolCtx, call: &ToolCall) -> Result<ToolOutput, ToolError> {
        let query = match call.args.get("query").and_then(|v| v.as_str()) {
            Some(q) => q.to_string(),
            None => return Ok(ToolOutput::err(&call.id, "missing required parameter 'query'")),
        };
        let count = call
            .args
            .get("count")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_COUNT as u64)
            .min(MAX_COUNT as u64) as usize;
        let context_window = call
            .args
            .get("context_window")
            .and_then(|v| v.as_u64())
            .unwrap_or(5) as usize;
        let timeout = call.args.get("timeout").and_then(|v| v.as_u64()).unwrap_or(30);

        debug!(query = %query, count, "sourcegraph tool");

        let endpoint = self
            .endpoint
            .clone()
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());

        let search = search_graphql(&endpoint, &query, count, timeout);
        let response = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                return Ok(ToolOutput::err(&call.id, "search canceled"));
            }
            r = search => r,
        };
        match response {
            Ok(v) => Ok(ToolOutput::ok(&call.id, format_report(&v, count, context_window))),
            Err(e) => Ok(ToolOutput::err(&call.id, format!("sourcegraph error: {e}"))),
        }
    }
}

async fn search_graphql(
    endpoint: &str,
    query: &str,
    count: usize,
    timeout_secs: u64,
) -> anyhow::Result<Value> {
    const SEARCH_QUERY: &str = r#"
        query Search($query: String!) {
            search(query: $query, version: V3) {
                results {
                    matchCount
                    results {
                        __typename
                        ... on FileMatch {
                            repository { name }
                            file { path }
                            lineMatches { preview lineNumber }
                        }
                    }
                }
            }
        }"#;

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .user_agent("quill-agent/0.4")
        .build()?;

    let body = json!({
        "query": SEARCH_QUERY,
        "variables": { "query": format!("{query} count:{count}") },
    });

    let resp = client.post(endpoint).json(&body).send().await?;
    if !resp.status().is_success() {
        anyhow::bail!("API returned status {}", resp.status());
    }
    Ok(resp.json().await?)
}

/// Render the GraphQL response into a Markdown report.
fn format_report(response: &Value, count: usize, context_window: usize) -> String {
    let results = response["data"]["search"]["results"]["results"]
        .as_array()
        .map(|a| a.as_slice())
        .unwrap_or(&[]);
    let match_count = response["data"]["search"]["results"]["matchCount"]
        .as_u64()
        .unwrap_or(0);

    if results.is_empty() {
        return "(no results)".to_string();
    }

    let mut out = format!("## Sourcegraph results ({match_count} matches)\n");
    for result in results.iter().take(count) {
        let repo = result["repository"]["name"].as_str().unwrap_or("?");
        let path = result["file"]["path"].as_str().unwrap_or("?");
        out.push_str(&format!("\n### {repo} — {path}\n"));

        let line_matches = result["lineMatches"]
            .as_array()
            .map(|a| a.as_slice())
            .unwrap_or(&[]);
        for lm in line_matches.iter().take(context_window) {
            let line = lm["lineNumber"].as_u64().unwrap_or(0) + 1;
            let preview = lm["preview"].as_str().unwrap_or("").trim_end();
            out.push_str(&format!("```\nL{line}: {preview}\n```\n"));
        }
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
