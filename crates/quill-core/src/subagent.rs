// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

use quill_config::AgentConfig;
use quill_model::LanguageModel;
use quill_store::{agent_tool_session_id, MessageStore, SessionStore};
use quill_tools::builtin::web::fetch_page_text;
use quill_tools::{PermissionService, Tool, ToolCall, ToolCtx, ToolError, ToolOutput, ToolRegistry};

use crate::agent::{SessionAgent, SessionAgentCall};
use crate::prompts::subagent_prompt;

/// Page content up to this size is inlined into the child's prompt; larger
/// pages are saved to a temp file the child reads with view.
const INLINE_CONTENT_LIMIT: usize = 50 * 1024;

/// Default timeout for the agentic_fetch page download.
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared construction state for the sub-agent tools.
///
/// The restricted registry excludes sub-agent tools (no recursive
/// spawning) and todos (children do not own the parent's task list).
/// Both tools run the child on the small model with auto-approval, so a
/// delegated task never blocks on an interactive permission prompt.
pub struct SubAgentDeps {
    pub sessions: Arc<SessionStore>,
    pub messages: Arc<MessageStore>,
    pub permissions: Arc<PermissionService>,
    pub small_model: Arc<dyn LanguageModel>,
    pub config: Arc<AgentConfig>,
    pub working_dir: PathBuf,
    pub restricted_tools: Arc<ToolRegistry>,
}

impl SubAgentDeps {
    fn build_agent(&self) -> SessionAgent {
        SessionAgent::new(
            Arc::clone(&self.sessions),
            Arc::clone(&self.messages),
            Arc::clone(&self.restricted_tools),
            Arc::clone(&self.small_model),
            Arc::clone(&self.small_model),
            Arc::clone(&self.config),
            self.working_dir.clone(),
        )
    }

    /// Create (or reuse) the deterministic child session and run the child
    /// agent to completion, returning its final text.
    async fn run_child(
        &self,
        ctx: &ToolCtx,
        title: &str,
        prompt: String,
    ) -> Result<(String, String), ToolError> {
        let child_id = agent_tool_session_id(&ctx.parent_message_id, &ctx.tool_call_id);
        let child = self
            .sessions
            .create_task_session(Some(child_id), title, &ctx.session_id)
            .map_err(|e| ToolError::Fatal(anyhow::anyhow!(e)))?;
        self.permissions.auto_approve_session(&child.id);

        debug!(child = %child.id, parent = %ctx.session_id, "spawning sub-agent");

        let agent = self.build_agent();
        // The receiver is dropped immediately: child progress events are not
        // surfaced, only the final text.
        let (events_tx, _) = mpsc::channel(64);
        let call = SessionAgentCall {
            session_id: child.id.clone(),
            prompt,
            ..Default::default()
        };
        let response = agent
            .run(ctx.cancel.child_token(), call, events_tx)
            .await
            .map_err(|e| ToolError::Fatal(anyhow::anyhow!("sub-agent failed: {e}")))?;

        Ok((child.id, response.message.text()))
    }
}

/// Delegate a focused task to a child agent session.
pub struct AgentTool {
    pub deps: Arc<SubAgentDeps>,
}

#[async_trait]
impl Tool for AgentTool {
    fn name(&self) -> &str {
        "agent"
    }

    fn description(&self) -> &str {
        "Spawn a sub-agent to complete a focused task and return its final\n\
         text.  The sub-agent has the standard read/search/edit/bash tools\n\
         but cannot spawn further sub-agents.  Use for isolated sub-tasks\n\
         whose intermediate steps would clutter this conversation."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": {
                    "type": "string",
                    "description": "Complete task description for the sub-agent"
                }
            },
            "required": ["prompt"],
            "additionalProperties": false
        })
    }

    fn parallel_safe(&self) -> bool {
        true
    }

    async fn invoke(&self, ctx: &ToolCtx, call: &ToolCall) -> Result<ToolOutput, ToolError> {
        let prompt = match call.args.get("prompt").and_then(|v| v.as_str()) {
            Some(p) if !p.trim().is_empty() => p.to_string(),
            _ => return Ok(ToolOutput::err(&call.id, "missing 'prompt'")),
        };

        let title = prompt.chars().take(60).collect::<String>();
        let (child_id, text) = self
            .deps
            .run_child(ctx, &format!("agent: {title}"), subagent_prompt(&prompt))
            .await?;

        let content = if text.is_empty() {
            "(sub-agent produced no text output)".to_string()
        } else {
            text
        };
        Ok(ToolOutput::ok(&call.id, content)
            .with_metadata(json!({ "child_session_id": child_id })))
    }
}

/// Fetch a page (or search the web) and hand the content to a child agent
/// for extraction.
pub struct AgenticFetchTool {
    pub deps: Arc<SubAgentDeps>,
}

#[async_trait]
impl Tool for AgenticFetchTool {
    fn name(&self) -> &str {
        "agentic_fetch"
    }

    fn description(&self) -> &str {
        "Answer a question about web content using a sub-agent.\n\
         With url: the page is fetched and given to the sub-agent together\n\
         with the prompt.  Without url: the sub-agent searches the web with\n\
         web_search and reads results with web_fetch.\n\
         Use when the answer needs reading and digesting a page, not just\n\
         its raw content."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": {
                    "type": "string",
                    "description": "What to find out or extract"
                },
                "url": {
                    "type": "string",
                    "description": "Page to read; omit to let the sub-agent search"
                }
            },
            "required": ["prompt"],
            "additionalProperties": false
        })
    }

    fn parallel_safe(&self) -> bool {
        true
    }

    async fn invoke(&self, ctx: &ToolCtx, call: &ToolCall) -> Result<ToolOutput, ToolError> {
        let prompt = match call.args.get("prompt").and_then(|v| v.as_str()) {
            Some(p) if !p.trim().is_empty() => p.to_string(),
            _ => return Ok(ToolOutput::err(&call.id, "missing 'prompt'")),
        };
        let url = call.args.get("url").and_then(|v| v.as_str()).map(str::to_string);

        let child_prompt = match &url {
            Some(url) => {
                let fetched = tokio::time::timeout(
                    FETCH_TIMEOUT,
                    fetch_page_text(url, INLINE_CONTENT_LIMIT * 4),
                )
                .await;
                let content = match fetched {
                    Ok(Ok(c)) => c,
                    Ok(Err(e)) => {
                        return Ok(ToolOutput::err(&call.id, format!("fetch error: {e}")))
                    }
                    Err(_) => {
                        return Ok(ToolOutput::err(
                            &call.id,
                            format!("fetching {url} timed out after {}s", FETCH_TIMEOUT.as_secs()),
                        ))
                    }
                };

                if content.len() <= INLINE_CONTENT_LIMIT {
                    format!(
                        "{}\n\nContent of {url}:\n---\n{content}\n---",
                        subagent_prompt(&prompt)
                    )
                } else {
                    // Too large to inline: the child reads it with view.
                    let path = match save_temp(&content) {
                        Ok(p) => p,
                        Err(e) => {
                            return Ok(ToolOutput::err(
                                &call.id,
                                format!("failed to save fetched content: {e}"),
                            ))
                        }
                    };
                    format!(
                        "{}\n\nThe content of {url} ({} bytes) is saved at {}. \
                         Read it with the view tool (paginate with offset/limit).",
                        subagent_prompt(&prompt),
                        content.len(),
                        path.display()
                    )
                }
            }
            None => format!(
                "{}\n\nFind the answer on the web: use web_search to locate \
                 relevant pages, then web_fetch to read them.",
                subagent_prompt(&prompt)
            ),
        };

        let (child_id, text) = self
            .deps
            .run_child(ctx, &format!("fetch: {}", url.as_deref().unwrap_or("search")), child_prompt)
            .await?;

        let content = if text.is_empty() {
            "(sub-agent produced no text output)".to_string()
        } else {
            text
        };
        Ok(ToolOutput::ok(&call.id, content)
            .with_metadata(json!({ "child_session_id": child_id })))
    }
}

fn save_temp(content: &str) -> anyhow::Result<PathBuf> {
    let mut file = tempfile::Builder::new()
        .prefix("quill-fetch-")
        .suffix(".txt")
        .tempfile()?;
    file.write_all(content.as_bytes())?;
    let (_, path) = file.keep()?;
    Ok(path)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
