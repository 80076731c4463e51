// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use quill_store::{SessionStore, Todo, TodoStatus};

use crate::tool::{Tool, ToolCall, ToolCtx, ToolError, ToolOutput};

/// Replace the session's todo list wholesale.
pub struct TodosTool {
    pub sessions: Arc<SessionStore>,
}

#[async_trait]
impl Tool for TodosTool {
    fn name(&self) -> &str {
        "todos"
    }

    fn description(&self) -> &str {
        "Replace the session's structured task list.\n\
         Each item: {content, status: pending|in_progress|completed, active_form}.\n\
         active_form is the present-continuous phrasing shown while the item\n\
         runs (\"Running tests\").  Calling todos replaces the entire list —\n\
         include every item, not just the changed ones.\n\
         Use for multi-step work (3+ steps); mark items completed immediately\n\
         after finishing them."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "todos": {
                    "type": "array",
                    "description": "Complete replacement todo list",
                    "items": {
                        "type": "object",
                        "properties": {
                            "content": {
                                "type": "string",
                                "description": "Description of the task"
                            },
                            "status": {
                                "type": "string",
                                "enum": ["pending", "in_progress", "completed"],
                                "description": "Current status of the task"
                            },
                            "active_form": {
                                "type": "string",
                                "description": "Present-continuous label shown while in progress"
                            }
                        },
                        "required": ["content", "status"],
                        "additionalProperties": false
                    }
                }
            },
            "required": ["todos"],
            "additionalProperties": false
        })
    }

    async fn invoke(&self, ctx: &ToolCtx, call: &ToolCall) -> Result<ToolOutput, ToolError> {
        let items = match call.args.get("todos").and_then(|v| v.as_array()) {
            Some(arr) => arr.clone(),
            None => return Ok(ToolOutput::err(&call.id, "missing 'todos' array")),
        };

        let mut todos: Vec<Todo> = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            let content = match item.get("content").and_then(|v| v.as_str()) {
                Some(c) if !c.is_empty() => c.to_string(),
                _ => return Ok(ToolOutput::err(&call.id, format!("todo {i} missing 'content'"))),
            };
            let status = match item.get("status").and_then(|v| v.as_str()) {
                Some("pending") => TodoStatus::Pending,
                Some("in_progress") => TodoStatus::InProgress,
                Some("completed") => TodoStatus::Completed,
                Some(other) => {
                    return Ok(ToolOutput::err(
                        &call.id,
                        format!("invalid status {other:?} for todo {i}"),
                    ))
                }
                None => return Ok(ToolOutput::err(&call.id, format!("todo {i} missing 'status'"))),
            };
            let active_form = item
                .get("active_form")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            todos.push(Todo { content, status, active_form });
        }

        let previous = match self.sessions.get(&ctx.session_id) {
            Ok(s) => s.todos,
            Err(e) => return Err(ToolError::Fatal(anyhow::anyhow!(e))),
        };

        // Transition report: which items just finished or just started,
        // keyed by content since the list is replaced wholesale.
        let just_completed: Vec<&str> = todos
            .iter()
            .filter(|t| {
                t.status == TodoStatus::Completed
                    && !previous
                        .iter()
                        .any(|p| p.content == t.content && p.status == TodoStatus::Completed)
            })
            .map(|t| t.content.as_str())
            .collect();
        let just_started: Vec<&str> = todos
            .iter()
            .filter(|t| {
                t.status == TodoStatus::InProgress
                    && !previous
                        .iter()
                        .any(|p| p.content == t.content && p.status == TodoStatus::InProgress)
            })
            .map(|t| t.content.as_str())
            .collect();

        debug!(count = todos.len(), "todos tool");

        let metadata = json!({
            "just_completed": just_completed,
            "just_started": just_started,
        });
        if let Err(e) = self.sessions.set_todos(&ctx.session_id, todos.clone()) {
            return Err(ToolError::Fatal(anyhow::anyhow!(e)));
        }

        Ok(ToolOutput::ok(&call.id, format_todos(&todos)).with_metadata(metadata))
    }
}

fn format_todos(items: &[Todo]) -> String {
    if items.is_empty() {
        return "Todo list cleared.".to_string();
    }
    let lines: Vec<String> = items
        .iter()
        .map(|t| {
            let icon = match t.status {
                TodoStatus::Completed => "✓",
                TodoStatus::InProgress => "→",
                TodoStatus::Pending => "○",
            };
            format!("{icon} {}", t.content)
        })
        .collect();
    format!("Todos updated:\n{}", lines.join("\n"))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::tool::test_ctx;

    fn setup() -> (TodosTool, Arc<SessionStore>, ToolCtx) {
        let sessions = SessionStore::new();
        let session = sessions.create("test");
        let mut ctx = test_ctx();
        ctx.session_id = session.id;
        (TodosTool { sessions: Arc::clone(&sessions) }, sessions, ctx)
    }

    fn call(args: serde_json::Value) -> ToolCall {
        ToolCall { id: "t1".into(), name: "todos".into(), args }
    }

    #[tokio::test]
    async fn replaces_session_todos() {
        let (tool, sessions, ctx) = setup();
        let out = tool
            .invoke(
                &ctx,
                &call(json!({"todos": [
                    {"content": "analyze", "status": "in_progress", "active_form": "Analyzing"},
                    {"content": "implement", "status": "pending"}
                ]})),
            )
            .await
            .unwrap();
        assert!(!out.is_error, "{}", out.content);
        let session = sessions.get(&ctx.session_id).unwrap();
        assert_eq!(session.todos.len(), 2);
        assert_eq!(session.todos[0].active_form, "Analyzing");
    }

    #[tokio::test]
    async fn reports_just_started_and_completed() {
        let (tool, _, ctx) = setup();
        tool.invoke(
            &ctx,
            &call(json!({"todos": [{"content": "a", "status": "in_progress"}]})),
        )
        .await
        .unwrap();
        let out = tool
            .invoke(
                &ctx,
                &call(json!({"todos": [
                    {"content": "a", "status": "completed"},
                    {"content": "b", "status": "in_progress"}
                ]})),
            )
            .await
            .unwrap();
        assert_eq!(out.metadata["just_completed"][0], "a");
        assert_eq!(out.metadata["just_started"][0], "b");
    }

    #[tokio::test]
    async fn invalid_status_is_rejected() {
        let (tool, sessions, ctx) = setup();
        let out = tool
            .invoke(
                &ctx,
                &call(json!({"todos": [{"content": "x", "status": "paused"}]})),
            )
            .await
            .unwrap();
        assert!(out.is_error);
        assert!(out.content.contains("invalid status"));
        assert!(sessions.get(&ctx.session_id).unwrap().todos.is_empty());
    }

    #[tokio::test]
    async fn empty_list_clears() {
        let (tool, sessions, ctx) = setup();
        tool.invoke(
            &ctx,
            &call(json!({"todos": [{"content": "a", "status": "pending"}]})),
        )
        .await
        .unwrap();
        let out = tool.invoke(&ctx, &call(json!({"todos": []}))).await.unwrap();
        assert!(out.content.contains("cleared"));
        assert!(sessions.get(&ctx.session_id).unwrap().todos.is_empty());
    }
}
