// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::shell::BackgroundShellManager;
use crate::tool::{Tool, ToolCall, ToolCtx, ToolError, ToolOutput};

/// Snapshot a background shell's buffered output and completion state.
///
/// Needs no permission: the caller must already hold a shell id, which only
/// an authorized bash invocation can have produced.
pub struct JobOutputTool {
    pub manager: Arc<BackgroundShellManager>,
}

#[async_trait]
impl Tool for JobOutputTool {
    fn name(&self) -> &str {
        "job_output"
    }

    fn description(&self) -> &str {
        "Read the buffered stdout/stderr of a background shell started by bash.\n\
         Reports whether the command has finished and its exit status."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "shell_id": {
                    "type": "string",
                    "description": "Id returned by bash when the command was backgrounded"
                }
            },
            "required": ["shell_id"],
            "additionalProperties": false
        })
    }

    fn parallel_safe(&self) -> bool {
        true
    }

    async fn invoke(&self, _ctx: &ToolCtx, call: &ToolCall) -> Result<ToolOutput, ToolError> {
        let shell_id = match call.args.get("shell_id").and_then(|v| v.as_str()) {
            Some(s) => s,
            None => return Ok(ToolOutput::err(&call.id, "missing 'shell_id'")),
        };
        let shell = match self.manager.get(shell_id) {
            Some(s) => s,
            None => {
                return Ok(ToolOutput::err(
                    &call.id,
                    format!("no background shell with id {shell_id}"),
                ))
            }
        };

        let stdout = shell.stdout.snapshot();
        let stderr = shell.stderr.snapshot();
        let mut content = format!("command: {}\ndone: {}\n", shell.command, shell.is_done());
        if let Some(code) = shell.exit_code() {
            content.push_str(&format!("exit code: {code}\n"));
        }
        if let Some(err) = shell.exit_error() {
            content.push_str(&format!("exit error: {err}\n"));
        }
        if !stdout.is_empty() {
            content.push_str("\n[stdout]\n");
            content.push_str(&stdout);
        }
        if !stderr.is_empty() {
            content.push_str("\n[stderr]\n");
            content.push_str(&stderr);
        }

        Ok(ToolOutput::ok(&call.id, content)
            .with_metadata(json!({ "shell_id": shell_id, "done": shell.is_done() })))
    }
}

/// Kill a background shell and wait for it to exit.
pub struct JobKillTool {
    pub manager: Arc<BackgroundShellManager>,
}

#[async_trait]
impl Tool for JobKillTool {
    fn name(&self) -> &str {
        "job_kill"
    }

    fn description(&self) -> &str {
        "Terminate a background shell started by bash and wait for it to exit."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "shell_id": {
                    "type": "string",
                    "description": "Id of the background shell to terminate"
                }
            },
            "required": ["shell_id"],
            "additionalProperties": false
        })
    }

    async fn invoke(&self, _ctx: &ToolCtx, call: &ToolCall) -> Result<ToolOutput, ToolError> {
        let shell_id = match call.args.get("shell_id").and_then(|v| v.as_str()) {
            Some(s) => s.to_string(),
            None => return Ok(ToolOutput::err(&call.id, "missing 'shell_id'")),
        };
        match self.manager.kill(&shell_id).await {
            Ok(()) => Ok(ToolOutput::ok(
                &call.id,
                format!("background shell {shell_id} terminated"),
            )),
            Err(e) => Ok(ToolOutput::err(&call.id, e.to_string())),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
