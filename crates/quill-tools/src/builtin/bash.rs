// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::permission::PermissionService;
use crate::shell::{BackgroundShell, BackgroundShellManager, BlockFunc};
use crate::tool::{Tool, ToolCall, ToolCtx, ToolError, ToolOutput};

/// Hard byte ceiling for combined stdout + stderr returned to the model.
const OUTPUT_LIMIT_BYTES: usize = 40_000;

/// Lines kept from the head / tail of oversized output.  Errors and
/// summaries almost always appear at the end of build or test output, so
/// the tail is at least as important as the head.
const HEAD_LINES: usize = 100;
const TAIL_LINES: usize = 100;

/// How long an explicitly backgrounded command is watched before
/// returning, to catch immediate failures (blocked commands, parse errors).
const FAST_FAIL_WINDOW: Duration = Duration::from_secs(1);

/// Run a shell command, auto-promoting long runners to background shells.
pub struct BashTool {
    pub manager: Arc<BackgroundShellManager>,
    pub permissions: Arc<PermissionService>,
    pub blockers: Vec<BlockFunc>,
    /// Synchronous wait window before auto-backgrounding (60 s in
    /// production; injectable for tests).
    pub sync_wait: Duration,
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return stdout + stderr.\n\
         'command' is required; 'description' is a short human-readable label.\n\
         Commands that run longer than 60 seconds are promoted to a tracked\n\
         background shell: the tool returns {background: true, shell_id} and\n\
         you poll with job_output / stop with job_kill.\n\
         Pass run_in_background=true for servers and watchers you know will\n\
         not exit.\n\
         Prefer non-interactive commands; avoid commands that require a TTY.\n\
         Do NOT use bash for file operations:\n\
         - Read files  → use view   (not cat / head / tail)\n\
         - Search text → use grep   (not grep / rg in bash)\n\
         - Find files  → use glob   (not find)\n\
         - Edit files  → use edit   (not sed / awk / patch)"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The complete bash one-liner to execute"
                },
                "description": {
                    "type": "string",
                    "description": "Short label shown while the command runs"
                },
                "run_in_background": {
                    "type": "boolean",
                    "description": "Start as a background shell and return its id immediately"
                }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    async fn invoke(&self, ctx: &ToolCtx, call: &ToolCall) -> Result<ToolOutput, ToolError> {
        let command = match call.args.get("command").and_then(|v| v.as_str()) {
            Some(c) if !c.trim().is_empty() => c.to_string(),
            _ => {
                return Ok(ToolOutput::err(
                    &call.id,
                    "missing required parameter 'command'",
                ))
            }
        };
        let description = call
            .args
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let run_in_background = call
            .args
            .get("run_in_background")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        debug!(cmd = %command, run_in_background, "bash tool");

        // Curated read-only prefixes bypass the gate; everything else asks.
        if !self.permissions.is_safe_read_command(&command) {
            self.permissions
                .request(
                    ctx,
                    "bash",
                    "execute",
                    &ctx.working_dir.to_string_lossy(),
                    &description,
                    json!({ "command": command }),
                )
                .await?;
        }

        // The shell runs on a detached token: finishing (or canceling) this
        // turn must not tear down a command that was promoted to background.
        let shell = match self.manager.start(
            &ctx.working_dir.to_string_lossy(),
            &self.blockers,
            &command,
            &description,
        ) {
            Ok(s) => s,
            Err(e) => return Ok(ToolOutput::err(&call.id, e.to_string())),
        };

        if run_in_background {
            // Watch briefly so obviously-broken commands fail inline.
            let done = tokio::time::timeout(FAST_FAIL_WINDOW, shell.wait()).await.is_ok();
            if done {
                self.manager.remove(&shell.id);
                return Ok(finished_output(&call.id, &shell));
            }
            return Ok(background_output(&call.id, &shell.id));
        }

        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                // The synchronous wait was interrupted: the user no longer
                // wants this command, so it does not linger in the manager.
                let _ = self.manager.kill(&shell.id).await;
                Ok(ToolOutput::err(&call.id, "command canceled"))
            }
            done = tokio::time::timeout(self.sync_wait, shell.wait()) => {
                if done.is_ok() {
                    self.manager.remove(&shell.id);
                    Ok(finished_output(&call.id, &shell))
                } else {
                    // Still running after the window: leave it tracked.
                    Ok(background_output(&call.id, &shell.id))
                }
            }
        }
    }
}

fn background_output(call_id: &str, shell_id: &str) -> ToolOutput {
    ToolOutput::ok(
        call_id,
        format!(
            "Command is still running in the background with shell id {shell_id}.\n\
             Use job_output(\"{shell_id}\") to read its output and job_kill(\"{shell_id}\") to stop it."
        ),
    )
    .with_metadata(json!({ "background": true, "shell_id": shell_id }))
}

fn finished_output(call_id: &str, shell: &BackgroundShell) -> ToolOutput {
    let stdout = shell.stdout.snapshot();
    let stderr = shell.stderr.snapshot();
    let mut content = String::new();
    if !stdout.is_empty() {
        content.push_str(&head_tail_truncate(&stdout));
    }
    if !stderr.is_empty() {
        if !content.is_empty() {
            content.push('\n');
        }
        content.push_str("[stderr]\n");
        content.push_str(&head_tail_truncate(&stderr));
    }

    if let Some(err) = shell.exit_error() {
        if content.is_empty() {
            return ToolOutput::err(call_id, err);
        }
        return ToolOutput::err(call_id, format!("{content}\n[{err}]"));
    }

    let code = shell.exit_code().unwrap_or(-1);
    if content.is_empty() {
        content = format!("[exit {code}]");
    }
    if code == 0 {
        ToolOutput::ok(call_id, content)
    } else if code == 1 {
        // Exit code 1 is the Unix convention for "no matches" (grep/rg),
        // "condition false" (test/[), and similar non-fatal empty results.
        // Flagging it as is_error confuses the model into believing the
        // command itself failed.  Include the code for transparency.
        ToolOutput::ok(call_id, format!("[exit 1]\n{content}"))
    } else {
        ToolOutput::err(call_id, format!("[exit {code}]\n{content}"))
    }
}

/// Truncate `s` to fit within `OUTPUT_LIMIT_BYTES`.
///
/// When truncation is needed the first `HEAD_LINES` and last `TAIL_LINES`
/// are kept verbatim, with an omission marker in the middle showing how
/// much was dropped.
pub(crate) fn head_tail_truncate(s: &str) -> String {
    if s.len() <= OUTPUT_LIMIT_BYTES {
        return s.to_string();
    }

    let lines: Vec<&str> = s.lines().collect();
    let total = lines.len();

    if total <= HEAD_LINES + TAIL_LINES {
        // Byte budget exceeded by very long lines; fall back to a byte-level
        // head+tail split.
        let head_end = OUTPUT_LIMIT_BYTES / 2;
        let tail_start = s.len().saturating_sub(OUTPUT_LIMIT_BYTES / 2);
        let head_str = &s[..floor_char_boundary(s, head_end)];
        let tail_str = &s[ceil_char_boundary(s, tail_start)..];
        let omitted = s.len() - head_str.len() - tail_str.len();
        return format!("{head_str}\n...[{omitted} bytes omitted]...\n{tail_str}");
    }

    let head = lines[..HEAD_LINES].join("\n");
    let tail = lines[total - TAIL_LINES..].join("\n");
    let omitted_lines = total - HEAD_LINES - TAIL_LINES;
    let omitted_bytes = s.len().saturating_sub(head.len() + tail.len());
    format!("{head}\n...[{omitted_lines} lines / ~{omitted_bytes} bytes omitted]...\n{tail}")
}

fn floor_char_boundary(s: &str, mut i: usize) -> usize {
    i = i.min(s.len());
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_char_boundary(s: &str, mut i: usize) -> usize {
    i = i.min(s.len());
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
