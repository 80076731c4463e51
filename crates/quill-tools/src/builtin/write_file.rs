// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::builtin::edit::create_dirs;
use crate::fsutil::{absolutize, unified_diff, FileGuard};
use crate::permission::PermissionService;
use crate::tool::{Tool, ToolCall, ToolCtx, ToolError, ToolOutput};

/// Whole-file write.  Overwriting an existing file follows the same safety
/// protocol as edit: the session must have viewed it and nothing may have
/// modified it since.
pub struct WriteTool {
    pub guard: Arc<FileGuard>,
    pub permissions: Arc<PermissionService>,
}

#[async_trait]
impl Tool for WriteTool {
    fn name(&self) -> &str {
        "write"
    }

    fn description(&self) -> &str {
        "Write complete content to a file, creating it (and parent\n\
         directories) when missing.  Overwriting an existing file requires\n\
         viewing it first.  Prefer edit for partial changes."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Path of the file to write"
                },
                "content": {
                    "type": "string",
                    "description": "Full new content of the file"
                }
            },
            "required": ["file_path", "content"],
            "additionalProperties": false
        })
    }

    async fn invoke(&self, ctx: &ToolCtx, call: &ToolCall) -> Result<ToolOutput, ToolError> {
        let path_arg = match call.args.get("file_path").and_then(|v| v.as_str()) {
            Some(p) => p,
            None => return Ok(ToolOutput::err(&call.id, "missing required parameter 'file_path'")),
        };
        let content = match call.args.get("content").and_then(|v| v.as_str()) {
            Some(c) => c.to_string(),
            None => return Ok(ToolOutput::err(&call.id, "missing required parameter 'content'")),
        };

        let path = absolutize(&ctx.working_dir, path_arg);
        debug!(path = %path.display(), bytes = content.len(), "write tool");

        let exists = path.exists();
        let old_content = if exists {
            if let Err(msg) = self.guard.ensure_read(&ctx.session_id, &path) {
                return Ok(ToolOutput::err(&call.id, msg));
            }
            if let Err(msg) = self.guard.ensure_unmodified(&ctx.session_id, &path) {
                return Ok(ToolOutput::err(&call.id, msg));
            }
            match std::fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) => return Ok(ToolOutput::err(&call.id, format!("read error: {e}"))),
            }
        } else {
            String::new()
        };

        if exists && old_content == content {
            return Ok(ToolOutput::ok(
                &call.id,
                format!("{} already has exactly this content", path.display()),
            ));
        }

        let diff = unified_diff(&path.to_string_lossy(), &old_content, &content);
        self.permissions
            .request(
                ctx,
                "write",
                "write",
                &path.to_string_lossy(),
                if exists { "overwrite a file" } else { "create a file" },
                json!({ "file_path": path.to_string_lossy(), "diff": diff }),
            )
            .await?;

        if let Some(parent) = path.parent() {
            if let Err(e) = create_dirs(parent) {
                return Ok(ToolOutput::err(&call.id, format!("mkdir error: {e}")));
            }
        }
        if let Err(e) = std::fs::write(&path, &content) {
            return Ok(ToolOutput::err(&call.id, format!("write error: {e}")));
        }
        self.guard.record_write(&ctx.session_id, &path, &old_content, &content);

        Ok(ToolOutput::ok(
            &call.id,
            format!("Wrote {} bytes to {}", content.len(), path.display()),
        ))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
