// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::builtin::edit::{apply_replacement, create_dirs};
use crate::fsutil::{
    absolutize, detect_line_ending, normalize_to_lf, restore_line_ending, unified_diff, FileGuard,
    LineEnding,
};
use crate::permission::PermissionService;
use crate::tool::{Tool, ToolCall, ToolCtx, ToolError, ToolOutput};

/// Apply an ordered array of string replacements in one shot.
///
/// Each operation works on the buffer produced by the previous ones.
/// Failed operations are collected (with index and reason) while the rest
/// still apply; the final write happens only when the net content changed.
pub struct MultiEditTool {
    pub guard: Arc<FileGuard>,
    pub permissions: Arc<PermissionService>,
}

#[async_trait]
impl Tool for MultiEditTool {
    fn name(&self) -> &str {
        "multiedit"
    }

    fn description(&self) -> &str {
        "Apply several edit operations to one file in a single call.\n\
         'edits' is an ordered array of {old_string, new_string, replace_all?}\n\
         applied to the accumulated buffer.  Failed edits are reported with\n\
         their index; the remaining edits still apply.  The first edit may\n\
         create the file when its old_string is empty.  The file is written\n\
         once, only if the net content changed."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Path of the file to edit"
                },
                "edits": {
                    "type": "array",
                    "description": "Ordered edit operations",
                    "items": {
                        "type": "object",
                        "properties": {
                            "old_string": { "type": "string" },
                            "new_string": { "type": "string" },
                            "replace_all": { "type": "boolean" }
                        },
                        "required": ["old_string", "new_string"],
                        "additionalProperties": false
                    }
                }
            },
            "required": ["file_path", "edits"],
            "additionalProperties": false
        })
    }

    async fn invoke(&self, ctx: &ToolCtx, call: &ToolCall) -> Result<ToolOutput, ToolError> {
        let path_arg = match call.args.get("file_path").and_then(|v| v.as_str()) {
            Some(p) => p,
            None => return Ok(ToolOutput::err(&call.id, "missing required parameter 'file_path'")),
        };
        let edits = match call.args.get("edits").and_then(|v| v.as_array()) {
            Some(e) if !e.is_empty() => e.clone(),
            _ => return Ok(ToolOutput::err(&call.id, "missing or empty 'edits' array")),
        };

        let path = absolutize(&ctx.working_dir, path_arg);
        debug!(path = %path.display(), edits = edits.len(), "multiedit tool");

        let first_old = edits[0].get("old_string").and_then(|v| v.as_str()).unwrap_or("");
        let creating = first_old.is_empty() && !path.exists();

        let (original, ending) = if creating {
            (String::new(), LineEnding::Lf)
        } else {
            if let Err(msg) = self.guard.ensure_read(&ctx.session_id, &path) {
                return Ok(ToolOutput::err(&call.id, msg));
            }
            if let Err(msg) = self.guard.ensure_unmodified(&ctx.session_id, &path) {
                return Ok(ToolOutput::err(&call.id, msg));
            }
            let raw = match std::fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) => return Ok(ToolOutput::err(&call.id, format!("read error: {e}"))),
            };
            let ending = detect_line_ending(&raw);
            (normalize_to_lf(&raw), ending)
        };

        let mut buffer = original.clone();
        let mut edits_failed: Vec<Value> = Vec::new();
        let mut applied = 0usize;

        for (index, edit) in edits.iter().enumerate() {
            let old = normalize_to_lf(edit.get("old_string").and_then(|v| v.as_str()).unwrap_or(""));
            let new = normalize_to_lf(edit.get("new_string").and_then(|v| v.as_str()).unwrap_or(""));
            let replace_all = edit.get("replace_all").and_then(|v| v.as_bool()).unwrap_or(false);

            if old.is_empty() {
                if index == 0 && creating {
                    buffer = new;
                    applied += 1;
                    continue;
                }
                edits_failed.push(json!({
                    "index": index,
                    "reason": "empty old_string is only allowed for the first edit of a new file",
                }));
                continue;
            }

            match apply_replacement(&buffer, &old, &new, replace_all) {
                Ok(next) => {
                    buffer = next;
                    applied += 1;
                }
                Err(reason) => {
                    edits_failed.push(json!({ "index": index, "reason": reason }));
                }
            }
        }

        if buffer == original {
            let mut content = "no changes: net file content is unchanged".to_string();
            if !edits_failed.is_empty() {
                content.push_str(&format!(" ({} edit(s) failed)", edits_failed.len()));
            }
            return Ok(ToolOutput::ok(&call.id, content)
                .with_metadata(json!({ "edits_failed": edits_failed, "applied": applied })));
        }

        let diff = unified_diff(&path.to_string_lossy(), &original, &buffer);
        self.permissions
            .request(
                ctx,
                "multiedit",
                "write",
                &path.to_string_lossy(),
                "apply a batch of string replacements",
                json!({ "file_path": path.to_string_lossy(), "diff": diff }),
            )
            .await?;

        if creating {
            if let Some(parent) = path.parent() {
                if let Err(e) = create_dirs(parent) {
                    return Ok(ToolOutput::err(&call.id, format!("mkdir error: {e}")));
                }
            }
        }
        let output = restore_line_ending(&buffer, ending);
        if let Err(e) = std::fs::write(&path, output) {
            return Ok(ToolOutput::err(&call.id, format!("write error: {e}")));
        }
        self.guard.record_write(&ctx.session_id, &path, &original, &buffer);

        let mut content = format!(
            "Applied {applied}/{} edit(s) to {}.",
            edits.len(),
            path.display()
        );
        if !edits_failed.is_empty() {
            content.push_str(&format!("\n{} edit(s) failed:", edits_failed.len()));
            for f in &edits_failed {
                content.push_str(&format!(
                    "\n  [{}] {}",
                    f["index"],
                    f["reason"].as_str().unwrap_or("")
                ));
            }
        }
        content.push('\n');
        content.push_str(&diff);

        Ok(ToolOutput::ok(&call.id, content)
            .with_metadata(json!({ "edits_failed": edits_failed, "applied": applied })))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use quill_config::PermissionConfig;
    use quill_store::FileHistoryStore;
    use serde_json::json;
    use std::path::Path;

    use super::*;
    use crate::tool::test_ctx;

    fn tool() -> MultiEditTool {
        MultiEditTool {
            guard: Arc::new(FileGuard::new(FileHistoryStore::new())),
            permissions: PermissionService::new(&PermissionConfig { yolo: true, ..Default::default() }),
        }
    }

    fn call(args: serde_json::Value) -> ToolCall {
        ToolCall { id: "m1".into(), name: "multiedit".into(), args }
    }

    fn ctx_in(dir: &Path) -> ToolCtx {
        let mut ctx = test_ctx();
        ctx.working_dir = dir.to_path_buf();
        ctx
    }

    #[tokio::test]
    async fn applies_sequential_edits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "one two three\n").unwrap();
        let t = tool();
        let ctx = ctx_in(dir.path());
        t.guard.mark_read(&ctx.session_id, &path);
        let out = t
            .invoke(
                &ctx,
                &call(json!({
                    "file_path": "a.txt",
                    "edits": [
                        {"old_string": "one", "new_string": "1"},
                        {"old_string": "three", "new_string": "3"}
                    ]
                })),
            )
            .await
            .unwrap();
        assert!(!out.is_error, "{}", out.content);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1 two 3\n");
        assert_eq!(out.metadata["applied"], 2);
    }

    #[tokio::test]
    async fn later_edits_see_earlier_results() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "alpha\n").unwrap();
        let t = tool();
        let ctx = ctx_in(dir.path());
        t.guard.mark_read(&ctx.session_id, &path);
        let out = t
            .invoke(
                &ctx,
                &call(json!({
                    "file_path": "a.txt",
                    "edits": [
                        {"old_string": "alpha", "new_string": "beta"},
                        {"old_string": "beta", "new_string": "gamma"}
                    ]
                })),
            )
            .await
            .unwrap();
        assert!(!out.is_error);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "gamma\n");
    }

    #[tokio::test]
    async fn failed_edit_is_collected_and_rest_apply() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "keep fix\n").unwrap();
        let t = tool();
        let ctx = ctx_in(dir.path());
        t.guard.mark_read(&ctx.session_id, &path);
        let out = t
            .invoke(
                &ctx,
                &call(json!({
                    "file_path": "a.txt",
                    "edits": [
                        {"old_string": "absent", "new_string": "x"},
                        {"old_string": "fix", "new_string": "fixed"}
                    ]
                })),
            )
            .await
            .unwrap();
        assert!(!out.is_error);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "keep fixed\n");
        assert_eq!(out.metadata["edits_failed"][0]["index"], 0);
        assert_eq!(out.metadata["applied"], 1);
    }

    #[tokio::test]
    async fn self_canceling_edits_report_no_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "stable\n").unwrap();
        let t = tool();
        let ctx = ctx_in(dir.path());
        t.guard.mark_read(&ctx.session_id, &path);
        let out = t
            .invoke(
                &ctx,
                &call(json!({
                    "file_path": "a.txt",
                    "edits": [
                        {"old_string": "stable", "new_string": "shifted"},
                        {"old_string": "shifted", "new_string": "stable"}
                    ]
                })),
            )
            .await
            .unwrap();
        assert!(!out.is_error);
        assert!(out.content.contains("no changes"));
        // No version recorded for a skipped write.
        assert!(t
            .guard
            .history()
            .latest(&ctx.session_id, &path.to_string_lossy())
            .is_none());
    }

    #[tokio::test]
    async fn first_edit_may_create_file() {
        let dir = tempfile::tempdir().unwrap();
        let t = tool();
        let out = t
            .invoke(
                &ctx_in(dir.path()),
                &call(json!({
                    "file_path": "fresh.txt",
                    "edits": [
                        {"old_string": "", "new_string": "created\n"},
                        {"old_string": "created", "new_string": "created and edited"}
                    ]
                })),
            )
            .await
            .unwrap();
        assert!(!out.is_error, "{}", out.content);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("fresh.txt")).unwrap(),
            "created and edited\n"
        );
    }

    #[tokio::test]
    async fn non_first_empty_old_string_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "content\n").unwrap();
        let t = tool();
        let ctx = ctx_in(dir.path());
        t.guard.mark_read(&ctx.session_id, &path);
        let out = t
            .invoke(
                &ctx,
                &call(json!({
                    "file_path": "a.txt",
                    "edits": [
                        {"old_string": "content", "new_string": "changed"},
                        {"old_string": "", "new_string": "sneaky create"}
                    ]
                })),
            )
            .await
            .unwrap();
        assert!(!out.is_error);
        assert_eq!(out.metadata["edits_failed"][0]["index"], 1);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "changed\n");
    }

    #[tokio::test]
    async fn requires_prior_read_for_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "x\n").unwrap();
        let out = tool()
            .invoke(
                &ctx_in(dir.path()),
                &call(json!({
                    "file_path": "a.txt",
                    "edits": [{"old_string": "x", "new_string": "y"}]
                })),
            )
            .await
            .unwrap();
        assert!(out.is_error);
        assert!(out.content.contains("read the file before editing"));
    }
}
