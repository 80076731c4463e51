// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::fsutil::{
    absolutize, detect_line_ending, normalize_to_lf, restore_line_ending, unified_diff, FileGuard,
};
use crate::permission::PermissionService;
use crate::tool::{Tool, ToolCall, ToolCtx, ToolError, ToolOutput};

/// String replacement editing with exact-match semantics.
///
/// Cooperates with `view` on the file-edit safety protocol: the session
/// must have read the file, and nothing may have modified it since.
pub struct EditTool {
    pub guard: Arc<FileGuard>,
    pub permissions: Arc<PermissionService>,
}

/// Replace `old` with `new` in `content`.
///
/// `old` must match exactly once unless `replace_all`; zero and multiple
/// matches produce distinguishable errors so the model can correct itself.
pub(crate) fn apply_replacement(
    content: &str,
    old: &str,
    new: &str,
    replace_all: bool,
) -> Result<String, String> {
    let matches = content.matches(old).count();
    if matches == 0 {
        return Err(
            "old_string not found in file. Check whitespace and indentation match exactly."
                .to_string(),
        );
    }
    if matches > 1 && !replace_all {
        return Err(format!(
            "old_string matches {matches} locations. Add surrounding context to make it unique, or set replace_all."
        ));
    }
    if replace_all {
        Ok(content.replace(old, new))
    } else {
        Ok(content.replacen(old, new, 1))
    }
}

#[async_trait]
impl Tool for EditTool {
    fn name(&self) -> &str {
        "edit"
    }

    fn description(&self) -> &str {
        "Replace an exact string in a file.\n\
         old_string must match exactly one location (including whitespace);\n\
         set replace_all=true to change every occurrence.\n\
         An empty old_string creates a new file with new_string as content\n\
         (fails if the file exists).  An empty new_string deletes the matched\n\
         text.  You must view the file first."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Path of the file to edit"
                },
                "old_string": {
                    "type": "string",
                    "description": "Exact text to replace; empty to create a new file"
                },
                "new_string": {
                    "type": "string",
                    "description": "Replacement text; empty to delete the matched text"
                },
                "replace_all": {
                    "type": "boolean",
                    "description": "Replace every occurrence instead of requiring a unique match"
                }
            },
            "required": ["file_path", "old_string", "new_string"],
            "additionalProperties": false
        })
    }

    async fn invoke(&self, ctx: &ToolCtx, call: &ToolCall) -> Result<ToolOutput, ToolError> {
        let path_arg = match call.args.get("file_path").and_then(|v| v.as_str()) {
            Some(p) => p,
            None => return Ok(ToolOutput::err(&call.id, "missing required parameter 'file_path'")),
        };
        let old_string = call
            .args
            .get("old_string")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let new_string = call
            .args
            .get("new_string")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let replace_all = call
            .args
            .get("replace_all")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let path = absolutize(&ctx.working_dir, path_arg);
        debug!(path = %path.display(), create = old_string.is_empty(), "edit tool");

        if old_string.is_empty() {
            return self.create_file(ctx, call, &path, &new_string).await;
        }

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

        // Match against LF-normalized text so CRLF files accept edits written
        // from viewed content; the original ending style is restored on write.
        let ending = detect_line_ending(&raw);
        let content = normalize_to_lf(&raw);
        let old = normalize_to_lf(&old_string);
        let new = normalize_to_lf(&new_string);

        let edited = match apply_replacement(&content, &old, &new, replace_all) {
            Ok(c) => c,
            Err(msg) => return Ok(ToolOutput::err(&call.id, msg)),
        };
        if edited == content {
            return Ok(ToolOutput::err(&call.id, "edit produced no change to the file"));
        }

        let diff = unified_diff(&path.to_string_lossy(), &content, &edited);
        self.permissions
            .request(
                ctx,
                "edit",
                "write",
                &path.to_string_lossy(),
                "apply a string replacement",
                json!({ "file_path": path.to_string_lossy(), "diff": diff }),
            )
            .await?;

        let output = restore_line_ending(&edited, ending);
        if let Err(e) = std::fs::write(&path, output) {
            return Ok(ToolOutput::err(&call.id, format!("write error: {e}")));
        }
        self.guard.record_write(&ctx.session_id, &path, &content, &edited);

        let replacements = if replace_all {
            content.matches(&old).count()
        } else {
            1
        };
        Ok(ToolOutput::ok(
            &call.id,
            format!("Edited {} ({replacements} replacement(s)).\n{diff}", path.display()),
        ))
    }
}

impl EditTool {
    async fn create_file(
        &self,
        ctx: &ToolCtx,
        call: &ToolCall,
        path: &Path,
        content: &str,
    ) -> Result<ToolOutput, ToolError> {
        if path.exists() {
            return Ok(ToolOutput::err(
                &call.id,
                format!(
                    "{} already exists; pass a non-empty old_string to modify it",
                    path.display()
                ),
            ));
        }

        let diff = unified_diff(&path.to_string_lossy(), "", content);
        self.permissions
            .request(
                ctx,
                "edit",
                "write",
                &path.to_string_lossy(),
                "create a new file",
                json!({ "file_path": path.to_string_lossy(), "diff": diff }),
            )
            .await?;

        if let Some(parent) = path.parent() {
            if let Err(e) = create_dirs(parent) {
                return Ok(ToolOutput::err(&call.id, format!("mkdir error: {e}")));
            }
        }
        if let Err(e) = std::fs::write(path, content) {
            return Ok(ToolOutput::err(&call.id, format!("write error: {e}")));
        }
        self.guard.record_write(&ctx.session_id, path, "", content);
        Ok(ToolOutput::ok(&call.id, format!("Created {}", path.display())))
    }
}

/// Create parent directories with mode 0755.
pub(crate) fn create_dirs(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new().recursive(true).mode(0o755).create(dir)
    }
    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(dir)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use quill_config::PermissionConfig;
    use quill_store::FileHistoryStore;
    use serde_json::json;

    use super::*;
    use crate::tool::test_ctx;

    fn tool() -> EditTool {
        EditTool {
            guard: Arc::new(FileGuard::new(FileHistoryStore::new())),
            permissions: PermissionService::new(&PermissionConfig { yolo: true, ..Default::default() }),
        }
    }

    fn call(args: serde_json::Value) -> ToolCall {
        ToolCall { id: "e1".into(), name: "edit".into(), args }
    }

    fn ctx_in(dir: &Path) -> ToolCtx {
        let mut ctx = test_ctx();
        ctx.working_dir = dir.to_path_buf();
        ctx
    }

    // ── apply_replacement ─────────────────────────────────────────────────────

    #[test]
    fn replacement_requires_exactly_one_match() {
        assert!(apply_replacement("aba", "a", "x", false)
            .unwrap_err()
            .contains("2 locations"));
        assert!(apply_replacement("aba", "z", "x", false)
            .unwrap_err()
            .contains("not found"));
        assert_eq!(apply_replacement("aba", "b", "x", false).unwrap(), "axa");
    }

    #[test]
    fn replace_all_bypasses_uniqueness() {
        assert_eq!(apply_replacement("aba", "a", "x", true).unwrap(), "xbx");
    }

    #[test]
    fn empty_new_string_deletes() {
        assert_eq!(apply_replacement("hello world", " world", "", false).unwrap(), "hello");
    }

    // ── Safety protocol ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn edit_without_prior_read_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "x").unwrap();
        let out = tool()
            .invoke(
                &ctx_in(dir.path()),
                &call(json!({"file_path": "a.txt", "old_string": "x", "new_string": "y"})),
            )
            .await
            .unwrap();
        assert!(out.is_error);
        assert!(out.content.contains("read the file before editing"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "x", "no disk write");
    }

    #[tokio::test]
    async fn edit_after_external_modification_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "v1").unwrap();
        let t = tool();
        let ctx = ctx_in(dir.path());
        // Read happened 30 seconds ago; the file changed afterwards.
        t.guard.history().mark_read(
            &ctx.session_id,
            &path.to_string_lossy(),
            chrono::Utc::now() - chrono::Duration::seconds(30),
        );
        std::fs::write(&path, "v2").unwrap();
        let out = t
            .invoke(
                &ctx,
                &call(json!({"file_path": "a.txt", "old_string": "v2", "new_string": "v3"})),
            )
            .await
            .unwrap();
        assert!(out.is_error);
        assert!(out.content.contains("modified since"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "v2");
    }

    #[tokio::test]
    async fn successful_edit_writes_and_records_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "hello world\n").unwrap();
        let t = tool();
        let ctx = ctx_in(dir.path());
        t.guard.mark_read(&ctx.session_id, &path);
        let out = t
            .invoke(
                &ctx,
                &call(json!({"file_path": "a.txt", "old_string": "world", "new_string": "quill"})),
            )
            .await
            .unwrap();
        assert!(!out.is_error, "{}", out.content);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello quill\n");
        let latest = t
            .guard
            .history()
            .latest(&ctx.session_id, &path.to_string_lossy())
            .unwrap();
        assert_eq!(latest.content, "hello quill\n");
    }

    #[tokio::test]
    async fn crlf_file_keeps_its_line_endings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dos.txt");
        std::fs::write(&path, "one\r\ntwo\r\n").unwrap();
        let t = tool();
        let ctx = ctx_in(dir.path());
        t.guard.mark_read(&ctx.session_id, &path);
        let out = t
            .invoke(
                &ctx,
                &call(json!({"file_path": "dos.txt", "old_string": "two", "new_string": "zwei"})),
            )
            .await
            .unwrap();
        assert!(!out.is_error, "{}", out.content);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "one\r\nzwei\r\n");
    }

    #[tokio::test]
    async fn create_mode_writes_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let t = tool();
        let out = t
            .invoke(
                &ctx_in(dir.path()),
                &call(json!({"file_path": "sub/new.txt", "old_string": "", "new_string": "fresh"})),
            )
            .await
            .unwrap();
        assert!(!out.is_error, "{}", out.content);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("sub/new.txt")).unwrap(),
            "fresh"
        );
    }

    #[tokio::test]
    async fn create_mode_rejects_existing_file_and_records_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "existing").unwrap();
        let t = tool();
        let ctx = ctx_in(dir.path());
        let out = t
            .invoke(
                &ctx,
                &call(json!({"file_path": "a.txt", "old_string": "", "new_string": "existing"})),
            )
            .await
            .unwrap();
        assert!(out.is_error);
        assert!(out.content.contains("already exists"));
        assert!(
            t.guard
                .history()
                .latest(&ctx.session_id, &path.to_string_lossy())
                .is_none(),
            "no version may be recorded for a rejected edit"
        );
    }

    #[tokio::test]
    async fn ambiguous_match_is_distinguishable_from_no_match() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "dup dup\n").unwrap();
        let t = tool();
        let ctx = ctx_in(dir.path());
        t.guard.mark_read(&ctx.session_id, &path);

        let multi = t
            .invoke(
                &ctx,
                &call(json!({"file_path": "a.txt", "old_string": "dup", "new_string": "x"})),
            )
            .await
            .unwrap();
        assert!(multi.content.contains("2 locations"));

        let none = t
            .invoke(
                &ctx,
                &call(json!({"file_path": "a.txt", "old_string": "absent", "new_string": "x"})),
            )
            .await
            .unwrap();
        assert!(none.content.contains("not found"));
    }

    #[tokio::test]
    async fn permission_denied_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "keep me\n").unwrap();
        let t = EditTool {
            guard: Arc::new(FileGuard::new(FileHistoryStore::new())),
            permissions: PermissionService::new(&PermissionConfig::default()),
        };
        let ctx = ctx_in(dir.path());
        t.guard.mark_read(&ctx.session_id, &path);
        let res = t
            .invoke(
                &ctx,
                &call(json!({"file_path": "a.txt", "old_string": "keep", "new_string": "kill"})),
            )
            .await;
        assert!(matches!(res, Err(ToolError::PermissionDenied(_))));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "keep me\n");
    }
}
