// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};
use tracing::debug;

use crate::fsutil::{absolutize, is_under, FileGuard};
use crate::permission::PermissionService;
use crate::tool::{Tool, ToolCall, ToolCtx, ToolError, ToolOutput, ToolOutputPart};

/// Default number of lines returned when the caller does not specify a limit.
const DEFAULT_LINE_LIMIT: usize = 2000;

/// Per-line byte cap; longer lines are cut with an ellipsis.
const MAX_LINE_BYTES: usize = 2000;

/// Files larger than this are refused (skills paths excepted).
const MAX_FILE_BYTES: u64 = 5 * 1024 * 1024;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "bmp"];

/// Read a file with 1-based line numbers; the read is recorded so that the
/// edit tools will accept subsequent mutations of the path.
pub struct ViewTool {
    pub guard: Arc<FileGuard>,
    pub permissions: Arc<PermissionService>,
    /// Directories readable without an out-of-working-dir permission and
    /// without the size cap (resolved through symlinks).
    pub skills_paths: Vec<PathBuf>,
}

#[async_trait]
impl Tool for ViewTool {
    fn name(&self) -> &str {
        "view"
    }

    fn description(&self) -> &str {
        "Read a file and return its content with 1-based line numbers.\n\
         Defaults to the first 2000 lines; use offset and limit to paginate.\n\
         Lines longer than 2000 bytes are cut with an ellipsis.\n\
         Image files (png/jpg/gif/webp/bmp) are returned as image content\n\
         when the model supports vision.\n\
         You must view a file before editing it."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Absolute or working-dir-relative path to the file"
                },
                "offset": {
                    "type": "integer",
                    "description": "1-indexed line number to start reading from (default 1)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to return (default 2000)"
                }
            },
            "required": ["file_path"],
            "additionalProperties": false
        })
    }

    fn parallel_safe(&self) -> bool {
        true
    }

    async fn invoke(&self, ctx: &ToolCtx, call: &ToolCall) -> Result<ToolOutput, ToolError> {
        let path_arg = match call.args.get("file_path").and_then(|v| v.as_str()) {
            Some(p) => p,
            None => return Ok(ToolOutput::err(&call.id, "missing required parameter 'file_path'")),
        };
        let offset = call.args.get("offset").and_then(|v| v.as_u64()).unwrap_or(1).max(1) as usize;
        let limit = call
            .args
            .get("limit")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_LINE_LIMIT as u64) as usize;

        let path = absolutize(&ctx.working_dir, path_arg);
        debug!(path = %path.display(), offset, limit, "view tool");

        let in_skills = self.is_skills_path(&path);
        if !in_skills && !is_under(&path, &ctx.working_dir) {
            self.permissions
                .request(
                    ctx,
                    "view",
                    "read",
                    &path.to_string_lossy(),
                    "read a file outside the working directory",
                    json!({ "file_path": path.to_string_lossy() }),
                )
                .await?;
        }

        let meta = match std::fs::metadata(&path) {
            Ok(m) => m,
            Err(e) => return Ok(ToolOutput::err(&call.id, format!("cannot read {}: {e}", path.display()))),
        };
        if meta.is_dir() {
            return Ok(ToolOutput::err(
                &call.id,
                format!("{} is a directory; use ls instead", path.display()),
            ));
        }
        if !in_skills && meta.len() > MAX_FILE_BYTES {
            return Ok(ToolOutput::err(
                &call.id,
                format!(
                    "{} is {} bytes, above the {} byte limit; use grep to locate the region you need",
                    path.display(),
                    meta.len(),
                    MAX_FILE_BYTES
                ),
            ));
        }

        // ── Image files ───────────────────────────────────────────────────────
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            if !ctx.supports_images {
                return Ok(ToolOutput::err(
                    &call.id,
                    format!("{} is an image and the current model does not accept image input", path.display()),
                ));
            }
            let bytes = match std::fs::read(&path) {
                Ok(b) => b,
                Err(e) => return Ok(ToolOutput::err(&call.id, format!("read error: {e}"))),
            };
            let mime = match ext.as_str() {
                "jpg" | "jpeg" => "image/jpeg",
                "gif" => "image/gif",
                "webp" => "image/webp",
                "bmp" => "image/bmp",
                _ => "image/png",
            };
            let data_url = format!(
                "data:{mime};base64,{}",
                base64::engine::general_purpose::STANDARD.encode(&bytes)
            );
            self.guard.mark_read(&ctx.session_id, &path);
            return Ok(ToolOutput::with_parts(
                &call.id,
                vec![
                    ToolOutputPart::Text(format!("Image file: {}", path.display())),
                    ToolOutputPart::Image(data_url),
                ],
            ));
        }

        // ── Text file ─────────────────────────────────────────────────────────
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) => return Ok(ToolOutput::err(&call.id, format!("read error: {e}"))),
        };
        let text = String::from_utf8_lossy(&bytes);
        let all_lines: Vec<&str> = text.lines().collect();
        let total = all_lines.len();
        let start = offset - 1;

        let mut selected: Vec<String> = Vec::new();
        for (i, line) in all_lines.iter().enumerate().skip(start).take(limit) {
            let rendered = if line.len() > MAX_LINE_BYTES {
                let mut cut = MAX_LINE_BYTES;
                while !line.is_char_boundary(cut) {
                    cut -= 1;
                }
                format!("L{}:{}…", i + 1, &line[..cut])
            } else {
                format!("L{}:{}", i + 1, line)
            };
            selected.push(rendered);
        }

        let last_shown = start + selected.len();
        let mut content = selected.join("\n");
        if last_shown < total {
            content.push_str(&format!(
                "\n...[{} more lines — showing L{}-L{} of {}; use offset={} to continue]",
                total - last_shown,
                offset,
                offset + selected.len().saturating_sub(1),
                total,
                last_shown + 1
            ));
        }

        self.guard.mark_read(&ctx.session_id, &path);
        Ok(ToolOutput::ok(&call.id, content))
    }
}

impl ViewTool {
    fn is_skills_path(&self, path: &Path) -> bool {
        let resolved = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        self.skills_paths.iter().any(|skills| {
            let skills = skills.canonicalize().unwrap_or_else(|_| skills.clone());
            resolved.starts_with(&skills)
        })
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

    fn tool() -> ViewTool {
        ViewTool {
            guard: Arc::new(FileGuard::new(FileHistoryStore::new())),
            permissions: PermissionService::new(&PermissionConfig { yolo: true, ..Default::default() }),
            skills_paths: vec![],
        }
    }

    fn call(args: serde_json::Value) -> ToolCall {
        ToolCall { id: "v1".into(), name: "view".into(), args }
    }

    fn ctx_in(dir: &Path) -> ToolCtx {
        let mut ctx = test_ctx();
        ctx.working_dir = dir.to_path_buf();
        ctx
    }

    #[tokio::test]
    async fn reads_file_with_line_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "alpha\nbeta\n").unwrap();
        let out = tool()
            .invoke(&ctx_in(dir.path()), &call(json!({"file_path": "a.txt"})))
            .await
            .unwrap();
        assert!(!out.is_error, "{}", out.content);
        assert!(out.content.contains("L1:alpha"));
        assert!(out.content.contains("L2:beta"));
    }

    #[tokio::test]
    async fn records_read_mark() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "x\n").unwrap();
        let t = tool();
        let ctx = ctx_in(dir.path());
        t.invoke(&ctx, &call(json!({"file_path": "a.txt"}))).await.unwrap();
        assert!(t.guard.ensure_read(&ctx.session_id, &path).is_ok());
    }

    #[tokio::test]
    async fn default_limit_is_2000_lines_with_offset_hint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.txt");
        let content: String = (1..=2001).map(|i| format!("line{i}\n")).collect();
        std::fs::write(&path, content).unwrap();
        let out = tool()
            .invoke(&ctx_in(dir.path()), &call(json!({"file_path": "big.txt"})))
            .await
            .unwrap();
        assert!(out.content.contains("L2000:line2000"));
        assert!(!out.content.contains("L2001:line2001"));
        assert!(out.content.contains("offset=2001"), "{}", out.content);
    }

    #[tokio::test]
    async fn offset_and_limit_paginate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.txt");
        std::fs::write(&path, "a\nb\nc\nd\n").unwrap();
        let out = tool()
            .invoke(
                &ctx_in(dir.path()),
                &call(json!({"file_path": "p.txt", "offset": 2, "limit": 2})),
            )
            .await
            .unwrap();
        assert!(out.content.contains("L2:b"));
        assert!(out.content.contains("L3:c"));
        assert!(!out.content.contains("L1:a"));
        assert!(!out.content.contains("L4:d"));
    }

    #[tokio::test]
    async fn long_line_is_cut_with_ellipsis() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("long.txt");
        std::fs::write(&path, format!("{}\n", "x".repeat(3000))).unwrap();
        let out = tool()
            .invoke(&ctx_in(dir.path()), &call(json!({"file_path": "long.txt"})))
            .await
            .unwrap();
        assert!(out.content.contains('…'));
        assert!(out.content.len() < 2500);
    }

    #[tokio::test]
    async fn directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let out = tool()
            .invoke(
                &ctx_in(dir.path()),
                &call(json!({"file_path": dir.path().to_string_lossy()})),
            )
            .await
            .unwrap();
        assert!(out.is_error);
        assert!(out.content.contains("directory"));
    }

    #[tokio::test]
    async fn missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let out = tool()
            .invoke(&ctx_in(dir.path()), &call(json!({"file_path": "ghost.txt"})))
            .await
            .unwrap();
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn image_requires_vision_support() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pic.png");
        std::fs::write(&path, [0x89, 0x50, 0x4e, 0x47]).unwrap();
        let out = tool()
            .invoke(&ctx_in(dir.path()), &call(json!({"file_path": "pic.png"})))
            .await
            .unwrap();
        assert!(out.is_error);
        assert!(out.content.contains("image"));
    }

    #[tokio::test]
    async fn image_returned_as_data_url_when_supported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pic.png");
        std::fs::write(&path, [0x89, 0x50, 0x4e, 0x47]).unwrap();
        let mut ctx = ctx_in(dir.path());
        ctx.supports_images = true;
        let out = tool()
            .invoke(&ctx, &call(json!({"file_path": "pic.png"})))
            .await
            .unwrap();
        assert!(!out.is_error);
        assert!(out.has_images());
    }

    #[tokio::test]
    async fn out_of_working_dir_read_denied_without_approver() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let path = outside.path().join("secret.txt");
        std::fs::write(&path, "s").unwrap();
        let t = ViewTool {
            guard: Arc::new(FileGuard::new(FileHistoryStore::new())),
            permissions: PermissionService::new(&PermissionConfig::default()),
            skills_paths: vec![],
        };
        let res = t
            .invoke(
                &ctx_in(dir.path()),
                &call(json!({"file_path": path.to_string_lossy()})),
            )
            .await;
        assert!(matches!(res, Err(ToolError::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn skills_path_skips_permission_and_size_cap() {
        let dir = tempfile::tempdir().unwrap();
        let skills = tempfile::tempdir().unwrap();
        let path = skills.path().join("guide.md");
        std::fs::write(&path, "skill content\n").unwrap();
        let t = ViewTool {
            guard: Arc::new(FileGuard::new(FileHistoryStore::new())),
            permissions: PermissionService::new(&PermissionConfig::default()),
            skills_paths: vec![skills.path().to_path_buf()],
        };
        let out = t
            .invoke(
                &ctx_in(dir.path()),
                &call(json!({"file_path": path.to_string_lossy()})),
            )
            .await
            .unwrap();
        assert!(!out.is_error, "{}", out.content);
        assert!(out.content.contains("skill content"));
    }
}
