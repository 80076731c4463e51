// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::fsutil::absolutize;
use crate::tool::{Tool, ToolCall, ToolCtx, ToolError, ToolOutput};

/// Maximum results returned.
const MAX_RESULTS: usize = 100;

/// File-name pattern matching.  Uses `rg --files --glob` when ripgrep is
/// available, otherwise a gitignore-aware walk with a compiled glob set.
/// Results are sorted by path length ascending so the most proximate files
/// come first.
pub struct GlobTool;

#[async_trait]
impl Tool for GlobTool {
    fn name(&self) -> &str {
        "glob"
    }

    fn description(&self) -> &str {
        "Find files whose path matches a glob pattern, e.g. '**/*.rs' or\n\
         'src/**/test_*.py'.  Returns up to 100 paths, shortest first.\n\
         Honors .gitignore and .quillignore."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Glob pattern to match file paths against"
                },
                "path": {
                    "type": "string",
                    "description": "Directory to search in (default: working directory)"
                }
            },
            "required": ["pattern"],
            "additionalProperties": false
        })
    }

    fn parallel_safe(&self) -> bool {
        true
    }

    async fn invoke(&self, ctx: &ToolCtx, call: &ToolCall) -> Result<ToolOutput, ToolError> {
        let pattern = match call.args.get("pattern").and_then(|v| v.as_str()) {
            Some(p) => p.to_string(),
            None => return Ok(ToolOutput::err(&call.id, "missing required parameter 'pattern'")),
        };
        let root = absolutize(
            &ctx.working_dir,
            call.args.get("path").and_then(|v| v.as_str()).unwrap_or("."),
        );

        debug!(pattern = %pattern, path = %root.display(), "glob tool");

        let mut paths = match run_rg_files(&pattern, &root).await {
            Ok(Some(paths)) => paths,
            Ok(None) | Err(_) => match run_walk(&pattern, &root) {
                Ok(paths) => paths,
                Err(e) => return Ok(ToolOutput::err(&call.id, format!("glob error: {e}"))),
            },
        };

        if paths.is_empty() {
            return Ok(ToolOutput::ok(&call.id, "(no files matched)"));
        }

        paths.sort_by_key(|p| p.len());
        let truncated = paths.len() > MAX_RESULTS;
        let mut lines: Vec<String> = paths.into_iter().take(MAX_RESULTS).collect();
        if truncated {
            lines.push(format!("...[truncated at {MAX_RESULTS} results]"));
        }
        Ok(ToolOutput::ok(&call.id, lines.join("\n"))
            .with_metadata(json!({ "truncated": truncated })))
    }
}

/// Returns `Ok(None)` when ripgrep is not on PATH.
async fn run_rg_files(
    pattern: &str,
    root: &std::path::Path,
) -> anyhow::Result<Option<Vec<String>>> {
    let output = match tokio::process::Command::new("rg")
        .args(["--files", "--glob", pattern])
        .arg(root)
        .stdin(std::process::Stdio::null())
        .output()
        .await
    {
        Ok(o) => o,
        Err(_) => return Ok(None),
    };
    if !output.status.success() && output.status.code() != Some(1) {
        anyhow::bail!(
            "rg failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(Some(
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect(),
    ))
}

fn run_walk(pattern: &str, root: &std::path::Path) -> anyhow::Result<Vec<String>> {
    let set = globset::GlobSetBuilder::new()
        .add(globset::Glob::new(pattern)?)
        .build()?;
    let walker = ignore::WalkBuilder::new(root)
        .hidden(true)
        .git_ignore(true)
        .add_custom_ignore_filename(".quillignore")
        .build();
    let mut out = Vec::new();
    for entry in walker.flatten() {
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        if set.is_match(rel) || set.is_match(entry.path()) {
            out.push(entry.path().display().to_string());
        }
    }
    Ok(out)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;
    use std::path::Path;

    use super::*;
    use crate::tool::test_ctx;

    fn ctx_in(dir: &Path) -> ToolCtx {
        let mut ctx = test_ctx();
        ctx.working_dir = dir.to_path_buf();
        ctx
    }

    fn call(args: serde_json::Value) -> ToolCall {
        ToolCall { id: "gl1".into(), name: "glob".into(), args }
    }

    #[tokio::test]
    async fn matches_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "").unwrap();
        std::fs::write(dir.path().join("notes.md"), "").unwrap();
        let out = GlobTool
            .invoke(&ctx_in(dir.path()), &call(json!({"pattern": "**/*.rs"})))
            .await
            .unwrap();
        assert!(!out.is_error, "{}", out.content);
        assert!(out.content.contains("lib.rs"));
        assert!(!out.content.contains("notes.md"));
    }

    #[tokio::test]
    async fn results_sorted_by_path_length() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("deeply/nested/dir")).unwrap();
        std::fs::write(dir.path().join("a.rs"), "").unwrap();
        std::fs::write(dir.path().join("deeply/nested/dir/z.rs"), "").unwrap();
        let out = GlobTool
            .invoke(&ctx_in(dir.path()), &call(json!({"pattern": "**/*.rs"})))
            .await
            .unwrap();
        let lines: Vec<&str> = out.content.lines().collect();
        assert!(lines[0].contains("a.rs"), "shortest path first: {:?}", lines);
        assert!(lines[1].contains("z.rs"));
    }

    #[tokio::test]
    async fn no_match_returns_marker() {
        let dir = tempfile::tempdir().unwrap();
        let out = GlobTool
            .invoke(&ctx_in(dir.path()), &call(json!({"pattern": "**/*.zig"})))
            .await
            .unwrap();
        assert!(!out.is_error);
        assert!(out.content.contains("no files matched"));
    }

    #[tokio::test]
    async fn missing_pattern_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let out = GlobTool
            .invoke(&ctx_in(dir.path()), &call(json!({})))
            .await
            .unwrap();
        assert!(out.is_error);
    }

    #[test]
    fn walk_fallback_matches_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/x.rs"), "").unwrap();
        let paths = run_walk("src/*.rs", dir.path()).unwrap();
        assert_eq!(paths.len(), 1);
        assert!(paths[0].ends_with("src/x.rs"));
    }
}
