// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_json::{json, Value};
use tracing::debug;
use walkdir::WalkDir;

use crate::fsutil::absolutize;
use crate::tool::{Tool, ToolCall, ToolCtx, ToolError, ToolOutput};

/// Tree renderer for directories.
pub struct LsTool {
    /// Entry cap; the tree is cut with a notice when exceeded.
    pub max_files: usize,
}

impl Default for LsTool {
    fn default() -> Self {
        Self { max_files: 1000 }
    }
}

#[async_trait]
impl Tool for LsTool {
    fn name(&self) -> &str {
        "ls"
    }

    fn description(&self) -> &str {
        "Render a directory tree.  Hidden entries are skipped; 'ignore' takes\n\
         glob patterns to exclude; 'depth' bounds recursion.  Capped at 1000\n\
         entries — prefer glob or grep for anything targeted."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory to list (default: working directory)"
                },
                "ignore": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Glob patterns to exclude, e.g. [\"*.o\", \"target/**\"]"
                },
                "depth": {
                    "type": "integer",
                    "description": "Maximum recursion depth (default: unlimited)"
                }
            },
            "additionalProperties": false
        })
    }

    fn parallel_safe(&self) -> bool {
        true
    }

    async fn invoke(&self, ctx: &ToolCtx, call: &ToolCall) -> Result<ToolOutput, ToolError> {
        let path_arg = call.args.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let depth = call.args.get("depth").and_then(|v| v.as_u64()).map(|d| d as usize);
        let ignore_patterns: Vec<String> = call
            .args
            .get("ignore")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|p| p.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let root = absolutize(&ctx.working_dir, path_arg);
        debug!(path = %root.display(), ?depth, "ls tool");

        if !root.is_dir() {
            return Ok(ToolOutput::err(
                &call.id,
                format!("{} is not a directory", root.display()),
            ));
        }

        let ignore_set = match build_globset(&ignore_patterns) {
            Ok(s) => s,
            Err(e) => return Ok(ToolOutput::err(&call.id, format!("bad ignore pattern: {e}"))),
        };

        let mut walker = WalkDir::new(&root).min_depth(1).sort_by_file_name();
        if let Some(d) = depth {
            walker = walker.max_depth(d.max(1));
        }

        let mut lines: Vec<String> = vec![format!("{}/", root.display())];
        let mut count = 0usize;
        let mut truncated = false;

        let iter = walker.into_iter().filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            if name.starts_with('.') {
                return false;
            }
            let rel = e.path().strip_prefix(&root).unwrap_or(e.path());
            !ignore_set.is_match(rel)
        });

        for entry in iter.flatten() {
            if count >= self.max_files {
                truncated = true;
                break;
            }
            let rel = entry.path().strip_prefix(&root).unwrap_or(entry.path());
            let indent = "  ".repeat(rel.components().count().saturating_sub(1));
            let name = entry.file_name().to_string_lossy();
            if entry.file_type().is_dir() {
                lines.push(format!("{indent}{name}/"));
            } else {
                lines.push(format!("{indent}{name}"));
            }
            count += 1;
        }

        let mut content = lines.join("\n");
        if truncated {
            content.push_str(&format!(
                "\n...[truncated at {} entries — pass a deeper path or use glob]",
                self.max_files
            ));
        }
        Ok(ToolOutput::ok(&call.id, content))
    }
}

fn build_globset(patterns: &[String]) -> anyhow::Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for p in patterns {
        builder.add(Glob::new(p)?);
    }
    Ok(builder.build()?)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
