// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::fsutil::absolutize;
use crate::tool::{Tool, ToolCall, ToolCtx, ToolError, ToolOutput};

/// Maximum matches returned; results beyond this are flagged as truncated.
const MAX_MATCHES: usize = 100;

/// Per-line byte cap in the match output.
const MAX_LINE_BYTES: usize = 500;

/// Content search.  Uses ripgrep when it is on PATH, otherwise a regex
/// walk that honors `.gitignore` / `.quillignore` and skips hidden files.
/// Matches are sorted by file modification time, newest first.
pub struct GrepTool;

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &str {
        "grep"
    }

    fn description(&self) -> &str {
        "Search file contents with a regular expression.\n\
         pattern: full regex syntax (set literal_text=true to match verbatim).\n\
         include: glob filter such as '*.rs' or '**/*.{ts,tsx}'.\n\
         Returns up to 100 matches sorted by file modification time (newest\n\
         first), each line capped at 500 bytes.  Honors .gitignore and\n\
         .quillignore."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Regular expression to search for"
                },
                "path": {
                    "type": "string",
                    "description": "File or directory to search (default: working directory)"
                },
                "include": {
                    "type": "string",
                    "description": "Glob filter for file names, e.g. '*.rs'"
                },
                "literal_text": {
                    "type": "boolean",
                    "description": "Treat pattern as a literal string instead of a regex"
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
        let path = absolutize(
            &ctx.working_dir,
            call.args.get("path").and_then(|v| v.as_str()).unwrap_or("."),
        );
        let include = call
            .args
            .get("include")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let literal = call
            .args
            .get("literal_text")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        debug!(pattern = %pattern, path = %path.display(), literal, "grep tool");

        let result = if has_ripgrep().await {
            run_rg(&pattern, &path, include.as_deref(), literal).await
        } else {
            run_walk(&pattern, &path, include.as_deref(), literal)
        };

        match result {
            Ok(matches) if matches.is_empty() => Ok(ToolOutput::ok(&call.id, "(no matches)")),
            Ok(matches) => {
                let truncated = matches.len() > MAX_MATCHES;
                let mut lines: Vec<String> = matches
                    .into_iter()
                    .take(MAX_MATCHES)
                    .map(|m| cap_line(&m))
                    .collect();
                if truncated {
                    lines.push(format!(
                        "...[truncated at {MAX_MATCHES} matches — narrow with path= or include=]"
                    ));
                }
                Ok(ToolOutput::ok(&call.id, lines.join("\n"))
                    .with_metadata(json!({ "truncated": truncated })))
            }
            Err(e) => Ok(ToolOutput::err(&call.id, format!("grep error: {e}"))),
        }
    }
}

fn cap_line(line: &str) -> String {
    if line.len() <= MAX_LINE_BYTES {
        return line.to_string();
    }
    let mut cut = MAX_LINE_BYTES;
    while !line.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &line[..cut])
}

async fn has_ripgrep() -> bool {
    tokio::process::Command::new("rg")
        .arg("--version")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

/// ripgrep path: `--sortr=modified` gives the newest-file-first ordering
/// directly.
async fn run_rg(
    pattern: &str,
    path: &std::path::Path,
    include: Option<&str>,
    literal: bool,
) -> anyhow::Result<Vec<String>> {
    let mut args: Vec<String> = vec![
        "--color".into(),
        "never".into(),
        "--no-heading".into(),
        "--with-filename".into(),
        "--line-number".into(),
        "--sortr".into(),
        "modified".into(),
    ];
    if literal {
        args.push("--fixed-strings".into());
    }
    if let Some(glob) = include {
        args.push("--glob".into());
        args.push(glob.into());
    }
    args.push("--".into());
    args.push(pattern.into());
    args.push(path.to_string_lossy().into_owned());

    let output = tokio::process::Command::new("rg")
        .args(&args)
        .stdin(std::process::Stdio::null())
        .output()
        .await?;

    // rg exits 1 on "no matches" — not an error.
    if !output.status.success() && output.status.code() != Some(1) {
        anyhow::bail!(
            "rg failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        // One extra entry beyond the cap lets the caller detect truncation.
        .take(MAX_MATCHES + 1)
        .map(str::to_string)
        .collect())
}

/// Fallback: walk with gitignore semantics and apply the regex per line.
fn run_walk(
    pattern: &str,
    path: &std::path::Path,
    include: Option<&str>,
    literal: bool,
) -> anyhow::Result<Vec<String>> {
    let source = if literal {
        regex::escape(pattern)
    } else {
        pattern.to_string()
    };
    let re = regex::Regex::new(&source)?;

    let include_set = match include {
        Some(glob) => Some(
            globset::GlobSetBuilder::new()
                .add(globset::Glob::new(glob)?)
                .build()?,
        ),
        None => None,
    };

    let walker = ignore::WalkBuilder::new(path)
        .hidden(true)
        .git_ignore(true)
        .add_custom_ignore_filename(".quillignore")
        .build();

    // (mtime, "path:line:text") pairs; sorted newest-first below.
    let mut hits: Vec<(std::time::SystemTime, String)> = Vec::new();
    for entry in walker.flatten() {
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        if let Some(set) = &include_set {
            let name = entry.file_name().to_string_lossy();
            if !set.is_match(name.as_ref()) && !set.is_match(entry.path()) {
                continue;
            }
        }
        let content = match std::fs::read_to_string(entry.path()) {
            Ok(c) => c,
            Err(_) => continue, // binary or unreadable
        };
        let mtime = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
        for (i, line) in content.lines().enumerate() {
            if re.is_match(line) {
                hits.push((mtime, format!("{}:{}:{}", entry.path().display(), i + 1, line)));
            }
        }
        if hits.len() > MAX_MATCHES * 4 {
            break;
        }
    }

    hits.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(hits.into_iter().map(|(_, line)| line).take(MAX_MATCHES + 1).collect())
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
        ToolCall { id: "g1".into(), name: "grep".into(), args }
    }

    #[tokio::test]
    async fn finds_pattern_in_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "fn needle_here() {}\n").unwrap();
        std::fs::write(dir.path().join("b.rs"), "fn other() {}\n").unwrap();
        let out = GrepTool
            .invoke(&ctx_in(dir.path()), &call(json!({"pattern": "needle_here"})))
            .await
            .unwrap();
        assert!(!out.is_error, "{}", out.content);
        assert!(out.content.contains("a.rs"));
        assert!(!out.content.contains("b.rs"));
    }

    #[tokio::test]
    async fn no_match_returns_marker() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "nothing\n").unwrap();
        let out = GrepTool
            .invoke(
                &ctx_in(dir.path()),
                &call(json!({"pattern": "zzz_absent_zzz"})),
            )
            .await
            .unwrap();
        assert!(!out.is_error);
        assert!(out.content.contains("no matches"));
    }

    #[tokio::test]
    async fn literal_text_disables_regex() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "price is $5.00 (sale)\n").unwrap();
        let out = GrepTool
            .invoke(
                &ctx_in(dir.path()),
                &call(json!({"pattern": "$5.00 (sale)", "literal_text": true})),
            )
            .await
            .unwrap();
        assert!(!out.is_error, "{}", out.content);
        assert!(out.content.contains("a.txt"));
    }

    #[tokio::test]
    async fn include_filters_by_glob() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "shared_token\n").unwrap();
        std::fs::write(dir.path().join("b.md"), "shared_token\n").unwrap();
        let out = GrepTool
            .invoke(
                &ctx_in(dir.path()),
                &call(json!({"pattern": "shared_token", "include": "*.rs"})),
            )
            .await
            .unwrap();
        assert!(out.content.contains("a.rs"));
        assert!(!out.content.contains("b.md"));
    }

    #[tokio::test]
    async fn truncates_at_match_cap() {
        let dir = tempfile::tempdir().unwrap();
        let body: String = (0..150).map(|i| format!("match_me line {i}\n")).collect();
        std::fs::write(dir.path().join("big.txt"), body).unwrap();
        let out = GrepTool
            .invoke(&ctx_in(dir.path()), &call(json!({"pattern": "match_me"})))
            .await
            .unwrap();
        assert!(!out.is_error);
        assert_eq!(out.metadata["truncated"], true);
        assert!(out.content.contains("truncated at 100 matches"));
    }

    #[tokio::test]
    async fn long_match_lines_are_capped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("long.txt"),
            format!("needle {}\n", "x".repeat(2000)),
        )
        .unwrap();
        let out = GrepTool
            .invoke(&ctx_in(dir.path()), &call(json!({"pattern": "needle"})))
            .await
            .unwrap();
        let first = out.content.lines().next().unwrap();
        assert!(first.len() < 600, "line must be capped: {} bytes", first.len());
    }

    #[tokio::test]
    async fn missing_pattern_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let out = GrepTool
            .invoke(&ctx_in(dir.path()), &call(json!({})))
            .await
            .unwrap();
        assert!(out.is_error);
    }

    #[test]
    fn walk_fallback_honors_gitignore() {
        let dir = tempfile::tempdir().unwrap();
        // An enclosing git repo makes .gitignore authoritative for `ignore`.
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".gitignore"), "ignored.txt\n").unwrap();
        std::fs::write(dir.path().join("ignored.txt"), "findme\n").unwrap();
        std::fs::write(dir.path().join("kept.txt"), "findme\n").unwrap();
        let hits = run_walk("findme", dir.path(), None, false).unwrap();
        let joined = hits.join("\n");
        assert!(joined.contains("kept.txt"));
        assert!(!joined.contains("ignored.txt"));
    }
}
