// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::fsutil::absolutize;
use crate::tool::{Tool, ToolCall, ToolCtx, ToolError, ToolOutput};

/// How long to wait for diagnostics to settle after a change notification.
const DIAGNOSTICS_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Information,
    Hint,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
            Severity::Information => write!(f, "info"),
            Severity::Hint => write!(f, "hint"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub path: PathBuf,
    pub line: usize,
    pub severity: Severity,
    pub message: String,
    pub source: String,
}

#[derive(Debug, Clone)]
pub struct Reference {
    pub path: PathBuf,
    pub line: usize,
    pub preview: String,
}

/// Language-server collaborator consumed by the LSP tools.
///
/// The concrete client (initialization, transport, per-language routing)
/// lives with the embedding application; the tools only need these four
/// capabilities.
#[async_trait]
pub trait LspHost: Send + Sync {
    /// Open/notify every registered client that handles the path's language.
    async fn notify_change(&self, path: &Path);
    /// Wait for diagnostics to settle, then snapshot them.  A `None` path
    /// returns diagnostics for every open file.
    async fn diagnostics(&self, path: Option<&Path>, timeout: Duration) -> Vec<Diagnostic>;
    /// Find references to a symbol, optionally scoped to one file.
    async fn references(&self, symbol: &str, path: Option<&Path>) -> Vec<Reference>;
    /// Force-restart one client by name, or all of them in parallel.
    async fn restart(&self, name: Option<&str>) -> anyhow::Result<()>;
}

fn format_diagnostics(diags: &[Diagnostic]) -> String {
    if diags.is_empty() {
        return "(no diagnostics)".to_string();
    }
    diags
        .iter()
        .map(|d| {
            format!(
                "{}:{}: {} [{}] {}",
                d.path.display(),
                d.line,
                d.severity,
                d.source,
                d.message
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Snapshot language-server diagnostics for one file or the whole project.
pub struct DiagnosticsTool {
    pub host: Arc<dyn LspHost>,
}

#[async_trait]
impl Tool for DiagnosticsTool {
    fn name(&self) -> &str {
        "diagnostics"
    }

    fn description(&self) -> &str {
        "Report language-server diagnostics (errors, warnings) for a file,\n\
         or for every open file when file_path is omitted."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "File to check; omit for project-wide diagnostics"
                }
            },
            "additionalProperties": false
        })
    }

    fn parallel_safe(&self) -> bool {
        true
    }

    async fn invoke(&self, ctx: &ToolCtx, call: &ToolCall) -> Result<ToolOutput, ToolError> {
        let path = call
            .args
            .get("file_path")
            .and_then(|v| v.as_str())
            .map(|p| absolutize(&ctx.working_dir, p));
        if let Some(p) = &path {
            self.host.notify_change(p).await;
        }
        let diags = self
            .host
            .diagnostics(path.as_deref(), DIAGNOSTICS_TIMEOUT)
            .await;
        Ok(ToolOutput::ok(&call.id, format_diagnostics(&diags)))
    }
}

/// Find references to a symbol via the language server.
pub struct LspReferencesTool {
    pub host: Arc<dyn LspHost>,
}

#[async_trait]
impl Tool for LspReferencesTool {
    fn name(&self) -> &str {
        "lsp_references"
    }

    fn description(&self) -> &str {
        "Find references to a symbol using the language server.\n\
         Pass path to scope the lookup to one file."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "symbol": {
                    "type": "string",
                    "description": "Symbol name to look up"
                },
                "path": {
                    "type": "string",
                    "description": "Optional file to scope the lookup to"
                }
            },
            "required": ["symbol"],
            "additionalProperties": false
        })
    }

    fn parallel_safe(&self) -> bool {
        true
    }

    async fn invoke(&self, ctx: &ToolCtx, call: &ToolCall) -> Result<ToolOutput, ToolError> {
        let symbol = match call.args.get("symbol").and_then(|v| v.as_str()) {
            Some(s) => s.to_string(),
            None => return Ok(ToolOutput::err(&call.id, "missing required parameter 'symbol'")),
        };
        let path = call
            .args
            .get("path")
            .and_then(|v| v.as_str())
            .map(|p| absolutize(&ctx.working_dir, p));

        let refs = self.host.references(&symbol, path.as_deref()).await;
        if refs.is_empty() {
            return Ok(ToolOutput::ok(&call.id, format!("(no references to {symbol})")));
        }
        let lines: Vec<String> = refs
            .iter()
            .map(|r| format!("{}:{}: {}", r.path.display(), r.line, r.preview))
            .collect();
        Ok(ToolOutput::ok(&call.id, lines.join("\n")))
    }
}

/// Restart one or all language-server clients.
pub struct LspRestartTool {
    pub host: Arc<dyn LspHost>,
}

#[async_trait]
impl Tool for LspRestartTool {
    fn name(&self) -> &str {
        "lsp_restart"
    }

    fn description(&self) -> &str {
        "Restart a language-server client by name, or all clients when no\n\
         name is given.  Use when diagnostics look stale."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": {
                    "type": "string",
                    "description": "Client to restart; omit for all"
                }
            },
            "additionalProperties": false
        })
    }

    async fn invoke(&self, _ctx: &ToolCtx, call: &ToolCall) -> Result<ToolOutput, ToolError> {
        let name = call.args.get("name").and_then(|v| v.as_str());
        match self.host.restart(name).await {
            Ok(()) => Ok(ToolOutput::ok(
                &call.id,
                match name {
                    Some(n) => format!("restarted language server {n}"),
                    None => "restarted all language servers".to_string(),
                },
            )),
            Err(e) => Ok(ToolOutput::err(&call.id, format!("restart failed: {e}"))),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
