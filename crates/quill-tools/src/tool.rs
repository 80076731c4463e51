// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier returned by the model (forwarded verbatim)
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments
    pub args: Value,
}

/// Context carried on every tool invocation.
///
/// `session_id` and `parent_message_id` are mandatory — tools use them for
/// read marks, file history, permission scoping, and sub-agent session
/// derivation.  `cancel` is a child of the run's token; tools observe it at
/// every I/O boundary.
#[derive(Debug, Clone)]
pub struct ToolCtx {
    pub session_id: String,
    pub parent_message_id: String,
    pub tool_call_id: String,
    pub model_name: String,
    pub supports_images: bool,
    pub working_dir: PathBuf,
    pub cancel: CancellationToken,
}

impl ToolCtx {
    /// Fail fast when the mandatory identifiers are missing.
    pub fn validate(&self) -> Result<(), ToolError> {
        if self.session_id.is_empty() {
            return Err(ToolError::Context("session_id missing from tool context".into()));
        }
        if self.parent_message_id.is_empty() {
            return Err(ToolError::Context(
                "parent_message_id missing from tool context".into(),
            ));
        }
        Ok(())
    }

    /// Derive the per-call context: same session scope, fresh call id and a
    /// child cancellation token.
    pub fn for_call(&self, call_id: &str) -> Self {
        Self {
            tool_call_id: call_id.to_string(),
            cancel: self.cancel.child_token(),
            ..self.clone()
        }
    }
}

/// Typed tool failures.
///
/// Validation problems (bad arguments, missing files, unmatched edits) are
/// *not* errors at this level — they travel inside [`ToolOutput`] with
/// `is_error = true` so the model can read them and self-correct.  The
/// variants here abort or redirect the turn.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The permission gate denied the call; the turn finishes with a
    /// permission-denied marker.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The invocation context was incomplete.
    #[error("tool context error: {0}")]
    Context(String),
    /// Unexpected I/O or provider failure; aborts the turn.
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

/// A single content item in a rich tool output.
///
/// Most tools produce only `Text`.  Vision-capable tools (e.g. `view` on an
/// image file) may produce a mix of `Text` and `Image` items.
#[derive(Debug, Clone)]
pub enum ToolOutputPart {
    /// Plain UTF-8 text.
    Text(String),
    /// Base64 data URL: `data:<mime>;base64,<b64>`.
    Image(String),
}

/// The result of executing a tool.
///
/// `content` is always the plain-text representation of the output (the
/// concatenation of all `Text` parts).  `metadata` is free-form JSON made
/// available to the agent loop (e.g. `child_session_id` for cost roll-up,
/// `shell_id` for backgrounded commands); it is persisted alongside the
/// result part.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub call_id: String,
    /// Plain-text content — concatenation of all Text parts.
    pub content: String,
    /// Structured parts (text and/or images).  For tools that only return
    /// text this contains exactly one `Text` part mirroring `content`.
    pub parts: Vec<ToolOutputPart>,
    /// Free-form metadata surfaced to the agent loop and persisted with
    /// the tool result.
    pub metadata: Value,
    /// If true, the tool execution failed non-fatally (returned error message).
    pub is_error: bool,
}

impl ToolOutput {
    /// Successful plain-text result.
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let text = content.into();
        Self {
            call_id: call_id.into(),
            content: text.clone(),
            parts: vec![ToolOutputPart::Text(text)],
            metadata: Value::Null,
            is_error: false,
        }
    }

    /// Error result containing a plain-text error message.
    pub fn err(call_id: impl Into<String>, msg: impl Into<String>) -> Self {
        let text = msg.into();
        Self {
            call_id: call_id.into(),
            content: text.clone(),
            parts: vec![ToolOutputPart::Text(text)],
            metadata: Value::Null,
            is_error: true,
        }
    }

    /// Result with arbitrary parts (text and/or images).
    ///
    /// `content` is set to the concatenation of all Text parts.
    pub fn with_parts(call_id: impl Into<String>, parts: Vec<ToolOutputPart>) -> Self {
        let text = parts
            .iter()
            .filter_map(|p| match p {
                ToolOutputPart::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        Self {
            call_id: call_id.into(),
            content: text,
            parts,
            metadata: Value::Null,
            is_error: false,
        }
    }

    /// Attach metadata, builder style.
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Return `true` if this output contains at least one image part.
    pub fn has_images(&self) -> bool {
        self.parts
            .iter()
            .any(|p| matches!(p, ToolOutputPart::Image(_)))
    }
}

/// Trait that every built-in and bridged tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for parameters
    fn parameters_schema(&self) -> Value;
    /// Whether this tool may run concurrently with other tools from the
    /// same turn.  Read-only tools override to `true`; anything that
    /// mutates shared state stays serialized.
    fn parallel_safe(&self) -> bool {
        false
    }
    /// Execute the tool.  Validation failures are reported through
    /// [`ToolOutput::err`]; only the typed [`ToolError`] variants abort or
    /// redirect the turn.
    async fn invoke(&self, ctx: &ToolCtx, call: &ToolCall) -> Result<ToolOutput, ToolError>;
}

#[cfg(test)]
pub(crate) fn test_ctx() -> ToolCtx {
    ToolCtx {
        session_id: "test-session".into(),
        parent_message_id: "test-message".into(),
        tool_call_id: "test-call".into(),
        model_name: "test-model".into(),
        supports_images: false,
        working_dir: std::env::temp_dir(),
        cancel: CancellationToken::new(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
