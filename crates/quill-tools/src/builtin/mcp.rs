// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::permission::PermissionService;
use crate::tool::{Tool, ToolCall, ToolCtx, ToolError, ToolOutput, ToolOutputPart};

/// A tool advertised by an MCP server.
#[derive(Debug, Clone)]
pub struct McpToolDef {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Content returned by an MCP tool invocation.
#[derive(Debug, Clone)]
pub enum McpContent {
    Text(String),
    /// Base64 payload with its mime type (images and other media).
    Media { data: String, mime: String },
}

/// Model-Context-Protocol collaborator.  Transport, handshake, and tool
/// caching live with the embedding application.
#[async_trait]
pub trait McpHost: Send + Sync {
    fn server_name(&self) -> &str;
    async fn list_tools(&self) -> anyhow::Result<Vec<McpToolDef>>;
    async fn run_tool(&self, tool: &str, input: Value) -> anyhow::Result<McpContent>;
}

/// Bridge adapter: one registered tool per MCP server tool, named
/// `mcp_<server>_<tool>`, with the schema the server advertised.
/// Permission scope uses the working directory as path since the server's
/// side effects are not path-addressable from here.
pub struct McpTool {
    host: Arc<dyn McpHost>,
    def: McpToolDef,
    bridged_name: String,
    permissions: Arc<PermissionService>,
}

/// Enumerate a server's tools and wrap each one for the registry.
pub async fn load_mcp_tools(
    host: Arc<dyn McpHost>,
    permissions: Arc<PermissionService>,
) -> anyhow::Result<Vec<McpTool>> {
    let defs = host.list_tools().await?;
    debug!(server = host.server_name(), count = defs.len(), "loaded MCP tools");
    Ok(defs
        .into_iter()
        .map(|def| McpTool {
            bridged_name: format!("mcp_{}_{}", host.server_name(), def.name),
            host: Arc::clone(&host),
            def,
            permissions: Arc::clone(&permissions),
        })
        .collect())
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.bridged_name
    }

    fn description(&self) -> &str {
        &self.def.description
    }

    fn parameters_schema(&self) -> Value {
        self.def.input_schema.clone()
    }

    async fn invoke(&self, ctx: &ToolCtx, call: &ToolCall) -> Result<ToolOutput, ToolError> {
        self.permissions
            .request(
                ctx,
                &self.bridged_name,
                "invoke",
                &ctx.working_dir.to_string_lossy(),
                &self.def.description,
                call.args.clone(),
            )
            .await?;

        let run = self.host.run_tool(&self.def.name, call.args.clone());
        let result = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                return Ok(ToolOutput::err(&call.id, "MCP call canceled"));
            }
            r = run => r,
        };

        match result {
            Ok(McpContent::Text(text)) => Ok(ToolOutput::ok(&call.id, text)),
            Ok(McpContent::Media { data, mime }) => {
                if !mime.starts_with("image/") {
                    return Ok(ToolOutput::err(
                        &call.id,
                        format!("unsupported media type from MCP server: {mime}"),
                    ));
                }
                if !ctx.supports_images {
                    return Ok(ToolOutput::err(
                        &call.id,
                        "MCP server returned an image and the current model does not accept image input",
                    ));
                }
                Ok(ToolOutput::with_parts(
                    &call.id,
                    vec![ToolOutputPart::Image(format!("data:{mime};base64,{data}"))],
                ))
            }
            Err(e) => Ok(ToolOutput::err(&call.id, format!("MCP error: {e}"))),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
