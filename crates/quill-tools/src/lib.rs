// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod builtin;
pub mod fsutil;
pub mod permission;
pub mod registry;
pub mod shell;
mod tool;

pub use builtin::bash::BashTool;
pub use builtin::edit::EditTool;
pub use builtin::fetch::{DownloadTool, FetchTool};
pub use builtin::glob::GlobTool;
pub use builtin::grep::GrepTool;
pub use builtin::job::{JobKillTool, JobOutputTool};
pub use builtin::ls::LsTool;
pub use builtin::lsp::{
    Diagnostic, DiagnosticsTool, LspHost, LspReferencesTool, LspRestartTool, Reference, Severity,
};
pub use builtin::mcp::{load_mcp_tools, McpContent, McpHost, McpTool, McpToolDef};
pub use builtin::multiedit::MultiEditTool;
pub use builtin::sourcegraph::SourcegraphTool;
pub use builtin::todos::TodosTool;
pub use builtin::view::ViewTool;
pub use builtin::web::{WebFetchTool, WebSearchTool};
pub use builtin::write_file::WriteTool;
pub use fsutil::FileGuard;
pub use permission::{PermissionDecision, PermissionRequest, PermissionService};
pub use registry::{ToolRegistry, ToolSchema};
pub use shell::{
    arguments_blocker, commands_blocker, BackgroundShell, BackgroundShellManager, BlockFunc,
};
pub use tool::{Tool, ToolCall, ToolCtx, ToolError, ToolOutput, ToolOutputPart};
