// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use quill_store::{Broker, Event, EventKind};

use crate::{ToolCtx, ToolError};

/// An interactive authorization request published to subscribers (the UI).
#[derive(Debug, Clone)]
pub struct PermissionRequest {
    pub id: String,
    pub session_id: String,
    pub tool_call_id: String,
    pub tool_name: String,
    pub action: String,
    pub path: String,
    pub description: String,
    pub params: Value,
}

/// The three answers a subscriber may give.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionDecision {
    Grant,
    /// Grant and remember for the rest of the process: the same
    /// `(session, tool, action, path)` will not ask again.
    GrantPersistent,
    Deny,
}

/// Bash prefixes that never need authorization.  Matching is prefix-based
/// with a word boundary, so `ls -la` passes but `lsof` does not.
const SAFE_READ_PREFIXES: &[&str] = &[
    "ls", "pwd", "cat", "head", "tail", "wc", "which", "echo", "file", "stat",
    "git status", "git log", "git diff", "git show", "git branch", "git remote",
    "rg", "grep", "find",
];

#[derive(Default)]
struct GateState {
    /// Sessions that skip the gate entirely (sub-agents, yolo mode).
    auto_approved_sessions: HashSet<String>,
    /// Persistent grants keyed by (session, tool, action, path).
    grants: HashSet<(String, String, String, String)>,
    /// Reply channels for in-flight interactive requests.
    pending: HashMap<String, oneshot::Sender<PermissionDecision>>,
}

/// The permission gate.
///
/// Decision sources in order: auto-approved session, persistent grant
/// cache, the construction-time allowlist, then an interactive request
/// published to subscribers and answered over a per-request reply channel.
/// The gate has no internal timeout — it relies on the caller's
/// cancellation token.
pub struct PermissionService {
    state: Mutex<GateState>,
    /// Tools (or "tool:action" strings) granted without asking.
    allowlist: HashSet<String>,
    yolo: bool,
    safe_read_fast_path: bool,
    broker: Broker<PermissionRequest>,
}

impl PermissionService {
    pub fn new(cfg: &quill_config::PermissionConfig) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GateState::default()),
            allowlist: cfg.allowed_tools.iter().cloned().collect(),
            yolo: cfg.yolo,
            safe_read_fast_path: cfg.safe_read_fast_path,
            broker: Broker::new(),
        })
    }

    pub fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<Event<PermissionRequest>> {
        self.broker.subscribe()
    }

    /// Mark a session as auto-approved for its whole lifetime.
    pub fn auto_approve_session(&self, session_id: &str) {
        self.state
            .lock()
            .auto_approved_sessions
            .insert(session_id.to_string());
    }

    pub fn is_auto_approved(&self, session_id: &str) -> bool {
        self.yolo || self.state.lock().auto_approved_sessions.contains(session_id)
    }

    /// True when `command` begins with a curated read-only prefix on a word
    /// boundary.  Lets the bash tool skip the gate for harmless commands.
    pub fn is_safe_read_command(&self, command: &str) -> bool {
        if !self.safe_read_fast_path {
            return false;
        }
        let cmd = command.trim();
        SAFE_READ_PREFIXES.iter().any(|prefix| {
            cmd == *prefix
                || (cmd.starts_with(prefix)
                    && cmd[prefix.len()..].starts_with(|c: char| c.is_whitespace()))
        })
    }

    /// Request authorization for a side-effectful action.
    ///
    /// Blocks until a subscriber answers, the caller's token is canceled,
    /// or a non-interactive short-circuit applies.  When no subscriber is
    /// listening the request is denied immediately — a batch run has no one
    /// to ask.
    pub async fn request(
        &self,
        ctx: &ToolCtx,
        tool_name: &str,
        action: &str,
        path: &str,
        description: &str,
        params: Value,
    ) -> Result<(), ToolError> {
        if self.is_auto_approved(&ctx.session_id) {
            return Ok(());
        }

        let grant_key = (
            ctx.session_id.clone(),
            tool_name.to_string(),
            action.to_string(),
            path.to_string(),
        );
        if self.state.lock().grants.contains(&grant_key) {
            return Ok(());
        }

        if self.allowlist.contains(tool_name)
            || self.allowlist.contains(&format!("{tool_name}:{action}"))
        {
            return Ok(());
        }

        if self.broker.subscriber_count() == 0 {
            return Err(ToolError::PermissionDenied(format!(
                "{tool_name} requires authorization and no approver is connected"
            )));
        }

        let request = PermissionRequest {
            id: Uuid::new_v4().to_string(),
            session_id: ctx.session_id.clone(),
            tool_call_id: ctx.tool_call_id.clone(),
            tool_name: tool_name.to_string(),
            action: action.to_string(),
            path: path.to_string(),
            description: description.to_string(),
            params,
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        self.state
            .lock()
            .pending
            .insert(request.id.clone(), reply_tx);

        debug!(
            tool = tool_name,
            action,
            path,
            request_id = %request.id,
            "publishing permission request"
        );
        self.broker.publish(EventKind::Notification, request.clone());

        let decision = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                self.state.lock().pending.remove(&request.id);
                return Err(ToolError::PermissionDenied(
                    "request canceled while waiting for authorization".into(),
                ));
            }
            reply = reply_rx => reply.unwrap_or(PermissionDecision::Deny),
        };

        match decision {
            PermissionDecision::Grant => Ok(()),
            PermissionDecision::GrantPersistent => {
                self.state.lock().grants.insert(grant_key);
                Ok(())
            }
            PermissionDecision::Deny => Err(ToolError::PermissionDenied(format!(
                "user denied {tool_name} ({action}) on {path}"
            ))),
        }
    }

    /// Answer an in-flight request.  Returns `false` when the request id is
    /// unknown (already answered or canceled).
    pub fn respond(&self, request_id: &str, decision: PermissionDecision) -> bool {
        let tx = self.state.lock().pending.remove(request_id);
        match tx {
            Some(tx) => tx.send(decision).is_ok(),
            None => false,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
