// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::pubsub::{Broker, Event, EventKind};

// ─── Parts ────────────────────────────────────────────────────────────────────

/// Why an assistant message stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    EndTurn,
    MaxTokens,
    ToolUse,
    Canceled,
    Error,
    PermissionDenied,
    Unknown,
}

/// One tagged content part of a persisted message.
///
/// An assistant message accumulates parts in stream order: text and
/// reasoning deltas, then tool calls, and finally exactly one `Finish`.
/// Tool-role messages hold the `ToolResult` parts for a preceding
/// assistant message's calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text {
        text: String,
    },
    Reasoning {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
        started_at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        finished_at: Option<DateTime<Utc>>,
    },
    ImageUrl {
        url: String,
    },
    Binary {
        mime: String,
        /// Base64-encoded payload
        data: String,
        path: String,
    },
    ToolCall {
        id: String,
        name: String,
        /// Raw JSON input, accumulated from provider input deltas
        input: String,
        #[serde(default)]
        provider_executed: bool,
        #[serde(default)]
        finished: bool,
    },
    ToolResult {
        tool_call_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime: Option<String>,
        #[serde(default)]
        metadata: serde_json::Value,
        #[serde(default)]
        is_error: bool,
    },
    Finish {
        reason: FinishReason,
        time: DateTime<Utc>,
        #[serde(default)]
        message: String,
        #[serde(default)]
        details: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    Tool,
    System,
}

// ─── Message ──────────────────────────────────────────────────────────────────

/// A persisted conversation message: an ordered list of tagged parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: MessageRole,
    pub parts: Vec<Part>,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub provider: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub is_summary: bool,
}

impl Message {
    /// Concatenated text content of all `Text` parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Append a streamed text delta, extending the trailing `Text` part or
    /// opening a new one.
    pub fn append_text_delta(&mut self, delta: &str) {
        if let Some(Part::Text { text }) = self.parts.last_mut() {
            text.push_str(delta);
            return;
        }
        self.parts.push(Part::Text { text: delta.to_string() });
    }

    /// Append a streamed reasoning delta, extending the trailing open
    /// `Reasoning` part or opening a new one.
    pub fn append_reasoning_delta(&mut self, delta: &str, signature: Option<&str>) {
        if let Some(Part::Reasoning { thinking, signature: sig, finished_at: None, .. }) =
            self.parts.last_mut()
        {
            thinking.push_str(delta);
            if sig.is_none() {
                *sig = signature.map(str::to_string);
            }
            return;
        }
        self.parts.push(Part::Reasoning {
            thinking: delta.to_string(),
            signature: signature.map(str::to_string),
            started_at: Utc::now(),
            finished_at: None,
        });
    }

    /// Close the trailing open `Reasoning` part, if any.
    pub fn finish_reasoning(&mut self) {
        if let Some(Part::Reasoning { finished_at, .. }) = self.parts.last_mut() {
            if finished_at.is_none() {
                *finished_at = Some(Utc::now());
            }
        }
    }

    /// All tool-call parts as `(id, name, input)` tuples, in stream order.
    pub fn tool_calls(&self) -> Vec<(String, String, String)> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::ToolCall { id, name, input, .. } => {
                    Some((id.clone(), name.clone(), input.clone()))
                }
                _ => None,
            })
            .collect()
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.parts.iter().find_map(|p| match p {
            Part::Finish { reason, .. } => Some(*reason),
            _ => None,
        })
    }

    pub fn is_finished(&self) -> bool {
        self.finish_reason().is_some()
    }

    /// Append the terminal `Finish` part.  A message carries at most one;
    /// repeated calls are ignored.
    pub fn finish(&mut self, reason: FinishReason, message: impl Into<String>, details: impl Into<String>) {
        if self.is_finished() {
            return;
        }
        self.finish_reasoning();
        self.parts.push(Part::Finish {
            reason,
            time: Utc::now(),
            message: message.into(),
            details: details.into(),
        });
    }
}

// ─── Store ────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct MessageState {
    by_id: HashMap<String, Message>,
    /// Insertion-ordered message ids per session.
    by_session: HashMap<String, Vec<String>>,
}

/// In-memory ordered message store with pub/sub change notification.
pub struct MessageStore {
    state: RwLock<MessageState>,
    broker: Broker<Message>,
}

impl MessageStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { state: RwLock::new(MessageState::default()), broker: Broker::new() })
    }

    pub fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<Event<Message>> {
        self.broker.subscribe()
    }

    /// Create and persist a new message.
    ///
    /// `ToolResult` parts are validated against the session's prior
    /// `ToolCall` ids; an unknown reference is rejected.
    pub fn create(
        &self,
        session_id: &str,
        role: MessageRole,
        parts: Vec<Part>,
        model: &str,
        provider: &str,
    ) -> StoreResult<Message> {
        let now = Utc::now();
        let msg = Message {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            role,
            parts,
            model: model.to_string(),
            provider: provider.to_string(),
            created_at: now,
            updated_at: now,
            is_summary: false,
        };
        {
            let mut state = self.state.write();
            Self::validate_tool_results(&state, &msg)?;
            state
                .by_session
                .entry(session_id.to_string())
                .or_default()
                .push(msg.id.clone());
            state.by_id.insert(msg.id.clone(), msg.clone());
        }
        self.broker.publish(EventKind::Created, msg.clone());
        Ok(msg)
    }

    /// Persist an updated copy of an existing message.
    pub fn update(&self, mut msg: Message) -> StoreResult<Message> {
        msg.updated_at = Utc::now();
        {
            let mut state = self.state.write();
            if !state.by_id.contains_key(&msg.id) {
                return Err(StoreError::NotFound(format!("message {}", msg.id)));
            }
            Self::validate_tool_results(&state, &msg)?;
            state.by_id.insert(msg.id.clone(), msg.clone());
        }
        self.broker.publish(EventKind::Updated, msg.clone());
        Ok(msg)
    }

    pub fn get(&self, id: &str) -> StoreResult<Message> {
        self.state
            .read()
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("message {id}")))
    }

    pub fn list_by_session(&self, session_id: &str) -> Vec<Message> {
        let state = self.state.read();
        state
            .by_session
            .get(session_id)
            .map(|ids| ids.iter().filter_map(|id| state.by_id.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    pub fn list_user_by_session(&self, session_id: &str) -> Vec<Message> {
        self.list_by_session(session_id)
            .into_iter()
            .filter(|m| m.role == MessageRole::User)
            .collect()
    }

    pub fn delete(&self, id: &str) -> StoreResult<()> {
        let removed = {
            let mut state = self.state.write();
            let removed = state.by_id.remove(id);
            if let Some(msg) = &removed {
                if let Some(ids) = state.by_session.get_mut(&msg.session_id) {
                    ids.retain(|i| i != id);
                }
            }
            removed
        };
        match removed {
            Some(msg) => {
                self.broker.publish(EventKind::Deleted, msg);
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("message {id}"))),
        }
    }

    pub fn delete_session_messages(&self, session_id: &str) {
        let removed: Vec<Message> = {
            let mut state = self.state.write();
            let ids = state.by_session.remove(session_id).unwrap_or_default();
            ids.iter().filter_map(|id| state.by_id.remove(id)).collect()
        };
        for msg in removed {
            self.broker.publish(EventKind::Deleted, msg);
        }
    }

    /// Every `ToolResult` must reference a `ToolCall` id that already exists
    /// in the same session (or in the message being written).
    fn validate_tool_results(state: &MessageState, msg: &Message) -> StoreResult<()> {
        let result_ids: Vec<&str> = msg
            .parts
            .iter()
            .filter_map(|p| match p {
                Part::ToolResult { tool_call_id, .. } => Some(tool_call_id.as_str()),
                _ => None,
            })
            .collect();
        if result_ids.is_empty() {
            return Ok(());
        }
        let known: Vec<String> = state
            .by_session
            .get(&msg.session_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.by_id.get(id))
                    .flat_map(|m| m.tool_calls().into_iter().map(|(id, _, _)| id))
                    .collect()
            })
            .unwrap_or_default();
        for rid in result_ids {
            if !known.iter().any(|k| k == rid) {
                return Err(StoreError::Invalid(format!(
                    "tool result references unknown tool call id {rid:?}"
                )));
            }
        }
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn text_part(s: &str) -> Part {
        Part::Text { text: s.into() }
    }

    #[test]
    fn create_and_get_round_trip() {
        let store = MessageStore::new();
        let m = store
            .create("s1", MessageRole::User, vec![text_part("hi")], "m", "p")
            .unwrap();
        let got = store.get(&m.id).unwrap();
        assert_eq!(got.text(), "hi");
        assert_eq!(got.session_id, "s1");
    }

    #[test]
    fn list_by_session_preserves_order() {
        let store = MessageStore::new();
        for i in 0..5 {
            store
                .create("s1", MessageRole::User, vec![text_part(&i.to_string())], "m", "p")
                .unwrap();
        }
        let msgs = store.list_by_session("s1");
        let texts: Vec<String> = msgs.iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["0", "1", "2", "3", "4"]);
    }

    #[test]
    fn list_user_filters_roles() {
        let store = MessageStore::new();
        store.create("s1", MessageRole::User, vec![text_part("u")], "m", "p").unwrap();
        store.create("s1", MessageRole::Assistant, vec![text_part("a")], "m", "p").unwrap();
        let users = store.list_user_by_session("s1");
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].text(), "u");
    }

    #[test]
    fn tool_result_with_unknown_call_id_is_rejected() {
        let store = MessageStore::new();
        let res = store.create(
            "s1",
            MessageRole::Tool,
            vec![Part::ToolResult {
                tool_call_id: "nope".into(),
                content: "x".into(),
                data: None,
                mime: None,
                metadata: serde_json::Value::Null,
                is_error: false,
            }],
            "m",
            "p",
        );
        assert!(matches!(res, Err(StoreError::Invalid(_))));
    }

    #[test]
    fn tool_result_with_known_call_id_is_accepted() {
        let store = MessageStore::new();
        store
            .create(
                "s1",
                MessageRole::Assistant,
                vec![Part::ToolCall {
                    id: "c1".into(),
                    name: "bash".into(),
                    input: "{}".into(),
                    provider_executed: false,
                    finished: true,
                }],
                "m",
                "p",
            )
            .unwrap();
        let res = store.create(
            "s1",
            MessageRole::Tool,
            vec![Part::ToolResult {
                tool_call_id: "c1".into(),
                content: "ok".into(),
                data: None,
                mime: None,
                metadata: serde_json::Value::Null,
                is_error: false,
            }],
            "m",
            "p",
        );
        assert!(res.is_ok());
    }

    #[test]
    fn append_text_delta_extends_trailing_part() {
        let store = MessageStore::new();
        let mut m = store
            .create("s1", MessageRole::Assistant, vec![], "m", "p")
            .unwrap();
        m.append_text_delta("hel");
        m.append_text_delta("lo");
        assert_eq!(m.parts.len(), 1);
        assert_eq!(m.text(), "hello");
    }

    #[test]
    fn reasoning_deltas_merge_until_finished() {
        let store = MessageStore::new();
        let mut m = store
            .create("s1", MessageRole::Assistant, vec![], "m", "p")
            .unwrap();
        m.append_reasoning_delta("think", None);
        m.append_reasoning_delta("ing", Some("sig"));
        m.finish_reasoning();
        m.append_reasoning_delta("new block", None);
        assert_eq!(m.parts.len(), 2);
    }

    #[test]
    fn finish_is_appended_at_most_once() {
        let store = MessageStore::new();
        let mut m = store
            .create("s1", MessageRole::Assistant, vec![text_part("x")], "m", "p")
            .unwrap();
        m.finish(FinishReason::EndTurn, "", "");
        m.finish(FinishReason::Error, "boom", "");
        let finishes = m
            .parts
            .iter()
            .filter(|p| matches!(p, Part::Finish { .. }))
            .count();
        assert_eq!(finishes, 1);
        assert_eq!(m.finish_reason(), Some(FinishReason::EndTurn));
    }

    #[test]
    fn update_unknown_message_is_not_found() {
        let store = MessageStore::new();
        let m = Message {
            id: "ghost".into(),
            session_id: "s1".into(),
            role: MessageRole::User,
            parts: vec![],
            model: String::new(),
            provider: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            is_summary: false,
        };
        assert!(matches!(store.update(m), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn delete_session_messages_clears_session() {
        let store = MessageStore::new();
        store.create("s1", MessageRole::User, vec![text_part("a")], "m", "p").unwrap();
        store.create("s1", MessageRole::User, vec![text_part("b")], "m", "p").unwrap();
        store.delete_session_messages("s1");
        assert!(store.list_by_session("s1").is_empty());
    }

    #[tokio::test]
    async fn create_publishes_event() {
        let store = MessageStore::new();
        let mut rx = store.subscribe();
        store.create("s1", MessageRole::User, vec![text_part("hi")], "m", "p").unwrap();
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::Created);
        assert_eq!(ev.payload.text(), "hi");
    }

    #[test]
    fn part_serialization_is_tagged() {
        let p = Part::ToolCall {
            id: "c1".into(),
            name: "bash".into(),
            input: "{}".into(),
            provider_executed: false,
            finished: true,
        };
        let json = serde_json::to_string(&p).unwrap();
        assert!(json.contains("\"type\":\"tool_call\""), "{json}");
        let back: Part = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, Part::ToolCall { ref name, .. } if name == "bash"));
    }
}
