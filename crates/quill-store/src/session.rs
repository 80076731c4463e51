// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::pubsub::{Broker, Event, EventKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

/// A single todo item.  The list is owned by a session and replaced
/// wholesale on every update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Todo {
    pub content: String,
    pub status: TodoStatus,
    /// Present-continuous phrasing shown while the item is in progress
    #[serde(default)]
    pub active_form: String,
}

/// A conversation session.  Sessions form a tree: task sessions spawned by
/// sub-agent tools carry `parent_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub title: String,
    /// Accumulated dollar cost: own LLM usage plus the terminal cost of
    /// every completed task child.
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub todos: Vec<Todo>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Deterministic session id for an agent-tool invocation, so that retrying
/// the same `(parent_message_id, tool_call_id)` pair reuses the child
/// session instead of orphaning a new one.
pub fn agent_tool_session_id(parent_message_id: &str, tool_call_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parent_message_id.as_bytes());
    hasher.update(b"\x00");
    hasher.update(tool_call_id.as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

/// In-memory session store with pub/sub change notification.
///
/// Cost roll-ups from sibling sub-agents go through [`SessionStore::add_cost`],
/// a read-modify-write under the store's write lock, so concurrent roll-ups
/// serialize instead of losing updates.
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Session>>,
    broker: Broker<Session>,
}

impl SessionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { sessions: RwLock::new(HashMap::new()), broker: Broker::new() })
    }

    pub fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<Event<Session>> {
        self.broker.subscribe()
    }

    pub fn create(&self, title: &str) -> Session {
        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            parent_id: None,
            title: title.to_string(),
            cost: 0.0,
            todos: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        self.sessions.write().insert(session.id.clone(), session.clone());
        self.broker.publish(EventKind::Created, session.clone());
        session
    }

    /// Create a child task session under `parent_id`.
    ///
    /// When `id` is `Some` (agent-tool sessions with a deterministic id) and
    /// a session with that id already exists, the existing session is
    /// returned unchanged — re-running an agent-tool invocation is
    /// idempotent.
    pub fn create_task_session(
        &self,
        id: Option<String>,
        title: &str,
        parent_id: &str,
    ) -> StoreResult<Session> {
        let mut sessions = self.sessions.write();
        if !sessions.contains_key(parent_id) {
            return Err(StoreError::NotFound(format!("session {parent_id}")));
        }
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        if let Some(existing) = sessions.get(&id) {
            return Ok(existing.clone());
        }
        let now = Utc::now();
        let session = Session {
            id: id.clone(),
            parent_id: Some(parent_id.to_string()),
            title: title.to_string(),
            cost: 0.0,
            todos: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        sessions.insert(id, session.clone());
        drop(sessions);
        self.broker.publish(EventKind::Created, session.clone());
        Ok(session)
    }

    pub fn get(&self, id: &str) -> StoreResult<Session> {
        self.sessions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("session {id}")))
    }

    pub fn save(&self, mut session: Session) -> StoreResult<Session> {
        session.updated_at = Utc::now();
        {
            let mut sessions = self.sessions.write();
            if !sessions.contains_key(&session.id) {
                return Err(StoreError::NotFound(format!("session {}", session.id)));
            }
            sessions.insert(session.id.clone(), session.clone());
        }
        self.broker.publish(EventKind::Updated, session.clone());
        Ok(session)
    }

    /// Atomically add `delta` to a session's cost.
    pub fn add_cost(&self, id: &str, delta: f64) -> StoreResult<Session> {
        let updated = {
            let mut sessions = self.sessions.write();
            let session = sessions
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(format!("session {id}")))?;
            session.cost += delta;
            session.updated_at = Utc::now();
            session.clone()
        };
        self.broker.publish(EventKind::Updated, updated.clone());
        Ok(updated)
    }

    /// Replace a session's todo list wholesale.
    pub fn set_todos(&self, id: &str, todos: Vec<Todo>) -> StoreResult<Session> {
        let updated = {
            let mut sessions = self.sessions.write();
            let session = sessions
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(format!("session {id}")))?;
            session.todos = todos;
            session.updated_at = Utc::now();
            session.clone()
        };
        self.broker.publish(EventKind::Updated, updated.clone());
        Ok(updated)
    }

    /// All direct children of `id`.
    pub fn children(&self, id: &str) -> Vec<Session> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.parent_id.as_deref() == Some(id))
            .cloned()
            .collect()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
