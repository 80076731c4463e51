// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::pubsub::{Broker, Event, EventKind};

/// One recorded version of a file's content within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileVersion {
    pub id: String,
    pub session_id: String,
    pub path: String,
    pub content: String,
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

/// Max attempts when a `(path, version)` pair collides with a concurrent
/// writer before history recording gives up.
const VERSION_CONFLICT_RETRIES: u32 = 3;

#[derive(Default)]
struct HistoryState {
    /// All versions in creation order.
    versions: Vec<FileVersion>,
    /// Uniqueness index over `(path, version)`.
    taken: HashMap<(String, i64), String>,
}

/// File version history plus per-session read marks.
///
/// History is best-effort: an edit that succeeds on disk is never rolled
/// back because version recording failed.
pub struct FileHistoryStore {
    state: RwLock<HistoryState>,
    read_marks: RwLock<HashMap<(String, String), DateTime<Utc>>>,
    broker: Broker<FileVersion>,
}

impl FileHistoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(HistoryState::default()),
            read_marks: RwLock::new(HashMap::new()),
            broker: Broker::new(),
        })
    }

    pub fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<Event<FileVersion>> {
        self.broker.subscribe()
    }

    /// Record a new version of `path` for `session_id`.
    ///
    /// Versions for a `(session, path)` pair are strictly monotone from 0.
    /// The `(path, version)` uniqueness constraint is enforced with up to
    /// three bump-and-retry attempts to absorb racing sessions writing the
    /// same path.
    pub fn create_version(
        &self,
        session_id: &str,
        path: &str,
        content: &str,
    ) -> StoreResult<FileVersion> {
        let mut state = self.state.write();
        let mut version = state
            .versions
            .iter()
            .filter(|v| v.session_id == session_id && v.path == path)
            .map(|v| v.version)
            .max()
            .map(|v| v + 1)
            .unwrap_or(0);

        let mut attempts = 0;
        while state.taken.contains_key(&(path.to_string(), version)) {
            attempts += 1;
            if attempts > VERSION_CONFLICT_RETRIES {
                warn!(path, version, "file version conflict persisted after retries");
                return Err(StoreError::Conflict(format!(
                    "version {version} of {path} already recorded"
                )));
            }
            version += 1;
        }

        let fv = FileVersion {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            path: path.to_string(),
            content: content.to_string(),
            version,
            created_at: Utc::now(),
        };
        state.taken.insert((path.to_string(), version), fv.id.clone());
        state.versions.push(fv.clone());
        drop(state);
        self.broker.publish(EventKind::Created, fv.clone());
        Ok(fv)
    }

    /// Latest recorded version of `path` within `session_id`.
    pub fn latest(&self, session_id: &str, path: &str) -> Option<FileVersion> {
        self.state
            .read()
            .versions
            .iter()
            .filter(|v| v.session_id == session_id && v.path == path)
            .max_by_key(|v| v.version)
            .cloned()
    }

    /// All versions of `path` across sessions, oldest first.
    pub fn list_by_path(&self, path: &str) -> Vec<FileVersion> {
        let mut out: Vec<FileVersion> = self
            .state
            .read()
            .versions
            .iter()
            .filter(|v| v.path == path)
            .cloned()
            .collect();
        out.sort_by_key(|v| v.version);
        out
    }

    /// The latest version of every path touched by `session_id`.
    pub fn latest_session_files(&self, session_id: &str) -> Vec<FileVersion> {
        let state = self.state.read();
        let mut latest: HashMap<&str, &FileVersion> = HashMap::new();
        for v in state.versions.iter().filter(|v| v.session_id == session_id) {
            match latest.get(v.path.as_str()) {
                Some(cur) if cur.version >= v.version => {}
                _ => {
                    latest.insert(v.path.as_str(), v);
                }
            }
        }
        latest.into_values().cloned().collect()
    }

    pub fn delete_version(&self, id: &str) -> StoreResult<()> {
        let removed = {
            let mut state = self.state.write();
            let pos = state.versions.iter().position(|v| v.id == id);
            match pos {
                Some(i) => {
                    let v = state.versions.remove(i);
                    state.taken.remove(&(v.path.clone(), v.version));
                    Some(v)
                }
                None => None,
            }
        };
        match removed {
            Some(v) => {
                self.broker.publish(EventKind::Deleted, v);
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("file version {id}"))),
        }
    }

    // ── Read marks ────────────────────────────────────────────────────────────

    /// Record that `session_id` observed `path` at `time`.
    pub fn mark_read(&self, session_id: &str, path: &str, time: DateTime<Utc>) {
        self.read_marks
            .write()
            .insert((session_id.to_string(), path.to_string()), time);
    }

    /// When `session_id` last observed `path`, if ever.
    pub fn last_read(&self, session_id: &str, path: &str) -> Option<DateTime<Utc>> {
        self.read_marks
            .read()
            .get(&(session_id.to_string(), path.to_string()))
            .copied()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_start_at_zero_and_increment() {
        let store = FileHistoryStore::new();
        let v0 = store.create_version("s1", "/tmp/a", "one").unwrap();
        let v1 = store.create_version("s1", "/tmp/a", "two").unwrap();
        assert_eq!(v0.version, 0);
        assert_eq!(v1.version, 1);
    }

    #[test]
    fn versions_are_per_session_path_pair() {
        let store = FileHistoryStore::new();
        store.create_version("s1", "/tmp/a", "x").unwrap();
        let other_path = store.create_version("s1", "/tmp/b", "x").unwrap();
        assert_eq!(other_path.version, 0);
    }

    #[test]
    fn path_version_collision_bumps_with_retry() {
        let store = FileHistoryStore::new();
        // Session s1 takes (path, 0); s2 starting fresh at 0 must bump to 1.
        store.create_version("s1", "/tmp/a", "x").unwrap();
        let v = store.create_version("s2", "/tmp/a", "y").unwrap();
        assert_eq!(v.version, 1);
    }

    #[test]
    fn latest_returns_highest_version() {
        let store = FileHistoryStore::new();
        store.create_version("s1", "/tmp/a", "one").unwrap();
        store.create_version("s1", "/tmp/a", "two").unwrap();
        let latest = store.latest("s1", "/tmp/a").unwrap();
        assert_eq!(latest.content, "two");
    }

    #[test]
    fn latest_session_files_one_entry_per_path() {
        let store = FileHistoryStore::new();
        store.create_version("s1", "/tmp/a", "a0").unwrap();
        store.create_version("s1", "/tmp/a", "a1").unwrap();
        store.create_version("s1", "/tmp/b", "b0").unwrap();
        let files = store.latest_session_files("s1");
        assert_eq!(files.len(), 2);
        let a = files.iter().find(|f| f.path == "/tmp/a").unwrap();
        assert_eq!(a.content, "a1");
    }

    #[test]
    fn delete_version_frees_the_slot() {
        let store = FileHistoryStore::new();
        let v = store.create_version("s1", "/tmp/a", "x").unwrap();
        store.delete_version(&v.id).unwrap();
        assert!(store.latest("s1", "/tmp/a").is_none());
        let again = store.create_version("s1", "/tmp/a", "y").unwrap();
        assert_eq!(again.version, 0);
    }

    #[test]
    fn read_marks_round_trip() {
        let store = FileHistoryStore::new();
        assert!(store.last_read("s1", "/tmp/a").is_none());
        let t = Utc::now();
        store.mark_read("s1", "/tmp/a", t);
        assert_eq!(store.last_read("s1", "/tmp/a"), Some(t));
        // Marks are per-session.
        assert!(store.last_read("s2", "/tmp/a").is_none());
    }
}
