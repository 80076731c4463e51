// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use similar::TextDiff;
use tracing::warn;

use quill_store::FileHistoryStore;

/// Line-ending style of a file, detected before matching and restored on
/// write so edits never silently rewrite a CRLF file as LF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEnding {
    Lf,
    CrLf,
}

pub fn detect_line_ending(s: &str) -> LineEnding {
    if s.contains("\r\n") {
        LineEnding::CrLf
    } else {
        LineEnding::Lf
    }
}

pub fn normalize_to_lf(s: &str) -> String {
    s.replace("\r\n", "\n")
}

pub fn restore_line_ending(s: &str, ending: LineEnding) -> String {
    match ending {
        LineEnding::Lf => s.to_string(),
        LineEnding::CrLf => s.replace('\n', "\r\n"),
    }
}

/// Unified diff between two versions of a file, labeled with its path.
pub fn unified_diff(path: &str, old: &str, new: &str) -> String {
    TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(3)
        .header(&format!("{path} (old)"), &format!("{path} (new)"))
        .to_string()
}

/// Resolve `path` against the working directory, producing an absolute path.
pub fn absolutize(working_dir: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        working_dir.join(p)
    }
}

/// True when `path` lives under `dir` after symlink resolution of the
/// directory (the file itself may not exist yet).
pub fn is_under(path: &Path, dir: &Path) -> bool {
    let dir = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    let path = match path.canonicalize() {
        Ok(p) => p,
        // Not on disk yet: canonicalize the parent and re-join.
        Err(_) => match path.parent() {
            Some(parent) => parent
                .canonicalize()
                .map(|p| p.join(path.file_name().unwrap_or_default()))
                .unwrap_or_else(|_| path.to_path_buf()),
            None => path.to_path_buf(),
        },
    };
    path.starts_with(&dir)
}

/// The file-edit safety protocol shared by every mutating tool and `view`.
///
/// Two invariants: a session must have *read* a path before mutating it,
/// and the file's mtime must not be newer than that read (someone else
/// changed it since).  Both failures are plain-text errors surfaced to the
/// model so it can `view` again and retry.
pub struct FileGuard {
    history: Arc<FileHistoryStore>,
}

impl FileGuard {
    pub fn new(history: Arc<FileHistoryStore>) -> Self {
        Self { history }
    }

    pub fn history(&self) -> &Arc<FileHistoryStore> {
        &self.history
    }

    /// Record that the session observed the file just now.
    pub fn mark_read(&self, session_id: &str, path: &Path) {
        self.history
            .mark_read(session_id, &path.to_string_lossy(), Utc::now());
    }

    /// Invariant 1: read-before-edit.
    pub fn ensure_read(&self, session_id: &str, path: &Path) -> Result<(), String> {
        match self.history.last_read(session_id, &path.to_string_lossy()) {
            Some(_) => Ok(()),
            None => Err(format!(
                "You must read the file before editing it. Use the view tool on {} first.",
                path.display()
            )),
        }
    }

    /// Invariant 2: no concurrent external mutation.  Timestamps are
    /// compared at second precision (filesystem mtime granularity).
    pub fn ensure_unmodified(&self, session_id: &str, path: &Path) -> Result<(), String> {
        let last_read = match self.history.last_read(session_id, &path.to_string_lossy()) {
            Some(t) => t,
            None => return Ok(()), // ensure_read reports this case
        };
        let mtime = match file_mtime(path) {
            Some(t) => t,
            None => return Ok(()), // new file
        };
        if mtime.timestamp() > last_read.timestamp() {
            return Err(format!(
                "File {} was modified since it was last read.\nLast read: {}\nModified:  {}\nRead it again with view before editing.",
                path.display(),
                last_read.format("%Y-%m-%dT%H:%M:%S"),
                mtime.format("%Y-%m-%dT%H:%M:%S"),
            ));
        }
        Ok(())
    }

    /// Record history around a successful write: an "interloper" version
    /// first when the on-disk pre-edit content drifted from the latest
    /// recorded version, then the new content.  History is best-effort —
    /// failures are logged, never propagated.
    pub fn record_write(&self, session_id: &str, path: &Path, old_content: &str, new_content: &str) {
        let path_str = path.to_string_lossy();
        let latest = self.history.latest(session_id, &path_str);
        let drifted = match &latest {
            Some(v) => v.content != old_content,
            None => !old_content.is_empty(),
        };
        if drifted {
            if let Err(e) = self.history.create_version(session_id, &path_str, old_content) {
                warn!(path = %path_str, "failed to record interloper version: {e}");
            }
        }
        if let Err(e) = self.history.create_version(session_id, &path_str, new_content) {
            warn!(path = %path_str, "failed to record file version: {e}");
        }
        self.mark_read(session_id, path);
    }
}

/// File mtime as UTC, if the file exists.
pub fn file_mtime(path: &Path) -> Option<DateTime<Utc>> {
    let meta = std::fs::metadata(path).ok()?;
    let mtime = meta.modified().ok()?;
    let secs = mtime
        .duration_since(std::time::UNIX_EPOCH)
        .ok()?
        .as_secs() as i64;
    Utc.timestamp_opt(secs, 0).single()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use quill_store::FileHistoryStore;

    fn guard() -> FileGuard {
        FileGuard::new(FileHistoryStore::new())
    }

    // ── Line endings ──────────────────────────────────────────────────────────

    #[test]
    fn detects_crlf() {
        assert_eq!(detect_line_ending("a\r\nb"), LineEnding::CrLf);
        assert_eq!(detect_line_ending("a\nb"), LineEnding::Lf);
        assert_eq!(detect_line_ending(""), LineEnding::Lf);
    }

    #[test]
    fn crlf_round_trip_preserves_content() {
        let original = "one\r\ntwo\r\nthree";
        let ending = detect_line_ending(original);
        let normalized = normalize_to_lf(original);
        assert!(!normalized.contains('\r'));
        assert_eq!(restore_line_ending(&normalized, ending), original);
    }

    // ── Diff ──────────────────────────────────────────────────────────────────

    #[test]
    fn unified_diff_shows_change() {
        let d = unified_diff("/tmp/x", "a\nb\n", "a\nc\n");
        assert!(d.contains("-b"));
        assert!(d.contains("+c"));
    }

    #[test]
    fn unified_diff_of_identical_content_is_empty() {
        let d = unified_diff("/tmp/x", "same\n", "same\n");
        assert!(!d.contains('-') || !d.contains('+'));
    }

    // ── Path helpers ──────────────────────────────────────────────────────────

    #[test]
    fn absolutize_joins_relative_paths() {
        let wd = Path::new("/work");
        assert_eq!(absolutize(wd, "src/main.rs"), PathBuf::from("/work/src/main.rs"));
        assert_eq!(absolutize(wd, "/etc/hosts"), PathBuf::from("/etc/hosts"));
    }

    #[test]
    fn is_under_detects_containment() {
        let dir = tempfile::tempdir().unwrap();
        let inside = dir.path().join("a.txt");
        std::fs::write(&inside, "x").unwrap();
        assert!(is_under(&inside, dir.path()));
        assert!(!is_under(Path::new("/etc/hosts"), dir.path()));
    }

    #[test]
    fn is_under_handles_nonexistent_file() {
        let dir = tempfile::tempdir().unwrap();
        let future = dir.path().join("not_yet.txt");
        assert!(is_under(&future, dir.path()));
    }

    // ── Read-before-edit ──────────────────────────────────────────────────────

    #[test]
    fn ensure_read_fails_without_prior_view() {
        let g = guard();
        let err = g.ensure_read("s1", Path::new("/tmp/a.txt")).unwrap_err();
        assert!(err.contains("read the file before editing"));
    }

    #[test]
    fn ensure_read_passes_after_mark() {
        let g = guard();
        g.mark_read("s1", Path::new("/tmp/a.txt"));
        assert!(g.ensure_read("s1", Path::new("/tmp/a.txt")).is_ok());
        // Other sessions are unaffected.
        assert!(g.ensure_read("s2", Path::new("/tmp/a.txt")).is_err());
    }

    // ── External mutation check ───────────────────────────────────────────────

    #[test]
    fn ensure_unmodified_passes_when_read_after_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, "v1").unwrap();
        let g = guard();
        g.mark_read("s1", &path);
        assert!(g.ensure_unmodified("s1", &path).is_ok());
    }

    #[test]
    fn ensure_unmodified_fails_after_external_touch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, "v1").unwrap();
        let g = guard();
        // Backdate the read mark by several seconds, then rewrite the file.
        g.history()
            .mark_read("s1", &path.to_string_lossy(), Utc::now() - chrono::Duration::seconds(30));
        std::fs::write(&path, "v2").unwrap();
        let err = g.ensure_unmodified("s1", &path).unwrap_err();
        assert!(err.contains("modified since"), "{err}");
        assert!(err.contains("Last read"));
    }

    // ── History recording ─────────────────────────────────────────────────────

    #[test]
    fn record_write_creates_version_and_marks_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        let g = guard();
        g.record_write("s1", &path, "", "new content");
        let latest = g.history().latest("s1", &path.to_string_lossy()).unwrap();
        assert_eq!(latest.content, "new content");
        assert!(g.ensure_read("s1", &path).is_ok());
    }

    #[test]
    fn record_write_inserts_interloper_version_on_drift() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        let g = guard();
        g.record_write("s1", &path, "", "v1");
        // Disk content drifted to "v1-external" outside our tooling; the
        // next write records it before the new content.
        g.record_write("s1", &path, "v1-external", "v2");
        let versions = g.history().list_by_path(&path.to_string_lossy());
        let contents: Vec<&str> = versions.iter().map(|v| v.content.as_str()).collect();
        assert_eq!(contents, vec!["v1", "v1-external", "v2"]);
    }
}
