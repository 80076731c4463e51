// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::bail;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Maximum number of concurrently tracked shells.
const MAX_SHELLS: usize = 50;

/// Completed shells older than this are purged on the next `start`.
const RETENTION_SECS: i64 = 8 * 60 * 60;

/// Hard byte ceiling per output buffer; the oldest quarter is dropped when
/// exceeded (finding a char boundary so multi-byte text never splits).
const MAX_BUFFER_BYTES: usize = 512 * 1024;

/// A predicate over a command's parsed argv; `true` blocks execution.
pub type BlockFunc = Arc<dyn Fn(&[String]) -> bool + Send + Sync>;

/// Block any command whose first token is in `commands`.
pub fn commands_blocker(commands: &[&str]) -> BlockFunc {
    let set: Vec<String> = commands.iter().map(|s| s.to_string()).collect();
    Arc::new(move |argv| {
        argv.first()
            .map(|first| set.iter().any(|c| c == first))
            .unwrap_or(false)
    })
}

/// Block `cmd subcmd… --flag…` combinations.
///
/// Matches when the argv starts with `cmd` followed by `subcommand_prefix`
/// and *all* of `required_flags` appear anywhere after — even positioned
/// after positional arguments.  `--flag=value` tokens are normalized to
/// `--flag` before comparison.
pub fn arguments_blocker(
    cmd: &str,
    subcommand_prefix: &[&str],
    required_flags: &[&str],
) -> BlockFunc {
    let cmd = cmd.to_string();
    let prefix: Vec<String> = subcommand_prefix.iter().map(|s| s.to_string()).collect();
    let flags: Vec<String> = required_flags.iter().map(|s| s.to_string()).collect();
    Arc::new(move |argv| {
        if argv.first().map(String::as_str) != Some(cmd.as_str()) {
            return false;
        }
        let rest = &argv[1..];
        if rest.len() < prefix.len() || rest[..prefix.len()] != prefix[..] {
            return false;
        }
        let normalized: Vec<&str> = rest[prefix.len()..]
            .iter()
            .map(|t| t.split_once('=').map(|(f, _)| f).unwrap_or(t.as_str()))
            .collect();
        flags.iter().all(|f| normalized.iter().any(|t| t == f))
    })
}

/// Output buffer shared between the reader task and observers.
#[derive(Default)]
pub struct OutputBuffer {
    text: Mutex<String>,
}

impl OutputBuffer {
    fn push_line(&self, line: &str) {
        let mut text = self.text.lock();
        text.push_str(line);
        text.push('\n');
        if text.len() > MAX_BUFFER_BYTES {
            let drain = text.len() - MAX_BUFFER_BYTES * 3 / 4;
            let mut boundary = drain;
            while boundary < text.len() && !text.is_char_boundary(boundary) {
                boundary += 1;
            }
            text.drain(..boundary);
        }
    }

    pub fn snapshot(&self) -> String {
        self.text.lock().clone()
    }
}

/// One tracked shell process.
pub struct BackgroundShell {
    pub id: String,
    pub command: String,
    pub description: String,
    pub working_dir: String,
    pub started_at: DateTime<Utc>,
    pub stdout: OutputBuffer,
    pub stderr: OutputBuffer,
    done: AtomicBool,
    done_tx: watch::Sender<bool>,
    exit_code: RwLock<Option<i32>>,
    exit_error: RwLock<Option<String>>,
    completed_at: RwLock<Option<DateTime<Utc>>>,
    /// Shell-local token, intentionally NOT derived from any agent turn —
    /// the shell outlives the turn that launched it.
    cancel: CancellationToken,
}

impl BackgroundShell {
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.read()
    }

    pub fn exit_error(&self) -> Option<String> {
        self.exit_error.read().clone()
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        *self.completed_at.read()
    }

    /// Wait until the process has exited and its output is flushed.
    pub async fn wait(&self) {
        let mut rx = self.done_tx.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Request termination.  Use [`BackgroundShellManager::kill`] to also
    /// await completion.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    fn mark_done(&self, code: Option<i32>, error: Option<String>) {
        *self.exit_code.write() = code;
        *self.exit_error.write() = error;
        *self.completed_at.write() = Some(Utc::now());
        self.done.store(true, Ordering::Release);
        // send_replace stores the value even with no live receivers, so a
        // later wait() always observes completion.
        self.done_tx.send_replace(true);
    }
}

/// Process-wide registry of background shells.
///
/// Shells run on detached tokens so the turn that launched them can finish
/// (or be canceled) without taking the process down; only an explicit kill
/// or process shutdown terminates them.
pub struct BackgroundShellManager {
    shells: RwLock<HashMap<String, Arc<BackgroundShell>>>,
    next_id: AtomicU32,
    retention_secs: i64,
}

impl BackgroundShellManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            shells: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            retention_secs: RETENTION_SECS,
        })
    }

    /// Test hook: shrink the retention window.
    pub fn with_retention_secs(retention_secs: i64) -> Arc<Self> {
        Arc::new(Self {
            shells: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            retention_secs,
        })
    }

    pub fn len(&self) -> usize {
        self.shells.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shells.read().is_empty()
    }

    pub fn get(&self, id: &str) -> Option<Arc<BackgroundShell>> {
        self.shells.read().get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.shells.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Detach a shell from tracking without killing it.
    pub fn remove(&self, id: &str) -> Option<Arc<BackgroundShell>> {
        self.shells.write().remove(id)
    }

    /// Launch `command` under `bash -c` and track it.
    ///
    /// Rejects when the tracked-shell cap is reached or any block func
    /// matches the parsed argv.  Completed shells past the retention window
    /// are purged first.
    pub fn start(
        &self,
        working_dir: &str,
        block_funcs: &[BlockFunc],
        command: &str,
        description: &str,
    ) -> anyhow::Result<Arc<BackgroundShell>> {
        self.purge_expired();

        if self.len() >= MAX_SHELLS {
            bail!("too many tracked shells ({MAX_SHELLS}); kill or remove one first");
        }

        // Block funcs operate on parsed argv.  An unparseable command line
        // (unbalanced quotes etc.) is left to bash to reject.
        if let Ok(argv) = shell_words::split(command) {
            if block_funcs.iter().any(|f| f(&argv)) {
                bail!("command not allowed for security reasons");
            }
        }

        let id = format!("{:03x}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let cancel = CancellationToken::new();
        let (done_tx, _) = watch::channel(false);

        let shell = Arc::new(BackgroundShell {
            id: id.clone(),
            command: command.to_string(),
            description: description.to_string(),
            working_dir: working_dir.to_string(),
            started_at: Utc::now(),
            stdout: OutputBuffer::default(),
            stderr: OutputBuffer::default(),
            done: AtomicBool::new(false),
            done_tx,
            exit_code: RwLock::new(None),
            exit_error: RwLock::new(None),
            completed_at: RwLock::new(None),
            cancel: cancel.clone(),
        });

        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(command);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        // Prevent the subprocess from touching the controlling terminal;
        // kill_on_drop covers the monitor task being dropped mid-flight.
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
        if !working_dir.is_empty() {
            cmd.current_dir(working_dir);
        }

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => bail!("failed to spawn shell: {e}"),
        };

        debug!(id = %id, command = %command, "background shell started");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let monitor_shell = Arc::clone(&shell);

        tokio::spawn(async move {
            let out_shell = Arc::clone(&monitor_shell);
            let stdout_task = tokio::spawn(async move {
                if let Some(stdout) = stdout {
                    let mut reader = BufReader::new(stdout).lines();
                    while let Ok(Some(line)) = reader.next_line().await {
                        out_shell.stdout.push_line(&line);
                    }
                }
            });
            let err_shell = Arc::clone(&monitor_shell);
            let stderr_task = tokio::spawn(async move {
                if let Some(stderr) = stderr {
                    let mut reader = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = reader.next_line().await {
                        err_shell.stderr.push_line(&line);
                    }
                }
            });

            tokio::select! {
                result = child.wait() => {
                    let _ = stdout_task.await;
                    let _ = stderr_task.await;
                    match result {
                        Ok(status) => monitor_shell.mark_done(status.code(), None),
                        Err(e) => monitor_shell.mark_done(None, Some(e.to_string())),
                    }
                }
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    let _ = stdout_task.await;
                    let _ = stderr_task.await;
                    monitor_shell.mark_done(None, Some("killed".into()));
                }
            }
        });

        self.shells.write().insert(id, Arc::clone(&shell));
        Ok(shell)
    }

    /// Kill a shell and wait for it to finish, then untrack it.
    pub async fn kill(&self, id: &str) -> anyhow::Result<()> {
        let shell = self
            .get(id)
            .ok_or_else(|| anyhow::anyhow!("no shell with id {id}"))?;
        shell.cancel();
        shell.wait().await;
        self.shells.write().remove(id);
        Ok(())
    }

    /// Fan-out kill every tracked shell, bounded by `deadline` for the
    /// whole group.  Used on process shutdown.
    pub async fn kill_all(&self, deadline: std::time::Duration) {
        let shells: Vec<Arc<BackgroundShell>> =
            self.shells.read().values().cloned().collect();
        for shell in &shells {
            shell.cancel();
        }
        let wait_all = async {
            for shell in &shells {
                shell.wait().await;
            }
        };
        let _ = tokio::time::timeout(deadline, wait_all).await;
        self.shells.write().clear();
    }

    fn purge_expired(&self) {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.retention_secs);
        self.shells.write().retain(|_, shell| {
            match shell.completed_at() {
                Some(done) => done > cutoff,
                None => true, // still running
            }
        });
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
