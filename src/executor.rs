//! Privileged command execution.
//!
//! The engine only ever talks to a `CommandExecutor`: a synchronous
//! "run this shell line, give me trimmed stdout" capability that reports
//! failure through a sentinel string instead of a structured error.
//! `ShellExecutor` is the production implementation: one long-lived shell
//! session (usually `su`) reused across commands, so the privilege
//! round-trip is paid once rather than per sample.

use crate::error::ExecError;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Output returned by an executor when the command could not be run at all.
pub const ERROR_SENTINEL: &str = "error";

/// Longest a single command may run before its session is killed.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Synchronous shell command capability.
pub trait CommandExecutor: Send + Sync {
    /// Run `command` and return its trimmed output, or [`ERROR_SENTINEL`].
    fn execute(&self, command: &str) -> String;

    /// Check whether `path` exists, as seen by the executor's session.
    fn exists(&self, path: &str) -> bool {
        self.execute(&format!("[ -e '{}' ] && echo 1 || echo 0", path)) == "1"
    }

    /// Relinquish any privileged session held by the executor.
    fn release(&self) {}
}

/// True when `output` is the executor's failure sentinel.
pub fn is_error_sentinel(output: &str) -> bool {
    output == ERROR_SENTINEL
}

struct ShellSession {
    child: Child,
    stdin: ChildStdin,
    lines: Receiver<String>,
}

/// Forward stdout lines until the pipe closes or nobody listens.
fn spawn_line_reader(stdout: ChildStdout) -> Result<Receiver<String>, ExecError> {
    let (tx, rx) = mpsc::channel();
    std::thread::Builder::new()
        .name("shell-reader".to_string())
        .spawn(move || {
            let mut stdout = BufReader::new(stdout);
            loop {
                let mut line = String::new();
                match stdout.read_line(&mut line) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                }
            }
        })?;
    Ok(rx)
}

impl ShellSession {
    fn terminate(mut self) {
        // Ask politely first; an already dead shell makes both calls no-ops.
        let _ = writeln!(self.stdin, "exit");
        let _ = self.stdin.flush();
        drop(self.stdin);
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
    }
}

/// Executor backed by a persistent shell process.
///
/// Each command is written to the shell's stdin followed by an `echo` of a
/// unique end marker; output is read line by line until the marker shows up.
/// A command that misses its deadline, or a broken session, gets the session
/// torn down; the next command respawns it.
pub struct ShellExecutor {
    shell: String,
    timeout: Duration,
    session: Mutex<Option<ShellSession>>,
    next_marker: AtomicU64,
}

impl ShellExecutor {
    /// Create an executor that will lazily spawn `shell` on first use.
    pub fn new(shell: impl Into<String>) -> Self {
        Self::with_timeout(shell, DEFAULT_COMMAND_TIMEOUT)
    }

    pub fn with_timeout(shell: impl Into<String>, timeout: Duration) -> Self {
        Self {
            shell: shell.into(),
            timeout,
            session: Mutex::new(None),
            next_marker: AtomicU64::new(0),
        }
    }

    /// `sh` when the process already runs as root, `su` otherwise.
    pub fn default_shell() -> &'static str {
        // Safety: geteuid has no preconditions and cannot fail.
        if unsafe { libc::geteuid() } == 0 {
            "sh"
        } else {
            "su"
        }
    }

    /// The shell program this executor spawns.
    pub fn shell(&self) -> &str {
        &self.shell
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<ShellSession>> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn spawn(&self) -> Result<ShellSession, ExecError> {
        let mut child = Command::new(&self.shell)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| ExecError::SpawnFailed {
                shell: self.shell.clone(),
                source: e,
            })?;

        let stdin = child.stdin.take().ok_or(ExecError::PipeUnavailable("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(ExecError::PipeUnavailable("stdout"))?;

        let lines = match spawn_line_reader(stdout) {
            Ok(lines) => lines,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        };

        info!(shell = %self.shell, pid = child.id(), "Shell session started");

        Ok(ShellSession {
            child,
            stdin,
            lines,
        })
    }

    fn run(&self, session: &mut ShellSession, command: &str) -> Result<String, ExecError> {
        let marker = format!(
            "__fps_probe_done_{}__",
            self.next_marker.fetch_add(1, Ordering::Relaxed)
        );

        writeln!(session.stdin, "{{ {}\n}} 2>&1", command)?;
        writeln!(session.stdin, "echo \"{}\"", marker)?;
        session.stdin.flush()?;

        let deadline = Instant::now() + self.timeout;
        let mut output = String::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let line = match session.lines.recv_timeout(remaining) {
                Ok(line) => line,
                Err(RecvTimeoutError::Timeout) => return Err(ExecError::Timeout(self.timeout)),
                Err(RecvTimeoutError::Disconnected) => return Err(ExecError::SessionClosed),
            };
            if line.trim_end() == marker {
                break;
            }
            output.push_str(&line);
        }

        Ok(output.trim().to_string())
    }
}

impl CommandExecutor for ShellExecutor {
    fn execute(&self, command: &str) -> String {
        let mut guard = self.lock_session();

        if guard.is_none() {
            match self.spawn() {
                Ok(session) => *guard = Some(session),
                Err(e) => {
                    warn!("Cannot run '{}': {}", command, e);
                    return ERROR_SENTINEL.to_string();
                }
            }
        }

        let Some(session) = guard.as_mut() else {
            return ERROR_SENTINEL.to_string();
        };

        match self.run(session, command) {
            Ok(output) => output,
            Err(e) => {
                debug!("Shell session failed on '{}': {}, dropping session", command, e);
                if let Some(broken) = guard.take() {
                    broken.terminate();
                }
                ERROR_SENTINEL.to_string()
            }
        }
    }

    fn release(&self) {
        if let Some(session) = self.lock_session().take() {
            info!(shell = %self.shell, "Releasing shell session");
            session.terminate();
        }
    }
}

impl Drop for ShellExecutor {
    fn drop(&mut self) {
        self.release();
    }
}
