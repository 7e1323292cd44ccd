//! Request/response command execution over one persistent shell.
//!
//! The shell's output arrives as an unstructured stream. Each command is
//! followed by `echo '<marker>'` with a fresh marker, and output is collected
//! until the marker shows up on stdout or the command timeout elapses.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{SandboxBackend, SandboxError, ShellEvent, ShellHandle, SHELL_SIGNATURE};
use crate::store::{SandboxState, TaskStore};

/// Prefix shared by every completion marker.
pub(crate) const MARKER_PREFIX: &str = "COMMAND_COMPLETE_";

// ============================================================================
// Public API
// ============================================================================

/// One sandbox plus one long-lived shell inside it.
pub(crate) struct SandboxSession {
    backend: Arc<dyn SandboxBackend>,
    store: Arc<dyn TaskStore>,
    task_id: Uuid,
    reconnect_id: Option<String>,
    command_timeout: Duration,
    sandbox_id: Option<String>,
    shell: Option<Shell>,
}

impl SandboxSession {
    /// Creates an unacquired session; `reconnect_id` resumes an existing sandbox.
    pub fn new(
        backend: Arc<dyn SandboxBackend>,
        store: Arc<dyn TaskStore>,
        task_id: Uuid,
        reconnect_id: Option<String>,
        command_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            store,
            task_id,
            reconnect_id,
            command_timeout,
            sandbox_id: None,
            shell: None,
        }
    }

    /// Creates or resumes the sandbox and attaches a shell.
    pub async fn acquire(&mut self) -> Result<()> {
        let (sandbox_id, handle) = match self.reconnect_id.clone() {
            Some(sandbox_id) => {
                self.backend.resume(&sandbox_id).await?;
                let handle = match self.backend.attach_shell(&sandbox_id, SHELL_SIGNATURE).await? {
                    Some(handle) => {
                        debug!("Attached to existing shell {}", handle.id);
                        handle
                    }
                    None => self.backend.spawn_shell(&sandbox_id, SHELL_SIGNATURE).await?,
                };
                (sandbox_id, handle)
            }
            None => {
                let sandbox_id = self.backend.create(&self.task_id.to_string()).await?;
                self.store.set_sandbox_id(self.task_id, &sandbox_id).await?;
                let handle = self.backend.spawn_shell(&sandbox_id, SHELL_SIGNATURE).await?;
                (sandbox_id, handle)
            }
        };

        info!(
            event = "sandbox_acquired",
            task_id = %self.task_id,
            sandbox_id = %sandbox_id,
            shell_id = %handle.id,
        );

        self.sandbox_id = Some(sandbox_id);
        self.shell = Some(Shell::new(handle));
        self.store
            .update_sandbox_usage(self.task_id, SandboxState::Running)
            .await?;
        Ok(())
    }

    /// Runs a command and renders its output; shell exits become error text.
    pub async fn run(&mut self, command: &str) -> Result<String, SandboxError> {
        self.execute(command, false).await
    }

    /// Like [`run`](Self::run), but a shell exit is returned as `ProcessExited`.
    pub async fn run_checked(&mut self, command: &str) -> Result<String, SandboxError> {
        self.execute(command, true).await
    }

    /// Replaces the shell with a fresh process.
    pub async fn restart(&mut self) -> Result<(), SandboxError> {
        let sandbox_id = self.require_sandbox()?.to_string();

        if let Some(old) = self.shell.take() {
            if old.exit_code.is_none() {
                // Best effort; the old process may already be gone.
                let _ = self.backend.send_stdin(&old.handle.id, "exit\n").await;
            }
        }

        let handle = self.backend.spawn_shell(&sandbox_id, SHELL_SIGNATURE).await?;
        info!(
            event = "shell_restarted",
            task_id = %self.task_id,
            shell_id = %handle.id,
        );
        self.shell = Some(Shell::new(handle));
        Ok(())
    }

    /// Pauses the sandbox; a no-op if acquire never completed.
    pub async fn release(&mut self) -> Result<()> {
        let Some(sandbox_id) = self.sandbox_id.take() else {
            return Ok(());
        };
        self.shell = None;

        self.backend.pause(&sandbox_id).await?;
        self.store
            .update_sandbox_usage(self.task_id, SandboxState::Paused)
            .await?;

        info!(event = "sandbox_released", task_id = %self.task_id, sandbox_id = %sandbox_id);
        Ok(())
    }

    pub fn sandbox_id(&self) -> Option<&str> {
        self.sandbox_id.as_deref()
    }

    pub async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        self.backend.read_file(self.require_sandbox()?, path).await
    }

    pub async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        self.backend
            .write_file(self.require_sandbox()?, path, content)
            .await
    }

    pub async fn list_dir(&self, path: &str) -> Result<Vec<String>, SandboxError> {
        self.backend.list_dir(self.require_sandbox()?, path).await
    }
}

// ============================================================================
// Internal types
// ============================================================================

struct Shell {
    handle: ShellHandle,
    exit_code: Option<i64>,
}

impl Shell {
    fn new(handle: ShellHandle) -> Self {
        Self {
            handle,
            exit_code: None,
        }
    }

    /// Discards buffered output, noting a termination if one was queued.
    fn drain_stale(&mut self) {
        loop {
            match self.handle.events.try_recv() {
                Ok(ShellEvent::Exited(code)) => self.exit_code = Some(code),
                Ok(_) => {}
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.exit_code.get_or_insert(-1);
                    break;
                }
            }
        }
    }

    async fn collect(&mut self, marker: &str, deadline: Instant) -> Collected {
        let mut buffer = String::new();
        let mut stdout = String::new();

        loop {
            match tokio::time::timeout_at(deadline, self.handle.events.recv()).await {
                Err(_) => return Collected::TimedOut,
                Ok(Some(ShellEvent::Stdout(chunk))) => {
                    buffer.push_str(&chunk);
                    stdout.push_str(&chunk);
                    if stdout.contains(marker) {
                        return Collected::Completed(buffer);
                    }
                }
                Ok(Some(ShellEvent::Stderr(chunk))) => buffer.push_str(&chunk),
                Ok(Some(ShellEvent::Exited(code))) => {
                    self.exit_code = Some(code);
                    return Collected::Exited(code);
                }
                Ok(None) => {
                    self.exit_code = Some(-1);
                    return Collected::Exited(-1);
                }
            }
        }
    }
}

enum Collected {
    Completed(String),
    TimedOut,
    Exited(i64),
}

impl SandboxSession {
    fn require_sandbox(&self) -> Result<&str, SandboxError> {
        self.sandbox_id.as_deref().ok_or(SandboxError::NotReady)
    }

    async fn send(&self, payload: &str) -> Result<(), SandboxError> {
        let shell = self.shell.as_ref().ok_or(SandboxError::NotReady)?;
        self.backend.send_stdin(&shell.handle.id, payload).await
    }

    async fn execute(&mut self, command: &str, propagate_exit: bool) -> Result<String, SandboxError> {
        self.require_sandbox()?;

        let needs_restart = match self.shell.as_mut() {
            Some(shell) => {
                shell.drain_stale();
                shell.exit_code.is_some()
            }
            None => true,
        };
        if needs_restart {
            self.restart().await?;
        }

        let marker = format!("{MARKER_PREFIX}{}", Uuid::new_v4().simple());
        let payload = format!("{command}; echo '{marker}'\n");

        match self.send(&payload).await {
            Err(e) if e.is_process_not_found() => {
                warn!(task_id = %self.task_id, "Shell went away, restarting: {}", e);
                self.restart().await?;
                self.send(&payload).await?;
            }
            other => other?,
        }

        self.touch().await;
        debug!(task_id = %self.task_id, command = %command, "Sent command");

        let deadline = Instant::now() + self.command_timeout;
        let shell = self.shell.as_mut().ok_or(SandboxError::NotReady)?;
        let output = match shell.collect(&marker, deadline).await {
            Collected::Completed(raw) => clean_output(&raw, &marker),
            Collected::TimedOut => {
                warn!(task_id = %self.task_id, command = %command, "Command timed out");
                format!("Error: {}", SandboxError::timeout(self.command_timeout))
            }
            Collected::Exited(code) => {
                let err = SandboxError::process_exited(code);
                if propagate_exit {
                    return Err(err);
                }
                format!("Error: {err}")
            }
        };

        Ok(render_command_output(command, &output))
    }

    async fn touch(&self) {
        if let Err(e) = self
            .store
            .update_sandbox_usage(self.task_id, SandboxState::Running)
            .await
        {
            warn!(task_id = %self.task_id, "Failed to record sandbox usage: {}", e);
        }
    }
}

// ============================================================================
// Helper functions
// ============================================================================

/// Strips the completion marker and any stale marker lines.
fn clean_output(raw: &str, marker: &str) -> String {
    raw.replace(marker, "")
        .lines()
        .filter(|line| !is_marker_line(line))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// True for a line holding nothing but a completion marker.
fn is_marker_line(line: &str) -> bool {
    line.trim()
        .strip_prefix(MARKER_PREFIX)
        .is_some_and(|id| id.len() == 32 && id.bytes().all(|b| b.is_ascii_hexdigit()))
}

/// Renders a command and its output as a fenced bash block.
pub(crate) fn render_command_output(command: &str, output: &str) -> String {
    format!("\n```bash\n$ {command}\n{output}\n```\n")
}

// ============================================================================
// Tests
// ============================================================================
