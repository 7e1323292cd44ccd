//! Sandboxes: ephemeral execution environments with a persistent shell.
//!
//! A [`SandboxBackend`] is the transport (Docker in production); a
//! [`SandboxSession`] layers request/response command execution on top of
//! one long-lived shell process inside one sandbox.

mod docker;
mod error;
#[cfg(test)]
pub(crate) mod fake;
mod session;

pub(crate) use docker::DockerBackend;
pub(crate) use error::SandboxError;
pub(crate) use session::SandboxSession;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Invocation signature of the persistent shell.
pub(crate) const SHELL_SIGNATURE: &str = "/bin/bash";

/// A chunk of shell output, or the shell's termination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ShellEvent {
    /// Text written to standard output.
    Stdout(String),
    /// Text written to standard error.
    Stderr(String),
    /// The shell terminated with this exit code.
    Exited(i64),
}

/// A live attachment to a shell process.
///
/// The receiver is the only consumer of the process output; the transport
/// pushes chunks as they arrive.
#[derive(Debug)]
pub(crate) struct ShellHandle {
    /// Transport-level process identifier (exec id for Docker).
    pub id: String,
    /// Output and termination events, in arrival order.
    pub events: mpsc::UnboundedReceiver<ShellEvent>,
}

/// Transport for sandbox lifecycle, shell processes and files.
#[async_trait]
pub(crate) trait SandboxBackend: Send + Sync {
    /// Creates and starts a new sandbox, returning its identifier.
    async fn create(&self, task_label: &str) -> Result<String, SandboxError>;

    /// Brings a paused or stopped sandbox back to running.
    async fn resume(&self, sandbox_id: &str) -> Result<(), SandboxError>;

    /// Pauses a running sandbox.
    async fn pause(&self, sandbox_id: &str) -> Result<(), SandboxError>;

    /// Starts a new background shell process running `signature`.
    async fn spawn_shell(
        &self,
        sandbox_id: &str,
        signature: &str,
    ) -> Result<ShellHandle, SandboxError>;

    /// Attaches to a still-running shell started with `signature`, if any.
    async fn attach_shell(
        &self,
        sandbox_id: &str,
        signature: &str,
    ) -> Result<Option<ShellHandle>, SandboxError>;

    /// Writes to the standard input of a shell process.
    async fn send_stdin(&self, shell_id: &str, data: &str) -> Result<(), SandboxError>;

    /// Reads a whole file as UTF-8 text.
    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<String, SandboxError>;

    /// Writes a file, creating or overwriting it.
    async fn write_file(
        &self,
        sandbox_id: &str,
        path: &str,
        content: &str,
    ) -> Result<(), SandboxError>;

    /// Lists the entry names of a directory.
    async fn list_dir(&self, sandbox_id: &str, path: &str) -> Result<Vec<String>, SandboxError>;
}
