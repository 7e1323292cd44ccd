//! Domain-specific error types for sandbox operations.
//!
//! Typed errors enable callers to match on specific failure modes
//! rather than parsing error message strings.

use std::time::Duration;

/// Errors that can occur during sandbox operations.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Session used before `acquire` completed.
    #[error("Sandbox session is not ready: acquire must complete before use")]
    NotReady,

    /// A command did not print its completion marker in time.
    #[error("Command timed out after {timeout_secs} seconds")]
    Timeout { timeout_secs: u64 },

    /// The shell process handle is stale (the process no longer exists).
    #[error("Shell process not found: {shell_id}")]
    ProcessNotFound { shell_id: String },

    /// The shell process terminated.
    #[error("Shell process exited with code {exit_code}")]
    ProcessExited { exit_code: i64 },

    /// The sandbox identifier does not refer to a known sandbox.
    #[error("Sandbox not found: {sandbox_id}")]
    SandboxNotFound { sandbox_id: String },

    /// A file or directory does not exist inside the sandbox.
    #[error("No such file or directory: {path}")]
    FileNotFound { path: String },

    /// Docker daemon is not running or not accessible.
    #[error("Docker is not available: {message}")]
    DockerUnavailable { message: String },

    /// Unrecovered transport or remote failure.
    #[error("Sandbox transport failed: {message}")]
    Transport { message: String },
}

impl SandboxError {
    /// Creates a `Timeout` error from a `Duration`.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout {
            timeout_secs: duration.as_secs(),
        }
    }

    /// Creates a `ProcessNotFound` error.
    pub fn process_not_found(shell_id: impl Into<String>) -> Self {
        Self::ProcessNotFound {
            shell_id: shell_id.into(),
        }
    }

    /// Creates a `ProcessExited` error.
    pub fn process_exited(exit_code: i64) -> Self {
        Self::ProcessExited { exit_code }
    }

    /// Creates a `SandboxNotFound` error.
    pub fn sandbox_not_found(sandbox_id: impl Into<String>) -> Self {
        Self::SandboxNotFound {
            sandbox_id: sandbox_id.into(),
        }
    }

    /// Creates a `FileNotFound` error.
    pub fn file_not_found(path: impl Into<String>) -> Self {
        Self::FileNotFound { path: path.into() }
    }

    /// Creates a `DockerUnavailable` error.
    pub fn docker_unavailable(message: impl Into<String>) -> Self {
        Self::DockerUnavailable {
            message: message.into(),
        }
    }

    /// Creates a `Transport` error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Returns true if the shell handle is stale and a restart may help.
    pub fn is_process_not_found(&self) -> bool {
        matches!(self, Self::ProcessNotFound { .. })
    }

    /// Returns true if this is a missing file error.
    pub fn is_file_not_found(&self) -> bool {
        matches!(self, Self::FileNotFound { .. })
    }

    /// Returns true if this is a timeout error.
    #[allow(dead_code)] // Public API for callers
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
