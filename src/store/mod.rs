//! Task persistence.
//!
//! The orchestration core only needs a narrow slice of task state: status,
//! sandbox bookkeeping and the conversation transcript. [`TaskStore`] is that
//! slice; [`FileStore`] keeps one JSON document per task on disk.

mod file;
#[cfg(test)]
mod memory;

pub(crate) use file::FileStore;
#[cfg(test)]
pub(crate) use memory::MemoryStore;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::conversation::{ContentBlock, ConversationMessage, Role};

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum TaskStatus {
    Running,
    PendingReview,
    Completed,
}

impl TaskStatus {
    /// Transitions permitted by `update_status`.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Running, Self::PendingReview) | (Self::PendingReview, Self::Running)
        )
    }

    /// Only a task awaiting review can be completed.
    pub fn can_complete(self) -> bool {
        self == Self::PendingReview
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::PendingReview => write!(f, "pending_review"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// Lifecycle state of a task's sandbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum SandboxState {
    Running,
    #[default]
    Paused,
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
        }
    }
}

/// Repository settings a task was started with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ProjectInfo {
    pub repo_clone_url: String,
    pub repo_name: String,
    #[serde(default)]
    pub rules_file_path: Option<String>,
    #[serde(default)]
    pub setup_script_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Task {
    pub id: Uuid,
    #[serde(default)]
    pub title: Option<String>,
    pub description: String,
    pub status: TaskStatus,
    pub project: ProjectInfo,
    #[serde(default)]
    pub sandbox_id: Option<String>,
    #[serde(default)]
    pub sandbox_state: SandboxState,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(description: impl Into<String>, project: ProjectInfo) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: None,
            description: description.into(),
            status: TaskStatus::Running,
            project,
            sandbox_id: None,
            sandbox_state: SandboxState::Paused,
            last_used_at: None,
            created_at: Utc::now(),
        }
    }

    /// True when the sandbox is marked running and was last used before `cutoff`.
    pub fn is_idle_since(&self, cutoff: DateTime<Utc>) -> bool {
        self.sandbox_id.is_some()
            && self.sandbox_state == SandboxState::Running
            && self.last_used_at.is_some_and(|used| used < cutoff)
    }
}

/// A content block with its position inside a stored message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct SequencedBlock {
    pub sequence_number: u32,
    pub block: ContentBlock,
}

/// A persisted conversation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct StoredMessage {
    pub message_order: u32,
    pub role: Role,
    pub blocks: Vec<SequencedBlock>,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    pub fn new(message_order: u32, role: Role, blocks: Vec<ContentBlock>) -> Self {
        let blocks = (0u32..)
            .zip(blocks)
            .map(|(sequence_number, block)| SequencedBlock {
                sequence_number,
                block,
            })
            .collect();
        Self {
            message_order,
            role,
            blocks,
            created_at: Utc::now(),
        }
    }

    /// Rebuilds the model-facing message.
    pub fn to_conversation(&self) -> ConversationMessage {
        ConversationMessage {
            role: self.role,
            content: self.blocks.iter().map(|b| b.block.clone()).collect(),
        }
    }
}

/// Errors raised by task stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: Uuid },
}

/// Persistence for tasks and their transcripts.
#[async_trait]
pub(crate) trait TaskStore: Send + Sync {
    async fn create_task(&self, task: Task) -> Result<Task>;

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>>;

    /// All tasks, newest first.
    async fn list_tasks(&self) -> Result<Vec<Task>>;

    async fn update_title(&self, task_id: Uuid, title: &str) -> Result<()>;

    /// Applies a status transition; returns false if it was rejected.
    async fn update_status(&self, task_id: Uuid, status: TaskStatus) -> Result<bool>;

    /// Marks a task completed; returns false if it was rejected.
    async fn complete_task(&self, task_id: Uuid) -> Result<bool>;

    async fn set_sandbox_id(&self, task_id: Uuid, sandbox_id: &str) -> Result<()>;

    /// Records the sandbox state and stamps `last_used_at` with now.
    async fn update_sandbox_usage(&self, task_id: Uuid, state: SandboxState) -> Result<()>;

    async fn append_message(
        &self,
        task_id: Uuid,
        message_order: u32,
        role: Role,
        blocks: Vec<ContentBlock>,
    ) -> Result<StoredMessage>;

    /// Messages ordered by `message_order`.
    async fn list_messages(&self, task_id: Uuid) -> Result<Vec<StoredMessage>>;

    /// The order the next appended message should take.
    async fn next_message_order(&self, task_id: Uuid) -> Result<u32> {
        let messages = self.list_messages(task_id).await?;
        Ok(messages.last().map_or(0, |m| m.message_order + 1))
    }

    /// Tasks whose sandbox is running and unused since `cutoff`.
    async fn idle_sandboxes(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>> {
        let tasks = self.list_tasks().await?;
        Ok(tasks.into_iter().filter(|t| t.is_idle_since(cutoff)).collect())
    }
}

// ----------------------------------------------------------------------------
// Helper functions
// ----------------------------------------------------------------------------

/// Applies a status change to a task record, logging rejected transitions.
pub(crate) fn apply_status(task: &mut Task, status: TaskStatus) -> bool {
    if !task.status.can_transition_to(status) {
        warn!(
            event = "status_transition_rejected",
            task_id = %task.id,
            from = %task.status,
            to = %status,
        );
        return false;
    }
    task.status = status;
    true
}

/// Marks a task completed, logging rejected completions.
pub(crate) fn apply_complete(task: &mut Task) -> bool {
    if !task.status.can_complete() {
        warn!(
            event = "status_transition_rejected",
            task_id = %task.id,
            from = %task.status,
            to = %TaskStatus::Completed,
        );
        return false;
    }
    task.status = TaskStatus::Completed;
    true
}

pub(crate) fn apply_sandbox_usage(task: &mut Task, state: SandboxState) {
    task.sandbox_state = state;
    task.last_used_at = Some(Utc::now());
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
