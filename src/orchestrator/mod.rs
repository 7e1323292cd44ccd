//! Task orchestration.
//!
//! Ties the pieces together for one task: acquire a sandbox, provision or
//! reconnect it, run the agent loop, release the sandbox and hand the task
//! back for review. At most one run per task is in flight at any time.

mod agent_loop;
mod setup;

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::agent::{title_or_fallback, ModelClient};
use crate::config::Config;
use crate::conversation::{ContentBlock, ConversationMessage, Role};
use crate::relay::{EventRelay, TaskEvent};
use crate::sandbox::{SandboxBackend, SandboxSession};
use crate::store::{ProjectInfo, StoredMessage, Task, TaskStatus, TaskStore};
use crate::templates;
use crate::tools::Toolbox;

use agent_loop::AgentLoop;
use setup::SetupPlan;

/// Errors raised before a run is spawned.
#[derive(Debug, thiserror::Error)]
pub enum OrchestrationError {
    #[error("Task {task_id} already has a run in progress")]
    AlreadyRunning { task_id: Uuid },

    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: Uuid },

    #[error("Task {task_id} is completed")]
    TaskCompleted { task_id: Uuid },
}

impl OrchestrationError {
    #[allow(dead_code)]
    pub fn is_already_running(&self) -> bool {
        matches!(self, Self::AlreadyRunning { .. })
    }
}

/// What a spawned run does after acquiring its sandbox.
enum RunMode {
    /// Fresh sandbox: provision it, then optionally run the agent.
    Start { access_token: String, skip_agent: bool },
    /// Existing sandbox: reconnect and run the agent on the stored history.
    Continue,
}

/// Spawns and tracks task runs.
#[derive(Clone)]
pub(crate) struct Orchestrator {
    backend: Arc<dyn SandboxBackend>,
    store: Arc<dyn TaskStore>,
    model: Arc<dyn ModelClient>,
    relay: Arc<EventRelay>,
    config: Arc<Config>,
    active: Arc<Mutex<HashSet<Uuid>>>,
}

// ============================================================================
// Public API
// ============================================================================

impl Orchestrator {
    pub fn new(
        backend: Arc<dyn SandboxBackend>,
        store: Arc<dyn TaskStore>,
        model: Arc<dyn ModelClient>,
        relay: Arc<EventRelay>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            backend,
            store,
            model,
            relay,
            config,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn relay(&self) -> &Arc<EventRelay> {
        &self.relay
    }

    /// Persists a new task with its description as the first user message.
    pub async fn create_task(&self, description: &str, project: ProjectInfo) -> Result<Task> {
        let task = self
            .store
            .create_task(Task::new(description, project))
            .await
            .context("Failed to create task")?;
        self.store
            .append_message(task.id, 0, Role::User, vec![ContentBlock::text(description)])
            .await?;
        self.relay.create(task.id);

        info!(event = "task_created", task_id = %task.id, repo = %task.project.repo_name);
        Ok(task)
    }

    /// Generates and stores a title in the background.
    pub fn spawn_title(&self, task_id: Uuid, description: String) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let title = title_or_fallback(this.model.as_ref(), &description).await;
            match this.store.update_title(task_id, &title).await {
                Ok(()) => info!(event = "task_titled", task_id = %task_id, title = %title),
                Err(e) => warn!(task_id = %task_id, "Failed to store title: {}", e),
            }
        })
    }

    /// Provisions a fresh sandbox for the task and runs the agent on it.
    pub async fn start(
        &self,
        task_id: Uuid,
        access_token: String,
        skip_agent: bool,
    ) -> Result<JoinHandle<()>> {
        let task = self.load_task(task_id).await?;
        if task.status == TaskStatus::Completed {
            return Err(OrchestrationError::TaskCompleted { task_id }.into());
        }
        // A task provisions exactly one sandbox; later runs go through continue.
        if task.status != TaskStatus::Running || task.sandbox_id.is_some() {
            return Err(OrchestrationError::AlreadyRunning { task_id }.into());
        }
        let guard = self.claim(task_id)?;
        self.relay.create(task_id);

        Ok(self.spawn_run(
            task,
            RunMode::Start {
                access_token,
                skip_agent,
            },
            guard,
        ))
    }

    /// Appends a user message and resumes the task's sandbox.
    ///
    /// Only a task awaiting review can be continued. The store's
    /// `pending_review -> running` transition is the claim shared by every
    /// process, so a run elsewhere makes this fail with `AlreadyRunning`.
    pub async fn continue_task(&self, task_id: Uuid, text: &str) -> Result<JoinHandle<()>> {
        let task = self.load_task(task_id).await?;
        match task.status {
            TaskStatus::Completed => {
                return Err(OrchestrationError::TaskCompleted { task_id }.into());
            }
            TaskStatus::Running => {
                return Err(OrchestrationError::AlreadyRunning { task_id }.into());
            }
            TaskStatus::PendingReview => {}
        }
        let guard = self.claim(task_id)?;

        if !self.store.update_status(task_id, TaskStatus::Running).await? {
            return Err(OrchestrationError::AlreadyRunning { task_id }.into());
        }
        let order = match self.append_follow_up(task_id, text).await {
            Ok(order) => order,
            Err(e) => {
                self.store
                    .update_status(task_id, TaskStatus::PendingReview)
                    .await?;
                return Err(e);
            }
        };
        self.relay.create(task_id);

        info!(event = "task_continued", task_id = %task_id, message_order = order);
        Ok(self.spawn_run(task, RunMode::Continue, guard))
    }

    /// Marks a task awaiting review completed and closes its event queue.
    ///
    /// Returns false, leaving the queue open, when the task is running or
    /// already completed.
    pub async fn complete(&self, task_id: Uuid) -> Result<bool> {
        let completed = self.store.complete_task(task_id).await?;
        if completed {
            self.relay.destroy(task_id);
            info!(event = "task_completed", task_id = %task_id);
        }
        Ok(completed)
    }
}

// ============================================================================
// Internal types
// ============================================================================

/// Holds a task's slot in the active set until dropped.
struct RunGuard {
    active: Arc<Mutex<HashSet<Uuid>>>,
    task_id: Uuid,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.task_id);
    }
}

impl Orchestrator {
    async fn load_task(&self, task_id: Uuid) -> Result<Task> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| OrchestrationError::TaskNotFound { task_id }.into())
    }

    async fn append_follow_up(&self, task_id: Uuid, text: &str) -> Result<u32> {
        let order = self.store.next_message_order(task_id).await?;
        self.store
            .append_message(task_id, order, Role::User, vec![ContentBlock::text(text)])
            .await?;
        Ok(order)
    }

    fn claim(&self, task_id: Uuid) -> Result<RunGuard, OrchestrationError> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(task_id) {
            return Err(OrchestrationError::AlreadyRunning { task_id });
        }
        Ok(RunGuard {
            active: Arc::clone(&self.active),
            task_id,
        })
    }

    fn spawn_run(&self, task: Task, mode: RunMode, guard: RunGuard) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let result = this.with_sandbox(&task, mode).await;
            this.finish(task.id, result).await;
        })
    }

    /// Runs `mode` inside an acquired sandbox and always releases it.
    async fn with_sandbox(&self, task: &Task, mode: RunMode) -> Result<()> {
        let reconnect_id = match mode {
            RunMode::Start { .. } => None,
            RunMode::Continue => task.sandbox_id.clone(),
        };
        let mut session = SandboxSession::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.store),
            task.id,
            reconnect_id,
            self.config.sandbox.command_timeout(),
        );

        let result = self.drive(&mut session, task, mode).await;

        if let Err(e) = session.release().await {
            warn!(task_id = %task.id, "Failed to release sandbox: {:#}", e);
        }
        result
    }

    async fn drive(&self, session: &mut SandboxSession, task: &Task, mode: RunMode) -> Result<()> {
        session.acquire().await.context("Failed to acquire sandbox")?;
        let repo_path = self.config.sandbox.repo_path.as_str();

        let rules = match &mode {
            RunMode::Start {
                access_token,
                skip_agent,
            } => {
                let plan = SetupPlan {
                    project: &task.project,
                    git: &self.config.git,
                    install_command: &self.config.setup.install_command,
                    repo_path,
                    access_token,
                };
                let rules = setup::provision(session, &self.relay, task.id, &plan).await?;
                if *skip_agent {
                    info!(event = "agent_skipped", task_id = %task.id);
                    return Ok(());
                }
                rules
            }
            RunMode::Continue => {
                setup::read_rules(session, repo_path, task.project.rules_file_path.as_deref())
                    .await?
            }
        };

        let history: Vec<ConversationMessage> = self
            .store
            .list_messages(task.id)
            .await?
            .iter()
            .map(StoredMessage::to_conversation)
            .collect();
        let system = templates::system_prompt(
            repo_path,
            self.config.sandbox.command_timeout_secs,
            &rules,
        );

        info!(
            event = "agent_started",
            task_id = %task.id,
            model = self.model.name(),
            sandbox_id = session.sandbox_id().unwrap_or_default(),
            messages = history.len(),
        );
        let agent = AgentLoop {
            model: self.model.as_ref(),
            store: self.store.as_ref(),
            relay: &self.relay,
            task_id: task.id,
            max_iterations: self.config.agent.max_iterations,
        };
        let mut toolbox = Toolbox::new(session);
        let outcome = agent.run(&mut toolbox, history, &system).await?;
        info!(
            event = "agent_stopped",
            task_id = %task.id,
            iterations = outcome.iterations,
            reason = ?outcome.reason,
        );
        Ok(())
    }

    /// Reports a failed run and hands the task back for review.
    async fn finish(&self, task_id: Uuid, result: Result<()>) {
        if let Err(e) = &result {
            error!(event = "run_failed", task_id = %task_id, "Task run failed: {:#}", e);
            self.relay.push(
                task_id,
                TaskEvent::Error {
                    error_message: format!("{e:#}"),
                },
            );
        }

        if let Err(e) = self
            .store
            .update_status(task_id, TaskStatus::PendingReview)
            .await
        {
            error!(task_id = %task_id, "Failed to mark task for review: {:#}", e);
        }
        info!(event = "run_finished", task_id = %task_id, ok = result.is_ok());
    }
}

// ============================================================================
// Tests
// ============================================================================
