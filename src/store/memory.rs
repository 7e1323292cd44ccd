//! In-memory task store for tests.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    apply_complete, apply_sandbox_usage, apply_status, SandboxState, StoreError, StoredMessage,
    Task, TaskStatus, TaskStore,
};
use crate::conversation::{ContentBlock, Role};

#[derive(Default)]
pub(crate) struct MemoryStore {
    tasks: Mutex<HashMap<Uuid, (Task, Vec<StoredMessage>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn with_task<R>(
        &self,
        task_id: Uuid,
        apply: impl FnOnce(&mut Task, &mut Vec<StoredMessage>) -> R,
    ) -> Result<R> {
        let mut tasks = self.tasks.lock().await;
        let (task, messages) = tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound { task_id })?;
        Ok(apply(task, messages))
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn create_task(&self, task: Task) -> Result<Task> {
        self.tasks
            .lock()
            .await
            .insert(task.id, (task.clone(), Vec::new()));
        Ok(task)
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>> {
        Ok(self.tasks.lock().await.get(&task_id).map(|(t, _)| t.clone()))
    }

    async fn list_tasks(&self) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .tasks
            .lock()
            .await
            .values()
            .map(|(t, _)| t.clone())
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks)
    }

    async fn update_title(&self, task_id: Uuid, title: &str) -> Result<()> {
        self.with_task(task_id, |task, _| task.title = Some(title.to_string()))
            .await
    }

    async fn update_status(&self, task_id: Uuid, status: TaskStatus) -> Result<bool> {
        self.with_task(task_id, |task, _| apply_status(task, status))
            .await
    }

    async fn complete_task(&self, task_id: Uuid) -> Result<bool> {
        self.with_task(task_id, |task, _| apply_complete(task)).await
    }

    async fn set_sandbox_id(&self, task_id: Uuid, sandbox_id: &str) -> Result<()> {
        self.with_task(task_id, |task, _| {
            task.sandbox_id = Some(sandbox_id.to_string());
        })
        .await
    }

    async fn update_sandbox_usage(&self, task_id: Uuid, state: SandboxState) -> Result<()> {
        self.with_task(task_id, |task, _| apply_sandbox_usage(task, state))
            .await
    }

    async fn append_message(
        &self,
        task_id: Uuid,
        message_order: u32,
        role: Role,
        blocks: Vec<ContentBlock>,
    ) -> Result<StoredMessage> {
        let message = StoredMessage::new(message_order, role, blocks);
        let stored = message.clone();
        self.with_task(task_id, move |_, messages| {
            messages.push(message);
            messages.sort_by_key(|m| m.message_order);
        })
        .await?;
        Ok(stored)
    }

    async fn list_messages(&self, task_id: Uuid) -> Result<Vec<StoredMessage>> {
        self.with_task(task_id, |_, messages| messages.clone()).await
    }
}
