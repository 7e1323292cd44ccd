//! JSON-file task store: one `<task-id>.json` document per task.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    apply_complete, apply_sandbox_usage, apply_status, SandboxState, StoreError, StoredMessage,
    Task, TaskStatus, TaskStore,
};
use crate::conversation::{ContentBlock, Role};

#[derive(Debug, Serialize, Deserialize)]
struct TaskRecord {
    task: Task,
    #[serde(default)]
    messages: Vec<StoredMessage>,
}

pub(crate) struct FileStore {
    dir: PathBuf,
    // Serializes read-modify-write cycles across tasks.
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Opens (and creates if needed) a store rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create store directory: {}", dir.display()))?;
        debug!("Opened task store at {}", dir.display());
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, task_id: Uuid) -> PathBuf {
        self.dir.join(format!("{task_id}.json"))
    }

    async fn load(&self, task_id: Uuid) -> Result<Option<TaskRecord>> {
        let path = self.record_path(task_id);
        match fs::read_to_string(&path).await {
            Ok(content) => {
                let record = serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse task file: {}", path.display()))?;
                Ok(Some(record))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to read task file: {}", path.display())),
        }
    }

    async fn save(&self, record: &TaskRecord) -> Result<()> {
        let path = self.record_path(record.task.id);
        let tmp_path = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(record).context("Failed to serialize task")?;

        fs::write(&tmp_path, content)
            .await
            .with_context(|| format!("Failed to write task file: {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &path)
            .await
            .with_context(|| format!("Failed to replace task file: {}", path.display()))?;
        Ok(())
    }

    async fn update<R>(&self, task_id: Uuid, apply: impl FnOnce(&mut TaskRecord) -> R) -> Result<R> {
        let _guard = self.write_lock.lock().await;
        let mut record = self
            .load(task_id)
            .await?
            .ok_or(StoreError::TaskNotFound { task_id })?;
        let result = apply(&mut record);
        self.save(&record).await?;
        Ok(result)
    }
}

#[async_trait]
impl TaskStore for FileStore {
    async fn create_task(&self, task: Task) -> Result<Task> {
        let _guard = self.write_lock.lock().await;
        let record = TaskRecord {
            task,
            messages: Vec::new(),
        };
        self.save(&record).await?;
        Ok(record.task)
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>> {
        Ok(self.load(task_id).await?.map(|record| record.task))
    }

    async fn list_tasks(&self) -> Result<Vec<Task>> {
        let mut entries = fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("Failed to read store directory: {}", self.dir.display()))?;

        let mut tasks = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = fs::read_to_string(&path)
                .await
                .map_err(anyhow::Error::from)
                .and_then(|content| {
                    serde_json::from_str::<TaskRecord>(&content).map_err(anyhow::Error::from)
                });
            match parsed {
                Ok(record) => tasks.push(record.task),
                Err(e) => warn!("Skipping unreadable task file {}: {}", path.display(), e),
            }
        }

        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks)
    }

    async fn update_title(&self, task_id: Uuid, title: &str) -> Result<()> {
        self.update(task_id, |record| record.task.title = Some(title.to_string()))
            .await
    }

    async fn update_status(&self, task_id: Uuid, status: TaskStatus) -> Result<bool> {
        self.update(task_id, |record| apply_status(&mut record.task, status))
            .await
    }

    async fn complete_task(&self, task_id: Uuid) -> Result<bool> {
        self.update(task_id, |record| apply_complete(&mut record.task))
            .await
    }

    async fn set_sandbox_id(&self, task_id: Uuid, sandbox_id: &str) -> Result<()> {
        self.update(task_id, |record| {
            record.task.sandbox_id = Some(sandbox_id.to_string());
        })
        .await
    }

    async fn update_sandbox_usage(&self, task_id: Uuid, state: SandboxState) -> Result<()> {
        self.update(task_id, |record| apply_sandbox_usage(&mut record.task, state))
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
        self.update(task_id, move |record| {
            record.messages.push(message);
            record.messages.sort_by_key(|m| m.message_order);
        })
        .await?;
        Ok(stored)
    }

    async fn list_messages(&self, task_id: Uuid) -> Result<Vec<StoredMessage>> {
        let record = self
            .load(task_id)
            .await?
            .ok_or(StoreError::TaskNotFound { task_id })?;
        Ok(record.messages)
    }
}
