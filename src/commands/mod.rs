//! CLI command implementations.
//!
//! Each submodule implements one fleet subcommand, keeping formatting and
//! decision logic in pure functions and doing IO only at the top level.

pub mod complete;
pub mod init;
pub mod messages;
pub mod reclaim;
pub mod resume;
pub mod run;
pub mod status;
pub mod tasks;

use anyhow::{Context, Result};
use colored::Colorize;
use futures_util::StreamExt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::agent::ClaudeClient;
use crate::config::{Config, CONFIG_FILE};
use crate::orchestrator::Orchestrator;
use crate::relay::EventRelay;
use crate::sandbox::DockerBackend;
use crate::store::FileStore;

/// Loaded configuration plus the task store it points at.
pub(crate) struct Workspace {
    pub config: Config,
    pub store: Arc<FileStore>,
}

impl Workspace {
    /// Loads `--config` (or `fleet.toml` in the working directory) and opens the store.
    pub async fn open(config_path: Option<&Path>) -> Result<Self> {
        let path = match config_path {
            Some(path) => path.to_path_buf(),
            None => std::env::current_dir()
                .context("Failed to get current directory")?
                .join(CONFIG_FILE),
        };
        let config = Config::load_from(&path)?;
        let store = FileStore::open(config.store.resolve_dir()?).await?;
        Ok(Self {
            config,
            store: Arc::new(store),
        })
    }

    pub fn store_dir(&self) -> PathBuf {
        self.store.dir().to_path_buf()
    }

    /// Connects to Docker and the model API.
    pub async fn orchestrator(&self) -> Result<Orchestrator> {
        let backend = DockerBackend::connect(self.config.sandbox.clone())
            .await
            .context("Docker is not available")?;
        let model = ClaudeClient::new(self.config.agent.clone(), self.config.agent.api_key()?);

        Ok(Orchestrator::new(
            Arc::new(backend),
            self.store.clone(),
            Arc::new(model),
            Arc::new(EventRelay::new()),
            Arc::new(self.config.clone()),
        ))
    }
}

pub(crate) fn parse_task_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw.trim()).with_context(|| format!("Invalid task id: {raw}"))
}

/// Prints the task's event stream as SSE frames until the run ends.
///
/// With `complete`, the task is marked completed afterwards. The queue is
/// closed either way so the stream can finish.
pub(crate) async fn follow(
    orchestrator: &Orchestrator,
    task_id: Uuid,
    run: JoinHandle<()>,
    complete: bool,
) -> Result<()> {
    let frames = orchestrator.relay().sse_stream(task_id);
    let printer = tokio::spawn(async move {
        let mut frames = std::pin::pin!(frames);
        let mut stdout = std::io::stdout();
        while let Some(frame) = frames.next().await {
            if write!(stdout, "{frame}").and_then(|()| stdout.flush()).is_err() {
                break;
            }
        }
    });

    let joined = run.await;

    if complete && !orchestrator.complete(task_id).await? {
        eprintln!("{} Task {} was not completed", "⚠".yellow(), task_id);
    }
    orchestrator.relay().destroy(task_id);
    printer.await.context("Event printer failed")?;
    joined.context("Task run panicked")?;

    eprintln!(
        "\n{} Run finished for task {}",
        "✓".green().bold(),
        task_id.to_string().cyan()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_task_id() {
        let id = Uuid::new_v4();
        assert_eq!(parse_task_id(&format!(" {id} ")).unwrap(), id);
        assert!(parse_task_id("not-a-uuid")
            .unwrap_err()
            .to_string()
            .contains("Invalid task id"));
    }
}
