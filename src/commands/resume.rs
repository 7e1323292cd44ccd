//! Continue a task with a follow-up message.

use anyhow::{bail, Result};
use colored::Colorize;

use super::{follow, parse_task_id, Workspace};

pub(crate) async fn run(workspace: &Workspace, task_id: &str, text: &str, complete: bool) -> Result<()> {
    let task_id = parse_task_id(task_id)?;
    if text.trim().is_empty() {
        bail!("Message must not be empty");
    }

    let orchestrator = workspace.orchestrator().await?;
    let handle = orchestrator.continue_task(task_id, text).await?;
    eprintln!("{} Continuing task {}", "→".blue(), task_id.to_string().cyan());

    follow(&orchestrator, task_id, handle, complete).await
}
