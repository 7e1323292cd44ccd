//! List stored tasks, newest first.

use anyhow::Result;
use colored::Colorize;
use std::fmt::Write;
use std::path::Path;

use super::Workspace;
use crate::store::{Task, TaskStatus, TaskStore};

pub(crate) async fn run(workspace: &Workspace) -> Result<()> {
    let tasks = workspace.store.list_tasks().await?;
    print!("{}", format_tasks(&tasks, &workspace.store_dir()));
    Ok(())
}

fn format_tasks(tasks: &[Task], store_dir: &Path) -> String {
    let mut out = String::new();
    if tasks.is_empty() {
        let _ = writeln!(out, "{} No tasks in {}", "ℹ".blue(), store_dir.display());
        let _ = writeln!(out, "  Run {} to start one.", "fleet run".green());
        return out;
    }

    for task in tasks {
        let marker = match task.status {
            TaskStatus::Running => "●".green(),
            TaskStatus::PendingReview => "◐".yellow(),
            TaskStatus::Completed => "○".dimmed(),
        };
        let _ = writeln!(
            out,
            "{marker} {}  {:<15} {}  {}",
            task.id.to_string().cyan(),
            task.status.to_string(),
            task.created_at.format("%Y-%m-%d %H:%M"),
            task.title.as_deref().unwrap_or(&task.description)
        );
    }
    out
}
