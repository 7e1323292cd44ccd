use anyhow::{Context, Result};
use colored::Colorize;
use std::fmt::Write;

use super::{parse_task_id, Workspace};
use crate::store::{Task, TaskStatus, TaskStore};

pub async fn run(workspace: &Workspace, task_id: &str) -> Result<()> {
    let task_id = parse_task_id(task_id)?;
    let task = workspace
        .store
        .get_task(task_id)
        .await?
        .with_context(|| format!("Task not found: {task_id}"))?;
    let message_count = workspace.store.list_messages(task_id).await?.len();

    print!("{}", format_task(&task, message_count));
    Ok(())
}

fn format_task(task: &Task, message_count: usize) -> String {
    let mut out = String::new();
    let rule = "━".repeat(50);

    let _ = writeln!(out, "\n{}", rule.dimmed());
    let _ = writeln!(
        out,
        "   {}",
        task.title.as_deref().unwrap_or("(untitled)").yellow().bold()
    );
    let _ = writeln!(out, "{}", rule.dimmed());

    let status = match task.status {
        TaskStatus::Running => task.status.to_string().green().bold(),
        TaskStatus::PendingReview => task.status.to_string().yellow(),
        TaskStatus::Completed => task.status.to_string().blue(),
    };
    let _ = writeln!(out, "  Id:         {}", task.id.to_string().cyan());
    let _ = writeln!(out, "  Status:     {status}");
    let _ = writeln!(out, "  Repository: {}", task.project.repo_name.cyan());
    let _ = writeln!(
        out,
        "  Sandbox:    {}",
        task.sandbox_id
            .as_deref()
            .map_or_else(|| "none".to_string(), |id| format!("{id} ({})", task.sandbox_state))
            .cyan()
    );
    let _ = writeln!(
        out,
        "  Created:    {}",
        task.created_at
            .format("%Y-%m-%d %H:%M:%S UTC")
            .to_string()
            .cyan()
    );
    if let Some(last) = task.last_used_at {
        let _ = writeln!(
            out,
            "  Last used:  {}",
            last.format("%Y-%m-%d %H:%M:%S UTC").to_string().cyan()
        );
    }
    let _ = writeln!(out, "  Messages:   {}", message_count.to_string().cyan());
    let _ = writeln!(out, "{}", rule.dimmed());
    let _ = writeln!(out, "  {}", task.description);

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ProjectInfo, SandboxState};

    fn task() -> Task {
        Task::new(
            "Fix the login redirect",
            ProjectInfo {
                repo_clone_url: "https://github.com/acme/widgets.git".to_string(),
                repo_name: "widgets".to_string(),
                ..ProjectInfo::default()
            },
        )
    }

    #[test]
    fn test_format_new_task() {
        let task = task();
        let output = format_task(&task, 1);
        assert!(output.contains("(untitled)"));
        assert!(output.contains("running"));
        assert!(output.contains("widgets"));
        assert!(output.contains("none"));
        assert!(output.contains("Fix the login redirect"));
        assert!(!output.contains("Last used"));
    }

    #[test]
    fn test_format_task_with_sandbox() {
        let mut task = task();
        task.title = Some("Login redirect".to_string());
        task.status = TaskStatus::PendingReview;
        task.sandbox_id = Some("abc123".to_string());
        task.sandbox_state = SandboxState::Paused;
        task.last_used_at = Some(chrono::Utc::now());

        let output = format_task(&task, 4);
        assert!(output.contains("Login redirect"));
        assert!(output.contains("pending_review"));
        assert!(output.contains("abc123 (paused)"));
        assert!(output.contains("Last used"));
    }
}
