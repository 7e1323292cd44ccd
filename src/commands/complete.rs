//! Mark a task completed.
//!
//! The decision is pure: given the stored task, say what completing it means.
//! Only the top level touches the store.

use anyhow::{bail, Context, Result};
use colored::Colorize;
use std::fmt::Write;
use uuid::Uuid;

use super::{parse_task_id, Workspace};
use crate::store::{Task, TaskStatus, TaskStore};

// -----------------------------------------------------------------------------
// Public API
// -----------------------------------------------------------------------------

pub(crate) async fn run(workspace: &Workspace, task_id: &str) -> Result<()> {
    let task_id = parse_task_id(task_id)?;
    let task = workspace
        .store
        .get_task(task_id)
        .await?
        .with_context(|| format!("Task not found: {task_id}"))?;

    let mut outcome = plan_completion(&task);
    if outcome == CompleteResult::Completed && !workspace.store.complete_task(task_id).await? {
        // The task moved on since it was read.
        let current = workspace
            .store
            .get_task(task_id)
            .await?
            .with_context(|| format!("Task not found: {task_id}"))?;
        outcome = plan_completion(&current);
        if outcome == CompleteResult::Completed {
            outcome = CompleteResult::StillRunning;
        }
    }

    if outcome == CompleteResult::StillRunning {
        bail!("Task {task_id} is still running; wait for the run to finish before completing it");
    }
    print!("{}", format_result(task_id, outcome));
    Ok(())
}

// -----------------------------------------------------------------------------
// Internal types
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompleteResult {
    Completed,
    AlreadyCompleted,
    StillRunning,
}

// -----------------------------------------------------------------------------
// Helper functions
// -----------------------------------------------------------------------------

fn plan_completion(task: &Task) -> CompleteResult {
    match task.status {
        TaskStatus::PendingReview => CompleteResult::Completed,
        TaskStatus::Completed => CompleteResult::AlreadyCompleted,
        TaskStatus::Running => CompleteResult::StillRunning,
    }
}

fn format_result(task_id: Uuid, result: CompleteResult) -> String {
    let mut out = String::new();
    let _ = match result {
        CompleteResult::Completed => writeln!(
            out,
            "{} Task {} completed.",
            "✓".green(),
            task_id.to_string().cyan()
        ),
        CompleteResult::AlreadyCompleted => writeln!(
            out,
            "{} Task {} was already completed.",
            "ℹ".blue(),
            task_id.to_string().cyan()
        ),
        CompleteResult::StillRunning => writeln!(
            out,
            "{} Task {} is still running.",
            "⚠".yellow(),
            task_id.to_string().cyan()
        ),
    };
    out
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ProjectInfo;

    #[test]
    fn test_plan_completion() {
        let mut task = Task::new("x", ProjectInfo::default());
        assert_eq!(plan_completion(&task), CompleteResult::StillRunning);

        task.status = TaskStatus::PendingReview;
        assert_eq!(plan_completion(&task), CompleteResult::Completed);

        task.status = TaskStatus::Completed;
        assert_eq!(plan_completion(&task), CompleteResult::AlreadyCompleted);
    }

    #[test]
    fn test_format_result() {
        let id = Uuid::new_v4();
        assert!(format_result(id, CompleteResult::Completed).contains("completed."));
        assert!(format_result(id, CompleteResult::AlreadyCompleted).contains("already completed"));
        assert!(format_result(id, CompleteResult::StillRunning).contains("still running"));
    }
}
