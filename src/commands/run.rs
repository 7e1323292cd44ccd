//! Create a task and run it in a fresh sandbox.

use anyhow::{bail, Result};
use colored::Colorize;
use tracing::info;

use super::{follow, Workspace};
use crate::config::ProjectConfig;
use crate::store::ProjectInfo;

/// Flags accepted by `fleet run`.
#[derive(Debug, Clone, Default)]
pub(crate) struct RunOptions {
    pub description: String,
    pub repo: Option<String>,
    pub repo_name: Option<String>,
    pub rules_file: Option<String>,
    pub setup_script: Option<String>,
    pub token: Option<String>,
    pub skip_agent: bool,
    pub complete: bool,
}

pub(crate) async fn run(workspace: &Workspace, options: RunOptions) -> Result<()> {
    if options.description.trim().is_empty() {
        bail!("Task description must not be empty");
    }
    let project = resolve_project(&options, &workspace.config.project)?;
    let orchestrator = workspace.orchestrator().await?;

    let task = orchestrator
        .create_task(&options.description, project)
        .await?;
    eprintln!(
        "{} Created task {} for {}",
        "→".blue(),
        task.id.to_string().cyan(),
        task.project.repo_name.cyan()
    );
    info!(event = "run_requested", task_id = %task.id, skip_agent = options.skip_agent);

    let title = orchestrator.spawn_title(task.id, task.description.clone());
    let handle = orchestrator
        .start(task.id, options.token.unwrap_or_default(), options.skip_agent)
        .await?;

    follow(&orchestrator, task.id, handle, options.complete).await?;
    let _ = title.await;
    Ok(())
}

// -----------------------------------------------------------------------------
// Helper functions
// -----------------------------------------------------------------------------

/// Merges command-line flags over the `[project]` config section.
fn resolve_project(options: &RunOptions, config: &ProjectConfig) -> Result<ProjectInfo> {
    let Some(repo_clone_url) = options
        .repo
        .clone()
        .or_else(|| config.repo_clone_url.clone())
    else {
        bail!("No repository configured: pass --repo or set [project] repo_clone_url");
    };

    let repo_name = options
        .repo_name
        .clone()
        .or_else(|| config.repo_name.clone())
        .unwrap_or_else(|| repo_name_from_url(&repo_clone_url));

    Ok(ProjectInfo {
        repo_clone_url,
        repo_name,
        rules_file_path: options
            .rules_file
            .clone()
            .or_else(|| config.rules_file_path.clone()),
        setup_script_path: options
            .setup_script
            .clone()
            .or_else(|| config.setup_script_path.clone()),
    })
}

/// Last path segment of a clone URL, without `.git`.
fn repo_name_from_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    let last = trimmed
        .rsplit(['/', ':'])
        .next()
        .unwrap_or(trimmed);
    last.strip_suffix(".git").unwrap_or(last).to_string()
}
