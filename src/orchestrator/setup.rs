//! Provisioning a fresh sandbox: git, credentials, clone, rules, setup script.
//!
//! Each announced step is pushed to the relay as a `setup` tool input; a
//! single combined result closes the phase.

use anyhow::{Context, Result};
use tracing::info;
use uuid::Uuid;

use crate::config::GitConfig;
use crate::relay::{EventRelay, TaskEvent};
use crate::sandbox::{SandboxError, SandboxSession};
use crate::store::ProjectInfo;
use crate::tools::{ToolInvocation, ToolResult, SETUP_TOOL_ID};

/// Rules text used when the project has none.
pub(crate) const NO_RULES: &str = "No rules file found";

/// Credential store written inside the sandbox.
const CREDENTIALS_PATH: &str = "/opt/fleet/git-credentials";

/// Inputs to the provisioning phase.
pub(crate) struct SetupPlan<'a> {
    pub project: &'a ProjectInfo,
    pub git: &'a GitConfig,
    pub install_command: &'a str,
    pub repo_path: &'a str,
    pub access_token: &'a str,
}

/// Runs every provisioning step and returns the rules text.
pub(crate) async fn provision(
    session: &mut SandboxSession,
    relay: &EventRelay,
    task_id: Uuid,
    plan: &SetupPlan<'_>,
) -> Result<String> {
    let announce = |title: &str| relay.push(task_id, TaskEvent::ToolInput(ToolInvocation::setup(title)));

    announce("Installing git");
    let git_output = session
        .run_checked(plan.install_command)
        .await
        .context("Installing git failed")?;

    session
        .run_checked(&git_config_command(plan.git))
        .await
        .context("Configuring git failed")?;
    if let Some(line) = credential_line(&plan.project.repo_clone_url, plan.access_token) {
        session
            .write_file(CREDENTIALS_PATH, &format!("{line}\n"))
            .await
            .context("Writing git credentials failed")?;
    }

    announce(&format!("Cloning repository {}", plan.project.repo_name));
    let branch = branch_name(&plan.git.branch_prefix);
    let clone_output = session
        .run_checked(&clone_command(
            &plan.project.repo_clone_url,
            plan.repo_path,
            &branch,
        ))
        .await
        .context("Cloning repository failed")?;

    announce("Reading rules file");
    let rules = read_rules(session, plan.repo_path, plan.project.rules_file_path.as_deref()).await?;

    announce("Running setup script");
    let setup_output = match &plan.project.setup_script_path {
        Some(script) => session
            .run_checked(&setup_script_command(plan.repo_path, script))
            .await
            .context("Running setup script failed")?,
        None => "No setup script configured".to_string(),
    };

    relay.push(
        task_id,
        TaskEvent::ToolInput(ToolInvocation::setup("Setup complete")),
    );
    relay.push(
        task_id,
        TaskEvent::ToolResult(ToolResult::ok(
            SETUP_TOOL_ID,
            format!(
                "Installing git:{git_output}Cloning repository:{clone_output}Reading rules file: {rules}Running setup script:{setup_output}"
            ),
        )),
    );

    info!(event = "setup_complete", task_id = %task_id, branch = %branch);
    Ok(rules)
}

/// Reads the project's rules file through the file API.
pub(crate) async fn read_rules(
    session: &SandboxSession,
    repo_path: &str,
    rules_file_path: Option<&str>,
) -> Result<String> {
    let Some(relative) = rules_file_path else {
        return Ok(NO_RULES.to_string());
    };

    match session.read_file(&repo_file(repo_path, relative)).await {
        Ok(rules) => Ok(rules),
        Err(SandboxError::FileNotFound { .. }) => Ok(NO_RULES.to_string()),
        Err(e) => Err(e).context("Reading rules file failed"),
    }
}

// ============================================================================
// Helper functions
// ============================================================================

fn repo_file(repo_path: &str, relative: &str) -> String {
    format!(
        "{}/{}",
        repo_path.trim_end_matches('/'),
        relative.trim_start_matches('/')
    )
}

fn git_config_command(git: &GitConfig) -> String {
    [
        format!("git config --global user.name {}", shell_words::quote(&git.user_name)),
        format!("git config --global user.email {}", shell_words::quote(&git.user_email)),
        format!(
            "git config --global credential.helper {}",
            shell_words::quote(&format!("store --file={CREDENTIALS_PATH}"))
        ),
        "git config --global push.autoSetupRemote true".to_string(),
    ]
    .join(" && ")
}

/// Credential-store line for an https clone URL; `None` for other schemes or no token.
fn credential_line(clone_url: &str, token: &str) -> Option<String> {
    if token.is_empty() {
        return None;
    }
    let rest = clone_url.strip_prefix("https://")?;
    let authority = rest.split('/').next()?;
    let host = authority.rsplit('@').next()?;
    if host.is_empty() {
        return None;
    }
    Some(format!("https://fleet:{token}@{host}"))
}

fn branch_name(prefix: &str) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &id[..8])
}

fn clone_command(clone_url: &str, repo_path: &str, branch: &str) -> String {
    let repo = shell_words::quote(repo_path);
    format!(
        "git clone {} {repo} && cd {repo} && git checkout -b {}",
        shell_words::quote(clone_url),
        shell_words::quote(branch)
    )
}

fn setup_script_command(repo_path: &str, script: &str) -> String {
    format!(
        "cd {} && bash {}",
        shell_words::quote(repo_path),
        shell_words::quote(script)
    )
}

// ============================================================================
// Tests
// ============================================================================
