use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "fleet.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub reclaimer: ReclaimerConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub setup: SetupConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub project: ProjectConfig,
}

/// Sandbox container and shell configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Docker image the sandbox container runs
    #[serde(default = "default_image")]
    pub image: String,

    /// Where the repository is cloned inside the sandbox
    #[serde(default = "default_repo_path")]
    pub repo_path: String,

    /// Seconds to wait for a command's completion marker
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Memory limit (e.g., "4g")
    #[serde(default = "default_memory")]
    pub memory: String,

    /// CPU limit (e.g., "2")
    #[serde(default = "default_cpus")]
    pub cpus: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            repo_path: default_repo_path(),
            command_timeout_secs: default_command_timeout(),
            memory: default_memory(),
            cpus: default_cpus(),
        }
    }
}

impl SandboxConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Model API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Model driving the agent loop
    #[serde(default = "default_model")]
    pub model: String,

    /// Small model used for task titles
    #[serde(default = "default_title_model")]
    pub title_model: String,

    /// Max tokens per model turn
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Upper bound on model turns per run
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Messages API endpoint
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            title_model: default_title_model(),
            max_tokens: default_max_tokens(),
            max_iterations: default_max_iterations(),
            api_url: default_api_url(),
            api_key_env: default_api_key_env(),
        }
    }
}

impl AgentConfig {
    /// Read the API key from the configured environment variable
    pub fn api_key(&self) -> Result<String> {
        std::env::var(&self.api_key_env)
            .with_context(|| format!("{} is not set", self.api_key_env))
    }
}

/// Idle sandbox reclamation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReclaimerConfig {
    /// Minutes without use before a running sandbox is paused
    #[serde(default = "default_idle_minutes")]
    pub idle_minutes: u64,

    /// Minutes between reclamation cycles
    #[serde(default = "default_check_interval")]
    pub check_interval_minutes: u64,
}

impl Default for ReclaimerConfig {
    fn default() -> Self {
        Self {
            idle_minutes: default_idle_minutes(),
            check_interval_minutes: default_check_interval(),
        }
    }
}

impl ReclaimerConfig {
    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_minutes * 60)
    }

    /// Never shorter than one minute.
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_minutes.max(1) * 60)
    }
}

/// Git identity and branch naming inside the sandbox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    #[serde(default = "default_git_user_name")]
    pub user_name: String,

    #[serde(default = "default_git_user_email")]
    pub user_email: String,

    /// Prefix for the working branch created on clone
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            user_name: default_git_user_name(),
            user_email: default_git_user_email(),
            branch_prefix: default_branch_prefix(),
        }
    }
}

/// Sandbox provisioning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupConfig {
    /// Command that makes git available in a fresh sandbox
    #[serde(default = "default_install_command")]
    pub install_command: String,
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            install_command: default_install_command(),
        }
    }
}

/// Task store location
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding task files (defaults to the user data dir)
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl StoreConfig {
    /// Resolve the store directory
    pub fn resolve_dir(&self) -> Result<PathBuf> {
        match &self.dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::data_dir()
                .map(|dir| dir.join("fleet"))
                .context("Could not determine a data directory; set [store] dir"),
        }
    }
}

/// Repository the agent works on
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub repo_clone_url: Option<String>,

    #[serde(default)]
    pub repo_name: Option<String>,

    /// Rules file relative to the repository root
    #[serde(default)]
    pub rules_file_path: Option<String>,

    /// Setup script relative to the repository root
    #[serde(default)]
    pub setup_script_path: Option<String>,
}

// Default value functions
fn default_image() -> String {
    "ubuntu:24.04".to_string()
}

fn default_repo_path() -> String {
    "/repo".to_string()
}

fn default_command_timeout() -> u64 {
    10
}

fn default_memory() -> String {
    "4g".to_string()
}

fn default_cpus() -> String {
    "2".to_string()
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_title_model() -> String {
    "claude-3-5-haiku-20241022".to_string()
}

fn default_max_tokens() -> u32 {
    10_000
}

fn default_max_iterations() -> u32 {
    20
}

fn default_api_url() -> String {
    "https://api.anthropic.com/v1/messages".to_string()
}

fn default_api_key_env() -> String {
    "ANTHROPIC_API_KEY".to_string()
}

fn default_idle_minutes() -> u64 {
    5
}

fn default_check_interval() -> u64 {
    2
}

fn default_git_user_name() -> String {
    "fleet".to_string()
}

fn default_git_user_email() -> String {
    "fleet@localhost".to_string()
}

fn default_branch_prefix() -> String {
    "fleet".to_string()
}

fn default_install_command() -> String {
    "apt-get update && apt-get install -y git".to_string()
}

impl Config {
    /// Load configuration from file, using defaults if not found
    pub fn load(project_dir: &Path) -> Result<Self> {
        Self::load_from(&project_dir.join(CONFIG_FILE))
    }

    /// Load configuration from an explicit path, using defaults if not found
    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", config_path.display()))?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.reclaimer.check_interval_minutes == 0 {
            bail!("[reclaimer] check_interval_minutes must be at least 1");
        }
        Ok(())
    }
}
