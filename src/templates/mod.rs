//! Embedded templates.

/// Default `fleet.toml` configuration.
pub(crate) const FLEET_TOML: &str = include_str!("fleet.toml");

/// Agent system prompt; see [`system_prompt`].
const SYSTEM_PROMPT: &str = include_str!("system_prompt.md");

/// Renders the system prompt for a repository path, timeout and rules text.
pub(crate) fn system_prompt(repo_path: &str, timeout_secs: u64, rules: &str) -> String {
    SYSTEM_PROMPT
        .replace("{repo_path}", repo_path)
        .replace("{timeout_secs}", &timeout_secs.to_string())
        .replace("{rules}", rules)
}
