//! Scaffold a fleet configuration file in the working directory.
//!
//! Filesystem access is passed in as closures so the decision logic can be
//! tested without touching disk.

use anyhow::{Context, Result};
use colored::Colorize;
use std::fmt::Write;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::CONFIG_FILE;
use crate::templates;

// -----------------------------------------------------------------------------
// Public API
// -----------------------------------------------------------------------------

/// Runs the init command.
pub(crate) fn run(force: bool) -> Result<()> {
    let cwd = std::env::current_dir().context("Failed to get current directory")?;

    info!("Initializing fleet in {}", cwd.display());

    let files = init_files();
    let results = init_project(
        &files,
        force,
        |path| cwd.join(path).exists(),
        |path, content| {
            fs::write(cwd.join(path), content)
                .with_context(|| format!("Failed to write {}", path.display()))
        },
    )?;

    print!("{}", format_results(&results, &files));
    Ok(())
}

// -----------------------------------------------------------------------------
// Internal types
// -----------------------------------------------------------------------------

/// File written during init.
#[derive(Debug, Clone, PartialEq, Eq)]
struct InitFile {
    path: PathBuf,
    content: &'static str,
    description: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteResult {
    Created,
    Overwritten,
    Skipped,
}

// -----------------------------------------------------------------------------
// Helper functions
// -----------------------------------------------------------------------------

fn init_files() -> Vec<InitFile> {
    vec![InitFile {
        path: PathBuf::from(CONFIG_FILE),
        content: templates::FLEET_TOML,
        description: "Sandbox, agent and project configuration",
    }]
}

/// Writes each file unless it exists and `force` is off.
fn init_project<E, W>(
    files: &[InitFile],
    force: bool,
    exists: E,
    mut write_file: W,
) -> Result<Vec<(PathBuf, WriteResult)>>
where
    E: Fn(&Path) -> bool,
    W: FnMut(&Path, &str) -> Result<()>,
{
    let mut results = Vec::with_capacity(files.len());

    for file in files {
        let existed = exists(&file.path);
        let result = match (existed, force) {
            (true, false) => WriteResult::Skipped,
            (true, true) => {
                write_file(&file.path, file.content)?;
                WriteResult::Overwritten
            }
            (false, _) => {
                write_file(&file.path, file.content)?;
                WriteResult::Created
            }
        };
        results.push((file.path.clone(), result));
    }

    Ok(results)
}

fn format_results(results: &[(PathBuf, WriteResult)], files: &[InitFile]) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "\n{} fleet initialized\n", "✓".green().bold());

    for (path, result) in results {
        let desc = files
            .iter()
            .find(|f| &f.path == path)
            .map_or("", |f| f.description);

        let _ = match result {
            WriteResult::Created => {
                writeln!(out, "  {} - {}", path.display().to_string().cyan(), desc)
            }
            WriteResult::Overwritten => {
                writeln!(out, "  {} {} (overwritten)", "↻".blue(), path.display())
            }
            WriteResult::Skipped => writeln!(
                out,
                "  {} {} (already exists, use --force to overwrite)",
                "⊘".yellow(),
                path.display()
            ),
        };
    }

    let _ = writeln!(out, "\n{}", "Next steps:".yellow().bold());
    let _ = writeln!(
        out,
        "  1. Set {} in {}",
        "[project] repo_clone_url".cyan(),
        CONFIG_FILE.cyan()
    );
    let _ = writeln!(out, "  2. Export {}", "ANTHROPIC_API_KEY".cyan());
    let _ = writeln!(
        out,
        "  3. Run {} to start a task",
        "fleet run \"<description>\"".green()
    );

    out
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
