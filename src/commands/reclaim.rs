//! Pause sandboxes that have sat idle, once or on a schedule.

use anyhow::{Context, Result};
use colored::Colorize;
use std::fmt::Write;
use std::sync::Arc;

use super::Workspace;
use crate::reclaimer::{IdleReclaimer, ReclaimReport};
use crate::sandbox::DockerBackend;

pub(crate) async fn run(workspace: &Workspace, watch: bool) -> Result<()> {
    let backend = DockerBackend::connect(workspace.config.sandbox.clone())
        .await
        .context("Docker is not available")?;
    let reclaimer = Arc::new(IdleReclaimer::new(
        Arc::new(backend),
        workspace.store.clone(),
        &workspace.config.reclaimer,
    ));

    if !watch {
        let report = reclaimer.run_cycle().await?;
        print!("{}", format_report(&report));
        return Ok(());
    }

    reclaimer.start();
    eprintln!(
        "{} Reclaiming idle sandboxes every {} min (Ctrl-C to stop)",
        "→".blue(),
        workspace.config.reclaimer.check_interval_minutes
    );
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    reclaimer.stop().await;
    Ok(())
}

fn format_report(report: &ReclaimReport) -> String {
    let mut out = String::new();
    if report.paused.is_empty() && report.failed.is_empty() {
        let _ = writeln!(out, "{} No idle sandboxes", "ℹ".blue());
        return out;
    }
    for task_id in &report.paused {
        let _ = writeln!(out, "  {} paused sandbox of {}", "✓".green(), task_id);
    }
    for task_id in &report.failed {
        let _ = writeln!(out, "  {} could not pause sandbox of {}", "✗".red(), task_id);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_format_empty_report() {
        let output = format_report(&ReclaimReport::default());
        assert!(output.contains("No idle sandboxes"));
    }

    #[test]
    fn test_format_report_lists_tasks() {
        let paused = Uuid::new_v4();
        let failed = Uuid::new_v4();
        let output = format_report(&ReclaimReport {
            paused: vec![paused],
            failed: vec![failed],
        });
        assert!(output.contains(&format!("paused sandbox of {paused}")));
        assert!(output.contains(&format!("could not pause sandbox of {failed}")));
    }
}
