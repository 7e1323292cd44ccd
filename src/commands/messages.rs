//! Print a task's stored transcript.

use anyhow::{Context, Result};
use colored::Colorize;
use std::fmt::Write;

use super::{parse_task_id, Workspace};
use crate::conversation::{ContentBlock, Role};
use crate::store::{StoredMessage, TaskStore};

/// Tool results longer than this are cut in the listing.
const MAX_RESULT_CHARS: usize = 2000;

pub(crate) async fn run(workspace: &Workspace, task_id: &str) -> Result<()> {
    let task_id = parse_task_id(task_id)?;
    workspace
        .store
        .get_task(task_id)
        .await?
        .with_context(|| format!("Task not found: {task_id}"))?;

    let messages = workspace.store.list_messages(task_id).await?;
    print!("{}", format_transcript(&messages));
    Ok(())
}

fn format_transcript(messages: &[StoredMessage]) -> String {
    let mut out = String::new();

    for message in messages {
        let header = format!("#{} {}", message.message_order, message.role);
        let header = match message.role {
            Role::User => header.blue().bold(),
            Role::Assistant => header.green().bold(),
        };
        let _ = writeln!(out, "\n{header}");

        for sequenced in &message.blocks {
            match &sequenced.block {
                ContentBlock::Text { text } => {
                    let _ = writeln!(out, "{text}");
                }
                ContentBlock::ToolInput(invocation) => {
                    let _ = writeln!(
                        out,
                        "{} {} {}",
                        "▶".cyan(),
                        invocation.tool_name.cyan(),
                        invocation.tool_input
                    );
                }
                ContentBlock::ToolResult(result) => {
                    let label = if result.is_error {
                        "✗ error".red()
                    } else {
                        "✓ result".dimmed()
                    };
                    let _ = writeln!(out, "{label}");
                    let _ = writeln!(out, "{}", truncate(&result.content, MAX_RESULT_CHARS));
                }
            }
        }
    }
    out
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}… ({} more bytes)", &text[..cut], text.len() - cut),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{ToolInvocation, ToolResult};
    use serde_json::json;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdef", 3), "abc… (3 more bytes)");
        assert_eq!(truncate("ééé", 2), "éé… (2 more bytes)");
    }

    #[test]
    fn test_format_transcript() {
        let messages = vec![
            StoredMessage::new(0, Role::User, vec![ContentBlock::text("Fix the bug")]),
            StoredMessage::new(
                1,
                Role::Assistant,
                vec![
                    ContentBlock::text("Looking."),
                    ContentBlock::ToolInput(ToolInvocation {
                        tool_id: "toolu_1".to_string(),
                        tool_name: "bash".to_string(),
                        tool_input: json!({"command": "ls"}),
                    }),
                ],
            ),
            StoredMessage::new(
                2,
                Role::User,
                vec![ContentBlock::ToolResult(ToolResult::error("toolu_1", "Error: boom"))],
            ),
        ];

        let output = format_transcript(&messages);
        assert!(output.contains("#0 user"));
        assert!(output.contains("Fix the bug"));
        assert!(output.contains("#1 assistant"));
        assert!(output.contains(r#"{"command":"ls"}"#));
        assert!(output.contains("Error: boom"));
    }
}
