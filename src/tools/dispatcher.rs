//! Executes parsed tool calls against a sandbox session.

use tracing::debug;

use super::editor::{insert_at, looks_like_directory, replace_unique, view_range, Replacement};
use super::{EditorCommand, ToolCall, ToolError, ToolInvocation, ToolResult};
use crate::sandbox::SandboxSession;

/// Routes tool invocations to the shell or the sandbox file API.
pub(crate) struct Toolbox<'a> {
    session: &'a mut SandboxSession,
}

impl<'a> Toolbox<'a> {
    pub fn new(session: &'a mut SandboxSession) -> Self {
        Self { session }
    }

    /// Executes one invocation and wraps its text in a result.
    pub async fn execute(&mut self, invocation: &ToolInvocation) -> Result<ToolResult, ToolError> {
        debug!(
            tool_id = %invocation.tool_id,
            tool_name = %invocation.tool_name,
            "Executing tool"
        );
        let content = match invocation.parse()? {
            ToolCall::Bash(input) if input.restart => {
                self.session.restart().await?;
                "Bash restarted".to_string()
            }
            ToolCall::Bash(input) => {
                let command = input.command.unwrap_or_default();
                self.session.run(&command).await?
            }
            ToolCall::TextEditor(command) => self.edit(command).await?,
            ToolCall::Setup { .. } => {
                return Err(ToolError::unsupported("setup steps cannot be executed"));
            }
        };
        Ok(ToolResult::ok(&invocation.tool_id, content))
    }

    async fn edit(&mut self, command: EditorCommand) -> Result<String, ToolError> {
        match command {
            EditorCommand::View { path, view_range: range } => {
                if looks_like_directory(&path) {
                    let entries = self.session.list_dir(&path).await?;
                    return Ok(entries.join("\n"));
                }
                let content = self.session.read_file(&path).await?;
                match range {
                    Some(range) => view_range(&content, &range),
                    None => Ok(content),
                }
            }
            EditorCommand::StrReplace {
                path,
                old_str,
                new_str,
            } => {
                let content = self.session.read_file(&path).await?;
                match replace_unique(&content, &old_str, &new_str) {
                    Replacement::NotFound => Ok(format!("Text to replace not found in {path}")),
                    Replacement::Ambiguous(count) => Ok(format!(
                        "Found {count} matches for replacement text. Please provide more context to make a unique match."
                    )),
                    Replacement::Replaced(updated) => {
                        self.session.write_file(&path, &updated).await?;
                        Ok(format!("Successfully replaced text in {path}"))
                    }
                }
            }
            EditorCommand::Create { path, file_text } => {
                self.session.write_file(&path, &file_text).await?;
                Ok(format!("Successfully created file {path}"))
            }
            EditorCommand::Insert {
                path,
                insert_line,
                insert_text,
            } => {
                let content = self.session.read_file(&path).await?;
                let updated = insert_at(&content, insert_line, &insert_text);
                self.session.write_file(&path, &updated).await?;
                Ok(format!(
                    "Successfully inserted text at line {insert_line} in {path}"
                ))
            }
        }
    }
}
