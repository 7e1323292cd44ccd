//! Tools the model can call, and their wire shapes.
//!
//! Two tools are exposed: `bash` (runs a command in the persistent shell)
//! and `str_replace_based_edit_tool` (view/create/str_replace/insert on
//! sandbox files). A third name, `setup`, tags provisioning steps in the
//! event stream and is never executable.

mod dispatcher;
pub(crate) mod editor;

pub(crate) use dispatcher::Toolbox;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::sandbox::SandboxError;

pub(crate) const BASH_TOOL: &str = "bash";
pub(crate) const EDITOR_TOOL: &str = "str_replace_based_edit_tool";
pub(crate) const SETUP_TOOL: &str = "setup";

/// Tool id shared by all provisioning steps.
pub(crate) const SETUP_TOOL_ID: &str = "setup_tool_id";

// ============================================================================
// Public API
// ============================================================================

/// A tool call as requested by the model (or emitted by setup).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct ToolInvocation {
    pub tool_id: String,
    pub tool_name: String,
    pub tool_input: Value,
}

impl ToolInvocation {
    /// A provisioning step, shown to the client as a `setup` tool input.
    pub fn setup(title: impl Into<String>) -> Self {
        Self {
            tool_id: SETUP_TOOL_ID.to_string(),
            tool_name: SETUP_TOOL.to_string(),
            tool_input: Value::String(title.into()),
        }
    }

    /// Parses the raw input into a typed call.
    pub fn parse(&self) -> Result<ToolCall, ToolError> {
        match self.tool_name.as_str() {
            BASH_TOOL => {
                let input: BashInput = serde_json::from_value(self.tool_input.clone())
                    .map_err(|e| ToolError::invalid_argument(BASH_TOOL, e.to_string()))?;
                if input.command.is_none() && !input.restart {
                    return Err(ToolError::invalid_argument(
                        BASH_TOOL,
                        "either command or restart is required",
                    ));
                }
                Ok(ToolCall::Bash(input))
            }
            EDITOR_TOOL => parse_editor_command(&self.tool_input).map(ToolCall::TextEditor),
            SETUP_TOOL => Ok(ToolCall::Setup {
                title: self.tool_input.as_str().unwrap_or_default().to_string(),
            }),
            other => Err(ToolError::unsupported(format!("unknown tool {other}"))),
        }
    }
}

/// Outcome of one tool invocation, fed back to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ToolResult {
    pub tool_id: String,
    #[serde(rename = "tool_result")]
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResult {
    pub fn ok(tool_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_id: tool_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(tool_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_id: tool_id.into(),
            content: content.into(),
            is_error: true,
        }
    }
}

/// A parsed tool call.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ToolCall {
    Bash(BashInput),
    TextEditor(EditorCommand),
    Setup { title: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub(crate) struct BashInput {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub restart: bool,
    /// Short summary shown to the user; not used for execution.
    #[serde(default)]
    #[allow(dead_code)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub(crate) enum EditorCommand {
    View {
        path: String,
        #[serde(default)]
        view_range: Option<Vec<i64>>,
    },
    StrReplace {
        path: String,
        old_str: String,
        new_str: String,
    },
    Create {
        path: String,
        file_text: String,
    },
    Insert {
        path: String,
        insert_line: i64,
        insert_text: String,
    },
}

/// Errors raised while executing a tool.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// Unknown tool, unknown sub-command, or a non-executable tool.
    #[error("Unsupported tool operation: {operation}")]
    UnsupportedOperation { operation: String },

    /// Malformed tool input.
    #[error("Invalid input for {tool}: {message}")]
    InvalidArgument { tool: String, message: String },

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

impl ToolError {
    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::UnsupportedOperation {
            operation: operation.into(),
        }
    }

    pub fn invalid_argument(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            tool: tool.into(),
            message: message.into(),
        }
    }
}

/// Tool schemas advertised to the model.
pub(crate) fn tool_definitions() -> Vec<Value> {
    vec![
        json!({"type": "bash_20250124", "name": BASH_TOOL}),
        json!({"type": "text_editor_20250429", "name": EDITOR_TOOL}),
    ]
}

// ============================================================================
// Helper functions
// ============================================================================

const EDITOR_COMMANDS: &[&str] = &["view", "str_replace", "create", "insert"];

fn parse_editor_command(input: &Value) -> Result<EditorCommand, ToolError> {
    let command = input
        .get("command")
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::invalid_argument(EDITOR_TOOL, "missing command"))?;

    if !EDITOR_COMMANDS.contains(&command) {
        return Err(ToolError::unsupported(format!(
            "{EDITOR_TOOL} command {command}"
        )));
    }

    serde_json::from_value(input.clone())
        .map_err(|e| ToolError::invalid_argument(EDITOR_TOOL, e.to_string()))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(name: &str, input: Value) -> ToolInvocation {
        ToolInvocation {
            tool_id: "toolu_1".to_string(),
            tool_name: name.to_string(),
            tool_input: input,
        }
    }

    #[test]
    fn test_parse_bash() {
        let call = invocation("bash", json!({"command": "ls", "description": "List files"}))
            .parse()
            .unwrap();
        match call {
            ToolCall::Bash(input) => {
                assert_eq!(input.command.as_deref(), Some("ls"));
                assert!(!input.restart);
            }
            other => panic!("expected bash, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_bash_requires_command_or_restart() {
        let err = invocation("bash", json!({})).parse().unwrap_err();
        assert!(matches!(err, ToolError::InvalidArgument { .. }));

        let call = invocation("bash", json!({"restart": true})).parse().unwrap();
        assert!(matches!(call, ToolCall::Bash(BashInput { restart: true, .. })));
    }

    #[test]
    fn test_parse_editor_commands() {
        let call = invocation(
            EDITOR_TOOL,
            json!({"command": "view", "path": "/repo/a.rs", "view_range": [1, 5]}),
        )
        .parse()
        .unwrap();
        assert_eq!(
            call,
            ToolCall::TextEditor(EditorCommand::View {
                path: "/repo/a.rs".to_string(),
                view_range: Some(vec![1, 5]),
            })
        );

        let call = invocation(
            EDITOR_TOOL,
            json!({"command": "insert", "path": "/repo/a.rs", "insert_line": 2, "insert_text": "x"}),
        )
        .parse()
        .unwrap();
        assert!(matches!(
            call,
            ToolCall::TextEditor(EditorCommand::Insert { insert_line: 2, .. })
        ));
    }

    #[test]
    fn test_unknown_editor_command_is_unsupported() {
        let err = invocation(EDITOR_TOOL, json!({"command": "undo_edit", "path": "/repo/a"}))
            .parse()
            .unwrap_err();
        assert!(matches!(err, ToolError::UnsupportedOperation { .. }));
    }

    #[test]
    fn test_malformed_editor_input_is_invalid() {
        let err = invocation(EDITOR_TOOL, json!({"command": "create", "path": "/repo/a"}))
            .parse()
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArgument { .. }));
    }

    #[test]
    fn test_unknown_tool_is_unsupported() {
        let err = invocation("web_search", json!({})).parse().unwrap_err();
        assert!(matches!(err, ToolError::UnsupportedOperation { .. }));
    }

    #[test]
    fn test_setup_invocation() {
        let setup = ToolInvocation::setup("Installing git");
        assert_eq!(setup.tool_id, SETUP_TOOL_ID);
        assert_eq!(
            setup.parse().unwrap(),
            ToolCall::Setup {
                title: "Installing git".to_string()
            }
        );
    }

    #[test]
    fn test_tool_definitions() {
        let defs = tool_definitions();
        assert_eq!(defs[0], json!({"type": "bash_20250124", "name": "bash"}));
        assert_eq!(
            defs[1],
            json!({"type": "text_editor_20250429", "name": "str_replace_based_edit_tool"})
        );
    }
}
