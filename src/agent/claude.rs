//! Anthropic Messages API client
//!
//! Turns are streamed over server-sent events:
//! ```text
//! event: content_block_delta
//! data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}
//! ```
//!
//! Text deltas are forwarded as they arrive; tool-use input JSON is
//! accumulated per block and parsed when the block closes.
//!
//! See: https://docs.anthropic.com/en/api/messages-streaming

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{ModelClient, ModelEvent, TurnRequest};
use crate::config::AgentConfig;
use crate::conversation::{ContentBlock, ConversationMessage, Role};
use crate::tools::ToolInvocation;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const TITLE_MAX_TOKENS: u32 = 50;

/// Anthropic Messages API client
pub struct ClaudeClient {
    client: reqwest::Client,
    api_key: String,
    config: AgentConfig,
}

impl ClaudeClient {
    pub fn new(config: AgentConfig, api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            config,
        }
    }

    async fn post(&self, body: &MessagesRequest<'_>) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(&self.config.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body)
            .send()
            .await
            .context("Failed to reach the model API")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<ApiErrorResponse>(&text)
                .map(|e| format!("{} - {}", e.error.error_type, e.error.message))
                .unwrap_or(text);
            anyhow::bail!("Model API error ({status}): {detail}");
        }

        Ok(response)
    }
}

#[async_trait]
impl ModelClient for ClaudeClient {
    fn name(&self) -> &'static str {
        "Claude"
    }

    async fn stream_turn(&self, request: TurnRequest<'_>) -> Result<mpsc::Receiver<ModelEvent>> {
        let body = MessagesRequest {
            model: &self.config.model,
            max_tokens: self.config.max_tokens,
            system: Some(request.system),
            messages: convert_messages(request.messages),
            tools: request.tools,
            stream: true,
        };

        debug!(
            model = %self.config.model,
            messages = body.messages.len(),
            "Starting model turn"
        );
        let response = self.post(&body).await?;

        let (tx, rx) = mpsc::channel(64);
        let byte_stream = response.bytes_stream();

        tokio::spawn(async move {
            let mut assembler = TurnAssembler::default();
            tokio::pin!(byte_stream);

            while let Some(chunk) = byte_stream.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx
                            .send(ModelEvent::Failed(format!("Stream read error: {e}")))
                            .await;
                        return;
                    }
                };

                for event in assembler.feed(&bytes) {
                    let done = matches!(event, ModelEvent::Finished(_) | ModelEvent::Failed(_));
                    if tx.send(event).await.is_err() || done {
                        return;
                    }
                }
            }

            let _ = tx
                .send(ModelEvent::Failed(
                    "Model stream ended before message_stop".to_string(),
                ))
                .await;
        });

        Ok(rx)
    }

    async fn generate_title(&self, description: &str) -> Result<String> {
        let prompt = vec![ConversationMessage::user_text(title_prompt(description))];
        let body = MessagesRequest {
            model: &self.config.title_model,
            max_tokens: TITLE_MAX_TOKENS,
            system: None,
            messages: convert_messages(&prompt),
            tools: &[],
            stream: false,
        };

        let response: MessagesResponse = self
            .post(&body)
            .await?
            .json()
            .await
            .context("Failed to parse title response")?;

        let title = response
            .content
            .into_iter()
            .find_map(|block| match block {
                ResponseBlock::Text { text } => Some(text.trim().to_string()),
                ResponseBlock::Other => None,
            })
            .context("Title response had no text")?;

        info!(event = "title_generated", title = %title);
        Ok(title)
    }
}

// ============================================================================
// Request types
// ============================================================================

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "<[Value]>::is_empty")]
    tools: &'a [Value],
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Serialize, PartialEq)]
struct ApiMessage {
    role: Role,
    content: Vec<ApiContentBlock>,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

// ============================================================================
// Response types
// ============================================================================

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ResponseBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct SseEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    message: Option<SseMessage>,
    #[serde(default)]
    content_block: Option<SseContentBlock>,
    #[serde(default)]
    delta: Option<SseDelta>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct SseMessage {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SseContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SseDelta {
    #[serde(rename = "type", default)]
    delta_type: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    partial_json: Option<String>,
}

// ============================================================================
// Stream assembly
// ============================================================================

enum PartialBlock {
    Text(String),
    ToolUse { id: String, name: String, json: String },
}

/// Turns raw SSE bytes into model events and the final content.
#[derive(Default)]
struct TurnAssembler {
    line_buffer: Vec<u8>,
    blocks: Vec<ContentBlock>,
    current: Option<PartialBlock>,
}

impl TurnAssembler {
    fn feed(&mut self, bytes: &[u8]) -> Vec<ModelEvent> {
        self.line_buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(pos) = self.line_buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.line_buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim();

            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };

            let event: SseEvent = match serde_json::from_str(data.trim()) {
                Ok(event) => event,
                Err(e) => {
                    warn!("Skipping unparseable stream event: {}", e);
                    continue;
                }
            };

            for model_event in self.handle(event) {
                let terminal =
                    matches!(model_event, ModelEvent::Finished(_) | ModelEvent::Failed(_));
                events.push(model_event);
                if terminal {
                    return events;
                }
            }
        }

        events
    }

    fn handle(&mut self, event: SseEvent) -> Vec<ModelEvent> {
        match event.event_type.as_str() {
            "message_start" => event
                .message
                .map(|m| ModelEvent::MessageStart { message_id: m.id })
                .into_iter()
                .collect(),
            "content_block_start" => {
                self.current = event.content_block.and_then(|block| match block.block_type.as_str() {
                    "text" => Some(PartialBlock::Text(block.text.unwrap_or_default())),
                    "tool_use" => Some(PartialBlock::ToolUse {
                        id: block.id.unwrap_or_default(),
                        name: block.name.unwrap_or_default(),
                        json: String::new(),
                    }),
                    _ => None,
                });
                Vec::new()
            }
            "content_block_delta" => {
                let Some(delta) = event.delta else {
                    return Vec::new();
                };
                match (delta.delta_type.as_deref(), self.current.as_mut()) {
                    (Some("text_delta"), Some(PartialBlock::Text(buffer))) => {
                        let text = delta.text.unwrap_or_default();
                        buffer.push_str(&text);
                        vec![ModelEvent::TextDelta(text)]
                    }
                    (Some("input_json_delta"), Some(PartialBlock::ToolUse { json, .. })) => {
                        json.push_str(delta.partial_json.as_deref().unwrap_or_default());
                        Vec::new()
                    }
                    _ => Vec::new(),
                }
            }
            "content_block_stop" => match self.current.take() {
                Some(PartialBlock::Text(text)) => {
                    self.blocks.push(ContentBlock::Text { text });
                    Vec::new()
                }
                Some(PartialBlock::ToolUse { id, name, json }) => {
                    let input = if json.trim().is_empty() {
                        Ok(Value::Object(serde_json::Map::new()))
                    } else {
                        serde_json::from_str(&json)
                    };
                    match input {
                        Ok(tool_input) => {
                            self.blocks.push(ContentBlock::ToolInput(ToolInvocation {
                                tool_id: id,
                                tool_name: name,
                                tool_input,
                            }));
                            Vec::new()
                        }
                        Err(e) => vec![ModelEvent::Failed(format!(
                            "Invalid tool input JSON for {name}: {e}"
                        ))],
                    }
                }
                None => Vec::new(),
            },
            "message_stop" => vec![
                ModelEvent::MessageStop,
                ModelEvent::Finished(std::mem::take(&mut self.blocks)),
            ],
            "error" => {
                let message = event
                    .error
                    .map_or_else(|| "unknown stream error".to_string(), |e| {
                        format!("{}: {}", e.error_type, e.message)
                    });
                vec![ModelEvent::Failed(message)]
            }
            _ => Vec::new(),
        }
    }
}

// ============================================================================
// Helper functions
// ============================================================================

fn convert_messages(messages: &[ConversationMessage]) -> Vec<ApiMessage> {
    messages
        .iter()
        .map(|message| ApiMessage {
            role: message.role,
            content: message
                .content
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } if text.trim().is_empty() => None,
                    ContentBlock::Text { text } => Some(ApiContentBlock::Text { text: text.clone() }),
                    ContentBlock::ToolInput(invocation) => Some(ApiContentBlock::ToolUse {
                        id: invocation.tool_id.clone(),
                        name: invocation.tool_name.clone(),
                        input: invocation.tool_input.clone(),
                    }),
                    ContentBlock::ToolResult(result) => Some(ApiContentBlock::ToolResult {
                        tool_use_id: result.tool_id.clone(),
                        content: result.content.clone(),
                        is_error: result.is_error,
                    }),
                })
                .collect(),
        })
        .collect()
}

fn title_prompt(description: &str) -> String {
    format!(
        "You are a helpful assistant that generates concise, clear titles for tasks based on their descriptions.

Generate a short, descriptive title (2-4 words) that captures the essence of this task. The title should be:
- Clear and specific
- Without quotes or special formatting

Just return the title, nothing else.

<task-description>
{description}
</task-description>"
    )
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolResult;
    use serde_json::json;

    fn sse(events: &[Value]) -> Vec<u8> {
        events
            .iter()
            .map(|e| format!("event: {}\ndata: {}\n\n", e["type"].as_str().unwrap(), e))
            .collect::<String>()
            .into_bytes()
    }

    fn text_turn() -> Vec<Value> {
        vec![
            json!({"type": "message_start", "message": {"id": "msg_01", "role": "assistant"}}),
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Hel"}}),
            json!({"type": "ping"}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "lo"}}),
            json!({"type": "content_block_stop", "index": 0}),
            json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}}),
            json!({"type": "message_stop"}),
        ]
    }

    #[test]
    fn test_text_turn_events() {
        let mut assembler = TurnAssembler::default();
        let events = assembler.feed(&sse(&text_turn()));

        assert_eq!(
            events,
            vec![
                ModelEvent::MessageStart {
                    message_id: "msg_01".to_string()
                },
                ModelEvent::TextDelta("Hel".to_string()),
                ModelEvent::TextDelta("lo".to_string()),
                ModelEvent::MessageStop,
                ModelEvent::Finished(vec![ContentBlock::text("Hello")]),
            ]
        );
    }

    #[test]
    fn test_events_split_across_chunks() {
        let bytes = sse(&text_turn());
        let mut assembler = TurnAssembler::default();
        let mut events = Vec::new();
        for chunk in bytes.chunks(7) {
            events.extend(assembler.feed(chunk));
        }
        assert_eq!(events.len(), 5);
        assert_eq!(
            events.last(),
            Some(&ModelEvent::Finished(vec![ContentBlock::text("Hello")]))
        );
    }

    #[test]
    fn test_tool_use_input_is_accumulated() {
        let turn = vec![
            json!({"type": "message_start", "message": {"id": "msg_02"}}),
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "tool_use", "id": "toolu_1", "name": "bash", "input": {}}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "input_json_delta", "partial_json": "{\"comm"}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "input_json_delta", "partial_json": "and\": \"ls\"}"}}),
            json!({"type": "content_block_stop", "index": 0}),
            json!({"type": "content_block_start", "index": 1, "content_block": {"type": "tool_use", "id": "toolu_2", "name": "bash", "input": {}}}),
            json!({"type": "content_block_stop", "index": 1}),
            json!({"type": "message_stop"}),
        ];
        let mut assembler = TurnAssembler::default();
        let events = assembler.feed(&sse(&turn));

        let Some(ModelEvent::Finished(blocks)) = events.last() else {
            panic!("expected Finished, got {events:?}");
        };
        assert_eq!(blocks.len(), 2);
        let first = blocks[0].as_tool_input().unwrap();
        assert_eq!(first.tool_id, "toolu_1");
        assert_eq!(first.tool_input, json!({"command": "ls"}));
        assert_eq!(blocks[1].as_tool_input().unwrap().tool_input, json!({}));
    }

    #[test]
    fn test_error_event_fails_turn() {
        let turn = vec![
            json!({"type": "message_start", "message": {"id": "msg_03"}}),
            json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}}),
        ];
        let mut assembler = TurnAssembler::default();
        let events = assembler.feed(&sse(&turn));
        assert_eq!(
            events.last(),
            Some(&ModelEvent::Failed("overloaded_error: Overloaded".to_string()))
        );
    }

    #[test]
    fn test_convert_messages() {
        let messages = vec![
            ConversationMessage::user_text("Fix the bug"),
            ConversationMessage::assistant(vec![
                ContentBlock::text(""),
                ContentBlock::ToolInput(ToolInvocation {
                    tool_id: "toolu_1".to_string(),
                    tool_name: "bash".to_string(),
                    tool_input: json!({"command": "ls"}),
                }),
            ]),
            ConversationMessage::tool_results(vec![ToolResult::error("toolu_1", "Error: boom")]),
        ];

        let converted = serde_json::to_value(convert_messages(&messages)).unwrap();
        assert_eq!(
            converted,
            json!([
                {"role": "user", "content": [{"type": "text", "text": "Fix the bug"}]},
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "toolu_1", "name": "bash", "input": {"command": "ls"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "Error: boom", "is_error": true}
                ]}
            ])
        );
    }

    #[test]
    fn test_request_serialization() {
        let tools = crate::tools::tool_definitions();
        let request = MessagesRequest {
            model: "claude-test",
            max_tokens: 10_000,
            system: Some("be helpful"),
            messages: Vec::new(),
            tools: &tools,
            stream: true,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["stream"], true);
        assert_eq!(value["system"], "be helpful");
        assert_eq!(value["tools"][0]["type"], "bash_20250124");

        let title = MessagesRequest {
            model: "claude-test",
            max_tokens: 50,
            system: None,
            messages: Vec::new(),
            tools: &[],
            stream: false,
        };
        let value = serde_json::to_value(&title).unwrap();
        assert!(value.get("stream").is_none());
        assert!(value.get("system").is_none());
        assert!(value.get("tools").is_none());
    }

    #[test]
    fn test_title_prompt_embeds_description() {
        assert!(title_prompt("Add dark mode").contains("<task-description>\nAdd dark mode\n</task-description>"));
    }
}
