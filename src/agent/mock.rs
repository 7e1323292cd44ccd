//! Mock model client for testing.
//!
//! Replays scripted turns in order and records the history it was given,
//! so agent loop tests run without network access.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use super::{ModelClient, ModelEvent, TurnRequest};
use crate::conversation::{ContentBlock, ConversationMessage};
use crate::tools::ToolInvocation;

/// One scripted model turn.
#[derive(Debug, Clone)]
pub(crate) enum MockTurn {
    /// Stream these blocks, then finish.
    Reply(Vec<ContentBlock>),
    /// Break the stream after `message_start`.
    StreamError(String),
    /// Fail before streaming starts.
    RequestError(String),
}

impl MockTurn {
    pub fn text(text: &str) -> Self {
        Self::Reply(vec![ContentBlock::text(text)])
    }

    /// A turn that requests one tool call per `(id, name, input)`.
    pub fn tools(text: &str, calls: Vec<(&str, &str, Value)>) -> Self {
        let mut blocks = Vec::new();
        if !text.is_empty() {
            blocks.push(ContentBlock::text(text));
        }
        blocks.extend(calls.into_iter().map(|(id, name, input)| {
            ContentBlock::ToolInput(ToolInvocation {
                tool_id: id.to_string(),
                tool_name: name.to_string(),
                tool_input: input,
            })
        }));
        Self::Reply(blocks)
    }
}

/// A mock model client for testing.
#[derive(Debug, Clone)]
pub(crate) struct MockModelClient {
    /// Turns to replay in order. Cycles if more turns are requested.
    turns: Arc<Vec<MockTurn>>,
    /// Number of times `stream_turn` has been called.
    invocation_count: Arc<AtomicUsize>,
    /// History seen on each call.
    seen: Arc<Mutex<Vec<Vec<ConversationMessage>>>>,
    /// System prompts seen on each call.
    systems: Arc<Mutex<Vec<String>>>,
    title: Option<String>,
}

impl MockModelClient {
    pub fn new(turns: Vec<MockTurn>) -> Self {
        Self {
            turns: Arc::new(turns),
            invocation_count: Arc::new(AtomicUsize::new(0)),
            seen: Arc::new(Mutex::new(Vec::new())),
            systems: Arc::new(Mutex::new(Vec::new())),
            title: None,
        }
    }

    pub fn with_title(mut self, title: &str) -> Self {
        self.title = Some(title.to_string());
        self
    }

    pub fn invocation_count(&self) -> usize {
        self.invocation_count.load(Ordering::SeqCst)
    }

    /// History passed to the n-th call.
    pub fn history(&self, call: usize) -> Vec<ConversationMessage> {
        self.seen.lock().unwrap()[call].clone()
    }

    pub fn system_prompt(&self, call: usize) -> String {
        self.systems.lock().unwrap()[call].clone()
    }
}

#[async_trait]
impl ModelClient for MockModelClient {
    fn name(&self) -> &'static str {
        "Mock"
    }

    async fn stream_turn(&self, request: TurnRequest<'_>) -> Result<mpsc::Receiver<ModelEvent>> {
        let count = self.invocation_count.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(request.messages.to_vec());
        self.systems.lock().unwrap().push(request.system.to_string());
        let turn = self.turns[count % self.turns.len()].clone();

        let (tx, rx) = mpsc::channel(64);
        let message_id = format!("msg_mock_{count}");
        match turn {
            MockTurn::RequestError(message) => anyhow::bail!("{message}"),
            MockTurn::StreamError(message) => {
                tx.send(ModelEvent::MessageStart { message_id }).await?;
                tx.send(ModelEvent::Failed(message)).await?;
            }
            MockTurn::Reply(blocks) => {
                tx.send(ModelEvent::MessageStart { message_id }).await?;
                for block in &blocks {
                    if let ContentBlock::Text { text } = block {
                        tx.send(ModelEvent::TextDelta(text.clone())).await?;
                    }
                }
                tx.send(ModelEvent::MessageStop).await?;
                tx.send(ModelEvent::Finished(blocks)).await?;
            }
        }
        Ok(rx)
    }

    async fn generate_title(&self, _description: &str) -> Result<String> {
        match &self.title {
            Some(title) => Ok(title.clone()),
            None => anyhow::bail!("no title scripted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(messages: &[ConversationMessage]) -> TurnRequest<'_> {
        TurnRequest {
            system: "sys",
            messages,
            tools: &[],
        }
    }

    async fn drain(mut rx: mpsc::Receiver<ModelEvent>) -> Vec<ModelEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_mock_reply_event_order() {
        let client = MockModelClient::new(vec![MockTurn::text("hello")]);
        let history = vec![ConversationMessage::user_text("hi")];
        let events = drain(client.stream_turn(request(&history)).await.unwrap()).await;

        assert_eq!(
            events,
            vec![
                ModelEvent::MessageStart {
                    message_id: "msg_mock_0".to_string()
                },
                ModelEvent::TextDelta("hello".to_string()),
                ModelEvent::MessageStop,
                ModelEvent::Finished(vec![ContentBlock::text("hello")]),
            ]
        );
        assert_eq!(client.invocation_count(), 1);
        assert_eq!(client.history(0), history);
    }

    #[tokio::test]
    async fn test_mock_cycles_turns() {
        let client = MockModelClient::new(vec![MockTurn::text("a"), MockTurn::text("b")]);
        for _ in 0..3 {
            drain(client.stream_turn(request(&[])).await.unwrap()).await;
        }
        assert_eq!(client.invocation_count(), 3);
    }

    #[tokio::test]
    async fn test_mock_request_error() {
        let client = MockModelClient::new(vec![MockTurn::RequestError("overloaded".to_string())]);
        let err = client.stream_turn(request(&[])).await.unwrap_err();
        assert!(err.to_string().contains("overloaded"));
    }
}
