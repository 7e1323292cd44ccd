//! Language model clients.
//!
//! The agent loop talks to a [`ModelClient`]: one streamed turn at a time,
//! delivered as [`ModelEvent`]s over a channel and closed by a single
//! `Finished` event carrying the assembled assistant content.

mod claude;
#[cfg(test)]
pub(crate) mod mock;

pub(crate) use claude::ClaudeClient;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::conversation::{ContentBlock, ConversationMessage};

/// Title used when generation fails or returns nothing.
pub(crate) const FALLBACK_TITLE: &str = "New Task";

/// Everything the model sees for one turn.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TurnRequest<'a> {
    pub system: &'a str,
    pub messages: &'a [ConversationMessage],
    pub tools: &'a [Value],
}

/// Incremental output of one model turn.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ModelEvent {
    MessageStart { message_id: String },
    TextDelta(String),
    MessageStop,
    /// Final assistant content, text and tool invocations in arrival order.
    Finished(Vec<ContentBlock>),
    /// The stream broke; no `Finished` will follow.
    Failed(String),
}

/// Trait for language model backends.
#[async_trait]
pub(crate) trait ModelClient: Send + Sync {
    /// Returns the client name for display.
    fn name(&self) -> &'static str;

    /// Starts streaming one assistant turn.
    async fn stream_turn(&self, request: TurnRequest<'_>) -> Result<mpsc::Receiver<ModelEvent>>;

    /// Produces a short title for a task description.
    async fn generate_title(&self, description: &str) -> Result<String>;
}

/// Generates a title, falling back to [`FALLBACK_TITLE`] on any failure.
pub(crate) async fn title_or_fallback(client: &dyn ModelClient, description: &str) -> String {
    match client.generate_title(description).await {
        Ok(title) if !title.trim().is_empty() => title.trim().to_string(),
        Ok(_) => FALLBACK_TITLE.to_string(),
        Err(e) => {
            tracing::warn!("Title generation failed: {}", e);
            FALLBACK_TITLE.to_string()
        }
    }
}
