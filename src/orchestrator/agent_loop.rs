//! Bounded model/tool conversation loop.

use anyhow::{bail, Result};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::{ModelClient, ModelEvent, TurnRequest};
use crate::conversation::{ContentBlock, ConversationMessage, Role};
use crate::relay::{EventRelay, TaskEvent};
use crate::store::TaskStore;
use crate::tools::{tool_definitions, ToolInvocation, ToolResult, Toolbox};

/// Why the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopReason {
    /// The model answered without requesting tools.
    Finished,
    /// The iteration bound was reached.
    IterationLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LoopOutcome {
    pub iterations: u32,
    pub reason: StopReason,
}

/// One agent run over a task's conversation.
pub(crate) struct AgentLoop<'a> {
    pub model: &'a dyn ModelClient,
    pub store: &'a dyn TaskStore,
    pub relay: &'a EventRelay,
    pub task_id: Uuid,
    pub max_iterations: u32,
}

impl AgentLoop<'_> {
    /// Alternates model turns and tool execution until the model stops
    /// requesting tools or the iteration bound is hit.
    pub async fn run(
        &self,
        toolbox: &mut Toolbox<'_>,
        mut history: Vec<ConversationMessage>,
        system: &str,
    ) -> Result<LoopOutcome> {
        let tools = tool_definitions();
        let mut message_order = self.store.next_message_order(self.task_id).await?;

        for iteration in 1..=self.max_iterations {
            debug!(task_id = %self.task_id, iteration, "Starting model turn");

            let blocks = self
                .stream_turn(TurnRequest {
                    system,
                    messages: &history,
                    tools: &tools,
                })
                .await?;
            history.push(ConversationMessage::assistant(blocks.clone()));

            let persisted: Vec<ContentBlock> = blocks
                .into_iter()
                .filter(|block| !matches!(block, ContentBlock::Text { text } if text.trim().is_empty()))
                .collect();
            let calls: Vec<ToolInvocation> = persisted
                .iter()
                .filter_map(ContentBlock::as_tool_input)
                .cloned()
                .collect();

            for call in &calls {
                self.relay
                    .push(self.task_id, TaskEvent::ToolInput(call.clone()));
            }
            if !persisted.is_empty() {
                self.store
                    .append_message(self.task_id, message_order, Role::Assistant, persisted)
                    .await?;
                message_order += 1;
            }

            if calls.is_empty() {
                info!(event = "agent_finished", task_id = %self.task_id, iterations = iteration);
                return Ok(LoopOutcome {
                    iterations: iteration,
                    reason: StopReason::Finished,
                });
            }

            let mut results = Vec::with_capacity(calls.len());
            for call in &calls {
                let result = match toolbox.execute(call).await {
                    Ok(result) => result,
                    Err(e) => {
                        warn!(
                            task_id = %self.task_id,
                            tool_id = %call.tool_id,
                            tool_name = %call.tool_name,
                            "Tool failed: {}", e
                        );
                        ToolResult::error(&call.tool_id, format!("Error: {e}"))
                    }
                };
                self.relay
                    .push(self.task_id, TaskEvent::ToolResult(result.clone()));
                results.push(result);
            }

            self.store
                .append_message(
                    self.task_id,
                    message_order,
                    Role::User,
                    results.iter().cloned().map(ContentBlock::ToolResult).collect(),
                )
                .await?;
            message_order += 1;
            history.push(ConversationMessage::tool_results(results));
        }

        info!(
            event = "agent_iteration_limit",
            task_id = %self.task_id,
            iterations = self.max_iterations,
        );
        Ok(LoopOutcome {
            iterations: self.max_iterations,
            reason: StopReason::IterationLimit,
        })
    }

    /// Streams one turn, forwarding live events, and returns the final content.
    async fn stream_turn(&self, request: TurnRequest<'_>) -> Result<Vec<ContentBlock>> {
        let mut events = self.model.stream_turn(request).await?;

        while let Some(event) = events.recv().await {
            match event {
                ModelEvent::MessageStart { message_id } => {
                    self.relay
                        .push(self.task_id, TaskEvent::MessageStart { message_id });
                }
                ModelEvent::TextDelta(text) => {
                    self.relay.push(self.task_id, TaskEvent::TextDelta { text });
                }
                ModelEvent::MessageStop => self.relay.push(self.task_id, TaskEvent::MessageStop),
                ModelEvent::Finished(blocks) => return Ok(blocks),
                ModelEvent::Failed(message) => bail!("Model stream failed: {message}"),
            }
        }

        bail!("Model stream closed without a final message")
    }
}
