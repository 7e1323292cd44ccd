//! Per-task event queues between orchestration and stream consumers.
//!
//! Producers push without blocking; one consumer at a time drains a task's
//! queue in FIFO order. Destroying a queue lets the consumer finish what is
//! buffered and then end.

use futures_util::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;
use uuid::Uuid;

use crate::tools::{ToolInvocation, ToolResult};

/// An event forwarded to the client stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum TaskEvent {
    MessageStart { message_id: String },
    MessageStop,
    Error { error_message: String },
    ToolInput(ToolInvocation),
    ToolResult(ToolResult),
    TextDelta { text: String },
}

type Receiver = Arc<AsyncMutex<mpsc::UnboundedReceiver<TaskEvent>>>;

struct Queue {
    sender: mpsc::UnboundedSender<TaskEvent>,
    receiver: Receiver,
}

impl Queue {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(AsyncMutex::new(receiver)),
        }
    }
}

#[derive(Default)]
struct Registry {
    queues: HashMap<Uuid, Queue>,
    // Tasks whose queue was destroyed and not created again.
    closed: HashSet<Uuid>,
}

/// Registry of per-task event queues.
#[derive(Default)]
pub(crate) struct EventRelay {
    registry: Mutex<Registry>,
}

impl EventRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the queue for a task; no-op if it exists.
    pub fn create(&self, task_id: Uuid) {
        let mut registry = self.registry();
        registry.closed.remove(&task_id);
        registry.queues.entry(task_id).or_insert_with(Queue::new);
    }

    /// Enqueues an event, creating the queue if needed.
    ///
    /// Events for a task whose queue was destroyed are dropped until the
    /// queue is created again.
    pub fn push(&self, task_id: Uuid, event: TaskEvent) {
        let mut registry = self.registry();
        if registry.closed.contains(&task_id) {
            debug!(event = "relay_event_dropped", task_id = %task_id);
            return;
        }
        let queue = registry.queues.entry(task_id).or_insert_with(Queue::new);
        // The receiver lives in the same entry, so the send cannot fail.
        let _ = queue.sender.send(event);
    }

    /// Removes a task's queue; its consumer drains what is left and ends.
    pub fn destroy(&self, task_id: Uuid) {
        let mut registry = self.registry();
        registry.closed.insert(task_id);
        if registry.queues.remove(&task_id).is_some() {
            debug!(event = "relay_destroyed", task_id = %task_id);
        }
    }

    /// Events for a task until its queue is destroyed and drained.
    ///
    /// A task without a queue yields an empty stream. A second concurrent
    /// consumer waits until the first is dropped.
    pub fn stream(&self, task_id: Uuid) -> impl Stream<Item = TaskEvent> + Send + 'static {
        let receiver = self
            .registry()
            .queues
            .get(&task_id)
            .map(|q| Arc::clone(&q.receiver));

        stream::unfold(
            (receiver, None::<OwnedMutexGuard<mpsc::UnboundedReceiver<TaskEvent>>>),
            |(receiver, guard)| async move {
                let receiver = receiver?;
                let mut guard = match guard {
                    Some(guard) => guard,
                    None => Arc::clone(&receiver).lock_owned().await,
                };
                let event = guard.recv().await?;
                Some((event, (Some(receiver), Some(guard))))
            },
        )
    }

    /// Server-sent-event frames (`data: <json>\n\n`) for a task.
    pub fn sse_stream(&self, task_id: Uuid) -> impl Stream<Item = String> + Send + 'static {
        self.stream(task_id).scan(false, |failed, event| {
            let frame = if *failed {
                None
            } else {
                match serde_json::to_string(&event) {
                    Ok(json) => Some(format!("data: {json}\n\n")),
                    Err(e) => {
                        *failed = true;
                        Some(error_frame(&e.to_string()))
                    }
                }
            };
            futures_util::future::ready(frame)
        })
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Terminal frame emitted when the stream cannot continue.
pub(crate) fn error_frame(message: &str) -> String {
    let event = TaskEvent::Error {
        error_message: message.to_string(),
    };
    let json = serde_json::to_string(&event)
        .unwrap_or_else(|_| r#"{"type":"error","error_message":"stream failed"}"#.to_string());
    format!("data: {json}\n\n")
}
