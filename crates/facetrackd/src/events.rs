//! Live events published by the recognition worker.

use facetrack_core::Recognition;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub const STATUS_TOPIC: &str = "rec_status_update";
pub const RECOGNITION_TOPIC: &str = "new_recognition";

/// Snapshot of the worker lifecycle as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub running: bool,
    pub scheduled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecognitionBatch {
    pub results: Vec<Recognition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Status(WorkerStatus),
    Recognition(RecognitionBatch),
}

impl Event {
    pub fn topic(&self) -> &'static str {
        match self {
            Event::Status(_) => STATUS_TOPIC,
            Event::Recognition(_) => RECOGNITION_TOPIC,
        }
    }

    /// JSON payload as delivered to listeners.
    pub fn payload(&self) -> serde_json::Value {
        let value = match self {
            Event::Status(status) => serde_json::to_value(status),
            Event::Recognition(batch) => serde_json::to_value(batch),
        };
        value.unwrap_or(serde_json::Value::Null)
    }
}

/// Fire-and-forget destination for worker events. Implementations must not
/// block and must swallow delivery failures.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: Event);
}

/// In-process broadcast bus. Publishing with no subscribers is not an error.
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

impl EventSink for EventBus {
    fn publish(&self, event: Event) {
        tracing::trace!(topic = event.topic(), "publishing event");
        let _ = self.sender.send(event);
    }
}
