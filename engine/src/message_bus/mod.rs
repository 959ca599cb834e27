//! Message Bus for task lifecycle notifications
//!
//! The MessageBus provides a pub/sub pattern so callers can observe task
//! progress without polling the store. It uses bounded channels to prevent
//! unbounded memory growth and supports both specific event subscriptions
//! and global "All" subscriptions.
//!
//! Publishing never waits on a slow subscriber: when a subscriber's buffer is
//! full the event is dropped for that subscriber only. The store remains the
//! source of truth; events are a convenience signal.

use sdk::types::StepStatus;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

/// Channel buffer size for bounded channels
const CHANNEL_BUFFER_SIZE: usize = 100;

/// Event types that can be published on the message bus
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum EventType {
    /// Task row was created and queued for a worker
    TaskCreated,
    /// A step reached its terminal status
    StepFinished,
    /// Task reached SUCCESS
    TaskSucceeded,
    /// Task reached FAILED
    TaskFailed,
    /// Subscribe to all event types
    All,
}

/// Events that can be published on the message bus
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    TaskCreated {
        task_id: i64,
        document_id: i64,
        max_iterations: i64,
    },
    StepFinished {
        task_id: i64,
        iteration: i64,
        step_code: String,
        tool: Option<String>,
        status: StepStatus,
    },
    TaskSucceeded {
        task_id: i64,
        summary: String,
    },
    TaskFailed {
        task_id: i64,
        error: String,
    },
}

impl Event {
    /// Get the event type for this event
    pub fn event_type(&self) -> EventType {
        match self {
            Event::TaskCreated { .. } => EventType::TaskCreated,
            Event::StepFinished { .. } => EventType::StepFinished,
            Event::TaskSucceeded { .. } => EventType::TaskSucceeded,
            Event::TaskFailed { .. } => EventType::TaskFailed,
        }
    }

    /// Task the event belongs to
    pub fn task_id(&self) -> i64 {
        match self {
            Event::TaskCreated { task_id, .. }
            | Event::StepFinished { task_id, .. }
            | Event::TaskSucceeded { task_id, .. }
            | Event::TaskFailed { task_id, .. } => *task_id,
        }
    }

    /// Whether this is one of the two terminal task events
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::TaskSucceeded { .. } | Event::TaskFailed { .. })
    }
}

/// Message bus for pub/sub communication between components
pub struct MessageBus {
    /// Map of event types to lists of subscribers
    channels: Arc<Mutex<HashMap<EventType, Vec<mpsc::Sender<Event>>>>>,
}

impl MessageBus {
    /// Create a new MessageBus
    pub fn new() -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Subscribe to a specific event type, or `EventType::All`
    pub async fn subscribe(&self, event_type: EventType) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let mut channels = self.channels.lock().await;
        channels.entry(event_type).or_default().push(tx);
        rx
    }

    /// Publish an event to all subscribers
    ///
    /// The event is sent to all subscribers of the specific event type,
    /// as well as all subscribers of EventType::All. Closed subscribers are
    /// pruned.
    pub async fn publish(&self, event: Event) {
        let mut channels = self.channels.lock().await;
        let event_type = event.event_type();

        for key in [event_type, EventType::All] {
            if let Some(subscribers) = channels.get_mut(&key) {
                subscribers.retain(|tx| match tx.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(task_id = event.task_id(), "Subscriber buffer full, event dropped");
                        true
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                });
            }
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}
