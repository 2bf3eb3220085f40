// Event Publisher Port
// Best-effort, fire-and-forget delivery of job events to real-time transports

use crate::domain::{JobEvent, UserEvent};
use tokio::sync::broadcast;
use tracing::debug;

pub trait EventPublisher: Send + Sync {
    /// Publish an event for one user. Must not block and must not fail the caller.
    fn publish(&self, user_id: &str, event: JobEvent);
}

/// Default channel capacity for the in-process event bus
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// In-process event bus over a tokio broadcast channel.
///
/// Transports (SSE, websocket fan-out) subscribe and filter by `user_id`.
/// Slow subscribers lag and lose events.
pub struct BroadcastPublisher {
    tx: broadcast::Sender<UserEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UserEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventPublisher for BroadcastPublisher {
    fn publish(&self, user_id: &str, event: JobEvent) {
        let kind = event.kind;
        let job_id = event.job_id.clone();
        let user_event = UserEvent {
            user_id: user_id.to_string(),
            event,
        };
        if self.tx.send(user_event).is_err() {
            debug!(job_id = %job_id, event = ?kind, "No event subscribers");
        }
    }
}

pub mod mocks {
    use super::*;
    use std::sync::Mutex;

    /// Records every published event
    #[derive(Default)]
    pub struct RecordingPublisher {
        events: Mutex<Vec<UserEvent>>,
    }

    impl RecordingPublisher {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn events(&self) -> Vec<UserEvent> {
            self.events.lock().unwrap().clone()
        }

        pub fn kinds(&self) -> Vec<crate::domain::JobEventKind> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .map(|e| e.event.kind)
                .collect()
        }
    }

    impl EventPublisher for RecordingPublisher {
        fn publish(&self, user_id: &str, event: JobEvent) {
            self.events.lock().unwrap().push(UserEvent {
                user_id: user_id.to_string(),
                event,
            });
        }
    }
}
