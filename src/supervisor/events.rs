//! Structured event stream for instance lifecycle transitions (component F).
//!
//! Shape grounded on `metrics::MetricsBroadcaster`: a `broadcast::Sender`
//! wrapped in a small struct with a `subscribe()` accessor, cloned cheaply
//! via the channel's own internal `Arc`.

use serde::Serialize;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SupervisorEvent {
    Started { project_id: String, port: u16 },
    Stopped { project_id: String },
    Log { project_id: String, stream: LogStream, message: String },
    Exit { project_id: String, code: Option<i32> },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SupervisorEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.tx.subscribe()
    }

    /// No-op if there are currently no subscribers — ordering per
    /// `project_id` is guaranteed since every publish for one project comes
    /// from that project's own supervisor task.
    pub fn publish(&self, event: SupervisorEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(SupervisorEvent::Started {
            project_id: "p1".into(),
            port: 5200,
        });
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(SupervisorEvent::Stopped {
            project_id: "p1".into(),
        });
        let event = rx.recv().await.unwrap();
        matches!(event, SupervisorEvent::Stopped { project_id } if project_id == "p1");
    }
}
