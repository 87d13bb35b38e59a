//! Scheduler lifecycle events, broadcast to any interested listener.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::model::{RunStatus, ScheduledJob};

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    JobCreated { job: Box<ScheduledJob> },
    JobUpdated { job: Box<ScheduledJob> },
    JobDeleted { job_id: String },
    RunStarted { job_id: String, run_id: String },
    RunFinished {
        job_id: String,
        run_id: String,
        status: RunStatus,
    },
}

/// Broadcast bus for [`SchedulerEvent`]. Publishing never blocks; events are
/// dropped when no listener is subscribed.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SchedulerEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: SchedulerEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(SchedulerEvent::JobDeleted { job_id: "j1".into() });

        match rx.recv().await.unwrap() {
            SchedulerEvent::JobDeleted { job_id } => assert_eq!(job_id, "j1"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(SchedulerEvent::JobDeleted { job_id: "j1".into() });
    }
}
