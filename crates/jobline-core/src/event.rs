use serde::Serialize;

use crate::status::BatchStatus;

/// Engine lifecycle events, published for run logs and any other subscriber.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BatchEvent {
    JobStarted {
        job: String,
        execution_id: u64,
    },
    JobFinished {
        job: String,
        execution_id: u64,
        batch_status: BatchStatus,
        exit_status: String,
    },
    StepStarted {
        job: String,
        execution_id: u64,
        step: String,
        step_execution_id: u64,
    },
    StepFinished {
        job: String,
        execution_id: u64,
        step: String,
        step_execution_id: u64,
        batch_status: BatchStatus,
        exit_status: String,
    },
    SplitForked {
        job: String,
        execution_id: u64,
        split: String,
        branches: usize,
    },
    SplitJoined {
        job: String,
        execution_id: u64,
        split: String,
        batch_status: BatchStatus,
    },
    Transition {
        job: String,
        execution_id: u64,
        from: String,
        exit_status: String,
        to: String,
    },
}

impl BatchEvent {
    pub fn execution_id(&self) -> u64 {
        match self {
            BatchEvent::JobStarted { execution_id, .. }
            | BatchEvent::JobFinished { execution_id, .. }
            | BatchEvent::StepStarted { execution_id, .. }
            | BatchEvent::StepFinished { execution_id, .. }
            | BatchEvent::SplitForked { execution_id, .. }
            | BatchEvent::SplitJoined { execution_id, .. }
            | BatchEvent::Transition { execution_id, .. } => *execution_id,
        }
    }

    pub fn job(&self) -> &str {
        match self {
            BatchEvent::JobStarted { job, .. }
            | BatchEvent::JobFinished { job, .. }
            | BatchEvent::StepStarted { job, .. }
            | BatchEvent::StepFinished { job, .. }
            | BatchEvent::SplitForked { job, .. }
            | BatchEvent::SplitJoined { job, .. }
            | BatchEvent::Transition { job, .. } => job,
        }
    }
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<BatchEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: BatchEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<BatchEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(BatchEvent::JobStarted {
            job: "nightly".into(),
            execution_id: 4,
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.execution_id(), 4);
        assert_eq!(event.job(), "nightly");
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        bus.publish(BatchEvent::JobStarted {
            job: "nightly".into(),
            execution_id: 1,
        });
    }

    #[test]
    fn test_event_json_tag() {
        let event = BatchEvent::SplitJoined {
            job: "j".into(),
            execution_id: 1,
            split: "fork".into(),
            batch_status: BatchStatus::Stopped,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"split_joined\""));
        assert!(json.contains("\"STOPPED\""));
    }
}
