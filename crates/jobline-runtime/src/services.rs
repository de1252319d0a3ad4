use std::sync::Arc;

use jobline_core::event::{BatchEvent, EventBus};
use jobline_core::traits::{ArtifactFactory, PersistenceService};

/// Collaborators every controller needs, handed down explicitly.
#[derive(Clone)]
pub struct ExecutionServices {
    pub persistence: Arc<dyn PersistenceService>,
    pub artifacts: Arc<dyn ArtifactFactory>,
    pub events: Arc<EventBus>,
}

impl ExecutionServices {
    pub fn new(
        persistence: Arc<dyn PersistenceService>,
        artifacts: Arc<dyn ArtifactFactory>,
    ) -> Self {
        Self {
            persistence,
            artifacts,
            events: Arc::new(EventBus::default()),
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn publish(&self, event: BatchEvent) {
        self.events.publish(event);
    }
}
