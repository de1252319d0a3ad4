use std::time::{Duration, Instant};

use tracing::debug;

use jobline_core::error::Result;
use jobline_core::graph::{CheckpointPolicy, ChunkConfig};
use jobline_core::traits::{ArtifactFactory, CheckpointAlgorithm};

/// Commit every `item_count` items.
pub struct ItemCheckpoint {
    item_count: u32,
    seen: u32,
}

impl ItemCheckpoint {
    pub fn new(item_count: u32) -> Self {
        Self {
            item_count: item_count.max(1),
            seen: 0,
        }
    }
}

impl CheckpointAlgorithm for ItemCheckpoint {
    fn begin_checkpoint(&mut self) {
        self.seen = 0;
    }

    fn is_ready_to_checkpoint(&mut self) -> bool {
        self.seen += 1;
        self.seen >= self.item_count
    }

    fn end_checkpoint(&mut self) {}
}

/// Commit once `limit` has elapsed since the chunk began.
pub struct TimeCheckpoint {
    limit: Duration,
    started: Instant,
}

impl TimeCheckpoint {
    pub fn new(limit_secs: u64) -> Self {
        Self {
            limit: Duration::from_secs(limit_secs),
            started: Instant::now(),
        }
    }
}

impl CheckpointAlgorithm for TimeCheckpoint {
    fn checkpoint_timeout(&self) -> u64 {
        self.limit.as_secs()
    }

    fn begin_checkpoint(&mut self) {
        self.started = Instant::now();
    }

    fn is_ready_to_checkpoint(&mut self) -> bool {
        self.started.elapsed() >= self.limit
    }

    fn end_checkpoint(&mut self) {}
}

/// Commit on whichever comes first: the item count or the time limit.
/// A zero time limit leaves only the item count.
pub struct ItemTimeCheckpoint {
    items: ItemCheckpoint,
    time: Option<TimeCheckpoint>,
}

impl ItemTimeCheckpoint {
    pub fn new(item_count: u32, limit_secs: u64) -> Self {
        Self {
            items: ItemCheckpoint::new(item_count),
            time: (limit_secs > 0).then(|| TimeCheckpoint::new(limit_secs)),
        }
    }
}

impl CheckpointAlgorithm for ItemTimeCheckpoint {
    fn checkpoint_timeout(&self) -> u64 {
        self.time.as_ref().map_or(0, |t| t.checkpoint_timeout())
    }

    fn begin_checkpoint(&mut self) {
        self.items.begin_checkpoint();
        if let Some(time) = &mut self.time {
            time.begin_checkpoint();
        }
    }

    fn is_ready_to_checkpoint(&mut self) -> bool {
        let items_ready = self.items.is_ready_to_checkpoint();
        let time_ready = self
            .time
            .as_mut()
            .is_some_and(|t| t.is_ready_to_checkpoint());
        items_ready || time_ready
    }

    fn end_checkpoint(&mut self) {}
}

/// Pick the checkpoint algorithm a chunk step declares.
pub fn select_checkpoint_algorithm(
    chunk: &ChunkConfig,
    artifacts: &dyn ArtifactFactory,
) -> Result<Box<dyn CheckpointAlgorithm>> {
    debug!(
        handler = %chunk.handler,
        policy = ?chunk.checkpoint_policy,
        "Selecting checkpoint algorithm"
    );
    Ok(match chunk.checkpoint_policy {
        CheckpointPolicy::Item => Box::new(ItemCheckpoint::new(chunk.item_count)),
        CheckpointPolicy::Time => Box::new(TimeCheckpoint::new(chunk.time_limit_secs)),
        CheckpointPolicy::Custom => match &chunk.checkpoint_algorithm {
            Some(reference) => artifacts.checkpoint_algorithm(reference)?,
            None => Box::new(ItemTimeCheckpoint::new(
                chunk.item_count,
                chunk.time_limit_secs,
            )),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ArtifactRegistry;

    #[test]
    fn test_item_checkpoint_every_n() {
        let mut algo = ItemCheckpoint::new(3);
        algo.begin_checkpoint();
        assert!(!algo.is_ready_to_checkpoint());
        assert!(!algo.is_ready_to_checkpoint());
        assert!(algo.is_ready_to_checkpoint());
        algo.begin_checkpoint();
        assert!(!algo.is_ready_to_checkpoint());
    }

    #[test]
    fn test_zero_time_limit_checkpoints_immediately() {
        let mut algo = TimeCheckpoint::new(0);
        algo.begin_checkpoint();
        assert!(algo.is_ready_to_checkpoint());
        assert_eq!(algo.checkpoint_timeout(), 0);
    }

    #[test]
    fn test_item_time_without_limit_counts_items() {
        let mut algo = ItemTimeCheckpoint::new(2, 0);
        algo.begin_checkpoint();
        assert!(!algo.is_ready_to_checkpoint());
        assert!(algo.is_ready_to_checkpoint());
        assert_eq!(algo.checkpoint_timeout(), 0);
    }

    #[test]
    fn test_time_policy_reports_timeout() {
        let registry = ArtifactRegistry::new();
        let chunk = ChunkConfig::new("reader")
            .with_policy(CheckpointPolicy::Time)
            .with_time_limit(30);
        let algo = select_checkpoint_algorithm(&chunk, &registry).unwrap();
        assert_eq!(algo.checkpoint_timeout(), 30);
    }

    #[test]
    fn test_custom_policy_resolves_reference() {
        let mut registry = ArtifactRegistry::new();
        registry.register_checkpoint_algorithm("every-item", || Box::new(ItemCheckpoint::new(1)));
        let mut chunk = ChunkConfig::new("reader").with_policy(CheckpointPolicy::Custom);
        chunk.checkpoint_algorithm = Some("every-item".into());

        let mut algo = select_checkpoint_algorithm(&chunk, &registry).unwrap();
        algo.begin_checkpoint();
        assert!(algo.is_ready_to_checkpoint());
    }

    #[test]
    fn test_custom_policy_unknown_reference() {
        let registry = ArtifactRegistry::new();
        let mut chunk = ChunkConfig::new("reader").with_policy(CheckpointPolicy::Custom);
        chunk.checkpoint_algorithm = Some("missing".into());
        assert!(select_checkpoint_algorithm(&chunk, &registry).is_err());
    }
}
