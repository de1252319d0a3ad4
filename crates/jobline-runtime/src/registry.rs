use std::collections::HashMap;
use std::sync::Arc;

use jobline_core::error::{BatchError, Result};
use jobline_core::traits::{
    ArtifactFactory, Batchlet, CheckpointAlgorithm, ChunkHandler, Decider, JobListener,
    StepListener,
};

type Factory<T> = Arc<dyn Fn() -> T + Send + Sync>;

/// Named artifact factories. Every resolution calls the factory, so a
/// factory that builds a fresh value gives each step attempt its own
/// instance; one that clones an `Arc` shares it.
#[derive(Default)]
pub struct ArtifactRegistry {
    batchlets: HashMap<String, Factory<Arc<dyn Batchlet>>>,
    chunk_handlers: HashMap<String, Factory<Arc<dyn ChunkHandler>>>,
    deciders: HashMap<String, Factory<Arc<dyn Decider>>>,
    job_listeners: HashMap<String, Factory<Arc<dyn JobListener>>>,
    step_listeners: HashMap<String, Factory<Arc<dyn StepListener>>>,
    checkpoint_algorithms: HashMap<String, Factory<Box<dyn CheckpointAlgorithm>>>,
}

impl ArtifactRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_batchlet<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn Batchlet> + Send + Sync + 'static,
    {
        self.batchlets.insert(name.into(), Arc::new(factory));
    }

    pub fn register_chunk_handler<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn ChunkHandler> + Send + Sync + 'static,
    {
        self.chunk_handlers.insert(name.into(), Arc::new(factory));
    }

    pub fn register_decider<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn Decider> + Send + Sync + 'static,
    {
        self.deciders.insert(name.into(), Arc::new(factory));
    }

    pub fn register_job_listener<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn JobListener> + Send + Sync + 'static,
    {
        self.job_listeners.insert(name.into(), Arc::new(factory));
    }

    pub fn register_step_listener<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn StepListener> + Send + Sync + 'static,
    {
        self.step_listeners.insert(name.into(), Arc::new(factory));
    }

    pub fn register_checkpoint_algorithm<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn CheckpointAlgorithm> + Send + Sync + 'static,
    {
        self.checkpoint_algorithms.insert(name.into(), Arc::new(factory));
    }

    /// Names of all registered batchlets and chunk handlers.
    pub fn step_artifacts(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .batchlets
            .keys()
            .chain(self.chunk_handlers.keys())
            .map(|s| s.as_str())
            .collect();
        names.sort_unstable();
        names
    }
}

fn resolve<T>(map: &HashMap<String, Factory<T>>, kind: &str, reference: &str) -> Result<T> {
    map.get(reference)
        .map(|factory| factory())
        .ok_or_else(|| BatchError::ArtifactNotFound {
            kind: kind.to_string(),
            reference: reference.to_string(),
        })
}

impl ArtifactFactory for ArtifactRegistry {
    fn batchlet(&self, reference: &str) -> Result<Arc<dyn Batchlet>> {
        resolve(&self.batchlets, "batchlet", reference)
    }

    fn chunk_handler(&self, reference: &str) -> Result<Arc<dyn ChunkHandler>> {
        resolve(&self.chunk_handlers, "chunk handler", reference)
    }

    fn decider(&self, reference: &str) -> Result<Arc<dyn Decider>> {
        resolve(&self.deciders, "decider", reference)
    }

    fn job_listener(&self, reference: &str) -> Result<Arc<dyn JobListener>> {
        resolve(&self.job_listeners, "job listener", reference)
    }

    fn step_listener(&self, reference: &str) -> Result<Arc<dyn StepListener>> {
        resolve(&self.step_listeners, "step listener", reference)
    }

    fn checkpoint_algorithm(&self, reference: &str) -> Result<Box<dyn CheckpointAlgorithm>> {
        resolve(&self.checkpoint_algorithms, "checkpoint algorithm", reference)
    }
}
