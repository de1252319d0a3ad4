#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use jobline_core::graph::JobDefinition;
use jobline_core::records::{JobExecution, StepExecution};
use jobline_runtime::{ArtifactRegistry, BatchKernel, ExecutionServices};
use jobline_store::MemoryStore;

pub struct Harness {
    pub kernel: Arc<BatchKernel>,
    pub store: Arc<MemoryStore>,
}

impl Harness {
    pub fn new(registry: ArtifactRegistry) -> Self {
        let store = Arc::new(MemoryStore::new());
        let services = ExecutionServices::new(store.clone(), Arc::new(registry));
        Self {
            kernel: Arc::new(BatchKernel::new(services)),
            store,
        }
    }

    pub fn with_kernel(store: Arc<MemoryStore>, kernel: BatchKernel) -> Self {
        Self {
            kernel: Arc::new(kernel),
            store,
        }
    }

    /// Start `definition` and wait for it to finish.
    pub async fn run(&self, definition: JobDefinition) -> JobExecution {
        let execution_id = self.kernel.start(definition, HashMap::new()).unwrap();
        self.kernel.wait_for(execution_id).await.unwrap()
    }

    pub async fn restart(&self, execution_id: u64) -> JobExecution {
        let restarted = self.kernel.restart(execution_id, HashMap::new()).unwrap();
        self.kernel.wait_for(restarted).await.unwrap()
    }

    pub fn step_names(&self, execution_id: u64) -> Vec<String> {
        self.steps(execution_id)
            .into_iter()
            .map(|s| s.step_name)
            .collect()
    }

    pub fn steps(&self, execution_id: u64) -> Vec<StepExecution> {
        self.kernel.step_executions(execution_id).unwrap()
    }
}
