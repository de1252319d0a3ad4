use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::context::{JobContext, StepContext};
use crate::error::Result;
use crate::records::{JobExecution, JobInstance, JobStatus, StepExecution, StepStatus};
use crate::status::BatchStatus;

/// Persistence backend for instances, executions and their durable status.
///
/// Calls are synchronous; implementations serialize concurrent writers themselves.
pub trait PersistenceService: Send + Sync + 'static {
    fn create_job_instance(&self, job_name: &str, definition_json: &str) -> Result<JobInstance>;

    fn job_instance(&self, instance_id: u64) -> Result<JobInstance>;

    /// Number of instances created under `job_name`.
    fn job_instance_count(&self, job_name: &str) -> Result<usize>;

    /// Instances for `job_name`, oldest first.
    fn job_instances(&self, job_name: &str) -> Result<Vec<JobInstance>>;

    /// Distinct job names with at least one instance.
    fn job_names(&self) -> Result<Vec<String>>;

    fn create_job_execution(
        &self,
        instance_id: u64,
        parameters: &HashMap<String, String>,
    ) -> Result<JobExecution>;

    fn job_execution(&self, execution_id: u64) -> Result<JobExecution>;

    /// Executions of an instance, oldest first.
    fn job_executions(&self, instance_id: u64) -> Result<Vec<JobExecution>>;

    /// Record a lifecycle transition. STARTED stamps the start time and
    /// terminal states stamp the end time; every call stamps last-updated.
    fn update_batch_status(
        &self,
        execution_id: u64,
        status: BatchStatus,
        at: DateTime<Utc>,
    ) -> Result<()>;

    fn update_exit_status(&self, execution_id: u64, exit_status: &str, at: DateTime<Utc>)
        -> Result<()>;

    fn create_job_status(&self, instance_id: u64, job_name: &str) -> Result<JobStatus>;

    fn job_status(&self, instance_id: u64) -> Result<Option<JobStatus>>;

    fn update_job_status(&self, status: &JobStatus) -> Result<()>;

    fn create_step_status(
        &self,
        instance_id: u64,
        step_name: &str,
        step_execution_id: u64,
    ) -> Result<StepStatus>;

    fn step_status(&self, instance_id: u64, step_name: &str) -> Result<Option<StepStatus>>;

    /// Write a step status, keyed by its instance and step name.
    fn update_step_status(&self, status: &StepStatus) -> Result<()>;

    fn create_step_execution(&self, job_execution_id: u64, step_name: &str)
        -> Result<StepExecution>;

    fn update_step_execution(&self, execution: &StepExecution) -> Result<()>;

    /// Step executions of a job execution, in creation order.
    fn step_executions(&self, job_execution_id: u64) -> Result<Vec<StepExecution>>;
}

/// Resolves logical artifact references to fresh instances.
pub trait ArtifactFactory: Send + Sync + 'static {
    fn batchlet(&self, reference: &str) -> Result<Arc<dyn Batchlet>>;

    fn chunk_handler(&self, reference: &str) -> Result<Arc<dyn ChunkHandler>>;

    fn decider(&self, reference: &str) -> Result<Arc<dyn Decider>>;

    fn job_listener(&self, reference: &str) -> Result<Arc<dyn JobListener>>;

    fn step_listener(&self, reference: &str) -> Result<Arc<dyn StepListener>>;

    fn checkpoint_algorithm(&self, reference: &str) -> Result<Box<dyn CheckpointAlgorithm>>;
}

/// Task-oriented step logic.
pub trait Batchlet: Send + Sync + 'static {
    /// Run the step; the returned string, if any, becomes the step's exit status.
    fn process(&self, ctx: Arc<StepContext>) -> BoxFuture<'_, Result<Option<String>>>;

    /// Cooperative stop request, issued from another task while `process` runs.
    fn stop(&self) -> BoxFuture<'_, Result<()>>;
}

/// Chunk-oriented step logic. The handler owns the read/process/write loop
/// and asks the checkpoint algorithm when to commit.
pub trait ChunkHandler: Send + Sync + 'static {
    fn run(
        &self,
        ctx: Arc<StepContext>,
        checkpoint: Box<dyn CheckpointAlgorithm>,
    ) -> BoxFuture<'_, Result<Option<String>>>;

    fn stop(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Decides the routing exit status from the preceding element's step executions.
pub trait Decider: Send + Sync + 'static {
    fn decide(
        &self,
        executions: Vec<StepExecution>,
        job: Arc<JobContext>,
    ) -> BoxFuture<'_, Result<String>>;
}

pub trait JobListener: Send + Sync + 'static {
    fn before_job(&self, job: Arc<JobContext>) -> BoxFuture<'_, Result<()>>;

    fn after_job(&self, job: Arc<JobContext>) -> BoxFuture<'_, Result<()>>;
}

pub trait StepListener: Send + Sync + 'static {
    fn before_step(&self, step: Arc<StepContext>) -> BoxFuture<'_, Result<()>>;

    fn after_step(&self, step: Arc<StepContext>) -> BoxFuture<'_, Result<()>>;
}

/// Decides when a chunk handler commits.
pub trait CheckpointAlgorithm: Send {
    /// Transaction timeout in seconds for the next chunk; 0 means none.
    fn checkpoint_timeout(&self) -> u64 {
        0
    }

    fn begin_checkpoint(&mut self);

    /// Called after each item; true means commit now.
    fn is_ready_to_checkpoint(&mut self) -> bool;

    fn end_checkpoint(&mut self);
}
