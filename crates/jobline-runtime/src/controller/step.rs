use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use futures::future::BoxFuture;
use tracing::{error, info, warn};

use jobline_core::context::{JobContext, StepContext};
use jobline_core::error::{BatchError, Result};
use jobline_core::event::BatchEvent;
use jobline_core::graph::Step;
use jobline_core::records::StepExecution;
use jobline_core::status::{effective_exit_status, BatchStatus};
use jobline_core::traits::{Batchlet, ChunkHandler, StepListener};

use super::{ElementStatus, StepFailure};
use crate::checkpoint::select_checkpoint_algorithm;
use crate::kernel::BatchKernel;

#[derive(Clone)]
enum ActiveArtifact {
    Batchlet(Arc<dyn Batchlet>),
    Chunk(Arc<dyn ChunkHandler>),
}

impl ActiveArtifact {
    fn stop(&self) -> BoxFuture<'_, Result<()>> {
        match self {
            ActiveArtifact::Batchlet(b) => b.stop(),
            ActiveArtifact::Chunk(c) => c.stop(),
        }
    }
}

/// Runs one attempt of a step: restart bookkeeping, listeners, the
/// batchlet or chunk handler, and the step's execution and status records.
///
/// Failures of the step's own logic are reported as a FAILED status with
/// the cause attached, not as an error; errors are reserved for bookkeeping
/// that could not be done.
pub struct StepController {
    step: Step,
    job: Arc<JobContext>,
    kernel: Arc<BatchKernel>,
    stop_requested: AtomicBool,
    active: Mutex<Option<ActiveArtifact>>,
    last_execution: Mutex<Option<StepExecution>>,
}

impl StepController {
    pub fn new(step: Step, job: Arc<JobContext>, kernel: Arc<BatchKernel>) -> Self {
        Self {
            step,
            job,
            kernel,
            stop_requested: AtomicBool::new(false),
            active: Mutex::new(None),
            last_execution: Mutex::new(None),
        }
    }

    fn active(&self) -> MutexGuard<'_, Option<ActiveArtifact>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record_execution(&self, execution: StepExecution) {
        *self.last_execution.lock().unwrap_or_else(|e| e.into_inner()) = Some(execution);
    }

    pub fn last_execution(&self) -> Option<StepExecution> {
        self.last_execution
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn stopping(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst) || self.job.is_stopping()
    }

    pub async fn execute(&self) -> Result<ElementStatus> {
        let services = self.kernel.services();
        let status_manager = self.kernel.status();
        let instance_id = self.job.instance_id();
        let previous = status_manager.get_step_status(instance_id, &self.step.id)?;

        if let Some(prev) = &previous {
            if prev.batch_status == BatchStatus::Completed && !self.step.allow_start_if_complete {
                info!(step = %self.step.id, "Step already completed, not starting it again");
                self.record_execution(StepExecution::from_status(prev, self.job.execution_id()));
                return Ok(ElementStatus::new(
                    BatchStatus::Completed,
                    effective_exit_status(prev.exit_status.as_deref(), BatchStatus::Completed),
                ));
            }
            if self.step.start_limit > 0 && prev.start_count >= self.step.start_limit {
                return Err(BatchError::StartLimitExceeded {
                    step: self.step.id.clone(),
                    limit: self.step.start_limit,
                });
            }
        }

        let mut execution = services
            .persistence
            .create_step_execution(self.job.execution_id(), &self.step.id)?;
        let mut step_status = status_manager.begin_step_attempt(
            instance_id,
            &self.step.id,
            execution.step_execution_id,
            previous,
        )?;

        let ctx = Arc::new(StepContext::new(
            self.job.clone(),
            self.step.id.clone(),
            execution.step_execution_id,
            self.step.properties.clone(),
        ));
        ctx.set_persistent_user_data(step_status.persistent_user_data.clone());

        services.publish(BatchEvent::StepStarted {
            job: self.job.job_name().to_string(),
            execution_id: self.job.execution_id(),
            step: self.step.id.clone(),
            step_execution_id: execution.step_execution_id,
        });

        ctx.set_batch_status(BatchStatus::Started);
        execution.batch_status = BatchStatus::Started;
        execution.start_time = Some(Utc::now());
        services.persistence.update_step_execution(&execution)?;
        step_status.batch_status = BatchStatus::Started;
        status_manager.update_step_status(&step_status)?;

        info!(
            step = %self.step.id,
            step_execution_id = execution.step_execution_id,
            start_count = step_status.start_count,
            "Step started"
        );

        let outcome = if self.stopping() {
            Ok(None)
        } else {
            self.run_with_listeners(&ctx).await
        };

        let batch_status = match &outcome {
            Err(e) => {
                error!(step = %self.step.id, error = %e, "Step failed");
                BatchStatus::Failed
            }
            Ok(_) if self.stopping() => BatchStatus::Stopped,
            Ok(_) => BatchStatus::Completed,
        };
        ctx.set_batch_status(batch_status);
        let failure = outcome
            .as_ref()
            .err()
            .map(|e| StepFailure::new(self.step.id.clone(), e));
        let exit_status = match outcome {
            Ok(Some(exit)) => exit,
            _ => ctx.exit_status_or_default(),
        };
        ctx.set_exit_status(exit_status.clone());
        *self.active() = None;

        execution.batch_status = batch_status;
        execution.exit_status = Some(exit_status.clone());
        execution.metrics = ctx.metrics();
        execution.persistent_user_data = ctx.persistent_user_data();
        execution.end_time = Some(Utc::now());
        services.persistence.update_step_execution(&execution)?;

        step_status.batch_status = batch_status;
        step_status.exit_status = Some(exit_status.clone());
        step_status.persistent_user_data = ctx.persistent_user_data();
        status_manager.update_step_status(&step_status)?;

        services.publish(BatchEvent::StepFinished {
            job: self.job.job_name().to_string(),
            execution_id: self.job.execution_id(),
            step: self.step.id.clone(),
            step_execution_id: execution.step_execution_id,
            batch_status,
            exit_status: exit_status.clone(),
        });
        info!(
            step = %self.step.id,
            batch_status = %batch_status,
            exit_status = %exit_status,
            "Step finished"
        );

        self.record_execution(execution);
        Ok(ElementStatus::new(batch_status, exit_status).with_failure(failure))
    }

    async fn run_with_listeners(&self, ctx: &Arc<StepContext>) -> Result<Option<String>> {
        let artifacts = &self.kernel.services().artifacts;
        let listeners = self
            .step
            .listeners
            .iter()
            .map(|r| artifacts.step_listener(r))
            .collect::<Result<Vec<Arc<dyn StepListener>>>>()?;

        for listener in &listeners {
            listener.before_step(ctx.clone()).await?;
        }

        let result = self.run_artifact(ctx).await;

        let mut after_error = None;
        for listener in &listeners {
            if let Err(e) = listener.after_step(ctx.clone()).await {
                warn!(step = %self.step.id, error = %e, "After-step listener failed");
                after_error.get_or_insert(e);
            }
        }

        let exit = result?;
        match after_error {
            Some(e) => Err(e),
            None => Ok(exit),
        }
    }

    async fn run_artifact(&self, ctx: &Arc<StepContext>) -> Result<Option<String>> {
        let artifacts = &self.kernel.services().artifacts;
        match (&self.step.batchlet, &self.step.chunk) {
            (Some(reference), _) => {
                let batchlet = artifacts.batchlet(reference)?;
                self.activate(ActiveArtifact::Batchlet(batchlet.clone())).await?;
                batchlet.process(ctx.clone()).await
            }
            (None, Some(chunk)) => {
                let handler = artifacts.chunk_handler(&chunk.handler)?;
                let algorithm = select_checkpoint_algorithm(chunk, artifacts.as_ref())?;
                self.activate(ActiveArtifact::Chunk(handler.clone())).await?;
                handler.run(ctx.clone(), algorithm).await
            }
            (None, None) => Err(BatchError::StepFailed {
                step: self.step.id.clone(),
                message: "declares neither a batchlet nor a chunk".into(),
            }),
        }
    }

    /// Publish the running artifact; deliver a stop that arrived before it existed.
    async fn activate(&self, artifact: ActiveArtifact) -> Result<()> {
        *self.active() = Some(artifact.clone());
        if self.stopping() {
            artifact.stop().await?;
        }
        Ok(())
    }

    /// Stop the running artifact. Once the step has finished there is no
    /// active artifact and this only sets the flag.
    pub async fn stop(&self) -> Result<()> {
        self.stop_requested.store(true, Ordering::SeqCst);
        let active = self.active().clone();
        if let Some(artifact) = active {
            info!(step = %self.step.id, "Forwarding stop to step artifact");
            artifact.stop().await?;
        }
        Ok(())
    }
}
