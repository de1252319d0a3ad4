use std::sync::Arc;

use tracing::{debug, error, info, warn};

use jobline_core::context::JobContext;
use jobline_core::error::{BatchError, Result};
use jobline_core::event::BatchEvent;
use jobline_core::graph::JobDefinition;
use jobline_core::status::BatchStatus;
use jobline_core::traits::JobListener;

use super::traversal::{Outcome, Traversal};
use super::CurrentController;
use crate::kernel::BatchKernel;
use crate::navigator::Navigator;

/// Drives one job execution from STARTING to its final status.
///
/// The final batch and exit status are settled exactly once, in
/// `finalize`, whichever way the traversal ended.
pub struct JobController {
    definition: Arc<JobDefinition>,
    job: Arc<JobContext>,
    kernel: Arc<BatchKernel>,
    restart_on: Option<String>,
    listeners: Vec<Arc<dyn JobListener>>,
    current: CurrentController,
}

impl JobController {
    pub fn new(
        definition: Arc<JobDefinition>,
        job: Arc<JobContext>,
        kernel: Arc<BatchKernel>,
    ) -> Self {
        Self {
            definition,
            job,
            kernel,
            restart_on: None,
            listeners: vec![],
            current: CurrentController::new(),
        }
    }

    /// Resume the traversal at `restart_on` instead of the first element.
    pub fn with_restart_on(mut self, restart_on: Option<String>) -> Self {
        self.restart_on = restart_on;
        self
    }

    /// Listeners run in addition to the ones the definition names.
    pub fn with_listeners(mut self, listeners: Vec<Arc<dyn JobListener>>) -> Self {
        self.listeners = listeners;
        self
    }

    pub fn job(&self) -> &Arc<JobContext> {
        &self.job
    }

    pub fn execution_id(&self) -> u64 {
        self.job.execution_id()
    }

    pub async fn execute(&self) -> Result<()> {
        if self.job.is_stopping()
            || !self
                .job
                .compare_and_set_status(BatchStatus::Starting, BatchStatus::Started)
        {
            info!(
                job = %self.job.job_name(),
                execution_id = self.job.execution_id(),
                "Job stopped before it started"
            );
            self.finalize(&[], self.restart_on.clone()).await;
            return Ok(());
        }

        let mut failure = None;
        if let Err(e) = self.kernel.status().update_job_batch_status(
            self.job.instance_id(),
            self.job.execution_id(),
            BatchStatus::Started,
        ) {
            // Stop raced us to the store; the STOPPING checks below handle it
            if !matches!(e, BatchError::IllegalStatusChange { .. }) {
                failure = Some(e);
            }
        }

        self.kernel.services().publish(BatchEvent::JobStarted {
            job: self.job.job_name().to_string(),
            execution_id: self.job.execution_id(),
        });
        info!(
            job = %self.job.job_name(),
            execution_id = self.job.execution_id(),
            restart_on = ?self.restart_on,
            "Job started"
        );

        let mut restart_on = None;
        let listeners = if failure.is_none() {
            match self.resolve_listeners() {
                Ok(listeners) => listeners,
                Err(e) => {
                    failure = Some(e);
                    vec![]
                }
            }
        } else {
            vec![]
        };

        if failure.is_none() {
            if self.job.is_stopping() {
                self.job.set_batch_status(BatchStatus::Stopped);
                restart_on = self.restart_on.clone();
            } else {
                match self.run(&listeners).await.and_then(|o| self.apply(o)) {
                    Ok(restart) => restart_on = restart,
                    Err(e) => failure = Some(e),
                }
            }
        }

        if let Some(e) = &failure {
            self.job.set_batch_status(BatchStatus::Failed);
            self.job.default_exit_status();
            error!(
                job = %self.job.job_name(),
                execution_id = self.job.execution_id(),
                error = %e,
                "Job failed"
            );
        }

        self.finalize(&listeners, restart_on).await;

        match failure {
            Some(e) => Err(BatchError::JobFailed {
                job: self.job.job_name().to_string(),
                execution_id: self.job.execution_id(),
                source: Box::new(e),
            }),
            None => Ok(()),
        }
    }

    fn resolve_listeners(&self) -> Result<Vec<Arc<dyn JobListener>>> {
        let artifacts = &self.kernel.services().artifacts;
        let mut listeners = self
            .definition
            .listeners
            .iter()
            .map(|r| artifacts.job_listener(r))
            .collect::<Result<Vec<_>>>()?;
        listeners.extend(self.listeners.iter().cloned());
        Ok(listeners)
    }

    async fn run(&self, listeners: &[Arc<dyn JobListener>]) -> Result<Outcome> {
        for listener in listeners {
            listener.before_job(self.job.clone()).await?;
        }
        let traversal = Traversal {
            job: &self.job,
            kernel: &self.kernel,
            slot: &self.current,
            track_current_step: true,
        };
        let navigator = Navigator::new(self.definition.id.clone(), &self.definition.elements);
        traversal.run(navigator, self.restart_on.as_deref()).await
    }

    /// Fold the traversal outcome into the job context. Returns the restart
    /// point to record when the job ends STOPPED, or the error of a step
    /// that failed the job.
    fn apply(&self, outcome: Outcome) -> Result<Option<String>> {
        debug!(job = %self.job.job_name(), outcome = ?outcome, "Traversal ended");
        let restart_on = match outcome {
            Outcome::Directive {
                batch_status,
                exit_status,
                restart_on,
            } => {
                if let Some(exit) = exit_status {
                    self.job.set_exit_status(exit);
                }
                match batch_status {
                    BatchStatus::Failed => {
                        self.job.set_batch_status(BatchStatus::Failed);
                        None
                    }
                    BatchStatus::Stopped => {
                        self.job.set_batch_status(BatchStatus::Stopped);
                        restart_on
                    }
                    // COMPLETED is settled in finalize, unless a stop got there first
                    _ => None,
                }
            }
            Outcome::ElementEnded { element, status } => {
                self.job.set_batch_status(status.batch_status);
                if let Some(failure) = status.failure {
                    return Err(failure.into_error());
                }
                if status.batch_status == BatchStatus::Stopped {
                    Some(status.restart_on.unwrap_or(element))
                } else {
                    None
                }
            }
            Outcome::StopRequested { element } => {
                self.job.set_batch_status(BatchStatus::Stopped);
                Some(element)
            }
            Outcome::Exhausted { .. } => None,
        };
        Ok(restart_on)
    }

    async fn finalize(&self, listeners: &[Arc<dyn JobListener>], restart_on: Option<String>) {
        let final_status = self.job.settle_final_status();

        for listener in listeners {
            if let Err(e) = listener.after_job(self.job.clone()).await {
                error!(job = %self.job.job_name(), error = %e, "After-job listener failed");
            }
        }

        let status = self.kernel.status();
        let instance_id = self.job.instance_id();
        let execution_id = self.job.execution_id();
        let exit_status = self.job.exit_status_or_default();

        if final_status == BatchStatus::Stopped {
            if let Err(e) = status.update_job_status_from_stop(
                instance_id,
                self.job.job_name(),
                restart_on.as_deref(),
            ) {
                error!(execution_id, error = %e, "Failed to record restart point");
            }
        }
        if let Err(e) =
            status.update_job_execution_status(instance_id, execution_id, final_status, &exit_status)
        {
            error!(execution_id, error = %e, "Failed to persist final job status");
        }

        self.kernel.services().publish(BatchEvent::JobFinished {
            job: self.job.job_name().to_string(),
            execution_id,
            batch_status: final_status,
            exit_status: exit_status.clone(),
        });
        info!(
            job = %self.job.job_name(),
            execution_id,
            batch_status = %final_status,
            exit_status = %exit_status,
            "Job finished"
        );
    }

    /// Cooperative stop. Only STARTING and STARTED jobs react; any further
    /// call is a no-op.
    pub async fn stop(&self) -> Result<()> {
        if !self.job.request_stop() {
            debug!(
                execution_id = self.job.execution_id(),
                batch_status = %self.job.batch_status(),
                "Stop ignored"
            );
            return Ok(());
        }
        info!(
            job = %self.job.job_name(),
            execution_id = self.job.execution_id(),
            "Stopping job"
        );
        if let Err(e) = self.kernel.status().update_job_batch_status(
            self.job.instance_id(),
            self.job.execution_id(),
            BatchStatus::Stopping,
        ) {
            warn!(execution_id = self.job.execution_id(), error = %e, "STOPPING not persisted");
        }
        self.current.forward_stop().await
    }
}
