use std::sync::Arc;

use tracing::debug;

use jobline_core::context::JobContext;
use jobline_core::error::Result;
use jobline_core::graph::Flow;
use jobline_core::records::StepExecution;
use jobline_core::status::{effective_exit_status, BatchStatus};

use super::traversal::{Outcome, Traversal};
use super::{CurrentController, ElementStatus};
use crate::kernel::BatchKernel;
use crate::navigator::Navigator;

/// Runs a flow's elements in its own scope and reports one status upward.
///
/// Never writes job status itself; the caller aggregates and persists.
pub struct FlowController {
    flow: Flow,
    job: Arc<JobContext>,
    kernel: Arc<BatchKernel>,
    current: CurrentController,
}

impl FlowController {
    pub fn new(flow: Flow, job: Arc<JobContext>, kernel: Arc<BatchKernel>) -> Self {
        Self {
            flow,
            job,
            kernel,
            current: CurrentController::new(),
        }
    }

    pub async fn execute(&self) -> Result<ElementStatus> {
        debug!(flow = %self.flow.id, job = %self.job.job_name(), "Flow started");
        let traversal = Traversal {
            job: &self.job,
            kernel: &self.kernel,
            slot: &self.current,
            track_current_step: false,
        };
        let navigator = Navigator::new(self.flow.id.clone(), &self.flow.elements);
        let outcome = traversal.run(navigator, None).await?;

        let status = match outcome {
            Outcome::Directive {
                batch_status,
                exit_status,
                restart_on,
            } => {
                // Without an override the job's own exit status is reported
                let exit = exit_status.unwrap_or_else(|| {
                    effective_exit_status(self.job.exit_status().as_deref(), batch_status)
                });
                ElementStatus::from_directive(batch_status, exit, restart_on)
            }
            Outcome::ElementEnded { status, .. } => status,
            Outcome::StopRequested { .. } => {
                ElementStatus::new(BatchStatus::Stopped, BatchStatus::Stopped.as_str())
            }
            Outcome::Exhausted { exit_status } => {
                ElementStatus::new(BatchStatus::Completed, exit_status)
            }
        };
        debug!(
            flow = %self.flow.id,
            batch_status = %status.batch_status,
            exit_status = %status.exit_status,
            "Flow finished"
        );
        Ok(status)
    }

    pub async fn stop(&self) -> Result<()> {
        self.current.forward_stop().await
    }

    /// The most recent execution of the flow's last declared step. When this
    /// execution skipped it as already completed, its durable status stands in.
    pub fn last_step_executions(&self) -> Result<Vec<StepExecution>> {
        let Some(last) = self.flow.last_step() else {
            return Ok(vec![]);
        };
        let persistence = &self.kernel.services().persistence;
        let execution_id = self.job.execution_id();
        let found = persistence
            .step_executions(execution_id)?
            .into_iter()
            .rev()
            .find(|e| e.step_name == last.id);
        let found = match found {
            Some(execution) => Some(execution),
            None => persistence
                .step_status(self.job.instance_id(), &last.id)?
                .filter(|status| status.batch_status == BatchStatus::Completed)
                .map(|status| StepExecution::from_status(&status, execution_id)),
        };
        Ok(found.into_iter().collect())
    }
}
