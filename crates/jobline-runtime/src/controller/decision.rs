use std::sync::Arc;

use tracing::info;

use jobline_core::context::JobContext;
use jobline_core::error::Result;
use jobline_core::graph::Decision;
use jobline_core::records::StepExecution;
use jobline_core::status::BatchStatus;

use super::ElementStatus;
use crate::kernel::BatchKernel;

/// Runs a decider over the preceding element's step executions.
///
/// The decided value only drives the next navigator lookup; it does not
/// become the job's exit status.
pub struct DecisionController {
    decision: Decision,
    job: Arc<JobContext>,
    kernel: Arc<BatchKernel>,
}

impl DecisionController {
    pub fn new(decision: Decision, job: Arc<JobContext>, kernel: Arc<BatchKernel>) -> Self {
        Self {
            decision,
            job,
            kernel,
        }
    }

    pub async fn execute(&self, predecessor: Vec<StepExecution>) -> Result<ElementStatus> {
        let decider = self
            .kernel
            .services()
            .artifacts
            .decider(&self.decision.decider)?;
        let inputs = predecessor.len();
        let exit_status = decider.decide(predecessor, self.job.clone()).await?;
        info!(
            decision = %self.decision.id,
            decider = %self.decision.decider,
            inputs,
            exit_status = %exit_status,
            "Decision made"
        );
        Ok(ElementStatus::new(BatchStatus::Completed, exit_status))
    }
}
