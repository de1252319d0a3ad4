mod decision;
mod flow;
mod job;
mod split;
mod step;
mod stoppable;
mod traversal;

use std::sync::Arc;

use futures::future::BoxFuture;

use jobline_core::context::JobContext;
use jobline_core::error::{BatchError, Result};
use jobline_core::graph::ExecutionElement;
use jobline_core::records::StepExecution;
use jobline_core::status::BatchStatus;

use crate::kernel::BatchKernel;

pub use decision::DecisionController;
pub use flow::FlowController;
pub use job::JobController;
pub use split::SplitController;
pub use step::StepController;
pub use stoppable::{CurrentController, SlotGuard};

/// What an element reports back to the traversal that ran it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementStatus {
    pub batch_status: BatchStatus,
    pub exit_status: String,
    /// Restart point requested by a stop directive inside the element.
    pub restart_on: Option<String>,
    /// The element ended through an end/fail/stop directive, which also
    /// ends the enclosing traversal.
    pub terminal: bool,
    /// Set when a step's own logic failed; the job re-raises it.
    pub failure: Option<StepFailure>,
}

impl ElementStatus {
    pub fn new(batch_status: BatchStatus, exit_status: impl Into<String>) -> Self {
        Self {
            batch_status,
            exit_status: exit_status.into(),
            restart_on: None,
            terminal: false,
            failure: None,
        }
    }

    pub fn with_failure(mut self, failure: Option<StepFailure>) -> Self {
        self.failure = failure;
        self
    }

    pub fn from_directive(
        batch_status: BatchStatus,
        exit_status: impl Into<String>,
        restart_on: Option<String>,
    ) -> Self {
        Self {
            batch_status,
            exit_status: exit_status.into(),
            restart_on,
            terminal: true,
            failure: None,
        }
    }
}

/// The error a step ended FAILED with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    pub step: String,
    pub message: String,
}

impl StepFailure {
    pub fn new(step: impl Into<String>, error: &BatchError) -> Self {
        let message = match error {
            BatchError::StepFailed { message, .. } => message.clone(),
            other => other.to_string(),
        };
        Self {
            step: step.into(),
            message,
        }
    }

    pub fn into_error(self) -> BatchError {
        BatchError::StepFailed {
            step: self.step,
            message: self.message,
        }
    }
}

/// One controller per element kind; a traversal builds a fresh one for
/// every element it dispatches.
pub enum Controller {
    Step(StepController),
    Flow(FlowController),
    Split(SplitController),
    Decision(DecisionController),
}

impl Controller {
    pub fn for_element(
        element: &ExecutionElement,
        job: &Arc<JobContext>,
        kernel: &Arc<BatchKernel>,
    ) -> Self {
        match element {
            ExecutionElement::Step(step) => {
                Controller::Step(StepController::new(step.clone(), job.clone(), kernel.clone()))
            }
            ExecutionElement::Flow(flow) => {
                Controller::Flow(FlowController::new(flow.clone(), job.clone(), kernel.clone()))
            }
            ExecutionElement::Split(split) => {
                Controller::Split(SplitController::new(split.clone(), job.clone(), kernel.clone()))
            }
            ExecutionElement::Decision(decision) => Controller::Decision(DecisionController::new(
                decision.clone(),
                job.clone(),
                kernel.clone(),
            )),
        }
    }

    /// Run the element. `predecessor` carries the step executions of the
    /// element that ran just before; only decisions look at it.
    pub fn execute(&self, predecessor: Vec<StepExecution>) -> BoxFuture<'_, Result<ElementStatus>> {
        match self {
            Controller::Step(c) => Box::pin(c.execute()),
            Controller::Flow(c) => Box::pin(c.execute()),
            Controller::Split(c) => Box::pin(c.execute()),
            Controller::Decision(c) => Box::pin(c.execute(predecessor)),
        }
    }

    pub fn stop(&self) -> BoxFuture<'_, Result<()>> {
        match self {
            Controller::Step(c) => Box::pin(c.stop()),
            Controller::Flow(c) => Box::pin(c.stop()),
            Controller::Split(c) => Box::pin(c.stop()),
            Controller::Decision(_) => Box::pin(async { Ok(()) }),
        }
    }

    /// The step results a decision following this element receives.
    pub fn last_step_executions(&self) -> Result<Vec<StepExecution>> {
        match self {
            Controller::Step(c) => Ok(c.last_execution().into_iter().collect()),
            Controller::Flow(c) => c.last_step_executions(),
            Controller::Split(c) => c.last_step_executions(),
            Controller::Decision(_) => Ok(vec![]),
        }
    }
}
