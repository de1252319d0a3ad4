use std::sync::Arc;

use tracing::{debug, info, warn};

use jobline_core::context::JobContext;
use jobline_core::error::Result;
use jobline_core::event::BatchEvent;
use jobline_core::status::BatchStatus;

use super::{Controller, CurrentController, ElementStatus};
use crate::kernel::BatchKernel;
use crate::navigator::{Navigator, Transition};

/// How a traversal of one scope ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// An end/fail/stop directive was reached, here or inside an element.
    Directive {
        batch_status: BatchStatus,
        exit_status: Option<String>,
        restart_on: Option<String>,
    },
    /// An element ended FAILED or STOPPED without a directive.
    ElementEnded { element: String, status: ElementStatus },
    /// The job was STOPPING when `element` was about to run or had just run.
    StopRequested { element: String },
    /// No transition left after the last element.
    Exhausted { exit_status: String },
}

/// The element loop shared by job and flow controllers.
pub(crate) struct Traversal<'a> {
    pub job: &'a Arc<JobContext>,
    pub kernel: &'a Arc<BatchKernel>,
    pub slot: &'a CurrentController,
    /// Record each element as the instance's current step (job level only).
    pub track_current_step: bool,
}

impl Traversal<'_> {
    pub async fn run(&self, mut navigator: Navigator, restart_on: Option<&str>) -> Result<Outcome> {
        let mut current = navigator.first_element(restart_on)?;
        let mut previous: Option<Arc<Controller>> = None;

        loop {
            let element_id = current.id().to_string();
            if self.job.is_stopping() {
                return Ok(Outcome::StopRequested {
                    element: element_id,
                });
            }

            if self.track_current_step {
                if let Err(e) = self.kernel.status().update_job_current_step(
                    self.job.instance_id(),
                    self.job.job_name(),
                    &element_id,
                ) {
                    warn!(element = %element_id, error = %e, "Failed to record current step");
                }
            }

            let predecessor = match (&previous, current.is_decision()) {
                (Some(prev), true) => prev.last_step_executions()?,
                _ => vec![],
            };

            let controller = Arc::new(Controller::for_element(&current, self.job, self.kernel));
            debug!(
                scope = %navigator.scope(),
                element = %element_id,
                kind = current.kind(),
                "Dispatching element"
            );
            let status = {
                let _guard = self.slot.enter(controller.clone());
                // A stop landing between the check above and publishing the
                // controller would otherwise reach neither.
                if self.job.is_stopping() {
                    return Ok(Outcome::StopRequested {
                        element: element_id,
                    });
                }
                controller.execute(predecessor).await?
            };

            debug!(
                element = %element_id,
                batch_status = %status.batch_status,
                exit_status = %status.exit_status,
                "Element finished"
            );

            if status.terminal {
                return Ok(Outcome::Directive {
                    batch_status: status.batch_status,
                    exit_status: Some(status.exit_status),
                    restart_on: status.restart_on,
                });
            }
            if matches!(status.batch_status, BatchStatus::Failed | BatchStatus::Stopped) {
                return Ok(Outcome::ElementEnded {
                    element: element_id,
                    status,
                });
            }
            if self.job.is_stopping() {
                return Ok(Outcome::StopRequested {
                    element: element_id,
                });
            }

            match navigator.next_transition(&current, &status.exit_status)? {
                None => {
                    return Ok(Outcome::Exhausted {
                        exit_status: status.exit_status,
                    })
                }
                Some(Transition::Next(next)) => {
                    self.kernel.services().publish(BatchEvent::Transition {
                        job: self.job.job_name().to_string(),
                        execution_id: self.job.execution_id(),
                        from: element_id,
                        exit_status: status.exit_status,
                        to: next.id().to_string(),
                    });
                    previous = Some(controller);
                    current = next;
                }
                Some(Transition::End { exit_status }) => {
                    return Ok(Outcome::Directive {
                        batch_status: BatchStatus::Completed,
                        exit_status,
                        restart_on: None,
                    })
                }
                Some(Transition::Fail { exit_status }) => {
                    info!(element = %element_id, "Fail directive reached");
                    return Ok(Outcome::Directive {
                        batch_status: BatchStatus::Failed,
                        exit_status,
                        restart_on: None,
                    });
                }
                Some(Transition::Stop {
                    exit_status,
                    restart,
                }) => {
                    info!(element = %element_id, restart_on = ?restart, "Stop directive reached");
                    return Ok(Outcome::Directive {
                        batch_status: BatchStatus::Stopped,
                        exit_status,
                        restart_on: restart,
                    });
                }
            }
        }
    }
}
