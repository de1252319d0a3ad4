use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{error, warn};

use jobline_core::context::JobContext;
use jobline_core::status::BatchStatus;

use crate::controller::JobController;
use crate::kernel::BatchKernel;

/// Completion signal a work unit posts for whoever is joining on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletedWork {
    pub execution_id: u64,
    pub batch_status: BatchStatus,
}

/// One job execution paired with its controller, run as its own task.
///
/// `run` consumes the unit, so the completion callbacks fire exactly once.
pub struct WorkUnit {
    controller: Arc<JobController>,
    kernel: Arc<BatchKernel>,
    completion: Option<mpsc::UnboundedSender<CompletedWork>>,
}

impl WorkUnit {
    pub(crate) fn new(
        controller: Arc<JobController>,
        kernel: Arc<BatchKernel>,
        completion: Option<mpsc::UnboundedSender<CompletedWork>>,
    ) -> Self {
        Self {
            controller,
            kernel,
            completion,
        }
    }

    pub fn execution_id(&self) -> u64 {
        self.controller.execution_id()
    }

    pub fn job(&self) -> &Arc<JobContext> {
        self.controller.job()
    }

    pub async fn run(self) {
        let execution_id = self.execution_id();
        let job = self.controller.job().clone();

        match AssertUnwindSafe(self.controller.execute()).catch_unwind().await {
            Ok(Ok(())) => {}
            // Already logged, and recorded as FAILED, by the controller
            Ok(Err(_)) => {}
            Err(_) => {
                error!(job = %job.job_name(), execution_id, "Job execution panicked");
                job.set_batch_status(BatchStatus::Failed);
                job.default_exit_status();
                if let Err(e) = self.kernel.status().update_job_execution_status(
                    job.instance_id(),
                    execution_id,
                    BatchStatus::Failed,
                    &job.exit_status_or_default(),
                ) {
                    error!(execution_id, error = %e, "Failed to persist status after panic");
                }
            }
        }

        let batch_status = job.batch_status();
        self.kernel.job_execution_done(execution_id);
        if let Some(tx) = self.completion {
            if tx
                .send(CompletedWork {
                    execution_id,
                    batch_status,
                })
                .is_err()
            {
                warn!(execution_id, "Nobody is waiting for this work unit any more");
            }
        }
    }
}
