use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use jobline_core::context::JobContext;
use jobline_core::error::{BatchError, Result};
use jobline_core::event::BatchEvent;
use jobline_core::graph::{ExecutionElement, Flow, JobDefinition, Split};
use jobline_core::records::StepExecution;
use jobline_core::status::BatchStatus;

use super::ElementStatus;
use crate::kernel::BatchKernel;
use crate::work_unit::{CompletedWork, WorkUnit};

/// A branch execution started by this split.
#[derive(Debug, Clone, Copy)]
struct Branch {
    /// Index of the branch's flow within the split.
    flow: usize,
    instance_id: u64,
    execution_id: u64,
}

/// Runs every branch of a split as its own generated job, concurrently,
/// and joins on all of them before aggregating.
pub struct SplitController {
    split: Split,
    job: Arc<JobContext>,
    kernel: Arc<BatchKernel>,
    stop_requested: AtomicBool,
    branches: Mutex<Vec<Branch>>,
}

impl SplitController {
    pub fn new(split: Split, job: Arc<JobContext>, kernel: Arc<BatchKernel>) -> Self {
        Self {
            split,
            job,
            kernel,
            stop_requested: AtomicBool::new(false),
            branches: Mutex::new(Vec::new()),
        }
    }

    fn branches(&self) -> MutexGuard<'_, Vec<Branch>> {
        self.branches.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Name of the generated job running `flow` for this split.
    pub fn branch_job_name(&self, flow: &Flow) -> String {
        format!(
            "{}:{}:{}:{}",
            self.job.job_name(),
            self.job.instance_id(),
            self.split.id,
            flow.id
        )
    }

    fn branch_definition(&self, flow: &Flow) -> JobDefinition {
        JobDefinition {
            id: self.branch_job_name(flow),
            restartable: true,
            properties: self.job.properties().clone(),
            listeners: vec![],
            elements: vec![ExecutionElement::Flow(flow.clone())],
        }
    }

    /// Prior instances of the branch's generated job: none on the first
    /// run, exactly one afterwards.
    fn branch_instance_count(&self, flow: &Flow) -> Result<usize> {
        let name = self.branch_job_name(flow);
        match self.kernel.job_instance_count(&name)? {
            n @ (0 | 1) => Ok(n),
            n => Err(BatchError::SplitInconsistency {
                split: self.split.id.clone(),
                message: format!("{} prior instances of generated job '{}'", n, name),
            }),
        }
    }

    fn build_branch(
        &self,
        flow: &Flow,
        completion: mpsc::UnboundedSender<CompletedWork>,
    ) -> Result<WorkUnit> {
        let parameters = self.job.parameters().clone();
        if self.branch_instance_count(flow)? == 0 {
            self.kernel.build_new_work_unit(
                self.branch_definition(flow),
                parameters,
                Some(completion),
                false,
            )
        } else {
            self.kernel.build_restartable_work_unit(
                &self.branch_job_name(flow),
                parameters,
                Some(completion),
            )
        }
    }

    /// Build one unit per branch. Either every branch gets a unit or none
    /// keeps one: units built before a failure are discarded.
    fn build_branches(
        &self,
        completion: &mpsc::UnboundedSender<CompletedWork>,
    ) -> Result<Vec<WorkUnit>> {
        for flow in &self.split.flows {
            self.branch_instance_count(flow)?;
        }

        let mut units = Vec::with_capacity(self.split.flows.len());
        for (index, flow) in self.split.flows.iter().enumerate() {
            match self.build_branch(flow, completion.clone()) {
                Ok(unit) => {
                    self.branches().push(Branch {
                        flow: index,
                        instance_id: unit.job().instance_id(),
                        execution_id: unit.execution_id(),
                    });
                    units.push(unit);
                }
                Err(e) => {
                    warn!(
                        split = %self.split.id,
                        flow = %flow.id,
                        error = %e,
                        "Split branch could not be built"
                    );
                    self.branches().clear();
                    for unit in units {
                        self.kernel.discard_work_unit(unit);
                    }
                    return Err(e);
                }
            }
        }
        Ok(units)
    }

    pub async fn execute(&self) -> Result<ElementStatus> {
        let expected = self.split.flows.len();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let units = self.build_branches(&tx)?;
        drop(tx);

        self.kernel.services().publish(BatchEvent::SplitForked {
            job: self.job.job_name().to_string(),
            execution_id: self.job.execution_id(),
            split: self.split.id.clone(),
            branches: expected,
        });
        info!(split = %self.split.id, branches = expected, "Split forked");

        for unit in units {
            self.kernel.spawn(unit);
        }

        // Branches registered above are covered by a stop issued from here on
        if self.stop_requested.load(Ordering::SeqCst) {
            self.stop_branches().await?;
        }

        let mut statuses = Vec::with_capacity(expected);
        while statuses.len() < expected {
            match rx.recv().await {
                Some(done) => {
                    debug!(
                        split = %self.split.id,
                        branch_execution_id = done.execution_id,
                        batch_status = %done.batch_status,
                        "Split branch finished"
                    );
                    statuses.push(done.batch_status);
                }
                None => {
                    return Err(BatchError::SplitBranchLost {
                        split: self.split.id.clone(),
                        expected,
                        received: statuses.len(),
                    })
                }
            }
        }

        let batch_status = BatchStatus::aggregate(statuses);
        self.kernel.services().publish(BatchEvent::SplitJoined {
            job: self.job.job_name().to_string(),
            execution_id: self.job.execution_id(),
            split: self.split.id.clone(),
            batch_status,
        });
        info!(split = %self.split.id, batch_status = %batch_status, "Split joined");
        Ok(ElementStatus::new(batch_status, batch_status.as_str()))
    }

    pub async fn stop(&self) -> Result<()> {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.stop_branches().await
    }

    /// Stop every branch individually. Failing to stop one is fatal.
    async fn stop_branches(&self) -> Result<()> {
        let branches = self.branches().clone();
        for Branch { execution_id, .. } in branches {
            self.kernel.stop(execution_id).await.map_err(|e| BatchError::StopFailed {
                execution_id,
                message: format!("split '{}' branch: {}", self.split.id, e),
            })?;
        }
        Ok(())
    }

    /// The last step execution of every branch. A branch that skipped all
    /// its steps as already completed reports its flow's last step from the
    /// step's durable status.
    pub fn last_step_executions(&self) -> Result<Vec<StepExecution>> {
        let persistence = &self.kernel.services().persistence;
        let branches = self.branches().clone();
        let mut last = Vec::new();
        for branch in branches {
            if let Some(step) = persistence.step_executions(branch.execution_id)?.pop() {
                last.push(step);
                continue;
            }
            let Some(step) = self
                .split
                .flows
                .get(branch.flow)
                .and_then(|flow| flow.last_step())
            else {
                continue;
            };
            if let Some(status) = persistence
                .step_status(branch.instance_id, &step.id)?
                .filter(|status| status.batch_status == BatchStatus::Completed)
            {
                last.push(StepExecution::from_status(&status, branch.execution_id));
            }
        }
        Ok(last)
    }
}
