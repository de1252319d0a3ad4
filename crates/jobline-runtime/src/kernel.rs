use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use jobline_core::context::JobContext;
use jobline_core::error::{BatchError, Result};
use jobline_core::graph::JobDefinition;
use jobline_core::records::{JobExecution, JobInstance, StepExecution};
use jobline_core::status::BatchStatus;
use jobline_core::traits::JobListener;

use crate::controller::JobController;
use crate::services::ExecutionServices;
use crate::status::JobStatusManager;
use crate::work_unit::{CompletedWork, WorkUnit};

struct RunningExecution {
    controller: Arc<JobController>,
    done: watch::Sender<bool>,
}

/// Starts, restarts, stops and tracks job executions.
///
/// Every execution, top-level or split branch, is registered here from the
/// moment its work unit is built until `job_execution_done` releases it.
pub struct BatchKernel {
    services: ExecutionServices,
    status: JobStatusManager,
    running: Mutex<HashMap<u64, RunningExecution>>,
    listeners: Vec<Arc<dyn JobListener>>,
}

impl BatchKernel {
    pub fn new(services: ExecutionServices) -> Self {
        let status = JobStatusManager::new(services.persistence.clone());
        Self {
            services,
            status,
            running: Mutex::new(HashMap::new()),
            listeners: vec![],
        }
    }

    /// Job listener applied to every top-level job (not to split branches).
    pub fn with_listener(mut self, listener: Arc<dyn JobListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn services(&self) -> &ExecutionServices {
        &self.services
    }

    pub fn status(&self) -> &JobStatusManager {
        &self.status
    }

    fn running(&self) -> MutexGuard<'_, HashMap<u64, RunningExecution>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_running(&self, execution_id: u64) -> bool {
        self.running().contains_key(&execution_id)
    }

    // --- Operator surface ---

    /// Create a new instance of `definition` and start its first execution.
    pub fn start(
        self: &Arc<Self>,
        definition: JobDefinition,
        parameters: HashMap<String, String>,
    ) -> Result<u64> {
        let unit = self.build_new_work_unit(definition, parameters, None, true)?;
        let execution_id = unit.execution_id();
        self.spawn(unit);
        Ok(execution_id)
    }

    /// Start a new execution of the instance `execution_id` belongs to.
    /// Only the most recent execution of a STOPPED or FAILED instance of a
    /// restartable job can be restarted.
    pub fn restart(
        self: &Arc<Self>,
        execution_id: u64,
        parameters: HashMap<String, String>,
    ) -> Result<u64> {
        let execution = self.services.persistence.job_execution(execution_id)?;
        let instance = self.services.persistence.job_instance(execution.instance_id)?;
        let definition = JobDefinition::from_json(&instance.definition_json)?;

        let rejected = |reason: &str| BatchError::JobRestart {
            execution_id,
            reason: reason.to_string(),
        };
        if !definition.restartable {
            return Err(rejected("job is not restartable"));
        }
        let latest = self.latest_execution(instance.instance_id)?;
        if latest.execution_id != execution_id {
            return Err(rejected("not the most recent execution of its instance"));
        }
        match latest.batch_status {
            BatchStatus::Completed => return Err(rejected("instance already completed")),
            BatchStatus::Abandoned => return Err(rejected("execution was abandoned")),
            status if status.is_running() || self.is_running(execution_id) => {
                return Err(BatchError::JobExecutionIsRunning(execution_id))
            }
            _ => {}
        }

        let unit = self.build_work_unit(instance, definition, parameters, None, true)?;
        let restarted = unit.execution_id();
        info!(
            previous_execution_id = execution_id,
            execution_id = restarted,
            "Restarting job"
        );
        self.spawn(unit);
        Ok(restarted)
    }

    /// Request a cooperative stop. Terminal executions are left alone; a
    /// non-terminal execution this kernel does not own is an error.
    pub async fn stop(&self, execution_id: u64) -> Result<()> {
        let controller = self
            .running()
            .get(&execution_id)
            .map(|r| r.controller.clone());
        if let Some(controller) = controller {
            return controller
                .stop()
                .await
                .map_err(|e| BatchError::StopFailed {
                    execution_id,
                    message: e.to_string(),
                });
        }

        let execution = self.services.persistence.job_execution(execution_id)?;
        if execution.batch_status.is_terminal() {
            debug!(execution_id, batch_status = %execution.batch_status, "Stop ignored");
            Ok(())
        } else {
            Err(BatchError::JobExecutionNotRunning(execution_id))
        }
    }

    /// Mark a finished execution ABANDONED so it can never be restarted.
    pub fn abandon(&self, execution_id: u64) -> Result<()> {
        let execution = self.services.persistence.job_execution(execution_id)?;
        if self.is_running(execution_id) || execution.batch_status.is_running() {
            return Err(BatchError::JobExecutionIsRunning(execution_id));
        }
        self.status.update_job_batch_status(
            execution.instance_id,
            execution_id,
            BatchStatus::Abandoned,
        )?;
        info!(execution_id, job = %execution.job_name, "Job execution abandoned");
        Ok(())
    }

    /// Wait until the execution is released by its work unit, then return
    /// its record.
    pub async fn wait_for(&self, execution_id: u64) -> Result<JobExecution> {
        let waiter = self
            .running()
            .get(&execution_id)
            .map(|r| r.done.subscribe());
        if let Some(mut rx) = waiter {
            // A dropped sender means the execution was released as well
            let _ = rx.wait_for(|done| *done).await;
        }
        self.services.persistence.job_execution(execution_id)
    }

    /// Completion callback from a work unit; releases waiters.
    pub fn job_execution_done(&self, execution_id: u64) {
        match self.running().remove(&execution_id) {
            Some(running) => {
                running.done.send_replace(true);
                debug!(execution_id, "Job execution released");
            }
            None => warn!(execution_id, "Completion for an unknown job execution"),
        }
    }

    // --- Queries ---

    pub fn job_execution(&self, execution_id: u64) -> Result<JobExecution> {
        self.services.persistence.job_execution(execution_id)
    }

    pub fn job_executions(&self, instance_id: u64) -> Result<Vec<JobExecution>> {
        self.services.persistence.job_executions(instance_id)
    }

    pub fn job_instance(&self, execution_id: u64) -> Result<JobInstance> {
        let execution = self.services.persistence.job_execution(execution_id)?;
        self.services.persistence.job_instance(execution.instance_id)
    }

    pub fn job_instance_count(&self, job_name: &str) -> Result<usize> {
        self.services.persistence.job_instance_count(job_name)
    }

    /// Ids of the executions of `job_name` this kernel is currently running.
    pub fn running_executions(&self, job_name: &str) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .running()
            .iter()
            .filter(|(_, r)| r.controller.job().job_name() == job_name)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn step_executions(&self, execution_id: u64) -> Result<Vec<StepExecution>> {
        self.services.persistence.step_executions(execution_id)
    }

    pub fn job_names(&self) -> Result<Vec<String>> {
        self.services.persistence.job_names()
    }

    // --- Work units ---

    /// New instance and first execution of `definition`, registered but not
    /// yet spawned. Kernel-wide listeners attach only to top-level jobs.
    pub fn build_new_work_unit(
        self: &Arc<Self>,
        definition: JobDefinition,
        parameters: HashMap<String, String>,
        completion: Option<mpsc::UnboundedSender<CompletedWork>>,
        top_level: bool,
    ) -> Result<WorkUnit> {
        let instance = self
            .services
            .persistence
            .create_job_instance(&definition.id, &definition.to_json()?)?;
        debug!(job = %definition.id, instance_id = instance.instance_id, "Job instance created");
        self.build_work_unit(instance, definition, parameters, completion, top_level)
    }

    /// Next execution of the single existing instance of a generated job.
    /// Unlike an operator restart this also reruns a COMPLETED instance;
    /// its completed steps are skipped by the step controllers.
    pub fn build_restartable_work_unit(
        self: &Arc<Self>,
        job_name: &str,
        parameters: HashMap<String, String>,
        completion: Option<mpsc::UnboundedSender<CompletedWork>>,
    ) -> Result<WorkUnit> {
        let instance = self
            .services
            .persistence
            .job_instances(job_name)?
            .pop()
            .ok_or_else(|| BatchError::NoSuchJobInstance(job_name.to_string()))?;
        let latest = self.latest_execution(instance.instance_id)?;
        if latest.batch_status.is_running() || self.is_running(latest.execution_id) {
            return Err(BatchError::JobExecutionIsRunning(latest.execution_id));
        }
        let definition = JobDefinition::from_json(&instance.definition_json)?;
        self.build_work_unit(instance, definition, parameters, completion, false)
    }

    fn build_work_unit(
        self: &Arc<Self>,
        instance: JobInstance,
        definition: JobDefinition,
        parameters: HashMap<String, String>,
        completion: Option<mpsc::UnboundedSender<CompletedWork>>,
        top_level: bool,
    ) -> Result<WorkUnit> {
        let execution = self
            .services
            .persistence
            .create_job_execution(instance.instance_id, &parameters)?;
        let restart_on = self.status.update_job_status_with_new_execution(
            instance.instance_id,
            &definition.id,
            execution.execution_id,
        )?;

        let job = Arc::new(
            JobContext::new(
                definition.id.clone(),
                instance.instance_id,
                execution.execution_id,
            )
            .with_properties(definition.properties.clone())
            .with_parameters(parameters),
        );
        let listeners = if top_level {
            self.listeners.clone()
        } else {
            vec![]
        };
        let controller = Arc::new(
            JobController::new(Arc::new(definition), job, self.clone())
                .with_restart_on(restart_on)
                .with_listeners(listeners),
        );

        let (done, _) = watch::channel(false);
        self.running().insert(
            execution.execution_id,
            RunningExecution {
                controller: controller.clone(),
                done,
            },
        );
        Ok(WorkUnit::new(controller, self.clone(), completion))
    }

    /// Release a unit that will never be spawned. Its execution is recorded
    /// FAILED and anyone waiting on it is woken.
    pub fn discard_work_unit(&self, unit: WorkUnit) {
        let execution_id = unit.execution_id();
        let job = unit.job().clone();
        job.set_batch_status(BatchStatus::Failed);
        job.default_exit_status();
        if let Err(e) = self.status.update_job_execution_status(
            job.instance_id(),
            execution_id,
            BatchStatus::Failed,
            &job.exit_status_or_default(),
        ) {
            error!(execution_id, error = %e, "Failed to persist status of discarded work unit");
        }
        warn!(job = %job.job_name(), execution_id, "Work unit discarded before it ran");
        self.job_execution_done(execution_id);
    }

    /// Run the unit on the tokio worker pool.
    pub fn spawn(&self, unit: WorkUnit) {
        debug!(execution_id = unit.execution_id(), "Spawning work unit");
        tokio::spawn(unit.run());
    }

    fn latest_execution(&self, instance_id: u64) -> Result<JobExecution> {
        self.services
            .persistence
            .job_executions(instance_id)?
            .into_iter()
            .max_by_key(|e| e.execution_id)
            .ok_or_else(|| BatchError::NoSuchJobInstance(instance_id.to_string()))
    }
}
