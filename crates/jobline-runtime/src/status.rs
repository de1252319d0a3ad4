use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tracing::debug;

use jobline_core::error::{BatchError, Result};
use jobline_core::records::{JobStatus, StepStatus};
use jobline_core::status::BatchStatus;
use jobline_core::traits::PersistenceService;

/// Writes job and step status through to persistence.
///
/// Job execution status changes are checked against the forward-only rule
/// and serialized, so a late STOPPING write from a stopping task can never
/// overwrite the STOPPED the execution task already recorded.
pub struct JobStatusManager {
    persistence: Arc<dyn PersistenceService>,
    write_lock: Mutex<()>,
}

impl JobStatusManager {
    pub fn new(persistence: Arc<dyn PersistenceService>) -> Self {
        Self {
            persistence,
            write_lock: Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get_or_create_job_status(&self, instance_id: u64, job_name: &str) -> Result<JobStatus> {
        match self.persistence.job_status(instance_id)? {
            Some(status) => Ok(status),
            None => self.persistence.create_job_status(instance_id, job_name),
        }
    }

    /// Record a batch status change for an execution and its instance.
    pub fn update_job_batch_status(
        &self,
        instance_id: u64,
        execution_id: u64,
        status: BatchStatus,
    ) -> Result<()> {
        let _guard = self.lock();
        self.write_batch_status(instance_id, execution_id, status, None)
    }

    /// Record the final batch and exit status of an execution.
    pub fn update_job_execution_status(
        &self,
        instance_id: u64,
        execution_id: u64,
        status: BatchStatus,
        exit_status: &str,
    ) -> Result<()> {
        let _guard = self.lock();
        self.write_batch_status(instance_id, execution_id, status, Some(exit_status))
    }

    fn write_batch_status(
        &self,
        instance_id: u64,
        execution_id: u64,
        status: BatchStatus,
        exit_status: Option<&str>,
    ) -> Result<()> {
        let execution = self.persistence.job_execution(execution_id)?;
        if !execution.batch_status.can_transition_to(status) {
            return Err(BatchError::IllegalStatusChange {
                execution_id,
                from: execution.batch_status,
                to: status,
            });
        }

        let now = Utc::now();
        if execution.batch_status != status {
            self.persistence
                .update_batch_status(execution_id, status, now)?;
        }
        if let Some(exit) = exit_status {
            self.persistence.update_exit_status(execution_id, exit, now)?;
        }

        let mut job_status = self.get_or_create_job_status(instance_id, &execution.job_name)?;
        job_status.batch_status = status;
        job_status.latest_execution_id = Some(execution_id);
        if let Some(exit) = exit_status {
            job_status.exit_status = Some(exit.to_string());
        }
        self.persistence.update_job_status(&job_status)?;

        debug!(
            job = %execution.job_name,
            execution_id,
            from = %execution.batch_status,
            to = %status,
            "Job status persisted"
        );
        Ok(())
    }

    /// Remember which top-level element is executing.
    pub fn update_job_current_step(&self, instance_id: u64, job_name: &str, step: &str) -> Result<()> {
        let _guard = self.lock();
        let mut status = self.get_or_create_job_status(instance_id, job_name)?;
        status.current_step = Some(step.to_string());
        self.persistence.update_job_status(&status)
    }

    /// Record where a restart of this instance resumes.
    pub fn update_job_status_from_stop(
        &self,
        instance_id: u64,
        job_name: &str,
        restart_on: Option<&str>,
    ) -> Result<()> {
        let _guard = self.lock();
        let mut status = self.get_or_create_job_status(instance_id, job_name)?;
        status.restart_on = restart_on.map(String::from);
        self.persistence.update_job_status(&status)
    }

    /// Point the instance at a fresh execution and hand back the pending
    /// restart point, which is consumed by this call.
    pub fn update_job_status_with_new_execution(
        &self,
        instance_id: u64,
        job_name: &str,
        execution_id: u64,
    ) -> Result<Option<String>> {
        let _guard = self.lock();
        let mut status = self.get_or_create_job_status(instance_id, job_name)?;
        let restart_on = status.restart_on.take();
        status.latest_execution_id = Some(execution_id);
        status.batch_status = BatchStatus::Starting;
        status.exit_status = None;
        status.current_step = None;
        self.persistence.update_job_status(&status)?;
        Ok(restart_on)
    }

    pub fn get_step_status(&self, instance_id: u64, step_name: &str) -> Result<Option<StepStatus>> {
        self.persistence.step_status(instance_id, step_name)
    }

    /// Step status for a new attempt: created on the first start, otherwise
    /// carried forward with the start count bumped.
    pub fn begin_step_attempt(
        &self,
        instance_id: u64,
        step_name: &str,
        step_execution_id: u64,
        previous: Option<StepStatus>,
    ) -> Result<StepStatus> {
        match previous {
            None => self
                .persistence
                .create_step_status(instance_id, step_name, step_execution_id),
            Some(mut status) => {
                status.increment_start_count();
                status.step_execution_id = step_execution_id;
                status.batch_status = BatchStatus::Starting;
                status.exit_status = None;
                self.persistence.update_step_status(&status)?;
                Ok(status)
            }
        }
    }

    pub fn update_step_status(&self, status: &StepStatus) -> Result<()> {
        self.persistence.update_step_status(status)
    }
}
