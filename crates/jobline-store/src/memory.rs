use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use jobline_core::error::{BatchError, Result};
use jobline_core::records::{
    JobExecution, JobInstance, JobStatus, Metrics, StepExecution, StepStatus,
};
use jobline_core::status::BatchStatus;
use jobline_core::traits::PersistenceService;

#[derive(Default)]
struct MemoryState {
    next_instance_id: u64,
    next_execution_id: u64,
    next_step_execution_id: u64,
    instances: BTreeMap<u64, JobInstance>,
    executions: BTreeMap<u64, JobExecution>,
    step_executions: BTreeMap<u64, StepExecution>,
    job_status: HashMap<u64, JobStatus>,
    step_status: HashMap<(u64, String), StepStatus>,
}

impl MemoryState {
    fn next_id(counter: &mut u64) -> u64 {
        *counter += 1;
        *counter
    }
}

/// Process-local persistence. Ids are allocated sequentially starting at 1.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|e| BatchError::Persistence(e.to_string()))
    }
}

impl PersistenceService for MemoryStore {
    fn create_job_instance(&self, job_name: &str, definition_json: &str) -> Result<JobInstance> {
        let mut state = self.lock()?;
        let instance_id = MemoryState::next_id(&mut state.next_instance_id);
        let instance = JobInstance {
            instance_id,
            job_name: job_name.to_string(),
            definition_json: definition_json.to_string(),
            created_at: Utc::now(),
        };
        state.instances.insert(instance_id, instance.clone());
        Ok(instance)
    }

    fn job_instance(&self, instance_id: u64) -> Result<JobInstance> {
        self.lock()?
            .instances
            .get(&instance_id)
            .cloned()
            .ok_or_else(|| BatchError::NoSuchJobInstance(instance_id.to_string()))
    }

    fn job_instance_count(&self, job_name: &str) -> Result<usize> {
        Ok(self
            .lock()?
            .instances
            .values()
            .filter(|i| i.job_name == job_name)
            .count())
    }

    fn job_instances(&self, job_name: &str) -> Result<Vec<JobInstance>> {
        Ok(self
            .lock()?
            .instances
            .values()
            .filter(|i| i.job_name == job_name)
            .cloned()
            .collect())
    }

    fn job_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .lock()?
            .instances
            .values()
            .map(|i| i.job_name.clone())
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn create_job_execution(
        &self,
        instance_id: u64,
        parameters: &HashMap<String, String>,
    ) -> Result<JobExecution> {
        let mut state = self.lock()?;
        let job_name = state
            .instances
            .get(&instance_id)
            .map(|i| i.job_name.clone())
            .ok_or_else(|| BatchError::NoSuchJobInstance(instance_id.to_string()))?;
        let execution_id = MemoryState::next_id(&mut state.next_execution_id);
        let now = Utc::now();
        let execution = JobExecution {
            execution_id,
            instance_id,
            job_name,
            batch_status: BatchStatus::Starting,
            exit_status: None,
            create_time: now,
            start_time: None,
            end_time: None,
            last_updated: now,
            parameters: parameters.clone(),
        };
        state.executions.insert(execution_id, execution.clone());
        Ok(execution)
    }

    fn job_execution(&self, execution_id: u64) -> Result<JobExecution> {
        self.lock()?
            .executions
            .get(&execution_id)
            .cloned()
            .ok_or(BatchError::NoSuchJobExecution(execution_id))
    }

    fn job_executions(&self, instance_id: u64) -> Result<Vec<JobExecution>> {
        Ok(self
            .lock()?
            .executions
            .values()
            .filter(|e| e.instance_id == instance_id)
            .cloned()
            .collect())
    }

    fn update_batch_status(
        &self,
        execution_id: u64,
        status: BatchStatus,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.lock()?;
        let execution = state
            .executions
            .get_mut(&execution_id)
            .ok_or(BatchError::NoSuchJobExecution(execution_id))?;
        execution.batch_status = status;
        execution.last_updated = at;
        match status {
            BatchStatus::Started => execution.start_time = Some(at),
            BatchStatus::Completed | BatchStatus::Stopped | BatchStatus::Failed => {
                execution.end_time = Some(at)
            }
            _ => {}
        }
        Ok(())
    }

    fn update_exit_status(
        &self,
        execution_id: u64,
        exit_status: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.lock()?;
        let execution = state
            .executions
            .get_mut(&execution_id)
            .ok_or(BatchError::NoSuchJobExecution(execution_id))?;
        execution.exit_status = Some(exit_status.to_string());
        execution.last_updated = at;
        Ok(())
    }

    fn create_job_status(&self, instance_id: u64, job_name: &str) -> Result<JobStatus> {
        let status = JobStatus::new(instance_id, job_name);
        self.lock()?.job_status.insert(instance_id, status.clone());
        Ok(status)
    }

    fn job_status(&self, instance_id: u64) -> Result<Option<JobStatus>> {
        Ok(self.lock()?.job_status.get(&instance_id).cloned())
    }

    fn update_job_status(&self, status: &JobStatus) -> Result<()> {
        self.lock()?
            .job_status
            .insert(status.instance_id, status.clone());
        Ok(())
    }

    fn create_step_status(
        &self,
        instance_id: u64,
        step_name: &str,
        step_execution_id: u64,
    ) -> Result<StepStatus> {
        let status = StepStatus::new(instance_id, step_name, step_execution_id);
        self.lock()?
            .step_status
            .insert((instance_id, step_name.to_string()), status.clone());
        Ok(status)
    }

    fn step_status(&self, instance_id: u64, step_name: &str) -> Result<Option<StepStatus>> {
        Ok(self
            .lock()?
            .step_status
            .get(&(instance_id, step_name.to_string()))
            .cloned())
    }

    fn update_step_status(&self, status: &StepStatus) -> Result<()> {
        self.lock()?.step_status.insert(
            (status.instance_id, status.step_name.clone()),
            status.clone(),
        );
        Ok(())
    }

    fn create_step_execution(
        &self,
        job_execution_id: u64,
        step_name: &str,
    ) -> Result<StepExecution> {
        let mut state = self.lock()?;
        if !state.executions.contains_key(&job_execution_id) {
            return Err(BatchError::NoSuchJobExecution(job_execution_id));
        }
        let step_execution_id = MemoryState::next_id(&mut state.next_step_execution_id);
        let execution = StepExecution {
            step_execution_id,
            job_execution_id,
            step_name: step_name.to_string(),
            batch_status: BatchStatus::Starting,
            exit_status: None,
            metrics: Metrics::default(),
            persistent_user_data: None,
            start_time: None,
            end_time: None,
        };
        state
            .step_executions
            .insert(step_execution_id, execution.clone());
        Ok(execution)
    }

    fn update_step_execution(&self, execution: &StepExecution) -> Result<()> {
        let mut state = self.lock()?;
        match state.step_executions.get_mut(&execution.step_execution_id) {
            Some(existing) => {
                *existing = execution.clone();
                Ok(())
            }
            None => Err(BatchError::Persistence(format!(
                "no step execution {}",
                execution.step_execution_id
            ))),
        }
    }

    fn step_executions(&self, job_execution_id: u64) -> Result<Vec<StepExecution>> {
        Ok(self
            .lock()?
            .step_executions
            .values()
            .filter(|s| s.job_execution_id == job_execution_id)
            .cloned()
            .collect())
    }
}
