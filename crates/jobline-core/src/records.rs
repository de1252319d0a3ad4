use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::{effective_exit_status, BatchStatus};

/// A logical job run; every restart of it is a new execution of the same instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInstance {
    pub instance_id: u64,
    pub job_name: String,
    /// Definition the instance was started with, so restarts work across processes.
    pub definition_json: String,
    pub created_at: DateTime<Utc>,
}

/// One attempt at running a job instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecution {
    pub execution_id: u64,
    pub instance_id: u64,
    pub job_name: String,
    pub batch_status: BatchStatus,
    pub exit_status: Option<String>,
    pub create_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

impl JobExecution {
    /// Exit status, defaulting to the batch status name.
    pub fn exit_status_or_default(&self) -> String {
        effective_exit_status(self.exit_status.as_deref(), self.batch_status)
    }
}

/// Step counters reported by batchlets and chunk handlers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    pub read_count: u64,
    pub write_count: u64,
    pub commit_count: u64,
    pub rollback_count: u64,
    pub read_skip_count: u64,
    pub process_skip_count: u64,
    pub write_skip_count: u64,
    pub filter_count: u64,
}

impl Metrics {
    pub fn add(&mut self, other: &Metrics) {
        self.read_count += other.read_count;
        self.write_count += other.write_count;
        self.commit_count += other.commit_count;
        self.rollback_count += other.rollback_count;
        self.read_skip_count += other.read_skip_count;
        self.process_skip_count += other.process_skip_count;
        self.write_skip_count += other.write_skip_count;
        self.filter_count += other.filter_count;
    }
}

/// One attempt at running a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub step_execution_id: u64,
    pub job_execution_id: u64,
    pub step_name: String,
    pub batch_status: BatchStatus,
    pub exit_status: Option<String>,
    #[serde(default)]
    pub metrics: Metrics,
    #[serde(default)]
    pub persistent_user_data: Option<serde_json::Value>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl StepExecution {
    /// Stand-in for a step that completed in an earlier execution and was
    /// skipped by `job_execution_id`, rebuilt from its durable status.
    pub fn from_status(status: &StepStatus, job_execution_id: u64) -> Self {
        Self {
            step_execution_id: status.step_execution_id,
            job_execution_id,
            step_name: status.step_name.clone(),
            batch_status: status.batch_status,
            exit_status: status.exit_status.clone(),
            metrics: Metrics::default(),
            persistent_user_data: status.persistent_user_data.clone(),
            start_time: None,
            end_time: None,
        }
    }

    pub fn exit_status_or_default(&self) -> String {
        effective_exit_status(self.exit_status.as_deref(), self.batch_status)
    }
}

/// Durable per-instance job status, updated at every transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub instance_id: u64,
    pub job_name: String,
    pub batch_status: BatchStatus,
    pub exit_status: Option<String>,
    pub latest_execution_id: Option<u64>,
    /// Top-level element being executed when the status was last written.
    pub current_step: Option<String>,
    /// Element a restart resumes at.
    pub restart_on: Option<String>,
}

impl JobStatus {
    pub fn new(instance_id: u64, job_name: impl Into<String>) -> Self {
        Self {
            instance_id,
            job_name: job_name.into(),
            batch_status: BatchStatus::Starting,
            exit_status: None,
            latest_execution_id: None,
            current_step: None,
            restart_on: None,
        }
    }
}

/// Durable per-instance step status; survives restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStatus {
    pub instance_id: u64,
    pub step_name: String,
    /// Most recent step execution for this step.
    pub step_execution_id: u64,
    pub batch_status: BatchStatus,
    pub exit_status: Option<String>,
    /// Number of times the step has been started, counting the current attempt.
    pub start_count: u32,
    #[serde(default)]
    pub persistent_user_data: Option<serde_json::Value>,
}

impl StepStatus {
    pub fn new(instance_id: u64, step_name: impl Into<String>, step_execution_id: u64) -> Self {
        Self {
            instance_id,
            step_name: step_name.into(),
            step_execution_id,
            batch_status: BatchStatus::Starting,
            exit_status: None,
            start_count: 1,
            persistent_user_data: None,
        }
    }

    pub fn increment_start_count(&mut self) {
        self.start_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_execution_from_status() {
        let mut status = StepStatus::new(3, "load", 11);
        status.batch_status = BatchStatus::Completed;
        status.exit_status = Some("LOADED".into());

        let execution = StepExecution::from_status(&status, 20);
        assert_eq!(execution.step_execution_id, 11);
        assert_eq!(execution.job_execution_id, 20);
        assert_eq!(execution.step_name, "load");
        assert_eq!(execution.batch_status, BatchStatus::Completed);
        assert_eq!(execution.exit_status_or_default(), "LOADED");
    }

    #[test]
    fn test_step_status_starts_at_one() {
        let mut status = StepStatus::new(1, "load", 10);
        assert_eq!(status.start_count, 1);
        status.increment_start_count();
        assert_eq!(status.start_count, 2);
    }

    #[test]
    fn test_metrics_add() {
        let mut total = Metrics {
            read_count: 3,
            commit_count: 1,
            ..Default::default()
        };
        total.add(&Metrics {
            read_count: 2,
            filter_count: 4,
            ..Default::default()
        });
        assert_eq!(total.read_count, 5);
        assert_eq!(total.commit_count, 1);
        assert_eq!(total.filter_count, 4);
    }

    #[test]
    fn test_exit_status_defaults_to_batch_status() {
        let exec = StepExecution {
            step_execution_id: 1,
            job_execution_id: 1,
            step_name: "s".into(),
            batch_status: BatchStatus::Stopped,
            exit_status: None,
            metrics: Metrics::default(),
            persistent_user_data: None,
            start_time: None,
            end_time: None,
        };
        assert_eq!(exec.exit_status_or_default(), "STOPPED");
    }
}
