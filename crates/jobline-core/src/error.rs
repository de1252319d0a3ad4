use thiserror::Error;

use crate::status::BatchStatus;

#[derive(Debug, Error)]
pub enum BatchError {
    // Graph / navigation errors
    #[error("Illegal transition: {0}")]
    IllegalTransition(String),

    // Operator errors
    #[error("No such job execution: {0}")]
    NoSuchJobExecution(u64),

    #[error("No such job instance: {0}")]
    NoSuchJobInstance(String),

    #[error("Job restart rejected for execution {execution_id}: {reason}")]
    JobRestart { execution_id: u64, reason: String },

    #[error("Job execution {0} is still running")]
    JobExecutionIsRunning(u64),

    #[error("Job execution {0} is not running")]
    JobExecutionNotRunning(u64),

    #[error("Illegal batch status change for execution {execution_id}: {from} -> {to}")]
    IllegalStatusChange {
        execution_id: u64,
        from: BatchStatus,
        to: BatchStatus,
    },

    // Artifact errors
    #[error("Artifact not found: {kind} '{reference}'")]
    ArtifactNotFound { kind: String, reference: String },

    #[error("Artifact failed: {reference}: {message}")]
    ArtifactFailed { reference: String, message: String },

    // Step errors
    #[error("Step failed: {step}: {message}")]
    StepFailed { step: String, message: String },

    #[error("Step {step} exceeded its start limit ({limit})")]
    StartLimitExceeded { step: String, limit: u32 },

    // Split errors
    #[error("Split {split} is inconsistent: {message}")]
    SplitInconsistency { split: String, message: String },

    #[error("Split {split} lost a branch before all {expected} completed (got {received})")]
    SplitBranchLost {
        split: String,
        expected: usize,
        received: usize,
    },

    #[error("Failed to stop job execution {execution_id}: {message}")]
    StopFailed { execution_id: u64, message: String },

    // Wrapped failure raised by the job controller after marking the job FAILED
    #[error("Job {job} (execution {execution_id}) failed: {source}")]
    JobFailed {
        job: String,
        execution_id: u64,
        #[source]
        source: Box<BatchError>,
    },

    // Storage errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BatchError {
    /// Shorthand for an artifact reporting a failure.
    pub fn artifact(reference: impl Into<String>, message: impl Into<String>) -> Self {
        BatchError::ArtifactFailed {
            reference: reference.into(),
            message: message.into(),
        }
    }

    pub fn illegal_transition(message: impl Into<String>) -> Self {
        BatchError::IllegalTransition(message.into())
    }

    /// Whether this is a graph/configuration error rather than a runtime failure.
    pub fn is_configuration(&self) -> bool {
        match self {
            BatchError::IllegalTransition(_) | BatchError::Config(_) => true,
            BatchError::JobFailed { source, .. } => source.is_configuration(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, BatchError>;
