use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BatchError;

/// Engine-controlled lifecycle state of a job or step execution.
///
/// The normal path is STARTING → STARTED → {COMPLETED | FAILED}, with the
/// single stop sequence STARTING|STARTED → STOPPING → STOPPED. ABANDONED is
/// only ever set out of band by an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Starting,
    Started,
    Stopping,
    Stopped,
    Failed,
    Completed,
    Abandoned,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Starting => "STARTING",
            BatchStatus::Started => "STARTED",
            BatchStatus::Stopping => "STOPPING",
            BatchStatus::Stopped => "STOPPED",
            BatchStatus::Failed => "FAILED",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Abandoned => "ABANDONED",
        }
    }

    /// COMPLETED, STOPPED, FAILED and ABANDONED never change again during a run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed
                | BatchStatus::Stopped
                | BatchStatus::Failed
                | BatchStatus::Abandoned
        )
    }

    /// STARTING, STARTED and STOPPING: an execution thread still owns the record.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            BatchStatus::Starting | BatchStatus::Started | BatchStatus::Stopping
        )
    }

    /// Whether a stop request is honored in this state.
    pub fn is_stoppable(&self) -> bool {
        matches!(self, BatchStatus::Starting | BatchStatus::Started)
    }

    /// Forward-only transition rule. Re-setting the current status is allowed.
    pub fn can_transition_to(&self, next: BatchStatus) -> bool {
        use BatchStatus::*;
        if *self == next {
            return true;
        }
        match self {
            Starting => matches!(next, Started | Stopping | Stopped | Failed),
            Started => matches!(next, Stopping | Stopped | Completed | Failed),
            Stopping => matches!(next, Stopped | Failed),
            Completed | Stopped | Failed => next == Abandoned,
            Abandoned => false,
        }
    }

    /// Combine branch outcomes with FAILED > STOPPED > COMPLETED precedence.
    pub fn aggregate<I>(statuses: I) -> BatchStatus
    where
        I: IntoIterator<Item = BatchStatus>,
    {
        let mut stopped = false;
        for status in statuses {
            match status {
                BatchStatus::Failed => return BatchStatus::Failed,
                BatchStatus::Stopped => stopped = true,
                _ => {}
            }
        }
        if stopped {
            BatchStatus::Stopped
        } else {
            BatchStatus::Completed
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = BatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STARTING" => Ok(BatchStatus::Starting),
            "STARTED" => Ok(BatchStatus::Started),
            "STOPPING" => Ok(BatchStatus::Stopping),
            "STOPPED" => Ok(BatchStatus::Stopped),
            "FAILED" => Ok(BatchStatus::Failed),
            "COMPLETED" => Ok(BatchStatus::Completed),
            "ABANDONED" => Ok(BatchStatus::Abandoned),
            other => Err(BatchError::Persistence(format!(
                "unknown batch status '{}'",
                other
            ))),
        }
    }
}

/// Exit status reported for an element: the explicit one if set, else the batch status name.
pub fn effective_exit_status(exit_status: Option<&str>, batch_status: BatchStatus) -> String {
    match exit_status {
        Some(s) => s.to_string(),
        None => batch_status.as_str().to_string(),
    }
}
