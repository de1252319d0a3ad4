use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use jobline_core::event::BatchEvent;
use jobline_core::records::JobExecution;

/// The execution a run log follows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunTarget {
    pub job_name: String,
    pub instance_id: u64,
    pub execution_id: u64,
}

impl RunTarget {
    pub fn new(job_name: impl Into<String>, instance_id: u64, execution_id: u64) -> Self {
        Self {
            job_name: job_name.into(),
            instance_id,
            execution_id,
        }
    }

    pub fn of(execution: &JobExecution) -> Self {
        Self::new(
            execution.job_name.clone(),
            execution.instance_id,
            execution.execution_id,
        )
    }

    fn is_own(&self, event: &BatchEvent) -> bool {
        event.job() == self.job_name && event.execution_id() == self.execution_id
    }

    /// Split branch jobs are named `{job}:{instance}:{split}:{flow}`, nested
    /// branches extending their parent's name.
    fn is_branch(&self, event: &BatchEvent) -> bool {
        event
            .job()
            .strip_prefix(self.job_name.as_str())
            .and_then(|rest| rest.strip_prefix(':'))
            .and_then(|rest| rest.strip_prefix(self.instance_id.to_string().as_str()))
            .is_some_and(|rest| rest.starts_with(':'))
    }
}

/// JSONL run logger.
///
/// Consumes engine events for one job execution (and its split branches)
/// and writes one JSON object per line. Append-only, so a crash leaves
/// every line written so far intact.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single log entry written to the JSONL file.
#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    #[serde(flatten)]
    event: BatchEvent,
}

impl RunLogger {
    /// `log_dir` is the base directory; logs are written to
    /// `{log_dir}/{job_name}/{execution_id}.jsonl`.
    /// `level` controls verbosity: 1=job, 2=per-step, 3=transitions, splits and branches.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Run the logger as a background task.
    ///
    /// Takes a receiver subscribed before the job started, so no event is
    /// missed. Writes until cancellation or until the execution finishes.
    pub async fn run(
        self,
        mut rx: broadcast::Receiver<BatchEvent>,
        target: RunTarget,
        cancel: CancellationToken,
    ) {
        let execution_id = target.execution_id;
        let job_dir = self.log_dir.join(&target.job_name);
        if let Err(e) = tokio::fs::create_dir_all(&job_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let log_path = job_dir.join(format!("{}.jsonl", execution_id));
        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");
        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            let finished = matches!(&event, BatchEvent::JobFinished { .. })
                                && target.is_own(&event);
                            if let Some(entry) = self.event_to_entry(&target, event) {
                                if let Ok(json) = serde_json::to_string(&entry) {
                                    let line = format!("{}\n", json);
                                    if let Err(e) = writer.write_all(line.as_bytes()).await {
                                        error!(error = %e, "Failed to write log entry");
                                        break;
                                    }
                                    if let Err(e) = writer.flush().await {
                                        error!(error = %e, "Failed to flush log");
                                    }
                                }
                            }
                            if finished {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }

    /// Convert an event to a log entry (None if it belongs to another
    /// execution or is filtered by level).
    fn event_to_entry(&self, target: &RunTarget, event: BatchEvent) -> Option<LogEntry> {
        let own = target.is_own(&event);
        if !own && !target.is_branch(&event) {
            return None;
        }

        let required = match &event {
            BatchEvent::JobStarted { .. } | BatchEvent::JobFinished { .. } if own => 1,
            BatchEvent::StepStarted { .. } | BatchEvent::StepFinished { .. } => 2,
            _ => 3,
        };
        if self.level < required {
            return None;
        }

        Some(LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            event,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobline_core::event::EventBus;
    use jobline_core::status::BatchStatus;

    fn step_started(job: &str) -> BatchEvent {
        step_started_in(job, 1)
    }

    fn step_started_in(job: &str, execution_id: u64) -> BatchEvent {
        BatchEvent::StepStarted {
            job: job.into(),
            execution_id,
            step: "load".into(),
            step_execution_id: 1,
        }
    }

    fn nightly(execution_id: u64) -> RunTarget {
        RunTarget::new("nightly", 1, execution_id)
    }

    #[test]
    fn test_jsonl_entry_format() {
        let logger = RunLogger::new(PathBuf::from("/tmp"), 1);
        let entry = logger
            .event_to_entry(
                &nightly(4),
                BatchEvent::JobStarted {
                    job: "nightly".into(),
                    execution_id: 4,
                },
            )
            .unwrap();
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"event\":\"job_started\""));
        assert!(json.contains("\"execution_id\":4"));
    }

    #[test]
    fn test_event_level_filtering() {
        let logger = RunLogger::new(PathBuf::from("/tmp"), 1);
        assert!(logger.event_to_entry(&nightly(1), step_started("nightly")).is_none());

        let logger2 = RunLogger::new(PathBuf::from("/tmp"), 2);
        assert!(logger2.event_to_entry(&nightly(1), step_started("nightly")).is_some());

        let transition = BatchEvent::Transition {
            job: "nightly".into(),
            execution_id: 1,
            from: "load".into(),
            exit_status: "COMPLETED".into(),
            to: "report".into(),
        };
        assert!(logger2.event_to_entry(&nightly(1), transition.clone()).is_none());
        let logger3 = RunLogger::new(PathBuf::from("/tmp"), 3);
        assert!(logger3.event_to_entry(&nightly(1), transition).is_some());
    }

    #[test]
    fn test_branch_events_included_other_jobs_excluded() {
        let logger = RunLogger::new(PathBuf::from("/tmp"), 2);
        assert!(logger
            .event_to_entry(&nightly(1), step_started("nightly:1:fan:left"))
            .is_some());
        assert!(logger
            .event_to_entry(&nightly(1), step_started("nightly-other"))
            .is_none());
        // Branch job lifecycle only at the most verbose level
        let branch_started = BatchEvent::JobStarted {
            job: "nightly:1:fan:left".into(),
            execution_id: 2,
        };
        assert!(logger.event_to_entry(&nightly(1), branch_started).is_none());
    }

    #[test]
    fn test_other_executions_of_same_job_excluded() {
        let logger = RunLogger::new(PathBuf::from("/tmp"), 3);
        let target = RunTarget::new("nightly", 1, 4);

        assert!(logger
            .event_to_entry(&target, step_started_in("nightly", 4))
            .is_some());
        // A concurrent run of the same job under another instance
        assert!(logger
            .event_to_entry(&target, step_started_in("nightly", 7))
            .is_none());
        let other_finished = BatchEvent::JobFinished {
            job: "nightly".into(),
            execution_id: 7,
            batch_status: BatchStatus::Completed,
            exit_status: "COMPLETED".into(),
        };
        assert!(logger.event_to_entry(&target, other_finished).is_none());
        // Its split branches carry the other instance id
        assert!(logger
            .event_to_entry(&target, step_started_in("nightly:2:fan:left", 8))
            .is_none());
        assert!(logger
            .event_to_entry(&target, step_started_in("nightly:12:fan:left", 9))
            .is_none());
        assert!(logger
            .event_to_entry(&target, step_started_in("nightly:1:fan:left", 5))
            .is_some());
    }

    #[tokio::test]
    async fn test_writes_until_job_finished() {
        let dir = std::env::temp_dir().join(format!("jobline-runlog-{}", uuid::Uuid::new_v4()));
        let bus = EventBus::default();
        let rx = bus.subscribe();

        bus.publish(BatchEvent::JobStarted {
            job: "nightly".into(),
            execution_id: 9,
        });
        bus.publish(step_started_in("nightly", 9));
        // Another execution of the same job finishing first must not end the log
        bus.publish(BatchEvent::JobFinished {
            job: "nightly".into(),
            execution_id: 3,
            batch_status: BatchStatus::Failed,
            exit_status: "FAILED".into(),
        });
        bus.publish(BatchEvent::JobFinished {
            job: "nightly".into(),
            execution_id: 9,
            batch_status: BatchStatus::Completed,
            exit_status: "COMPLETED".into(),
        });

        RunLogger::new(dir.clone(), 2)
            .run(rx, RunTarget::new("nightly", 2, 9), CancellationToken::new())
            .await;

        let content = std::fs::read_to_string(dir.join("nightly").join("9.jsonl")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[2].contains("job_finished"));
        std::fs::remove_dir_all(&dir).ok();
    }
}
