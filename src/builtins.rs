use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use jobline_core::context::{JobContext, StepContext};
use jobline_core::error::{BatchError, Result};
use jobline_core::records::StepExecution;
use jobline_core::traits::{Batchlet, Decider};
use jobline_runtime::ArtifactRegistry;

/// Registry with the built-in artifacts every job file can reference.
pub fn registry() -> ArtifactRegistry {
    let mut registry = ArtifactRegistry::new();
    registry.register_batchlet("command", || Arc::new(CommandBatchlet::new()));
    registry.register_batchlet("echo", || Arc::new(EchoBatchlet));
    registry.register_decider("exit-status", || Arc::new(ExitStatusDecider));
    registry
}

/// Runs the step's `command` property with `sh -c`.
///
/// Job parameters are exported as `JOBLINE_PARAM_<NAME>`. A non-zero exit
/// fails the step; stop kills the child.
pub struct CommandBatchlet {
    cancel: CancellationToken,
}

impl CommandBatchlet {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
        }
    }
}

impl Batchlet for CommandBatchlet {
    fn process(&self, ctx: Arc<StepContext>) -> BoxFuture<'_, Result<Option<String>>> {
        Box::pin(async move {
            let step = ctx.step_name().to_string();
            let cmd = ctx
                .property("command")
                .ok_or_else(|| BatchError::StepFailed {
                    step: step.clone(),
                    message: "missing 'command' property".into(),
                })?
                .to_string();

            let job = ctx.job();
            let mut command = tokio::process::Command::new("sh");
            command.args(["-c", cmd.as_str()]);
            command.env("JOBLINE_JOB", job.job_name());
            command.env("JOBLINE_STEP", &step);
            command.env("JOBLINE_EXECUTION_ID", job.execution_id().to_string());
            for (key, value) in job.parameters() {
                command.env(format!("JOBLINE_PARAM_{}", key.to_uppercase()), value);
            }
            command.kill_on_drop(true);

            debug!(step = %step, command = %cmd, "Spawning step command");
            let mut child = command.spawn()?;
            let finished = tokio::select! {
                status = child.wait() => Some(status?),
                _ = self.cancel.cancelled() => None,
            };
            let Some(status) = finished else {
                info!(step = %step, "Killing step command");
                if let Err(e) = child.kill().await {
                    warn!(step = %step, error = %e, "Failed to kill step command");
                }
                return Ok(None);
            };

            if !status.success() {
                return Err(BatchError::StepFailed {
                    step,
                    message: format!("command exited with {}", status),
                });
            }
            Ok(ctx.property("exit_status").map(String::from))
        })
    }

    fn stop(&self) -> BoxFuture<'_, Result<()>> {
        self.cancel.cancel();
        Box::pin(async { Ok(()) })
    }
}

/// Prints the step's `message` property; returns its `exit_status` property.
pub struct EchoBatchlet;

impl Batchlet for EchoBatchlet {
    fn process(&self, ctx: Arc<StepContext>) -> BoxFuture<'_, Result<Option<String>>> {
        Box::pin(async move {
            let message = ctx.property("message").unwrap_or(ctx.step_name());
            println!("{}", message);
            Ok(ctx.property("exit_status").map(String::from))
        })
    }

    fn stop(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Routes on the preceding step results: their shared exit status, or
/// `MIXED` when split branches disagree. With nothing before it, the job's
/// current exit status or `COMPLETED`.
pub struct ExitStatusDecider;

impl Decider for ExitStatusDecider {
    fn decide(
        &self,
        executions: Vec<StepExecution>,
        job: Arc<JobContext>,
    ) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let mut statuses = executions.iter().map(|e| {
                e.exit_status
                    .clone()
                    .unwrap_or_else(|| e.batch_status.to_string())
            });
            let Some(first) = statuses.next() else {
                return Ok(job.exit_status().unwrap_or_else(|| "COMPLETED".to_string()));
            };
            if statuses.all(|s| s == first) {
                Ok(first)
            } else {
                Ok("MIXED".to_string())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use jobline_core::status::BatchStatus;

    fn step_ctx(properties: &[(&str, &str)]) -> Arc<StepContext> {
        let job = Arc::new(JobContext::new("cli", 1, 1));
        let props: HashMap<String, String> = properties
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Arc::new(StepContext::new(job, "step", 1, props))
    }

    fn execution(step: &str, exit: &str) -> StepExecution {
        StepExecution {
            step_execution_id: 1,
            job_execution_id: 1,
            step_name: step.into(),
            batch_status: BatchStatus::Completed,
            exit_status: Some(exit.into()),
            metrics: Default::default(),
            persistent_user_data: None,
            start_time: None,
            end_time: None,
        }
    }

    #[tokio::test]
    async fn test_command_exit_status_property() {
        let ctx = step_ctx(&[("command", "true"), ("exit_status", "SHIPPED")]);
        let exit = CommandBatchlet::new().process(ctx).await.unwrap();
        assert_eq!(exit.as_deref(), Some("SHIPPED"));
    }

    #[tokio::test]
    async fn test_command_non_zero_fails() {
        let ctx = step_ctx(&[("command", "exit 4")]);
        let err = CommandBatchlet::new().process(ctx).await.unwrap_err();
        assert!(matches!(err, BatchError::StepFailed { .. }));
    }

    #[tokio::test]
    async fn test_command_stop_kills_child() {
        let batchlet = Arc::new(CommandBatchlet::new());
        let ctx = step_ctx(&[("command", "sleep 30")]);
        let running = {
            let batchlet = batchlet.clone();
            tokio::spawn(async move { batchlet.process(ctx).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        batchlet.stop().await.unwrap();

        let exit = tokio::time::timeout(std::time::Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(exit.is_none());
    }

    #[tokio::test]
    async fn test_exit_status_decider() {
        let job = Arc::new(JobContext::new("cli", 1, 1));
        let decider = ExitStatusDecider;

        let same = vec![execution("a", "OK"), execution("b", "OK")];
        assert_eq!(decider.decide(same, job.clone()).await.unwrap(), "OK");

        let mixed = vec![execution("a", "OK"), execution("b", "LATE")];
        assert_eq!(decider.decide(mixed, job.clone()).await.unwrap(), "MIXED");

        assert_eq!(decider.decide(vec![], job).await.unwrap(), "COMPLETED");
    }
}
