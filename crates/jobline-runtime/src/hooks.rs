use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::warn;

use jobline_core::config::HooksConfig;
use jobline_core::context::JobContext;
use jobline_core::error::Result;
use jobline_core::traits::JobListener;

/// Execute hook commands with environment variables.
/// Fire-and-forget: errors are logged, not propagated.
pub async fn run_hooks(commands: &[String], env_vars: &[(&str, &str)]) {
    for cmd in commands {
        let mut command = tokio::process::Command::new("sh");
        command.args(["-c", cmd]);
        for (key, val) in env_vars {
            command.env(key, val);
        }
        command.stdout(std::process::Stdio::null());
        command.stderr(std::process::Stdio::null());
        match command.status().await {
            Ok(s) if !s.success() => warn!(hook = %cmd, code = s.code(), "Hook exited non-zero"),
            Err(e) => warn!(hook = %cmd, error = %e, "Hook failed to execute"),
            _ => {}
        }
    }
}

/// Runs the configured `[hooks]` shell commands around every job.
pub struct ShellHookListener {
    hooks: HooksConfig,
}

impl ShellHookListener {
    pub fn new(hooks: HooksConfig) -> Self {
        Self { hooks }
    }

    async fn fire(&self, commands: &[String], job: &JobContext) {
        if commands.is_empty() {
            return;
        }
        let execution_id = job.execution_id().to_string();
        let batch_status = job.batch_status().to_string();
        let exit_status = job.exit_status().unwrap_or_default();
        let env = [
            ("JOBLINE_JOB", job.job_name()),
            ("JOBLINE_EXECUTION_ID", execution_id.as_str()),
            ("JOBLINE_BATCH_STATUS", batch_status.as_str()),
            ("JOBLINE_EXIT_STATUS", exit_status.as_str()),
        ];
        run_hooks(commands, &env).await;
    }
}

impl JobListener for ShellHookListener {
    fn before_job(&self, job: Arc<JobContext>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.fire(&self.hooks.before_job, &job).await;
            Ok(())
        })
    }

    fn after_job(&self, job: Arc<JobContext>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.fire(&self.hooks.after_job, &job).await;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobline_core::status::BatchStatus;

    #[tokio::test]
    async fn test_after_job_hook_sees_final_status() {
        let dir = std::env::temp_dir().join(format!("jobline-hooks-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let out = dir.join("after.txt");

        let hooks = HooksConfig {
            before_job: vec![],
            after_job: vec![format!(
                "echo \"$JOBLINE_JOB $JOBLINE_EXECUTION_ID $JOBLINE_BATCH_STATUS $JOBLINE_EXIT_STATUS\" > {}",
                out.display()
            )],
        };
        let listener = ShellHookListener::new(hooks);
        let job = Arc::new(JobContext::new("nightly", 1, 7));
        job.set_batch_status(BatchStatus::Completed);
        job.set_exit_status("DONE");

        listener.after_job(job).await.unwrap();

        let written = std::fs::read_to_string(&out).unwrap();
        assert_eq!(written.trim(), "nightly 7 COMPLETED DONE");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_failing_hook_is_not_an_error() {
        let hooks = HooksConfig {
            before_job: vec!["exit 3".to_string()],
            after_job: vec![],
        };
        let listener = ShellHookListener::new(hooks);
        let job = Arc::new(JobContext::new("nightly", 1, 1));
        assert!(listener.before_job(job).await.is_ok());
    }
}
