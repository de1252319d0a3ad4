//! Fixtures shared by the jobline integration tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::sync::watch;

use jobline_core::context::{JobContext, StepContext};
use jobline_core::error::{BatchError, Result};
use jobline_core::records::StepExecution;
use jobline_core::traits::{Batchlet, Decider, JobListener, StepListener};

/// Returns a fixed exit status, or none to let the step default it.
pub struct ExitBatchlet {
    exit_status: Option<String>,
    calls: AtomicUsize,
}

impl ExitBatchlet {
    pub fn new(exit_status: impl Into<String>) -> Self {
        Self {
            exit_status: Some(exit_status.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn silent() -> Self {
        Self {
            exit_status: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Batchlet for ExitBatchlet {
    fn process(&self, ctx: Arc<StepContext>) -> BoxFuture<'_, Result<Option<String>>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ctx.update_metrics(|m| m.read_count += 1);
            Ok(self.exit_status.clone())
        })
    }

    fn stop(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Fails its first `failures` attempts, then returns `exit_status`.
/// Counts every attempt in the step's persistent user data.
pub struct FlakyBatchlet {
    failures: usize,
    exit_status: String,
    attempts: AtomicUsize,
}

impl FlakyBatchlet {
    pub fn new(failures: usize, exit_status: impl Into<String>) -> Self {
        Self {
            failures,
            exit_status: exit_status.into(),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Batchlet for FlakyBatchlet {
    fn process(&self, ctx: Arc<StepContext>) -> BoxFuture<'_, Result<Option<String>>> {
        Box::pin(async move {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let seen = ctx
                .persistent_user_data()
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            ctx.set_persistent_user_data(Some(serde_json::json!(seen + 1)));
            if attempt <= self.failures {
                return Err(BatchError::artifact(
                    ctx.step_name(),
                    format!("attempt {} failed", attempt),
                ));
            }
            Ok(Some(self.exit_status.clone()))
        })
    }

    fn stop(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Always fails, optionally after setting an exit status on the step.
pub struct FailingBatchlet {
    exit_status: Option<String>,
}

impl FailingBatchlet {
    pub fn new() -> Self {
        Self { exit_status: None }
    }

    pub fn with_exit_status(exit_status: impl Into<String>) -> Self {
        Self {
            exit_status: Some(exit_status.into()),
        }
    }
}

impl Default for FailingBatchlet {
    fn default() -> Self {
        Self::new()
    }
}

impl Batchlet for FailingBatchlet {
    fn process(&self, ctx: Arc<StepContext>) -> BoxFuture<'_, Result<Option<String>>> {
        Box::pin(async move {
            if let Some(exit) = &self.exit_status {
                ctx.set_exit_status(exit.clone());
            }
            Err(BatchError::artifact(ctx.step_name(), "scripted failure"))
        })
    }

    fn stop(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Runs until stopped. `wait_started` resolves once `process` is entered.
pub struct BlockingBatchlet {
    started: watch::Sender<bool>,
    stopped: watch::Sender<bool>,
    stop_calls: AtomicUsize,
}

impl BlockingBatchlet {
    pub fn new() -> Self {
        Self {
            started: watch::channel(false).0,
            stopped: watch::channel(false).0,
            stop_calls: AtomicUsize::new(0),
        }
    }

    pub async fn wait_started(&self) {
        let mut rx = self.started.subscribe();
        let _ = rx.wait_for(|started| *started).await;
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }
}

impl Default for BlockingBatchlet {
    fn default() -> Self {
        Self::new()
    }
}

impl Batchlet for BlockingBatchlet {
    fn process(&self, _ctx: Arc<StepContext>) -> BoxFuture<'_, Result<Option<String>>> {
        Box::pin(async move {
            let mut rx = self.stopped.subscribe();
            self.started.send_replace(true);
            let _ = rx.wait_for(|stopped| *stopped).await;
            Ok(None)
        })
    }

    fn stop(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.stop_calls.fetch_add(1, Ordering::SeqCst);
            self.stopped.send_replace(true);
            Ok(())
        })
    }
}

/// What a decider was handed: `(step name, exit status)` per execution.
pub type DecisionInput = Vec<(String, Option<String>)>;

/// Returns a fixed value and records every input it was given.
pub struct RecordingDecider {
    value: String,
    inputs: Mutex<Vec<DecisionInput>>,
}

impl RecordingDecider {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            inputs: Mutex::new(vec![]),
        }
    }

    pub fn inputs(&self) -> Vec<DecisionInput> {
        self.inputs.lock().unwrap().clone()
    }
}

impl Decider for RecordingDecider {
    fn decide(
        &self,
        executions: Vec<StepExecution>,
        _job: Arc<JobContext>,
    ) -> BoxFuture<'_, Result<String>> {
        let input: DecisionInput = executions
            .into_iter()
            .map(|e| (e.step_name, e.exit_status))
            .collect();
        self.inputs.lock().unwrap().push(input);
        let value = self.value.clone();
        Box::pin(async move { Ok(value) })
    }
}

/// Records `before:<name>` / `after:<name>:<status>` for jobs and steps.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<String>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl JobListener for RecordingListener {
    fn before_job(&self, job: Arc<JobContext>) -> BoxFuture<'_, Result<()>> {
        self.record(format!("before:{}", job.job_name()));
        Box::pin(async { Ok(()) })
    }

    fn after_job(&self, job: Arc<JobContext>) -> BoxFuture<'_, Result<()>> {
        self.record(format!("after:{}:{}", job.job_name(), job.batch_status()));
        Box::pin(async { Ok(()) })
    }
}

impl StepListener for RecordingListener {
    fn before_step(&self, step: Arc<StepContext>) -> BoxFuture<'_, Result<()>> {
        self.record(format!("before:{}", step.step_name()));
        Box::pin(async { Ok(()) })
    }

    fn after_step(&self, step: Arc<StepContext>) -> BoxFuture<'_, Result<()>> {
        self.record(format!("after:{}:{}", step.step_name(), step.batch_status()));
        Box::pin(async { Ok(()) })
    }
}

/// A job listener whose `before_job` fails.
pub struct FailingJobListener;

impl JobListener for FailingJobListener {
    fn before_job(&self, job: Arc<JobContext>) -> BoxFuture<'_, Result<()>> {
        let name = job.job_name().to_string();
        Box::pin(async move { Err(BatchError::artifact(name, "listener refused")) })
    }

    fn after_job(&self, _job: Arc<JobContext>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}
