use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crate::records::Metrics;
use crate::status::{effective_exit_status, BatchStatus};

#[derive(Debug)]
struct JobState {
    batch_status: BatchStatus,
    exit_status: Option<String>,
    transient_user_data: Option<serde_json::Value>,
}

/// Runtime view of one job execution, shared between the execution task,
/// its controllers and whoever calls stop.
#[derive(Debug)]
pub struct JobContext {
    job_name: String,
    instance_id: u64,
    execution_id: u64,
    properties: HashMap<String, String>,
    parameters: HashMap<String, String>,
    state: RwLock<JobState>,
}

impl JobContext {
    pub fn new(job_name: impl Into<String>, instance_id: u64, execution_id: u64) -> Self {
        Self {
            job_name: job_name.into(),
            instance_id,
            execution_id,
            properties: HashMap::new(),
            parameters: HashMap::new(),
            state: RwLock::new(JobState {
                batch_status: BatchStatus::Starting,
                exit_status: None,
                transient_user_data: None,
            }),
        }
    }

    pub fn with_properties(mut self, properties: HashMap<String, String>) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_parameters(mut self, parameters: HashMap<String, String>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    pub fn execution_id(&self) -> u64 {
        self.execution_id
    }

    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn parameters(&self) -> &HashMap<String, String> {
        &self.parameters
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    pub fn batch_status(&self) -> BatchStatus {
        self.read().batch_status
    }

    pub fn set_batch_status(&self, status: BatchStatus) {
        self.write().batch_status = status;
    }

    pub fn exit_status(&self) -> Option<String> {
        self.read().exit_status.clone()
    }

    pub fn set_exit_status(&self, exit_status: impl Into<String>) {
        self.write().exit_status = Some(exit_status.into());
    }

    /// Exit status, or the batch status name when none was set.
    pub fn exit_status_or_default(&self) -> String {
        let state = self.read();
        effective_exit_status(state.exit_status.as_deref(), state.batch_status)
    }

    /// Fill in the exit status from the batch status if nothing set it.
    pub fn default_exit_status(&self) {
        let mut state = self.write();
        if state.exit_status.is_none() {
            state.exit_status = Some(state.batch_status.as_str().to_string());
        }
    }

    /// Resolve the final batch status and default the exit status, under
    /// one write so a concurrent `request_stop` lands either before (and
    /// ends STOPPED) or after (and is refused).
    ///
    /// FAILED stays FAILED, STOPPING or STOPPED end STOPPED, anything else
    /// ends COMPLETED.
    pub fn settle_final_status(&self) -> BatchStatus {
        let mut state = self.write();
        let settled = match state.batch_status {
            BatchStatus::Failed => BatchStatus::Failed,
            BatchStatus::Stopped | BatchStatus::Stopping => BatchStatus::Stopped,
            _ => BatchStatus::Completed,
        };
        state.batch_status = settled;
        if state.exit_status.is_none() {
            state.exit_status = Some(settled.as_str().to_string());
        }
        settled
    }

    /// Set `to` only if the current status is `from`.
    pub fn compare_and_set_status(&self, from: BatchStatus, to: BatchStatus) -> bool {
        let mut state = self.write();
        if state.batch_status == from {
            state.batch_status = to;
            true
        } else {
            false
        }
    }

    /// Move to STOPPING if the job is STARTING or STARTED.
    ///
    /// Returns false (and changes nothing) in any other state, which makes
    /// repeated stop requests no-ops.
    pub fn request_stop(&self) -> bool {
        let mut state = self.write();
        if state.batch_status.is_stoppable() {
            state.batch_status = BatchStatus::Stopping;
            true
        } else {
            false
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.batch_status() == BatchStatus::Stopping
    }

    pub fn transient_user_data(&self) -> Option<serde_json::Value> {
        self.read().transient_user_data.clone()
    }

    pub fn set_transient_user_data(&self, data: serde_json::Value) {
        self.write().transient_user_data = Some(data);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, JobState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, JobState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug)]
struct StepState {
    batch_status: BatchStatus,
    exit_status: Option<String>,
    metrics: Metrics,
    persistent_user_data: Option<serde_json::Value>,
}

/// Runtime view of one step attempt.
#[derive(Debug)]
pub struct StepContext {
    step_name: String,
    step_execution_id: u64,
    properties: HashMap<String, String>,
    job: Arc<JobContext>,
    state: Mutex<StepState>,
}

impl StepContext {
    pub fn new(
        job: Arc<JobContext>,
        step_name: impl Into<String>,
        step_execution_id: u64,
        properties: HashMap<String, String>,
    ) -> Self {
        Self {
            step_name: step_name.into(),
            step_execution_id,
            properties,
            job,
            state: Mutex::new(StepState {
                batch_status: BatchStatus::Starting,
                exit_status: None,
                metrics: Metrics::default(),
                persistent_user_data: None,
            }),
        }
    }

    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    pub fn step_execution_id(&self) -> u64 {
        self.step_execution_id
    }

    pub fn job(&self) -> &Arc<JobContext> {
        &self.job
    }

    /// Step property, falling back to the job's properties.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties
            .get(key)
            .map(String::as_str)
            .or_else(|| self.job.property(key))
    }

    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    pub fn batch_status(&self) -> BatchStatus {
        self.lock().batch_status
    }

    pub fn set_batch_status(&self, status: BatchStatus) {
        self.lock().batch_status = status;
    }

    pub fn exit_status(&self) -> Option<String> {
        self.lock().exit_status.clone()
    }

    pub fn set_exit_status(&self, exit_status: impl Into<String>) {
        self.lock().exit_status = Some(exit_status.into());
    }

    pub fn exit_status_or_default(&self) -> String {
        let state = self.lock();
        effective_exit_status(state.exit_status.as_deref(), state.batch_status)
    }

    pub fn metrics(&self) -> Metrics {
        self.lock().metrics
    }

    pub fn update_metrics(&self, f: impl FnOnce(&mut Metrics)) {
        f(&mut self.lock().metrics);
    }

    pub fn persistent_user_data(&self) -> Option<serde_json::Value> {
        self.lock().persistent_user_data.clone()
    }

    pub fn set_persistent_user_data(&self, data: Option<serde_json::Value>) {
        self.lock().persistent_user_data = data;
    }

    fn lock(&self) -> MutexGuard<'_, StepState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_stop_only_from_running_states() {
        let ctx = JobContext::new("job", 1, 1);
        assert!(ctx.request_stop());
        assert_eq!(ctx.batch_status(), BatchStatus::Stopping);
        assert!(!ctx.request_stop());

        let done = JobContext::new("job", 1, 2);
        done.set_batch_status(BatchStatus::Completed);
        assert!(!done.request_stop());
        assert_eq!(done.batch_status(), BatchStatus::Completed);
    }

    #[test]
    fn test_compare_and_set_loses_to_stop() {
        let ctx = JobContext::new("job", 1, 1);
        assert!(ctx.request_stop());
        assert!(!ctx.compare_and_set_status(BatchStatus::Starting, BatchStatus::Started));
        assert_eq!(ctx.batch_status(), BatchStatus::Stopping);
    }

    #[test]
    fn test_settle_after_stop_ends_stopped() {
        let ctx = JobContext::new("job", 1, 1);
        ctx.set_batch_status(BatchStatus::Started);
        assert!(ctx.request_stop());
        assert_eq!(ctx.settle_final_status(), BatchStatus::Stopped);
        assert_eq!(ctx.exit_status().as_deref(), Some("STOPPED"));
    }

    #[test]
    fn test_stop_after_settle_is_refused() {
        let ctx = JobContext::new("job", 1, 1);
        ctx.set_batch_status(BatchStatus::Started);
        assert_eq!(ctx.settle_final_status(), BatchStatus::Completed);
        assert!(!ctx.request_stop());
        assert_eq!(ctx.batch_status(), BatchStatus::Completed);
        assert_eq!(ctx.exit_status_or_default(), "COMPLETED");
    }

    #[test]
    fn test_settle_keeps_failure_and_custom_exit() {
        let ctx = JobContext::new("job", 1, 1);
        ctx.set_batch_status(BatchStatus::Failed);
        ctx.set_exit_status("BAD_INPUT");
        assert_eq!(ctx.settle_final_status(), BatchStatus::Failed);
        assert_eq!(ctx.exit_status().as_deref(), Some("BAD_INPUT"));
    }

    #[test]
    fn test_settle_races_with_stop() {
        for _ in 0..200 {
            let ctx = Arc::new(JobContext::new("job", 1, 1));
            ctx.set_batch_status(BatchStatus::Started);
            let stopper = {
                let ctx = ctx.clone();
                std::thread::spawn(move || ctx.request_stop())
            };
            let settled = ctx.settle_final_status();
            let stopped = stopper.join().unwrap();
            // The stop either won and was honoured, or lost and changed nothing
            if stopped {
                assert_eq!(settled, BatchStatus::Stopped);
            } else {
                assert_eq!(settled, BatchStatus::Completed);
            }
            assert_eq!(ctx.batch_status(), settled);
        }
    }

    #[test]
    fn test_default_exit_status_is_sticky() {
        let ctx = JobContext::new("job", 1, 1);
        ctx.set_batch_status(BatchStatus::Failed);
        assert_eq!(ctx.exit_status_or_default(), "FAILED");

        ctx.set_exit_status("CUSTOM");
        ctx.default_exit_status();
        assert_eq!(ctx.exit_status().as_deref(), Some("CUSTOM"));
    }

    #[test]
    fn test_step_property_falls_back_to_job() {
        let mut job_props = HashMap::new();
        job_props.insert("region".to_string(), "eu".to_string());
        job_props.insert("mode".to_string(), "full".to_string());
        let job = Arc::new(JobContext::new("job", 1, 1).with_properties(job_props));

        let mut step_props = HashMap::new();
        step_props.insert("mode".to_string(), "delta".to_string());
        let step = StepContext::new(job, "load", 3, step_props);

        assert_eq!(step.property("mode"), Some("delta"));
        assert_eq!(step.property("region"), Some("eu"));
        assert_eq!(step.property("missing"), None);
    }

    #[test]
    fn test_step_metrics_update() {
        let job = Arc::new(JobContext::new("job", 1, 1));
        let step = StepContext::new(job, "load", 3, HashMap::new());
        step.update_metrics(|m| {
            m.read_count += 5;
            m.commit_count += 1;
        });
        assert_eq!(step.metrics().read_count, 5);
        assert_eq!(step.metrics().commit_count, 1);
    }
}
