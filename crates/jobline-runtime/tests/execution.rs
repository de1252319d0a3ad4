mod common;

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;

use jobline_core::context::{JobContext, StepContext};
use jobline_core::error::BatchError;
use jobline_core::graph::{ChunkConfig, Decision, Flow, JobDefinition, Step, TransitionRule};
use jobline_core::status::BatchStatus;
use jobline_core::traits::{CheckpointAlgorithm, ChunkHandler, PersistenceService};
use jobline_runtime::{ArtifactRegistry, JobController};
use jobline_test_utils::{
    ExitBatchlet, FailingBatchlet, FailingJobListener, RecordingDecider, RecordingListener,
};

use common::Harness;

fn registry() -> ArtifactRegistry {
    let mut registry = ArtifactRegistry::new();
    registry.register_batchlet("normal", || Arc::new(ExitBatchlet::new("NORMAL")));
    registry.register_batchlet("silent", || Arc::new(ExitBatchlet::silent()));
    registry.register_batchlet("fail", || Arc::new(FailingBatchlet::new()));
    registry
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sequential_steps_complete() {
    let harness = Harness::new(registry());
    let job = JobDefinition::new("nightly")
        .with_element(Step::new("extract").with_batchlet("normal").with_next("load"))
        .with_element(Step::new("load").with_batchlet("silent"));

    let execution = harness.run(job).await;
    assert_eq!(execution.batch_status, BatchStatus::Completed);
    assert_eq!(execution.exit_status.as_deref(), Some("COMPLETED"));
    assert!(execution.end_time.is_some());

    let steps = harness.steps(execution.execution_id);
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].exit_status.as_deref(), Some("NORMAL"));
    assert_eq!(steps[0].metrics.read_count, 1);
    assert_eq!(steps[1].exit_status.as_deref(), Some("COMPLETED"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_decision_end_directive_sets_exit_status() {
    let decider = Arc::new(RecordingDecider::new("GOOD"));
    let mut registry = registry();
    let d = decider.clone();
    registry.register_decider("judge", move || d.clone());
    let harness = Harness::new(registry);

    let job = JobDefinition::new("decide")
        .with_element(Step::new("A").with_batchlet("normal").with_next("D"))
        .with_element(
            Decision::new("D", "judge").with_transition(TransitionRule::end("GOOD", Some("DONE"))),
        );

    let execution = harness.run(job).await;
    assert_eq!(execution.batch_status, BatchStatus::Completed);
    assert_eq!(execution.exit_status.as_deref(), Some("DONE"));
    // The decider saw the step's own exit status
    assert_eq!(
        decider.inputs(),
        vec![vec![("A".to_string(), Some("NORMAL".to_string()))]]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_decision_after_flow_gets_last_step() {
    let decider = Arc::new(RecordingDecider::new("GO"));
    let mut registry = registry();
    let d = decider.clone();
    registry.register_decider("judge", move || d.clone());
    let harness = Harness::new(registry);

    let flow = Flow::new("F")
        .with_element(Step::new("f1").with_batchlet("normal").with_next("f2"))
        .with_element(Step::new("f2").with_batchlet("silent"))
        .with_next("D");
    let job = JobDefinition::new("flowed")
        .with_element(flow)
        .with_element(Decision::new("D", "judge").with_transition(TransitionRule::next("GO", "after")))
        .with_element(Step::new("after").with_batchlet("silent"));

    let execution = harness.run(job).await;
    assert_eq!(execution.batch_status, BatchStatus::Completed);
    assert_eq!(
        decider.inputs(),
        vec![vec![("f2".to_string(), Some("COMPLETED".to_string()))]]
    );
    assert_eq!(
        harness.step_names(execution.execution_id),
        vec!["f1", "f2", "after"]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_decision_after_skipped_flow_gets_last_step() {
    let decider = Arc::new(RecordingDecider::new("PAUSE"));
    let mut registry = registry();
    let d = decider.clone();
    registry.register_decider("judge", move || d.clone());
    let harness = Harness::new(registry);

    let flow = Flow::new("F")
        .with_element(Step::new("f1").with_batchlet("silent").with_next("f2"))
        .with_element(Step::new("f2").with_batchlet("normal"))
        .with_next("D");
    let job = JobDefinition::new("paused")
        .with_element(flow)
        .with_element(
            Decision::new("D", "judge").with_transition(TransitionRule::stop("PAUSE", None, Some("F"))),
        );

    let first = harness.run(job).await;
    assert_eq!(first.batch_status, BatchStatus::Stopped);

    // The restart re-enters F, whose steps are all skipped as completed
    let second = harness.restart(first.execution_id).await;
    assert_eq!(second.batch_status, BatchStatus::Stopped);
    assert!(harness.step_names(second.execution_id).is_empty());

    let expected = vec![("f2".to_string(), Some("NORMAL".to_string()))];
    assert_eq!(decider.inputs(), vec![expected.clone(), expected]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_decision_first_in_scope_gets_nothing() {
    let decider = Arc::new(RecordingDecider::new("SKIP"));
    let mut registry = registry();
    let d = decider.clone();
    registry.register_decider("judge", move || d.clone());
    let harness = Harness::new(registry);

    let job = JobDefinition::new("first")
        .with_element(Decision::new("D", "judge").with_transition(TransitionRule::end("SKIP", None)));

    let execution = harness.run(job).await;
    assert_eq!(execution.batch_status, BatchStatus::Completed);
    assert_eq!(decider.inputs(), vec![Vec::new()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_glob_transition_routes_by_exit_status() {
    let harness = Harness::new(registry());
    let job = JobDefinition::new("routes")
        .with_element(
            Step::new("A")
                .with_batchlet("normal")
                .with_transition(TransitionRule::next("NOR*", "B"))
                .with_transition(TransitionRule::next("*", "C")),
        )
        .with_element(Step::new("B").with_batchlet("silent"))
        .with_element(Step::new("C").with_batchlet("silent"));

    let execution = harness.run(job).await;
    assert_eq!(execution.batch_status, BatchStatus::Completed);
    assert_eq!(harness.step_names(execution.execution_id), vec!["A", "B"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_step_fails_job_without_transition() {
    let harness = Harness::new(registry());
    let job = JobDefinition::new("broken")
        .with_element(Step::new("A").with_batchlet("fail").with_next("B"))
        .with_element(Step::new("B").with_batchlet("silent"));

    let execution = harness.run(job).await;
    assert_eq!(execution.batch_status, BatchStatus::Failed);
    assert_eq!(execution.exit_status.as_deref(), Some("FAILED"));
    assert_eq!(harness.step_names(execution.execution_id), vec!["A"]);
}

/// A job controller over a fresh instance and execution, driven directly
/// instead of through a work unit.
fn unspawned_controller(
    harness: &Harness,
    definition: JobDefinition,
) -> (Arc<JobContext>, JobController) {
    let name = definition.id.clone();
    let instance = harness
        .store
        .create_job_instance(&name, &definition.to_json().unwrap())
        .unwrap();
    let execution = harness
        .store
        .create_job_execution(instance.instance_id, &HashMap::new())
        .unwrap();
    harness
        .kernel
        .status()
        .update_job_status_with_new_execution(instance.instance_id, &name, execution.execution_id)
        .unwrap();

    let job = Arc::new(JobContext::new(name, instance.instance_id, execution.execution_id));
    let controller = JobController::new(Arc::new(definition), job.clone(), harness.kernel.clone());
    (job, controller)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_step_failure_surfaces_as_job_error() {
    let harness = Harness::new(registry());
    let definition = JobDefinition::new("broken").with_element(Step::new("A").with_batchlet("fail"));
    let (job, controller) = unspawned_controller(&harness, definition);

    match controller.execute().await {
        Err(BatchError::JobFailed { job, source, .. }) => {
            assert_eq!(job, "broken");
            match *source {
                BatchError::StepFailed { step, message } => {
                    assert_eq!(step, "A");
                    assert!(message.contains("scripted failure"), "{}", message);
                }
                other => panic!("expected StepFailed, got {:?}", other),
            }
        }
        other => panic!("expected JobFailed, got {:?}", other),
    }
    assert_eq!(job.batch_status(), BatchStatus::Failed);
    let persisted = harness.kernel.job_execution(job.execution_id()).unwrap();
    assert_eq!(persisted.batch_status, BatchStatus::Failed);
    assert_eq!(persisted.exit_status.as_deref(), Some("FAILED"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fail_directive_is_not_an_error() {
    let harness = Harness::new(registry());
    let definition = JobDefinition::new("directive").with_element(
        Step::new("A")
            .with_batchlet("normal")
            .with_transition(TransitionRule::fail("NORMAL", None)),
    );
    let (job, controller) = unspawned_controller(&harness, definition);

    assert!(controller.execute().await.is_ok());
    assert_eq!(job.batch_status(), BatchStatus::Failed);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fail_directive_with_exit_status() {
    let harness = Harness::new(registry());
    let job = JobDefinition::new("directive").with_element(
        Step::new("A")
            .with_batchlet("normal")
            .with_transition(TransitionRule::fail("NORMAL", Some("BAD_DATA"))),
    );

    let execution = harness.run(job).await;
    assert_eq!(execution.batch_status, BatchStatus::Failed);
    assert_eq!(execution.exit_status.as_deref(), Some("BAD_DATA"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_illegal_transition_fails_job() {
    let harness = Harness::new(registry());
    let job = JobDefinition::new("dangling")
        .with_element(Step::new("A").with_batchlet("normal").with_next("nowhere"));

    let execution = harness.run(job).await;
    assert_eq!(execution.batch_status, BatchStatus::Failed);
    assert_eq!(execution.exit_status.as_deref(), Some("FAILED"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_transition_out_of_flow_scope_fails_job() {
    let harness = Harness::new(registry());
    let flow = Flow::new("F")
        .with_element(Step::new("f1").with_batchlet("normal").with_next("outside"));
    let job = JobDefinition::new("escape")
        .with_element(flow)
        .with_element(Step::new("outside").with_batchlet("silent"));

    let execution = harness.run(job).await;
    assert_eq!(execution.batch_status, BatchStatus::Failed);
    assert_eq!(harness.step_names(execution.execution_id), vec!["f1"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_listeners_wrap_job_and_steps() {
    let listener = Arc::new(RecordingListener::new());
    let mut registry = registry();
    let l = listener.clone();
    registry.register_step_listener("steps", move || l.clone());
    let store = Arc::new(jobline_store::MemoryStore::new());
    let services = jobline_runtime::ExecutionServices::new(store.clone(), Arc::new(registry));
    let job_listener = Arc::new(RecordingListener::new());
    let kernel = jobline_runtime::BatchKernel::new(services).with_listener(job_listener.clone());
    let harness = Harness::with_kernel(store, kernel);

    let job = JobDefinition::new("watched")
        .with_element(Step::new("A").with_batchlet("normal").with_listener("steps"));

    let execution = harness.run(job).await;
    assert_eq!(execution.batch_status, BatchStatus::Completed);
    assert_eq!(
        job_listener.events(),
        vec!["before:watched", "after:watched:COMPLETED"]
    );
    assert_eq!(listener.events(), vec!["before:A", "after:A:STARTED"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_before_job_listener_failure_fails_job() {
    let mut registry = registry();
    registry.register_job_listener("refuse", || Arc::new(FailingJobListener));
    let harness = Harness::new(registry);

    let job = JobDefinition::new("refused")
        .with_listener("refuse")
        .with_element(Step::new("A").with_batchlet("normal"));

    let execution = harness.run(job).await;
    assert_eq!(execution.batch_status, BatchStatus::Failed);
    assert!(harness.step_names(execution.execution_id).is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_job_properties_reach_steps() {
    let harness = Harness::new(registry());
    let job = JobDefinition::new("props")
        .with_property("region", "eu")
        .with_element(Step::new("A").with_batchlet("normal"));
    let execution = harness.run(job).await;

    let instance = harness.kernel.job_instance(execution.execution_id).unwrap();
    let stored = JobDefinition::from_json(&instance.definition_json).unwrap();
    assert_eq!(stored.properties.get("region").map(String::as_str), Some("eu"));
    assert_eq!(harness.kernel.job_instance_count("props").unwrap(), 1);
    assert!(harness.kernel.running_executions("props").is_empty());
}

/// Reads `total` items, committing whenever the algorithm says so.
struct CountingChunk {
    total: u64,
}

impl ChunkHandler for CountingChunk {
    fn run(
        &self,
        ctx: Arc<StepContext>,
        mut checkpoint: Box<dyn CheckpointAlgorithm>,
    ) -> BoxFuture<'_, jobline_core::Result<Option<String>>> {
        Box::pin(async move {
            checkpoint.begin_checkpoint();
            for item in 1..=self.total {
                ctx.update_metrics(|m| {
                    m.read_count += 1;
                    m.write_count += 1;
                });
                if checkpoint.is_ready_to_checkpoint() || item == self.total {
                    checkpoint.end_checkpoint();
                    ctx.update_metrics(|m| m.commit_count += 1);
                    checkpoint.begin_checkpoint();
                }
            }
            Ok(None)
        })
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_chunk_step_uses_item_checkpoints() {
    let mut registry = registry();
    registry.register_chunk_handler("count", || Arc::new(CountingChunk { total: 10 }));
    let harness = Harness::new(registry);

    let job = JobDefinition::new("chunky").with_element(
        Step::new("load").with_chunk(ChunkConfig::new("count").with_item_count(4)),
    );

    let execution = harness.run(job).await;
    assert_eq!(execution.batch_status, BatchStatus::Completed);
    let steps = harness.steps(execution.execution_id);
    assert_eq!(steps[0].metrics.read_count, 10);
    // 4 + 4 + 2
    assert_eq!(steps[0].metrics.commit_count, 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_step_without_artifact_fails() {
    let harness = Harness::new(registry());
    let job = JobDefinition::new("empty").with_element(Step::new("nothing"));
    let execution = harness.run(job).await;
    assert_eq!(execution.batch_status, BatchStatus::Failed);
}
