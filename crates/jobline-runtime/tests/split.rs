mod common;

use std::sync::Arc;

use jobline_core::graph::{Decision, Flow, JobDefinition, Split, Step, TransitionRule};
use jobline_core::status::BatchStatus;
use jobline_core::traits::PersistenceService;
use jobline_runtime::ArtifactRegistry;
use jobline_test_utils::{
    BlockingBatchlet, ExitBatchlet, FailingBatchlet, FlakyBatchlet, RecordingDecider,
};

use common::Harness;

fn registry() -> ArtifactRegistry {
    let mut registry = ArtifactRegistry::new();
    registry.register_batchlet("ok", || Arc::new(ExitBatchlet::new("OK")));
    registry.register_batchlet("silent", || Arc::new(ExitBatchlet::silent()));
    registry.register_batchlet("fail", || Arc::new(FailingBatchlet::with_exit_status("FAIL")));
    registry
}

fn branch(id: &str, batchlet: &str) -> Flow {
    Flow::new(id).with_element(Step::new(format!("{}-step", id)).with_batchlet(batchlet))
}

/// A branch that ends STOPPED through a stop directive.
fn stopping_branch(id: &str) -> Flow {
    Flow::new(id).with_element(
        Step::new(format!("{}-step", id))
            .with_batchlet("ok")
            .with_transition(TransitionRule::stop("*", None, None)),
    )
}

fn split_job(name: &str, split: Split) -> JobDefinition {
    JobDefinition::new(name)
        .with_element(split.with_next("after"))
        .with_element(Step::new("after").with_batchlet("silent"))
}

#[tokio::test(flavor = "multi_thread")]
async fn test_all_branches_completed() {
    let harness = Harness::new(registry());
    let split = Split::new("fan")
        .with_flow(branch("left", "ok"))
        .with_flow(branch("right", "ok"));

    let execution = harness.run(split_job("fanout", split)).await;
    assert_eq!(execution.batch_status, BatchStatus::Completed);
    assert_eq!(harness.step_names(execution.execution_id), vec!["after"]);

    // Each branch ran as its own generated job
    let names = harness.kernel.job_names().unwrap();
    assert!(names.contains(&"fanout:1:fan:left".to_string()));
    assert!(names.contains(&"fanout:1:fan:right".to_string()));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_branch_fails_split_and_job() {
    let harness = Harness::new(registry());
    let split = Split::new("fan")
        .with_flow(branch("flow1", "ok"))
        .with_flow(branch("flow2", "fail"));

    let execution = harness.run(split_job("mixed", split)).await;
    assert_eq!(execution.batch_status, BatchStatus::Failed);
    assert!(harness.step_names(execution.execution_id).is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stopped_branch_stops_split() {
    let harness = Harness::new(registry());
    let split = Split::new("fan")
        .with_flow(branch("left", "ok"))
        .with_flow(stopping_branch("right"));

    let execution = harness.run(split_job("halt", split)).await;
    assert_eq!(execution.batch_status, BatchStatus::Stopped);
    assert!(harness.step_names(execution.execution_id).is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_outranks_stopped() {
    let harness = Harness::new(registry());
    let split = Split::new("fan")
        .with_flow(stopping_branch("a"))
        .with_flow(branch("b", "fail"))
        .with_flow(branch("c", "ok"));

    let execution = harness.run(split_job("worst", split)).await;
    assert_eq!(execution.batch_status, BatchStatus::Failed);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_decision_after_split_gets_each_branch_last_step() {
    let decider = Arc::new(RecordingDecider::new("JOINED"));
    let mut registry = registry();
    let d = decider.clone();
    registry.register_decider("join", move || d.clone());
    let harness = Harness::new(registry);

    let left = Flow::new("left")
        .with_element(Step::new("l1").with_batchlet("silent").with_next("l2"))
        .with_element(Step::new("l2").with_batchlet("ok"));
    let right = branch("right", "silent");
    let job = JobDefinition::new("joined")
        .with_element(Split::new("fan").with_flow(left).with_flow(right).with_next("D"))
        .with_element(
            Decision::new("D", "join").with_transition(TransitionRule::end("JOINED", Some("DONE"))),
        );

    let execution = harness.run(job).await;
    assert_eq!(execution.batch_status, BatchStatus::Completed);
    assert_eq!(execution.exit_status.as_deref(), Some("DONE"));

    let inputs = decider.inputs();
    assert_eq!(inputs.len(), 1);
    let mut seen = inputs[0].clone();
    seen.sort();
    assert_eq!(
        seen,
        vec![
            ("l2".to_string(), Some("OK".to_string())),
            ("right-step".to_string(), Some("COMPLETED".to_string())),
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_branches_run_concurrently_and_stop_together() {
    let left = Arc::new(BlockingBatchlet::new());
    let right = Arc::new(BlockingBatchlet::new());
    let mut registry = registry();
    let l = left.clone();
    registry.register_batchlet("block-left", move || l.clone());
    let r = right.clone();
    registry.register_batchlet("block-right", move || r.clone());
    let harness = Harness::new(registry);

    let split = Split::new("fan")
        .with_flow(branch("left", "block-left"))
        .with_flow(branch("right", "block-right"));
    let execution_id = harness
        .kernel
        .start(split_job("parallel", split), Default::default())
        .unwrap();

    // Both branches are inside their batchlets at the same time
    left.wait_started().await;
    right.wait_started().await;

    harness.kernel.stop(execution_id).await.unwrap();
    let execution = harness.kernel.wait_for(execution_id).await.unwrap();
    assert_eq!(execution.batch_status, BatchStatus::Stopped);
    assert_eq!(left.stop_calls(), 1);
    assert_eq!(right.stop_calls(), 1);
    assert!(harness.step_names(execution_id).is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_split_restart_reuses_branch_instances() {
    let harness = Harness::new(registry());
    let split = Split::new("fan")
        .with_flow(branch("good", "ok"))
        .with_flow(branch("bad", "fail"));

    let first = harness.run(split_job("again", split)).await;
    assert_eq!(first.batch_status, BatchStatus::Failed);

    let second = harness.restart(first.execution_id).await;
    assert_eq!(second.batch_status, BatchStatus::Failed);
    // Still exactly one generated instance per branch
    assert_eq!(harness.kernel.job_instance_count("again:1:fan:good").unwrap(), 1);
    assert_eq!(harness.kernel.job_instance_count("again:1:fan:bad").unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_decision_after_restarted_split_sees_skipped_branch() {
    let decider = Arc::new(RecordingDecider::new("JOINED"));
    let flaky = Arc::new(FlakyBatchlet::new(1, "OK"));
    let mut registry = registry();
    let d = decider.clone();
    registry.register_decider("join", move || d.clone());
    let f = flaky.clone();
    registry.register_batchlet("flaky", move || f.clone());
    let harness = Harness::new(registry);

    let job = JobDefinition::new("rejoin")
        .with_element(
            Split::new("fan")
                .with_flow(branch("left", "ok"))
                .with_flow(branch("right", "flaky"))
                .with_next("D"),
        )
        .with_element(Decision::new("D", "join").with_transition(TransitionRule::end("JOINED", None)));

    let first = harness.run(job).await;
    assert_eq!(first.batch_status, BatchStatus::Failed);
    assert!(decider.inputs().is_empty());

    let second = harness.restart(first.execution_id).await;
    assert_eq!(second.batch_status, BatchStatus::Completed);
    assert_eq!(flaky.attempts(), 2);

    // The left branch skipped its only step, yet still reports it
    let inputs = decider.inputs();
    assert_eq!(inputs.len(), 1);
    let mut seen = inputs[0].clone();
    seen.sort();
    assert_eq!(
        seen,
        vec![
            ("left-step".to_string(), Some("OK".to_string())),
            ("right-step".to_string(), Some("OK".to_string())),
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_inconsistent_branch_leaves_no_running_executions() {
    let harness = Harness::new(registry());
    // Two stray instances of the second branch's generated job; the parent
    // job's instance is created after them and gets id 3
    harness.store.create_job_instance("leak:3:fan:b", "{}").unwrap();
    harness.store.create_job_instance("leak:3:fan:b", "{}").unwrap();

    let split = Split::new("fan")
        .with_flow(branch("a", "ok"))
        .with_flow(branch("b", "ok"));
    let execution = harness.run(split_job("leak", split)).await;
    assert_eq!(execution.instance_id, 3);
    assert_eq!(execution.batch_status, BatchStatus::Failed);

    for name in ["leak:3:fan:a", "leak:3:fan:b"] {
        assert!(harness.kernel.running_executions(name).is_empty(), "{}", name);
        for instance in harness.store.job_instances(name).unwrap() {
            for branch in harness.kernel.job_executions(instance.instance_id).unwrap() {
                assert!(!branch.batch_status.is_running(), "{} left {:?}", name, branch);
            }
        }
    }
    // The healthy branch was never built
    assert_eq!(harness.kernel.job_instance_count("leak:3:fan:a").unwrap(), 0);
}
