//! Scheduler scenarios over scripted lanes and a scripted worktree backend.
//!
//! Each test builds a plan, runs it to quiescence and checks the report, the
//! persisted workflow states and the worktree calls the lanes made.

use std::time::Duration;

use conductor::core::graph::{DependencyGraph, GraphError};
use conductor::core::types::{LifecycleState, WorkUnit};
use conductor::lane::LaneOutcome;
use conductor::scheduler::{FailurePolicy, RunOutcome, Scheduler};
use conductor::test_support::{Harness, ScriptedLaneRunner, diamond, unit, weighted};
use conductor::workflow::load_workflow;

fn state_of(harness: &Harness, id: &str) -> LifecycleState {
    load_workflow(&harness.store, id)
        .expect("load")
        .map_or(LifecycleState::NotStarted, |s| s.current_state)
}

/// Diamond `A -> {B, C} -> D` with two lanes:
///
/// 1. A runs alone.
/// 2. B and C run together.
/// 3. D runs once both are complete.
#[test]
fn diamond_respects_dependencies_and_cap() {
    let harness = Harness::new();
    let graph = DependencyGraph::from_units(diamond()).expect("graph");
    let plan = Scheduler::plan(&graph, 2);
    assert_eq!(plan.groups, vec![vec!["A"], vec!["B", "C"], vec!["D"]]);

    let runner = ScriptedLaneRunner::new().with_delay(Duration::from_millis(30));
    let report = harness.scheduler().run(&plan, &runner).expect("run");

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.completed.first().map(String::as_str), Some("A"));
    assert_eq!(report.completed.last().map(String::as_str), Some("D"));
    assert!(runner.max_concurrency() <= 2);
    for id in ["A", "B", "C", "D"] {
        assert_eq!(state_of(&harness, id), LifecycleState::Complete, "{id}");
    }

    let calls = harness.backend.calls();
    assert!(calls.contains(&"add conductor/D main".to_string()));
    assert!(calls.contains(&"remove D".to_string()));
    assert!(harness.worktrees.list().expect("list").iter().all(|w| !w.is_active()));
}

#[test]
fn concurrency_never_exceeds_cap() {
    let harness = Harness::new();
    let units: Vec<WorkUnit> = (0..6).map(|i| unit(&format!("u{i}"), &[])).collect();
    let graph = DependencyGraph::from_units(units).expect("graph");
    let plan = Scheduler::plan(&graph, 2);
    let runner = ScriptedLaneRunner::new().with_delay(Duration::from_millis(40));

    let report = harness.scheduler().run(&plan, &runner).expect("run");

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.completed.len(), 6);
    assert!(runner.max_concurrency() <= 2);
    assert_eq!(runner.invocations().len(), 6);
}

#[test]
fn critical_path_follows_weights() {
    let graph = DependencyGraph::from_units(vec![
        weighted("design", 2.0, &[]),
        weighted("api", 5.0, &["design"]),
        weighted("ui", 1.0, &["design"]),
        weighted("release", 1.0, &["api", "ui"]),
    ])
    .expect("graph");
    let plan = Scheduler::plan(&graph, 3);
    assert_eq!(plan.critical_path, vec!["design", "api", "release"]);
    assert!((plan.critical_path_length - 8.0).abs() < f64::EPSILON);
}

#[test]
fn cyclic_plan_is_rejected_before_running() {
    let err = DependencyGraph::from_units(vec![unit("a", &["b"]), unit("b", &["a"])])
        .expect_err("cycle");
    assert!(matches!(err, GraphError::Cycle { .. }));
}

#[test]
fn soft_dependency_does_not_gate_start() {
    let harness = Harness::new();
    let graph = DependencyGraph::from_units(vec![
        unit("schema", &[]),
        WorkUnit::new("docs").soft_depends_on(["schema"]),
    ])
    .expect("graph");
    let plan = Scheduler::plan(&graph, 2);
    let runner = ScriptedLaneRunner::new();
    runner.script("schema", vec![LaneOutcome::Failed("schema broke".to_string())]);

    let report = harness.scheduler().run(&plan, &runner).expect("run");

    assert_eq!(report.outcome, RunOutcome::Failed);
    assert_eq!(report.completed, vec!["docs"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].unit, "schema");
    assert!(report.blocked.is_empty());
}

#[test]
fn failed_unit_blocks_its_dependents() {
    let harness = Harness::new();
    let graph = DependencyGraph::from_units(diamond()).expect("graph");
    let plan = Scheduler::plan(&graph, 2);
    let runner = ScriptedLaneRunner::new();
    runner.script("B", vec![LaneOutcome::Failed("tests red".to_string())]);

    let report = harness.scheduler().run(&plan, &runner).expect("run");

    assert_eq!(report.outcome, RunOutcome::Failed);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].unit, "B");
    assert_eq!(report.failed[0].attempts, 1);
    assert_eq!(report.failed[0].reason, "tests red");
    assert_eq!(report.blocked, vec!["D"]);
    assert!(runner.invocations_of("D").is_empty());

    // The failed lane was rolled back and its worktree released.
    assert_eq!(state_of(&harness, "B"), LifecycleState::NotStarted);
    assert!(harness.worktrees.active("B").expect("active").is_none());
}

#[test]
fn failing_lane_is_retried_within_budget() {
    let harness = Harness::new();
    let mut options = Harness::options();
    options.failure = FailurePolicy { max_attempts: 2 };
    let graph = DependencyGraph::from_units(vec![unit("flaky", &[])]).expect("graph");
    let plan = Scheduler::plan(&graph, 1);
    let runner = ScriptedLaneRunner::new();
    runner.script(
        "flaky",
        vec![LaneOutcome::Failed("network".to_string()), LaneOutcome::Done],
    );

    let report = harness.scheduler_with(options).run(&plan, &runner).expect("run");

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.completed, vec!["flaky"]);
    let state = load_workflow(&harness.store, "flaky")
        .expect("load")
        .expect("stored");
    assert_eq!(state.attempts, 2);
    assert_eq!(state.current_state, LifecycleState::Complete);

    let adds = harness
        .backend
        .calls()
        .iter()
        .filter(|call| call.starts_with("add "))
        .count();
    assert_eq!(adds, 2);
}

#[test]
fn retry_reuses_branch_kept_with_unmerged_work() {
    let harness = Harness::new();
    harness.backend.mark_unmerged("conductor/flaky");
    let mut options = Harness::options();
    options.failure = FailurePolicy { max_attempts: 2 };
    let graph = DependencyGraph::from_units(vec![unit("flaky", &[])]).expect("graph");
    let plan = Scheduler::plan(&graph, 1);
    let runner = ScriptedLaneRunner::new();
    runner.script(
        "flaky",
        vec![LaneOutcome::Failed("tests red".to_string()), LaneOutcome::Done],
    );

    let report = harness.scheduler_with(options).run(&plan, &runner).expect("run");

    assert_eq!(report.outcome, RunOutcome::Completed);
    let calls = harness.backend.calls();
    assert!(calls.contains(&"add conductor/flaky main".to_string()));
    assert!(calls.contains(&"attach conductor/flaky".to_string()));
}

#[test]
fn unit_id_the_store_cannot_hold_is_rejected_up_front() {
    let err = DependencyGraph::from_units(vec![unit("build.tmp", &[])]).expect_err("invalid id");
    assert!(matches!(err, GraphError::InvalidUnitId(ref reason) if reason.contains("build.tmp")));
}

#[test]
fn multi_step_lane_advances_step_pointer() {
    let harness = Harness::new();
    let graph = DependencyGraph::from_units(vec![unit("story", &[])]).expect("graph");
    let plan = Scheduler::plan(&graph, 1);
    let runner = ScriptedLaneRunner::new();
    runner.script(
        "story",
        vec![LaneOutcome::StepDone, LaneOutcome::StepDone, LaneOutcome::Done],
    );

    harness.scheduler().run(&plan, &runner).expect("run");

    let steps: Vec<u32> = runner.invocations_of("story").iter().map(|l| l.step).collect();
    assert_eq!(steps, vec![0, 1, 2]);
    let state = load_workflow(&harness.store, "story")
        .expect("load")
        .expect("stored");
    assert_eq!(state.step_pointer, 2);
}

#[test]
fn rerun_of_finished_plan_skips_everything() {
    let harness = Harness::new();
    let graph = DependencyGraph::from_units(diamond()).expect("graph");
    let plan = Scheduler::plan(&graph, 2);
    let runner = ScriptedLaneRunner::new();
    harness.scheduler().run(&plan, &runner).expect("first run");

    let report = harness.scheduler().run(&plan, &runner).expect("second run");
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert!(report.completed.is_empty());
    assert_eq!(report.skipped, vec!["A", "B", "C", "D"]);
    assert_eq!(runner.invocations().len(), 4);
}
