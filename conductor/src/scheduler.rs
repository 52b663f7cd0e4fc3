//! Scheduler: drives a plan through parallel lanes.
//!
//! Ready units are launched in `(depth, id)` order onto scoped threads, up to
//! the concurrency cap. Lanes report back over a channel. A lane that hits an
//! escalation parks and keeps its slot; the loop polls its escalations and
//! relaunches it once nothing is pending. Persisted workflow state is the
//! source of truth for what is complete, so a rerun after a crash skips
//! finished units and resumes interrupted ones.

use std::collections::{BTreeMap, BTreeSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::graph::DependencyGraph;
use crate::core::lifecycle::Checkpoint;
use crate::core::types::{DecisionKind, DecisionValue, LifecycleState};
use crate::error::{OrchestratorError, Result};
use crate::hooks::{HookEvent, HookPoint};
use crate::io::config::ConductorConfig;
use crate::io::worktree::Worktree;
use crate::lane::{Lane, LaneOutcome, LaneRunner};
use crate::workflow::{Services, WorkflowMachine, load_workflow};

/// Category tag attached to review approvals.
pub const REVIEW_CATEGORY: &str = "review";

/// Ordered execution plan derived from a graph.
#[derive(Debug, Clone)]
pub struct Plan<'g> {
    graph: &'g DependencyGraph,
    pub groups: Vec<Vec<String>>,
    pub critical_path: Vec<String>,
    pub critical_path_length: f64,
    /// Every unit in launch order: increasing depth, then id.
    pub queue: Vec<String>,
    pub max_parallel: usize,
}

/// What to do when a lane fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailurePolicy {
    /// Lane attempts per unit within one run; 1 means no retry.
    pub max_attempts: u32,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self { max_attempts: 1 }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub base_branch: String,
    pub poll_interval: Duration,
    pub wait_for_escalations: bool,
    pub failure: FailurePolicy,
}

impl SchedulerOptions {
    pub fn from_config(cfg: &ConductorConfig) -> Self {
        Self {
            base_branch: cfg.git.base_branch.clone(),
            poll_interval: cfg.escalation_poll_interval(),
            wait_for_escalations: cfg.wait_for_escalations,
            failure: FailurePolicy {
                max_attempts: cfg.max_lane_attempts,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    /// Every unit is complete.
    Completed,
    /// Some units wait on pending escalations and nothing else can run.
    Stalled,
    /// Some units failed terminally.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitFailure {
    pub unit: String,
    pub attempts: u32,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParkedUnit {
    pub unit: String,
    pub escalations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// Completed during this run, in completion order.
    pub completed: Vec<String>,
    /// Already complete before this run started.
    pub skipped: Vec<String>,
    pub failed: Vec<UnitFailure>,
    pub parked: Vec<ParkedUnit>,
    /// Not run because a prerequisite failed or is parked.
    pub blocked: Vec<String>,
}

impl RunReport {
    pub fn pending_escalations(&self) -> Vec<&str> {
        self.parked
            .iter()
            .flat_map(|p| p.escalations.iter().map(String::as_str))
            .collect()
    }
}

/// How a lane thread ended.
#[derive(Debug)]
enum LaneReport {
    Completed,
    Parked {
        escalations: Vec<String>,
        checkpoint: Checkpoint,
    },
    Failed(String),
    /// Invariant violation or persistence failure; aborts the run.
    Fatal(OrchestratorError),
}

impl LaneReport {
    fn label(&self) -> &'static str {
        match self {
            LaneReport::Completed => "completed",
            LaneReport::Parked { .. } => "parked",
            LaneReport::Failed(_) => "failed",
            LaneReport::Fatal(_) => "fatal",
        }
    }
}

struct ParkedLane {
    escalations: Vec<String>,
    checkpoint: Checkpoint,
}

pub struct Scheduler<'a> {
    services: Services<'a>,
    options: SchedulerOptions,
}

impl<'a> Scheduler<'a> {
    pub fn new(services: Services<'a>, options: SchedulerOptions) -> Self {
        Self { services, options }
    }

    /// Derive the launch plan for `graph`.
    pub fn plan(graph: &DependencyGraph, max_parallel: usize) -> Plan<'_> {
        let mut queue: Vec<(usize, String)> = graph
            .units()
            .iter()
            .map(|u| (graph.depth(&u.id).unwrap_or(0), u.id.clone()))
            .collect();
        queue.sort();
        Plan {
            graph,
            groups: graph.parallel_groups().to_vec(),
            critical_path: graph.critical_path().into_iter().map(str::to_string).collect(),
            critical_path_length: graph.critical_path_length(),
            queue: queue.into_iter().map(|(_, id)| id).collect(),
            max_parallel: max_parallel.max(1),
        }
    }

    /// Run `plan` until every unit is complete, failed, blocked or parked.
    #[instrument(skip_all, fields(units = plan.queue.len(), max_parallel = plan.max_parallel))]
    pub fn run(&self, plan: &Plan<'_>, runner: &dyn LaneRunner) -> Result<RunReport> {
        let graph = plan.graph;
        let mut completed = Vec::new();
        let mut skipped = Vec::new();
        let mut done = BTreeSet::new();
        for unit in &plan.queue {
            if let Some(state) = load_workflow(self.services.store, unit)?
                && state.is_complete()
            {
                done.insert(unit.clone());
                skipped.push(unit.clone());
            }
        }
        let mut ready: BTreeSet<(usize, String)> = plan
            .queue
            .iter()
            .filter(|unit| !done.contains(*unit) && prerequisites_done(graph, unit, &done))
            .map(|unit| (graph.depth(unit).unwrap_or(0), unit.clone()))
            .collect();
        info!(skipped = skipped.len(), ready = ready.len(), "run starting");

        let slots = AtomicUsize::new(0);
        let (tx, rx) = mpsc::channel::<(String, LaneReport)>();
        let mut attempts: BTreeMap<String, u32> = BTreeMap::new();
        let mut parked: BTreeMap<String, ParkedLane> = BTreeMap::new();
        let mut failed: Vec<UnitFailure> = Vec::new();
        let mut running = 0usize;
        let mut stalled = false;

        thread::scope(|scope| -> Result<()> {
            let launch = |unit: String, resume: Option<Checkpoint>| {
                let tx = tx.clone();
                let slots = &slots;
                scope.spawn(move || {
                    let report = panic::catch_unwind(AssertUnwindSafe(|| {
                        self.drive_lane(&unit, runner, resume)
                    }))
                    .unwrap_or_else(|_| {
                        LaneReport::Fatal(OrchestratorError::ExternalCall {
                            operation: format!("lane '{unit}'"),
                            message: "lane thread panicked".to_string(),
                        })
                    });
                    if !matches!(report, LaneReport::Parked { .. }) {
                        slots.fetch_sub(1, Ordering::SeqCst);
                    }
                    // The receiver outlives every lane; a send error means the
                    // run already aborted.
                    let _ = tx.send((unit, report));
                });
            };

            loop {
                // Parked lanes whose escalations were all closed resume in their slot.
                let mut resumable = Vec::new();
                for unit in parked.keys() {
                    if self.services.gate.pending_for(unit)?.is_empty() {
                        resumable.push(unit.clone());
                    }
                }
                for unit in resumable {
                    if let Some(lane) = parked.remove(&unit) {
                        info!(unit = %unit, "resuming parked lane");
                        running += 1;
                        launch(unit, Some(lane.checkpoint));
                    }
                }

                while slots.load(Ordering::SeqCst) < plan.max_parallel {
                    let Some((_, unit)) = ready.pop_first() else {
                        break;
                    };
                    self.check_dependencies(graph, &unit)?;
                    *attempts.entry(unit.clone()).or_default() += 1;
                    slots.fetch_add(1, Ordering::SeqCst);
                    running += 1;
                    debug!(unit = %unit, "launching lane");
                    launch(unit, None);
                }

                if running == 0 {
                    if parked.is_empty() {
                        break;
                    }
                    if !self.options.wait_for_escalations {
                        stalled = true;
                        break;
                    }
                }

                let message = if parked.is_empty() {
                    rx.recv().ok()
                } else {
                    match rx.recv_timeout(self.options.poll_interval) {
                        Ok(message) => Some(message),
                        Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
                    }
                };
                let Some((unit, report)) = message else {
                    continue;
                };
                running -= 1;
                debug!(unit = %unit, outcome = report.label(), "lane reported");

                match report {
                    LaneReport::Completed => {
                        done.insert(unit.clone());
                        for dependent in graph.dependents(&unit) {
                            if !done.contains(dependent) && prerequisites_done(graph, dependent, &done)
                            {
                                ready.insert((
                                    graph.depth(dependent).unwrap_or(0),
                                    dependent.to_string(),
                                ));
                            }
                        }
                        completed.push(unit);
                    }
                    LaneReport::Parked {
                        escalations,
                        checkpoint,
                    } => {
                        info!(unit = %unit, escalations = ?escalations, "lane parked on escalation");
                        parked.insert(
                            unit,
                            ParkedLane {
                                escalations,
                                checkpoint,
                            },
                        );
                    }
                    LaneReport::Failed(reason) => {
                        let used = attempts.get(&unit).copied().unwrap_or(1);
                        if used < self.options.failure.max_attempts {
                            warn!(unit = %unit, attempt = used, reason = %reason, "lane failed, retrying");
                            ready.insert((graph.depth(&unit).unwrap_or(0), unit));
                        } else {
                            warn!(unit = %unit, attempts = used, reason = %reason, "lane failed");
                            failed.push(UnitFailure {
                                unit,
                                attempts: used,
                                reason,
                            });
                        }
                    }
                    LaneReport::Fatal(err) => return Err(err),
                }
            }
            Ok(())
        })?;

        let parked: Vec<ParkedUnit> = parked
            .into_iter()
            .map(|(unit, lane)| ParkedUnit {
                unit,
                escalations: lane.escalations,
            })
            .collect();
        let settled: BTreeSet<&str> = failed
            .iter()
            .map(|f| f.unit.as_str())
            .chain(parked.iter().map(|p| p.unit.as_str()))
            .chain(done.iter().map(String::as_str))
            .collect();
        let blocked: Vec<String> = plan
            .queue
            .iter()
            .filter(|unit| !settled.contains(unit.as_str()))
            .cloned()
            .collect();

        let outcome = if stalled || !parked.is_empty() {
            RunOutcome::Stalled
        } else if !failed.is_empty() || !blocked.is_empty() {
            RunOutcome::Failed
        } else {
            RunOutcome::Completed
        };
        info!(?outcome, completed = completed.len(), failed = failed.len(), "run finished");
        Ok(RunReport {
            outcome,
            completed,
            skipped,
            failed,
            parked,
            blocked,
        })
    }

    /// Every hard prerequisite of `unit` must be `Complete` in the store.
    fn check_dependencies(&self, graph: &DependencyGraph, unit: &str) -> Result<()> {
        for dependency in graph.hard_dependencies(unit) {
            let state = load_workflow(self.services.store, dependency)?
                .map_or(LifecycleState::NotStarted, |s| s.current_state);
            if state != LifecycleState::Complete {
                return Err(OrchestratorError::DependencyUnmet {
                    unit: unit.to_string(),
                    dependency: dependency.to_string(),
                    state,
                });
            }
        }
        Ok(())
    }

    fn drive_lane(
        &self,
        unit: &str,
        runner: &dyn LaneRunner,
        resume: Option<Checkpoint>,
    ) -> LaneReport {
        let hooks = self.services.hooks;
        hooks.fire(&HookEvent::lane(HookPoint::LaneStarted, unit, None));
        let report = self
            .try_drive_lane(unit, runner, resume)
            .unwrap_or_else(LaneReport::Fatal);
        hooks.fire(&HookEvent::lane(
            HookPoint::LaneFinished,
            unit,
            Some(report.label()),
        ));
        report
    }

    #[instrument(skip_all, fields(unit = %unit, resumed = resume.is_some()))]
    fn try_drive_lane(
        &self,
        unit: &str,
        runner: &dyn LaneRunner,
        resume: Option<Checkpoint>,
    ) -> Result<LaneReport> {
        let mut machine = WorkflowMachine::open(unit, self.services)?;
        let checkpoint = match resume {
            Some(checkpoint) => checkpoint,
            None if machine.current_state() == LifecycleState::NotStarted => {
                let checkpoint = machine.create_checkpoint();
                let attempt = machine.begin_attempt()?;
                machine.transition(LifecycleState::InProgress)?;
                info!(attempt, "lane started");
                checkpoint
            }
            None => {
                info!(state = %machine.current_state(), step = machine.step(), "resuming interrupted lane");
                machine.initial_checkpoint()
            }
        };

        let pending = self.services.gate.pending_for(unit)?;
        if !pending.is_empty() {
            return Ok(LaneReport::Parked {
                escalations: pending.into_iter().map(|e| e.id).collect(),
                checkpoint,
            });
        }

        let worktree = match self.ensure_worktree(unit) {
            Ok(worktree) => worktree,
            Err(err @ OrchestratorError::ExternalCall { .. }) => {
                return self.fail(&mut machine, &checkpoint, err.to_string());
            }
            Err(err) => return Err(err),
        };

        let mut decision = None;
        loop {
            if machine.current_state() == LifecycleState::Review {
                let question = format!("approve review of '{unit}' at step {}?", machine.step());
                let context =
                    BTreeMap::from([("category".to_string(), REVIEW_CATEGORY.to_string())]);
                match machine.decide(&question, DecisionKind::Approval, context) {
                    Ok(approval) => {
                        machine.transition(LifecycleState::InProgress)?;
                        if approval.value == DecisionValue::Approval(true) {
                            return self.complete(&mut machine);
                        }
                        // Rejected: rework in a new step with the verdict visible.
                        machine.advance_step()?;
                        decision = Some(approval);
                    }
                    Err(err) => return self.blocked(&mut machine, &checkpoint, err),
                }
            }

            let lane = Lane {
                unit: unit.to_string(),
                step: machine.step(),
                worktree: worktree.path.clone(),
                decision: decision.take(),
            };
            let outcome = runner
                .run(&lane)
                .unwrap_or_else(|err| LaneOutcome::Failed(format!("{err:#}")));
            match outcome {
                LaneOutcome::Done => return self.complete(&mut machine),
                LaneOutcome::StepDone => {
                    machine.advance_step()?;
                }
                LaneOutcome::Review => {
                    machine.transition(LifecycleState::Review)?;
                }
                LaneOutcome::Question {
                    question,
                    kind,
                    context,
                } => match machine.decide(&question, kind, context) {
                    Ok(answer) => decision = Some(answer),
                    Err(err) => return self.blocked(&mut machine, &checkpoint, err),
                },
                LaneOutcome::Failed(reason) => {
                    return self.fail(&mut machine, &checkpoint, reason);
                }
            }
        }
    }

    /// Reuse the unit's worktree if it survived, otherwise start a fresh one.
    fn ensure_worktree(&self, unit: &str) -> Result<Worktree> {
        let worktrees = self.services.worktrees;
        if let Some(existing) = worktrees.active(unit)? {
            if existing.path.exists() {
                debug!(path = %existing.path.display(), "reusing worktree");
                return Ok(existing);
            }
            warn!(path = %existing.path.display(), "discarding stale worktree record");
            worktrees.destroy(unit)?;
        }
        worktrees.create(unit, &self.options.base_branch)
    }

    fn complete(&self, machine: &mut WorkflowMachine<'_>) -> Result<LaneReport> {
        machine.transition(LifecycleState::Complete)?;
        if let Err(err) = self.services.worktrees.destroy(machine.id()) {
            warn!(unit = %machine.id(), err = %err, "worktree cleanup failed");
        }
        info!(unit = %machine.id(), "lane completed");
        Ok(LaneReport::Completed)
    }

    /// Map a decision failure onto park / abandon / abort.
    fn blocked(
        &self,
        machine: &mut WorkflowMachine<'_>,
        checkpoint: &Checkpoint,
        err: OrchestratorError,
    ) -> Result<LaneReport> {
        match err {
            OrchestratorError::EscalationPending { escalations, .. } => Ok(LaneReport::Parked {
                escalations,
                checkpoint: checkpoint.clone(),
            }),
            err @ OrchestratorError::EscalationCancelled { .. } => {
                self.fail(machine, checkpoint, err.to_string())
            }
            err => Err(err),
        }
    }

    /// Roll the lane back to its start and release its worktree.
    fn fail(
        &self,
        machine: &mut WorkflowMachine<'_>,
        checkpoint: &Checkpoint,
        reason: String,
    ) -> Result<LaneReport> {
        warn!(unit = %machine.id(), reason = %reason, "lane failed, rolling back");
        machine.rollback(checkpoint)?;
        self.services.worktrees.destroy(machine.id())?;
        Ok(LaneReport::Failed(reason))
    }
}

fn prerequisites_done(graph: &DependencyGraph, unit: &str, done: &BTreeSet<String>) -> bool {
    graph
        .hard_dependencies(unit)
        .iter()
        .all(|dep| done.contains(*dep))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Harness, ScriptedLaneRunner, diamond, unit};

    #[test]
    fn plan_orders_queue_by_depth_then_id() {
        let graph = DependencyGraph::from_units(vec![
            unit("z", &[]),
            unit("a", &["z"]),
            unit("m", &[]),
            unit("b", &["m", "a"]),
        ])
        .expect("graph");
        let plan = Scheduler::plan(&graph, 0);
        assert_eq!(plan.queue, vec!["m", "z", "a", "b"]);
        assert_eq!(plan.max_parallel, 1);
    }

    #[test]
    fn diamond_runs_to_completion_in_dependency_order() {
        let harness = Harness::new();
        let graph = DependencyGraph::from_units(diamond()).expect("graph");
        let plan = Scheduler::plan(&graph, 2);
        let runner = ScriptedLaneRunner::new();
        let report = harness.scheduler().run(&plan, &runner).expect("run");

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.completed.len(), 4);
        assert_eq!(report.completed[0], "A");
        assert_eq!(report.completed[3], "D");
        assert!(runner.max_concurrency() <= 2);
        assert!(
            harness
                .worktrees
                .list()
                .expect("list")
                .iter()
                .all(|w| !w.is_active())
        );
    }

    #[test]
    fn dependency_unmet_aborts_run() {
        let harness = Harness::new();
        let graph = DependencyGraph::from_units(vec![unit("a", &[]), unit("b", &["a"])])
            .expect("graph");
        let scheduler = harness.scheduler();
        assert!(matches!(
            scheduler.check_dependencies(&graph, "b"),
            Err(OrchestratorError::DependencyUnmet { ref dependency, .. }) if dependency == "a"
        ));
    }
}
