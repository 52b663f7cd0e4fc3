//! Test-only helpers: deterministic builders, scripted collaborators and a
//! throwaway state directory wired with every service.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};

use crate::core::types::{
    DecisionKind, DecisionValue, Escalation, EscalationStatus, WorkUnit,
};
use crate::gate::DecisionGate;
use crate::hooks::HookRegistry;
use crate::io::reasoner::{Reasoner, Reasoning, ReasoningRequest};
use crate::io::store::StateStore;
use crate::io::worktree::{WorktreeBackend, WorktreeCoordinator};
use crate::lane::{Lane, LaneOutcome, LaneRunner};
use crate::scheduler::{FailurePolicy, Scheduler, SchedulerOptions};
use crate::workflow::Services;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Unit with weight 1 and the given hard dependencies.
pub fn unit(id: &str, deps: &[&str]) -> WorkUnit {
    WorkUnit::new(id).depends_on(deps.iter().copied())
}

pub fn weighted(id: &str, weight: f64, deps: &[&str]) -> WorkUnit {
    unit(id, deps).with_weight(weight)
}

/// `A -> {B, C} -> D`, all weight 1.
pub fn diamond() -> Vec<WorkUnit> {
    vec![
        unit("A", &[]),
        unit("B", &["A"]),
        unit("C", &["A"]),
        unit("D", &["B", "C"]),
    ]
}

pub fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

/// Escalation created at a fixed instant, with no response.
pub fn escalation(id: &str, owner: &str, status: EscalationStatus) -> Escalation {
    Escalation {
        id: id.to_string(),
        owner_workflow_id: owner.to_string(),
        step: 0,
        question: format!("{id}?"),
        kind: DecisionKind::Choice,
        confidence: 0.5,
        context: BTreeMap::new(),
        status,
        created_at: at(1_700_000_000),
        resolved_at: None,
        response: None,
    }
}

/// Reasoner that replays queued answers, then a fallback if one is set.
#[derive(Default)]
pub struct ScriptedReasoner {
    answers: Mutex<VecDeque<Reasoning>>,
    fallback: Option<Reasoning>,
    delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl ScriptedReasoner {
    /// Answers in order; once exhausted every call fails (and escalates).
    pub fn new(answers: Vec<Reasoning>) -> Self {
        Self {
            answers: Mutex::new(answers.into()),
            ..Self::default()
        }
    }

    /// Always answers `value` with `confidence`.
    pub fn fixed(value: DecisionValue, confidence: f64) -> Self {
        Self {
            fallback: Some(answer(value, confidence)),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

pub fn answer(value: DecisionValue, confidence: f64) -> Reasoning {
    Reasoning {
        value,
        confidence,
        reasoning: "scripted".to_string(),
    }
}

impl Reasoner for ScriptedReasoner {
    fn reason(&self, _request: &ReasoningRequest) -> Result<Reasoning> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        lock(&self.answers)
            .pop_front()
            .or_else(|| self.fallback.clone())
            .ok_or_else(|| anyhow!("scripted reasoner has no answer"))
    }
}

/// Worktree backend that creates plain directories and records every call.
#[derive(Default)]
pub struct ScriptedBackend {
    calls: Mutex<Vec<String>>,
    fail_add: Mutex<Option<String>>,
    unmerged: Mutex<BTreeSet<String>>,
    branches: Mutex<BTreeSet<String>>,
    /// Branch checked out at each live path.
    checked_out: Mutex<BTreeMap<PathBuf, String>>,
}

impl ScriptedBackend {
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    /// Make the next `add` fail with `message`.
    pub fn fail_next_add(&self, message: &str) {
        *lock(&self.fail_add) = Some(message.to_string());
    }

    /// Make `delete_branch` refuse `branch`.
    pub fn mark_unmerged(&self, branch: &str) {
        lock(&self.unmerged).insert(branch.to_string());
    }
}

impl WorktreeBackend for ScriptedBackend {
    fn add(&self, path: &Path, branch: &str, base: &str) -> Result<()> {
        let mut branches = lock(&self.branches);
        let call = if branches.contains(branch) {
            format!("attach {branch}")
        } else {
            format!("add {branch} {base}")
        };
        lock(&self.calls).push(call);
        if let Some(message) = lock(&self.fail_add).take() {
            return Err(anyhow!(message));
        }
        let mut checked_out = lock(&self.checked_out);
        if checked_out.values().any(|held| held == branch) {
            return Err(anyhow!("fatal: '{branch}' is already checked out"));
        }
        fs::create_dir_all(path)?;
        branches.insert(branch.to_string());
        checked_out.insert(path.to_path_buf(), branch.to_string());
        Ok(())
    }

    fn remove(&self, path: &Path) -> Result<()> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        lock(&self.calls).push(format!("remove {name}"));
        lock(&self.checked_out).remove(path);
        if path.exists() {
            fs::remove_dir_all(path)?;
        }
        Ok(())
    }

    fn delete_branch(&self, branch: &str) -> Result<bool> {
        lock(&self.calls).push(format!("delete-branch {branch}"));
        if lock(&self.unmerged).contains(branch) {
            return Ok(false);
        }
        lock(&self.branches).remove(branch);
        Ok(true)
    }
}

/// Lane runner that replays a per-unit script; unscripted calls finish the unit.
#[derive(Default)]
pub struct ScriptedLaneRunner {
    scripts: Mutex<BTreeMap<String, VecDeque<LaneOutcome>>>,
    invocations: Mutex<Vec<Lane>>,
    delay: Duration,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedLaneRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep each invocation busy for `delay`, so lanes overlap.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn script(&self, unit: &str, outcomes: Vec<LaneOutcome>) {
        lock(&self.scripts)
            .entry(unit.to_string())
            .or_default()
            .extend(outcomes);
    }

    pub fn invocations(&self) -> Vec<Lane> {
        lock(&self.invocations).clone()
    }

    pub fn invocations_of(&self, unit: &str) -> Vec<Lane> {
        self.invocations()
            .into_iter()
            .filter(|lane| lane.unit == unit)
            .collect()
    }

    /// Highest number of lanes observed running at once.
    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

impl LaneRunner for ScriptedLaneRunner {
    fn run(&self, lane: &Lane) -> Result<LaneOutcome> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        lock(&self.invocations).push(lane.clone());
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        let outcome = lock(&self.scripts)
            .get_mut(&lane.unit)
            .and_then(VecDeque::pop_front)
            .unwrap_or(LaneOutcome::Done);
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(outcome)
    }
}

/// Every service wired over one throwaway directory.
pub struct Harness {
    _temp: Option<tempfile::TempDir>,
    pub root: PathBuf,
    pub store: StateStore,
    pub gate: DecisionGate,
    pub worktrees: WorktreeCoordinator,
    pub hooks: HookRegistry,
    pub backend: Arc<ScriptedBackend>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_reasoner(ScriptedReasoner::default())
    }

    pub fn with_reasoner(reasoner: ScriptedReasoner) -> Self {
        let temp = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let root = temp.path().to_path_buf();
        let mut harness = Self::at(&root, reasoner);
        harness._temp = Some(temp);
        harness
    }

    /// Services over an existing directory, as a restarted process would see it.
    pub fn at(root: &Path, reasoner: ScriptedReasoner) -> Self {
        let state_dir = root.join("state");
        fs::create_dir_all(&state_dir).unwrap_or_else(|err| panic!("state dir: {err}"));
        let store = StateStore::new(&state_dir);
        let backend = Arc::new(ScriptedBackend::default());
        let gate = DecisionGate::new(store.clone(), Arc::new(reasoner))
            .with_timeout(Duration::from_secs(1));
        let worktrees = WorktreeCoordinator::new(
            store.clone(),
            backend.clone(),
            root.join("worktrees"),
            "conductor/",
        );
        Self {
            _temp: None,
            root: root.to_path_buf(),
            store,
            gate,
            worktrees,
            hooks: HookRegistry::new(),
            backend,
        }
    }

    pub fn services(&self) -> Services<'_> {
        Services {
            store: &self.store,
            gate: &self.gate,
            worktrees: &self.worktrees,
            hooks: &self.hooks,
        }
    }

    pub fn options() -> SchedulerOptions {
        SchedulerOptions {
            base_branch: "main".to_string(),
            poll_interval: Duration::from_millis(10),
            wait_for_escalations: false,
            failure: FailurePolicy::default(),
        }
    }

    pub fn scheduler(&self) -> Scheduler<'_> {
        self.scheduler_with(Self::options())
    }

    pub fn scheduler_with(&self, options: SchedulerOptions) -> Scheduler<'_> {
        Scheduler::new(self.services(), options)
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// Throwaway git repository with one commit on `main`.
pub struct TestRepo {
    _temp: tempfile::TempDir,
    pub path: PathBuf,
}

impl TestRepo {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let path = temp.path().join("repo");
        fs::create_dir_all(&path).unwrap_or_else(|err| panic!("repo dir: {err}"));
        let repo = Self { _temp: temp, path };
        repo.git(&["init", "-q"]);
        repo.git(&["symbolic-ref", "HEAD", "refs/heads/main"]);
        repo.git(&["config", "user.name", "Conductor Test"]);
        repo.git(&["config", "user.email", "conductor@example.com"]);
        repo.git(&["config", "commit.gpgsign", "false"]);
        fs::write(repo.path.join("README.md"), "# test\n")
            .unwrap_or_else(|err| panic!("write readme: {err}"));
        repo.git(&["add", "README.md"]);
        repo.git(&["commit", "-q", "-m", "initial"]);
        repo
    }

    /// Run git in the repo and return stdout; panics on failure.
    pub fn git(&self, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.path)
            .output()
            .unwrap_or_else(|err| panic!("spawn git {args:?}: {err}"));
        assert!(
            output.status.success(),
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).into_owned()
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}
