//! Per-unit workflow state machine.
//!
//! Every mutation is persisted under `workflows/<id>` before it is reported
//! as done; if the write fails the in-memory state is put back, so memory
//! never runs ahead of the store.

use std::collections::BTreeMap;

use chrono::Utc;
use tracing::{debug, info, instrument};

use crate::core::lifecycle::{Checkpoint, InvalidTransition, WorkflowState, is_legal_transition};
use crate::core::types::{
    Decision, DecisionKind, DecisionSource, EscalationStatus, LifecycleState,
};
use crate::error::{OrchestratorError, Result};
use crate::gate::{DecisionGate, DecisionRequest, Verdict};
use crate::hooks::{HookEvent, HookPoint, HookRegistry};
use crate::io::store::StateStore;
use crate::io::worktree::WorktreeCoordinator;

const NAMESPACE: &str = "workflows";

/// Shared collaborators a workflow needs. Cheap to copy into lane threads.
#[derive(Clone, Copy)]
pub struct Services<'a> {
    pub store: &'a StateStore,
    pub gate: &'a DecisionGate,
    pub worktrees: &'a WorktreeCoordinator,
    pub hooks: &'a HookRegistry,
}

pub fn workflow_key(id: &str) -> String {
    format!("{NAMESPACE}/{id}")
}

/// Persisted state of `id`, if it was ever started.
pub fn load_workflow(store: &StateStore, id: &str) -> Result<Option<WorkflowState>> {
    Ok(store.load(&workflow_key(id))?)
}

/// Every persisted workflow, ordered by id.
pub fn load_workflows(store: &StateStore) -> Result<Vec<WorkflowState>> {
    Ok(store.load_all(NAMESPACE)?)
}

pub struct WorkflowMachine<'a> {
    state: WorkflowState,
    services: Services<'a>,
}

impl<'a> WorkflowMachine<'a> {
    /// Load the persisted state of `id`, or start from `NotStarted`.
    pub fn open(id: &str, services: Services<'a>) -> Result<Self> {
        let state = load_workflow(services.store, id)?.unwrap_or_else(|| WorkflowState::new(id));
        Ok(Self { state, services })
    }

    pub fn id(&self) -> &str {
        &self.state.id
    }

    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    pub fn current_state(&self) -> LifecycleState {
        self.state.current_state
    }

    pub fn step(&self) -> u32 {
        self.state.step_pointer
    }

    /// Move to `next`. Rejected while the workflow has pending escalations.
    ///
    /// `BeforeTransition` hooks run once the move is known to be legal, while
    /// the workflow still holds its old state.
    #[instrument(skip_all, fields(unit = %self.state.id, to = %next))]
    pub fn transition(&mut self, next: LifecycleState) -> Result<()> {
        self.ensure_not_blocked()?;
        let from = self.state.current_state;
        if !is_legal_transition(from, next) {
            return Err(InvalidTransition { from, to: next }.into());
        }

        self.services.hooks.fire(&HookEvent::transition(
            HookPoint::BeforeTransition,
            &self.state.id,
            from,
            next,
        ));
        let previous = self.state.clone();
        self.state.apply_transition(next, Utc::now())?;
        self.commit(previous)?;
        self.services.hooks.fire(&HookEvent::transition(
            HookPoint::AfterTransition,
            &self.state.id,
            from,
            next,
        ));
        info!(from = %from, "transitioned");
        Ok(())
    }

    /// Count a new lane attempt.
    pub fn begin_attempt(&mut self) -> Result<u32> {
        let previous = self.state.clone();
        self.state.attempts += 1;
        self.commit(previous)?;
        Ok(self.state.attempts)
    }

    /// Move the step pointer forward. Rejected while escalations are pending.
    pub fn advance_step(&mut self) -> Result<u32> {
        self.ensure_not_blocked()?;
        let previous = self.state.clone();
        self.state.step_pointer += 1;
        self.commit(previous)?;
        debug!(unit = %self.state.id, step = self.state.step_pointer, "advanced step");
        Ok(self.state.step_pointer)
    }

    /// Capture the current state. Checkpoints are handed back, not stored.
    pub fn create_checkpoint(&self) -> Checkpoint {
        Checkpoint {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: self.state.id.clone(),
            timestamp: Utc::now(),
            snapshot: self.state.snapshot(),
        }
    }

    /// Checkpoint of a never-started unit. Lanes resumed after a restart roll
    /// back to this, since the checkpoint their first run took is gone.
    pub fn initial_checkpoint(&self) -> Checkpoint {
        Checkpoint {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: self.state.id.clone(),
            timestamp: Utc::now(),
            snapshot: WorkflowState::new(self.state.id.clone()).snapshot(),
        }
    }

    /// Restore `checkpoint` and destroy worktrees created since it was taken.
    #[instrument(skip_all, fields(unit = %self.state.id, checkpoint = %checkpoint.id))]
    pub fn rollback(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        if checkpoint.workflow_id != self.state.id {
            return Err(OrchestratorError::CheckpointMismatch {
                workflow: self.state.id.clone(),
                owner: checkpoint.workflow_id.clone(),
            });
        }
        let previous = self.state.clone();
        self.state.restore(&checkpoint.snapshot)?;
        self.commit(previous)?;
        self.services
            .worktrees
            .destroy_created_after(&self.state.id, checkpoint.timestamp)?;
        info!(state = %self.state.current_state, step = self.state.step_pointer, "rolled back");
        Ok(())
    }

    /// Ask a step-scoped question.
    ///
    /// A human answer to the same question at the same step is reused. A
    /// still-pending escalation fails with `EscalationPending`; one cancelled
    /// during the current attempt fails with `EscalationCancelled`.
    pub fn decide(
        &self,
        question: &str,
        kind: DecisionKind,
        context: BTreeMap<String, String>,
    ) -> Result<Decision> {
        let owner = self.state.id.as_str();
        let step = self.state.step_pointer;
        if let Some(previous) = self.services.gate.resolution_for(owner, step, question)? {
            match previous.status {
                EscalationStatus::Pending => {
                    return Err(OrchestratorError::EscalationPending {
                        owner: owner.to_string(),
                        escalations: vec![previous.id],
                    });
                }
                EscalationStatus::Resolved => {
                    if let Some(value) = previous.response {
                        return Ok(Decision {
                            value,
                            confidence: 1.0,
                            source: DecisionSource::Human,
                            reasoning: format!("resolved escalation {}", previous.id),
                        });
                    }
                }
                EscalationStatus::Cancelled => {
                    // Cancellations from an earlier attempt do not bind a retry.
                    let current_attempt = match (previous.resolved_at, self.state.started_at) {
                        (Some(cancelled_at), Some(started_at)) => cancelled_at >= started_at,
                        _ => true,
                    };
                    if current_attempt {
                        return Err(OrchestratorError::EscalationCancelled {
                            owner: owner.to_string(),
                            escalation: previous.id,
                        });
                    }
                }
            }
        }

        let request = DecisionRequest {
            owner: owner.to_string(),
            step,
            question: question.to_string(),
            kind,
            context,
        };
        match self.services.gate.decide(&request)? {
            Verdict::Accepted(decision) => Ok(decision),
            Verdict::Escalated(escalation) => Err(OrchestratorError::EscalationPending {
                owner: owner.to_string(),
                escalations: vec![escalation.id],
            }),
        }
    }

    fn ensure_not_blocked(&self) -> Result<()> {
        let pending = self.services.gate.pending_for(&self.state.id)?;
        if pending.is_empty() {
            return Ok(());
        }
        Err(OrchestratorError::EscalationPending {
            owner: self.state.id.clone(),
            escalations: pending.into_iter().map(|e| e.id).collect(),
        })
    }

    fn commit(&mut self, previous: WorkflowState) -> Result<()> {
        if let Err(err) = self
            .services
            .store
            .persist(&workflow_key(&self.state.id), &self.state)
        {
            self.state = previous;
            return Err(err.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use crate::core::types::DecisionValue;
    use crate::test_support::Harness;

    #[test]
    fn transitions_are_persisted() {
        let harness = Harness::new();
        let services = harness.services();
        let mut machine = WorkflowMachine::open("story-1", services).expect("open");
        machine.transition(LifecycleState::InProgress).expect("start");
        machine.transition(LifecycleState::Complete).expect("complete");

        let stored = load_workflow(&harness.store, "story-1")
            .expect("load")
            .expect("stored");
        assert_eq!(stored.current_state, LifecycleState::Complete);
        assert!(stored.started_at.is_some());
        assert!(stored.completed_at.is_some());
    }

    #[test]
    fn illegal_transition_leaves_store_untouched() {
        let harness = Harness::new();
        let mut machine = WorkflowMachine::open("story-1", harness.services()).expect("open");
        let err = machine.transition(LifecycleState::Complete).expect_err("illegal");
        assert!(matches!(err, OrchestratorError::InvalidTransition(_)));
        assert_eq!(machine.current_state(), LifecycleState::NotStarted);
        assert!(load_workflow(&harness.store, "story-1").expect("load").is_none());
    }

    #[test]
    fn before_hooks_see_the_old_state_and_after_hooks_the_new() {
        let mut harness = Harness::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for (point, label) in [
            (HookPoint::BeforeTransition, "before"),
            (HookPoint::AfterTransition, "after"),
        ] {
            let seen = Arc::clone(&seen);
            let store = harness.store.clone();
            harness.hooks.register(point, label, move |event| {
                let stored = load_workflow(&store, &event.unit)?.map(|s| s.current_state);
                seen.lock().expect("lock").push((label, stored));
                Ok(())
            });
        }

        let mut machine = WorkflowMachine::open("story-1", harness.services()).expect("open");
        machine.transition(LifecycleState::InProgress).expect("start");
        assert!(machine.transition(LifecycleState::NotStarted).is_err());
        machine.transition(LifecycleState::Complete).expect("complete");

        assert_eq!(
            *seen.lock().expect("lock"),
            vec![
                ("before", None),
                ("after", Some(LifecycleState::InProgress)),
                ("before", Some(LifecycleState::InProgress)),
                ("after", Some(LifecycleState::Complete)),
            ]
        );
    }

    #[test]
    fn failed_persist_restores_memory() {
        let harness = Harness::new();
        let mut machine = WorkflowMachine::open("story-1", harness.services()).expect("open");
        // A file where the namespace directory should be makes every write fail.
        std::fs::write(harness.store.root().join("workflows"), b"").expect("block namespace");
        let err = machine.transition(LifecycleState::InProgress).expect_err("persist fails");
        assert!(matches!(err, OrchestratorError::Persistence(_)));
        assert_eq!(machine.current_state(), LifecycleState::NotStarted);
        assert!(machine.state().started_at.is_none());
    }

    #[test]
    fn rollback_restores_checkpoint_and_destroys_new_worktree() {
        let harness = Harness::new();
        let services = harness.services();
        let mut machine = WorkflowMachine::open("story-1", services).expect("open");
        let checkpoint = machine.create_checkpoint();
        machine.transition(LifecycleState::InProgress).expect("start");
        harness.worktrees.create("story-1", "main").expect("worktree");
        machine.advance_step().expect("step");

        machine.rollback(&checkpoint).expect("rollback");
        assert_eq!(machine.current_state(), LifecycleState::NotStarted);
        assert_eq!(machine.step(), 0);
        assert!(harness.worktrees.active("story-1").expect("active").is_none());
        let stored = load_workflow(&harness.store, "story-1").expect("load").expect("stored");
        assert_eq!(stored.current_state, LifecycleState::NotStarted);
    }

    #[test]
    fn rollback_of_completed_workflow_is_rejected() {
        let harness = Harness::new();
        let mut machine = WorkflowMachine::open("story-1", harness.services()).expect("open");
        let checkpoint = machine.create_checkpoint();
        machine.transition(LifecycleState::InProgress).expect("start");
        machine.transition(LifecycleState::Complete).expect("complete");
        assert!(matches!(
            machine.rollback(&checkpoint),
            Err(OrchestratorError::InvalidTransition(_))
        ));
    }

    #[test]
    fn pending_escalation_blocks_progress_until_resolved() {
        let harness = Harness::new();
        let mut machine = WorkflowMachine::open("story-1", harness.services()).expect("open");
        machine.transition(LifecycleState::InProgress).expect("start");

        let err = machine
            .decide("which database?", DecisionKind::Choice, BTreeMap::new())
            .expect_err("escalates");
        let OrchestratorError::EscalationPending { escalations, .. } = err else {
            panic!("expected pending");
        };
        assert!(matches!(
            machine.advance_step(),
            Err(OrchestratorError::EscalationPending { .. })
        ));
        assert!(matches!(
            machine.transition(LifecycleState::Review),
            Err(OrchestratorError::EscalationPending { .. })
        ));

        harness
            .gate
            .resolve(&escalations[0], DecisionValue::Choice("postgres".to_string()))
            .expect("resolve");
        let decision = machine
            .decide("which database?", DecisionKind::Choice, BTreeMap::new())
            .expect("resumed");
        assert_eq!(decision.source, DecisionSource::Human);
        assert_eq!(decision.value, DecisionValue::Choice("postgres".to_string()));
        machine.advance_step().expect("unblocked");
    }

    #[test]
    fn cancelled_escalation_abandons_current_attempt() {
        let harness = Harness::new();
        let mut machine = WorkflowMachine::open("story-1", harness.services()).expect("open");
        machine.transition(LifecycleState::InProgress).expect("start");
        let Err(OrchestratorError::EscalationPending { escalations, .. }) =
            machine.decide("ship it?", DecisionKind::Approval, BTreeMap::new())
        else {
            panic!("expected pending");
        };
        harness.gate.cancel(&escalations[0]).expect("cancel");
        assert!(matches!(
            machine.decide("ship it?", DecisionKind::Approval, BTreeMap::new()),
            Err(OrchestratorError::EscalationCancelled { .. })
        ));
    }

    #[test]
    fn hooks_see_transitions() {
        use std::sync::{Arc, Mutex};
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut harness = Harness::new();
        for point in [HookPoint::BeforeTransition, HookPoint::AfterTransition] {
            let seen = Arc::clone(&seen);
            harness.hooks.register(point, "record", move |event| {
                seen.lock().expect("lock").push((event.point, event.to));
                Ok(())
            });
        }
        let mut machine = WorkflowMachine::open("story-1", harness.services()).expect("open");
        machine.transition(LifecycleState::InProgress).expect("start");
        assert_eq!(
            *seen.lock().expect("lock"),
            vec![
                (HookPoint::BeforeTransition, Some(LifecycleState::InProgress)),
                (HookPoint::AfterTransition, Some(LifecycleState::InProgress)),
            ]
        );
    }
}
