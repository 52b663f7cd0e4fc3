//! Workflow lifecycle rules: the legal transition table, timestamp stamping,
//! and checkpoint capture/restore.
//!
//! Everything here mutates in-memory values only. Persisting the result is
//! the job of [`crate::workflow::WorkflowMachine`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::LifecycleState;

/// Rejected lifecycle transition. The state it was attempted on is unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: LifecycleState,
    pub to: LifecycleState,
}

/// True for the four edges of the lifecycle graph.
pub fn is_legal_transition(from: LifecycleState, to: LifecycleState) -> bool {
    use crate::core::types::LifecycleState::{Complete, InProgress, NotStarted, Review};
    matches!(
        (from, to),
        (NotStarted, InProgress) | (InProgress, Review) | (InProgress, Complete) | (Review, InProgress)
    )
}

/// Persisted lifecycle of one work unit (`workflows/<id>`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub id: String,
    pub current_state: LifecycleState,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Index of the next step the lane will execute.
    pub step_pointer: u32,
    /// Lane attempts started for this unit, including the current one.
    #[serde(default)]
    pub attempts: u32,
}

impl WorkflowState {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            current_state: LifecycleState::NotStarted,
            started_at: None,
            completed_at: None,
            step_pointer: 0,
            attempts: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.current_state.is_terminal()
    }

    /// Move to `next`, stamping `started_at` on first entry to `InProgress`
    /// and `completed_at` on entry to `Complete`.
    pub fn apply_transition(
        &mut self,
        next: LifecycleState,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        if !is_legal_transition(self.current_state, next) {
            return Err(InvalidTransition {
                from: self.current_state,
                to: next,
            });
        }
        self.current_state = next;
        match next {
            LifecycleState::InProgress if self.started_at.is_none() => self.started_at = Some(now),
            LifecycleState::Complete => self.completed_at = Some(now),
            _ => {}
        }
        Ok(())
    }

    /// Snapshot the restorable fields.
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            current_state: self.current_state,
            step_pointer: self.step_pointer,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }

    /// Restore a snapshot. A completed workflow cannot be restored.
    pub fn restore(&mut self, snapshot: &StateSnapshot) -> Result<(), InvalidTransition> {
        if self.is_complete() {
            return Err(InvalidTransition {
                from: self.current_state,
                to: snapshot.current_state,
            });
        }
        self.current_state = snapshot.current_state;
        self.step_pointer = snapshot.step_pointer;
        self.started_at = snapshot.started_at;
        self.completed_at = snapshot.completed_at;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub current_state: LifecycleState,
    pub step_pointer: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Immutable point-in-time snapshot returned to whoever asked for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub workflow_id: String,
    pub timestamp: DateTime<Utc>,
    pub snapshot: StateSnapshot,
}
