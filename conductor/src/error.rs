//! Error taxonomy for the orchestration core.
//!
//! Structural errors (cycle, invalid transition, worktree conflict, unmet
//! dependency) are never retried. `EscalationPending` is a control-flow
//! signal, not a defect. CLI glue wraps these in `anyhow`.

use std::path::PathBuf;

use thiserror::Error;

use crate::core::graph::GraphError;
use crate::core::lifecycle::InvalidTransition;
use crate::core::types::{DecisionKind, EscalationStatus, LifecycleState};

/// Failures of the state store. A failed write never leaves a partial value.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid state key '{0}'")]
    InvalidKey(String),
    #[error("write state key '{key}' at {}", .path.display())]
    Write {
        key: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("read state key '{key}' at {}", .path.display())]
    Read {
        key: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encode state key '{key}'")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("decode state key '{key}'")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// A unit was about to start before a hard prerequisite completed.
    /// This is a scheduler bug, not a runtime condition.
    #[error("unit '{unit}' started before dependency '{dependency}' completed (state: {state})")]
    DependencyUnmet {
        unit: String,
        dependency: String,
        state: LifecycleState,
    },

    #[error("unit '{unit}' already has an active worktree at {}", .path.display())]
    WorktreeConflict { unit: String, path: PathBuf },

    #[error("persistence failed")]
    Persistence(#[from] StoreError),

    #[error("workflow '{owner}' is blocked on pending escalation(s): {}", .escalations.join(", "))]
    EscalationPending {
        owner: String,
        escalations: Vec<String>,
    },

    #[error("workflow '{owner}' was abandoned: escalation '{escalation}' was cancelled")]
    EscalationCancelled { owner: String, escalation: String },

    #[error("escalation '{id}' is already {status}")]
    EscalationClosed { id: String, status: EscalationStatus },

    #[error("unknown escalation '{0}'")]
    UnknownEscalation(String),

    #[error("escalation '{id}' expects a {expected} response, got {got}")]
    InvalidResponse {
        id: String,
        expected: DecisionKind,
        got: DecisionKind,
    },

    #[error("checkpoint of '{owner}' cannot restore workflow '{workflow}'")]
    CheckpointMismatch { workflow: String, owner: String },

    #[error("{operation} failed: {message}")]
    ExternalCall { operation: String, message: String },
}

impl OrchestratorError {
    pub fn external(operation: impl Into<String>, err: &anyhow::Error) -> Self {
        OrchestratorError::ExternalCall {
            operation: operation.into(),
            message: format!("{err:#}"),
        }
    }
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;
