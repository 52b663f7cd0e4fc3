//! Shared deterministic types for the orchestration core.
//!
//! These types define stable contracts between components and the persisted
//! formats under `.conductor/state/`. They carry no I/O and never read the
//! clock; callers pass timestamps in.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state shared by work units and their workflow state machines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    #[default]
    NotStarted,
    InProgress,
    Review,
    Complete,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::NotStarted => "not_started",
            LifecycleState::InProgress => "in_progress",
            LifecycleState::Review => "review",
            LifecycleState::Complete => "complete",
        }
    }

    pub fn is_terminal(self) -> bool {
        self == LifecycleState::Complete
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_weight() -> f64 {
    1.0
}

/// A single schedulable item declared in the plan file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: String,
    /// Blocking prerequisites.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    /// Advisory ordering hints, never enforced.
    #[serde(default)]
    pub soft_dependencies: BTreeSet<String>,
    #[serde(default)]
    pub status: LifecycleState,
    /// Effort estimate used for critical-path weighting.
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Free-form labels carried through to the graph export.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl WorkUnit {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            dependencies: BTreeSet::new(),
            soft_dependencies: BTreeSet::new(),
            status: LifecycleState::NotStarted,
            weight: default_weight(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn soft_depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.soft_dependencies
            .extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

/// Whether an edge blocks scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    Hard,
    Soft,
}

impl EdgeKind {
    pub fn is_blocking(self) -> bool {
        self == EdgeKind::Hard
    }
}

/// Directed dependency: `to` depends on `from`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub from: String,
    pub to: String,
    pub kind: EdgeKind,
}

impl DependencyEdge {
    pub fn hard(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            kind: EdgeKind::Hard,
        }
    }

    pub fn soft(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            kind: EdgeKind::Soft,
        }
    }
}

/// Shape a decision value must take, chosen by the caller.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    #[default]
    Choice,
    Approval,
    Number,
    Text,
}

impl DecisionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DecisionKind::Choice => "choice",
            DecisionKind::Approval => "approval",
            DecisionKind::Number => "number",
            DecisionKind::Text => "text",
        }
    }
}

impl fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision payload, tagged by kind so consumers can match exhaustively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DecisionValue {
    Choice(String),
    Approval(bool),
    Number(f64),
    Text(String),
}

impl DecisionValue {
    pub fn kind(&self) -> DecisionKind {
        match self {
            DecisionValue::Choice(_) => DecisionKind::Choice,
            DecisionValue::Approval(_) => DecisionKind::Approval,
            DecisionValue::Number(_) => DecisionKind::Number,
            DecisionValue::Text(_) => DecisionKind::Text,
        }
    }

    /// Parse an operator-supplied string into a value of `kind`.
    pub fn parse(kind: DecisionKind, raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        match kind {
            DecisionKind::Choice => {
                if raw.is_empty() {
                    return Err("choice must not be empty".to_string());
                }
                Ok(DecisionValue::Choice(raw.to_string()))
            }
            DecisionKind::Approval => match raw.to_ascii_lowercase().as_str() {
                "yes" | "y" | "true" | "approve" | "approved" => Ok(DecisionValue::Approval(true)),
                "no" | "n" | "false" | "reject" | "rejected" => Ok(DecisionValue::Approval(false)),
                other => Err(format!("approval must be yes/no (got '{other}')")),
            },
            DecisionKind::Number => raw
                .parse::<f64>()
                .ok()
                .filter(|n| n.is_finite())
                .map(DecisionValue::Number)
                .ok_or_else(|| format!("number must be a finite float (got '{raw}')")),
            DecisionKind::Text => Ok(DecisionValue::Text(raw.to_string())),
        }
    }
}

impl fmt::Display for DecisionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecisionValue::Choice(v) | DecisionValue::Text(v) => f.write_str(v),
            DecisionValue::Approval(true) => f.write_str("yes"),
            DecisionValue::Approval(false) => f.write_str("no"),
            DecisionValue::Number(n) => write!(f, "{n}"),
        }
    }
}

/// Where an accepted decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionSource {
    Knowledge,
    Reasoner,
    Human,
}

/// A decision the caller may act on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub value: DecisionValue,
    pub confidence: f64,
    pub source: DecisionSource,
    pub reasoning: String,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum EscalationStatus {
    Pending,
    Resolved,
    Cancelled,
}

impl EscalationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EscalationStatus::Pending => "pending",
            EscalationStatus::Resolved => "resolved",
            EscalationStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for EscalationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted request for a human decision.
///
/// Records are append-only: once `status` leaves `Pending` nothing else changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    pub id: String,
    pub owner_workflow_id: String,
    pub step: u32,
    pub question: String,
    pub kind: DecisionKind,
    pub confidence: f64,
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    pub status: EscalationStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub response: Option<DecisionValue>,
}

impl Escalation {
    pub fn is_pending(&self) -> bool {
        self.status == EscalationStatus::Pending
    }

    /// Caller-supplied category tag, used for metrics breakdowns.
    pub fn category(&self) -> Option<&str> {
        self.context.get("category").map(String::as_str)
    }
}
