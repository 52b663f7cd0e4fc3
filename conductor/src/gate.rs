//! Escalation & decision gate.
//!
//! Answers come from the local knowledge base first, then from the reasoner.
//! An answer below the confidence threshold, a reasoner failure, a timeout
//! or an answer of the wrong kind all turn into a persisted `pending`
//! escalation that a human resolves or cancels through the inbox.

use std::collections::BTreeMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::metrics::{EscalationMetrics, compute_metrics};
use crate::core::types::{
    Decision, DecisionKind, DecisionSource, DecisionValue, Escalation, EscalationStatus,
};
use crate::error::{OrchestratorError, Result, StoreError};
use crate::io::config::ConductorConfig;
use crate::io::knowledge::KnowledgeBase;
use crate::io::reasoner::{Reasoner, Reasoning, ReasoningRequest, SamplingConfig};
use crate::io::store::StateStore;

/// Confidence reported for exact knowledge-base matches.
pub const KNOWLEDGE_CONFIDENCE: f64 = 0.95;
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.75;

const ESCALATIONS: &str = "escalations";
const DECISIONS_JOURNAL: &str = "decisions";
/// Context key recording why a question was escalated.
pub const ESCALATION_REASON_KEY: &str = "escalation_reason";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRequest {
    pub owner: String,
    pub step: u32,
    pub question: String,
    pub kind: DecisionKind,
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

impl DecisionRequest {
    pub fn new(
        owner: impl Into<String>,
        step: u32,
        question: impl Into<String>,
        kind: DecisionKind,
    ) -> Self {
        Self {
            owner: owner.into(),
            step,
            question: question.into(),
            kind,
            context: BTreeMap::new(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Accepted(Decision),
    Escalated(Escalation),
}

/// One line of the `decisions.jsonl` audit journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub owner: String,
    pub step: u32,
    pub question: String,
    pub value: DecisionValue,
    pub confidence: f64,
    pub reasoning: String,
    pub source: DecisionSource,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EscalationFilter {
    pub status: Option<EscalationStatus>,
    pub owner: Option<String>,
}

impl EscalationFilter {
    fn matches(&self, escalation: &Escalation) -> bool {
        self.status.is_none_or(|s| s == escalation.status)
            && self
                .owner
                .as_deref()
                .is_none_or(|o| o == escalation.owner_workflow_id)
    }
}

pub struct DecisionGate {
    store: StateStore,
    knowledge: KnowledgeBase,
    reasoner: Arc<dyn Reasoner>,
    sampling: SamplingConfig,
    confidence_threshold: f64,
    reasoning_timeout: Duration,
    /// Serializes read-modify-write of escalation records in this process.
    records: Mutex<()>,
}

impl DecisionGate {
    pub fn new(store: StateStore, reasoner: Arc<dyn Reasoner>) -> Self {
        Self {
            store,
            knowledge: KnowledgeBase::default(),
            reasoner,
            sampling: SamplingConfig::default(),
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            reasoning_timeout: Duration::from_secs(120),
            records: Mutex::new(()),
        }
    }

    pub fn from_config(
        store: StateStore,
        cfg: &ConductorConfig,
        knowledge: KnowledgeBase,
        reasoner: Arc<dyn Reasoner>,
    ) -> Self {
        Self::new(store, reasoner)
            .with_knowledge(knowledge)
            .with_threshold(cfg.confidence_threshold)
            .with_timeout(cfg.reasoning_timeout())
            .with_sampling(SamplingConfig {
                temperature: cfg.reasoner.temperature,
            })
    }

    pub fn with_knowledge(mut self, knowledge: KnowledgeBase) -> Self {
        self.knowledge = knowledge;
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.reasoning_timeout = timeout;
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingConfig) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn confidence_threshold(&self) -> f64 {
        self.confidence_threshold
    }

    /// Answer `request`, or escalate it to a human.
    #[instrument(skip_all, fields(owner = %request.owner, step = request.step, kind = %request.kind))]
    pub fn decide(&self, request: &DecisionRequest) -> Result<Verdict> {
        let candidate = match self.knowledge.lookup(&request.question, request.kind) {
            Some(value) => Ok(Decision {
                value: value.clone(),
                confidence: KNOWLEDGE_CONFIDENCE,
                source: DecisionSource::Knowledge,
                reasoning: "exact match in knowledge base".to_string(),
            }),
            None => self.ask_reasoner(request),
        };

        match candidate {
            Ok(decision) if decision.confidence >= self.confidence_threshold => {
                self.record(request, &decision)?;
                debug!(source = ?decision.source, confidence = decision.confidence, "decision accepted");
                Ok(Verdict::Accepted(decision))
            }
            Ok(decision) => {
                let reason = format!(
                    "confidence {:.2} below threshold {:.2}",
                    decision.confidence, self.confidence_threshold
                );
                self.escalate(request, decision.confidence, reason)
                    .map(Verdict::Escalated)
            }
            Err(reason) => self.escalate(request, 0.0, reason).map(Verdict::Escalated),
        }
    }

    /// Escalations matching `filter`, oldest first.
    pub fn list(&self, filter: &EscalationFilter) -> Result<Vec<Escalation>> {
        let mut escalations: Vec<Escalation> = self.store.load_all(ESCALATIONS)?;
        escalations.retain(|e| filter.matches(e));
        escalations.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(escalations)
    }

    pub fn get(&self, id: &str) -> Result<Escalation> {
        match self.store.load(&escalation_key(id)) {
            Ok(Some(escalation)) => Ok(escalation),
            Ok(None) | Err(StoreError::InvalidKey(_)) => {
                Err(OrchestratorError::UnknownEscalation(id.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Record a human response. Closed escalations cannot be resolved again.
    #[instrument(skip_all, fields(id = %id))]
    pub fn resolve(&self, id: &str, response: DecisionValue) -> Result<Escalation> {
        let _guard = self.lock_records();
        let mut escalation = self.get_pending(id)?;
        if response.kind() != escalation.kind {
            return Err(OrchestratorError::InvalidResponse {
                id: id.to_string(),
                expected: escalation.kind,
                got: response.kind(),
            });
        }
        let now = Utc::now();
        escalation.status = EscalationStatus::Resolved;
        escalation.resolved_at = Some(now);
        escalation.response = Some(response.clone());
        self.store.persist(&escalation_key(id), &escalation)?;
        self.store.append(
            DECISIONS_JOURNAL,
            &DecisionRecord {
                owner: escalation.owner_workflow_id.clone(),
                step: escalation.step,
                question: escalation.question.clone(),
                value: response,
                confidence: 1.0,
                reasoning: format!("resolved escalation {id}"),
                source: DecisionSource::Human,
                timestamp: now,
            },
        )?;
        info!(owner = %escalation.owner_workflow_id, "escalation resolved");
        Ok(escalation)
    }

    /// Abandon an escalation; its owner will be rolled back.
    #[instrument(skip_all, fields(id = %id))]
    pub fn cancel(&self, id: &str) -> Result<Escalation> {
        let _guard = self.lock_records();
        let mut escalation = self.get_pending(id)?;
        escalation.status = EscalationStatus::Cancelled;
        escalation.resolved_at = Some(Utc::now());
        self.store.persist(&escalation_key(id), &escalation)?;
        info!(owner = %escalation.owner_workflow_id, "escalation cancelled");
        Ok(escalation)
    }

    pub fn pending_for(&self, owner: &str) -> Result<Vec<Escalation>> {
        self.list(&EscalationFilter {
            status: Some(EscalationStatus::Pending),
            owner: Some(owner.to_string()),
        })
    }

    /// Most recent escalation raised for this exact question at this step.
    pub fn resolution_for(
        &self,
        owner: &str,
        step: u32,
        question: &str,
    ) -> Result<Option<Escalation>> {
        let matching = self.list(&EscalationFilter {
            status: None,
            owner: Some(owner.to_string()),
        })?;
        Ok(matching
            .into_iter()
            .rev()
            .find(|e| e.step == step && e.question == question))
    }

    pub fn metrics(&self) -> Result<EscalationMetrics> {
        let all: Vec<Escalation> = self.store.load_all(ESCALATIONS)?;
        Ok(compute_metrics(&all))
    }

    /// The audit journal, in append order.
    pub fn decisions(&self) -> Result<Vec<DecisionRecord>> {
        Ok(self.store.read_journal(DECISIONS_JOURNAL)?)
    }

    fn get_pending(&self, id: &str) -> Result<Escalation> {
        let escalation = self.get(id)?;
        if !escalation.is_pending() {
            return Err(OrchestratorError::EscalationClosed {
                id: id.to_string(),
                status: escalation.status,
            });
        }
        Ok(escalation)
    }

    /// Ask the reasoner under a deadline. `Err` carries the escalation reason.
    fn ask_reasoner(&self, request: &DecisionRequest) -> std::result::Result<Decision, String> {
        let reasoning_request = ReasoningRequest {
            question: request.question.clone(),
            kind: request.kind,
            context: request.context.clone(),
            sampling: self.sampling,
        };
        let reasoning = self.reason_with_deadline(reasoning_request)?;
        if reasoning.value.kind() != request.kind {
            return Err(format!(
                "reasoner answered with a {} value, expected {}",
                reasoning.value.kind(),
                request.kind
            ));
        }
        if !(0.0..=1.0).contains(&reasoning.confidence) {
            return Err(format!(
                "reasoner confidence {} is outside [0, 1]",
                reasoning.confidence
            ));
        }
        Ok(Decision {
            value: reasoning.value,
            confidence: reasoning.confidence,
            source: DecisionSource::Reasoner,
            reasoning: reasoning.reasoning,
        })
    }

    fn reason_with_deadline(
        &self,
        request: ReasoningRequest,
    ) -> std::result::Result<Reasoning, String> {
        let (tx, rx) = mpsc::channel();
        let reasoner = Arc::clone(&self.reasoner);
        // A reasoner that outlives the deadline finishes on its own thread;
        // its late answer is dropped with the channel.
        thread::Builder::new()
            .name("reasoner".to_string())
            .spawn(move || {
                let _ = tx.send(reasoner.reason(&request));
            })
            .map_err(|err| format!("spawn reasoner thread: {err}"))?;

        match rx.recv_timeout(self.reasoning_timeout) {
            Ok(Ok(reasoning)) => Ok(reasoning),
            Ok(Err(err)) => {
                warn!(err = %err, "reasoner failed");
                Err(format!("reasoner failed: {err:#}"))
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(timeout_ms = self.reasoning_timeout.as_millis() as u64, "reasoner timed out");
                Err(format!(
                    "reasoner timed out after {}ms",
                    self.reasoning_timeout.as_millis()
                ))
            }
            Err(RecvTimeoutError::Disconnected) => Err("reasoner thread panicked".to_string()),
        }
    }

    fn record(&self, request: &DecisionRequest, decision: &Decision) -> Result<()> {
        self.store.append(
            DECISIONS_JOURNAL,
            &DecisionRecord {
                owner: request.owner.clone(),
                step: request.step,
                question: request.question.clone(),
                value: decision.value.clone(),
                confidence: decision.confidence,
                reasoning: decision.reasoning.clone(),
                source: decision.source,
                timestamp: Utc::now(),
            },
        )?;
        Ok(())
    }

    fn escalate(
        &self,
        request: &DecisionRequest,
        confidence: f64,
        reason: String,
    ) -> Result<Escalation> {
        let mut context = request.context.clone();
        context.insert(ESCALATION_REASON_KEY.to_string(), reason);
        let escalation = Escalation {
            id: uuid::Uuid::new_v4().to_string(),
            owner_workflow_id: request.owner.clone(),
            step: request.step,
            question: request.question.clone(),
            kind: request.kind,
            confidence,
            context,
            status: EscalationStatus::Pending,
            created_at: Utc::now(),
            resolved_at: None,
            response: None,
        };
        self.store
            .persist(&escalation_key(&escalation.id), &escalation)?;
        info!(id = %escalation.id, confidence, "decision escalated");
        Ok(escalation)
    }

    fn lock_records(&self) -> MutexGuard<'_, ()> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn escalation_key(id: &str) -> String {
    format!("{ESCALATIONS}/{id}")
}
