//! Reasoning backends consulted by the decision gate.
//!
//! The gate never talks to a model directly. It hands a [`ReasoningRequest`]
//! to a [`Reasoner`] and gets back a value with a self-reported confidence.

use std::collections::BTreeMap;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::core::types::{DecisionKind, DecisionValue};
use crate::io::config::ReasonerConfig;
use crate::io::process::run_command_with_timeout;

/// Sampling knobs forwarded to the backend. Decisions want low variance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    pub temperature: f64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self { temperature: 0.1 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningRequest {
    pub question: String,
    pub kind: DecisionKind,
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    pub sampling: SamplingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reasoning {
    pub value: DecisionValue,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
}

pub trait Reasoner: Send + Sync {
    fn reason(&self, request: &ReasoningRequest) -> Result<Reasoning>;
}

/// Used when no reasoner command is configured: every question goes to a human.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoReasoner;

impl Reasoner for NoReasoner {
    fn reason(&self, _request: &ReasoningRequest) -> Result<Reasoning> {
        Err(anyhow!("no reasoner configured"))
    }
}

/// Pipes the request as JSON to a command and parses its JSON answer.
#[derive(Debug, Clone)]
pub struct CommandReasoner {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandReasoner {
    pub fn new(command: Vec<String>, timeout: Duration, output_limit_bytes: usize) -> Result<Self> {
        if command.is_empty() {
            return Err(anyhow!("reasoner command must not be empty"));
        }
        Ok(Self {
            command,
            timeout,
            output_limit_bytes,
        })
    }

    pub fn from_config(cfg: &ReasonerConfig) -> Result<Self> {
        Self::new(
            cfg.command.clone(),
            Duration::from_secs(cfg.timeout_secs),
            cfg.output_limit_bytes,
        )
    }
}

impl Reasoner for CommandReasoner {
    #[instrument(skip_all, fields(kind = %request.kind))]
    fn reason(&self, request: &ReasoningRequest) -> Result<Reasoning> {
        let input = serde_json::to_vec(request).context("serialize reasoning request")?;
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..]);
        let output =
            run_command_with_timeout(cmd, Some(&input), self.timeout, self.output_limit_bytes)?;
        if output.timed_out {
            return Err(anyhow!("reasoner timed out after {:?}", self.timeout));
        }
        if !output.success() {
            return Err(anyhow!(
                "reasoner exited with {}: {}",
                output.status,
                output.stderr_text()
            ));
        }
        let reasoning: Reasoning = serde_json::from_slice(&output.stdout)
            .context("parse reasoner output as JSON")?;
        debug!(confidence = reasoning.confidence, "reasoner answered");
        Ok(reasoning)
    }
}

/// Build the configured reasoner.
pub fn reasoner_from_config(cfg: &ReasonerConfig) -> Result<Box<dyn Reasoner>> {
    if cfg.command.is_empty() {
        return Ok(Box::new(NoReasoner));
    }
    Ok(Box::new(CommandReasoner::from_config(cfg)?))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn request() -> ReasoningRequest {
        ReasoningRequest {
            question: "which database?".to_string(),
            kind: DecisionKind::Choice,
            context: BTreeMap::new(),
            sampling: SamplingConfig::default(),
        }
    }

    fn sh(script: &str) -> CommandReasoner {
        CommandReasoner::new(
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            Duration::from_secs(5),
            10_000,
        )
        .expect("reasoner")
    }

    #[test]
    fn parses_json_answer() {
        let reasoner = sh(
            r#"cat >/dev/null; printf '{"value":{"kind":"choice","value":"postgres"},"confidence":0.9,"reasoning":"ok"}'"#,
        );
        let answer = reasoner.reason(&request()).expect("reason");
        assert_eq!(answer.value, DecisionValue::Choice("postgres".to_string()));
        assert_eq!(answer.confidence, 0.9);
    }

    #[test]
    fn request_reaches_stdin() {
        let reasoner = sh(
            r#"grep -q '"temperature":0.1' && printf '{"value":{"kind":"approval","value":true},"confidence":1.0}'"#,
        );
        let answer = reasoner.reason(&request()).expect("reason");
        assert_eq!(answer.value, DecisionValue::Approval(true));
    }

    #[test]
    fn non_zero_exit_is_an_error() {
        let reasoner = sh("cat >/dev/null; echo boom >&2; exit 3");
        let err = reasoner.reason(&request()).expect_err("fails");
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn empty_command_falls_back_to_no_reasoner() {
        let reasoner = reasoner_from_config(&ReasonerConfig::default()).expect("build");
        assert!(reasoner.reason(&request()).is_err());
    }
}
