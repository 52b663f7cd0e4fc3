//! Lane runner abstraction.
//!
//! The [`LaneRunner`] trait decouples scheduling from whatever does the work
//! inside a worktree. Production lanes run a configured command; tests use
//! scripted runners that return predetermined outcomes.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use tracing::{debug, info, instrument};

use crate::core::types::{Decision, DecisionKind};
use crate::io::config::LaneConfig;
use crate::io::process::run_command_with_timeout;

/// One invocation of a lane.
#[derive(Debug, Clone, PartialEq)]
pub struct Lane {
    pub unit: String,
    pub step: u32,
    pub worktree: PathBuf,
    /// Answer to the question the previous invocation asked, if any.
    pub decision: Option<Decision>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LaneOutcome {
    /// The unit's work is finished.
    Done,
    /// The current step is finished; run the next one.
    StepDone,
    /// The work needs an approval before it can complete.
    Review,
    /// The lane needs a decision before it can continue.
    Question {
        question: String,
        kind: DecisionKind,
        context: BTreeMap<String, String>,
    },
    Failed(String),
}

pub trait LaneRunner: Send + Sync {
    fn run(&self, lane: &Lane) -> Result<LaneOutcome>;
}

/// Lane status line printed by lane commands.
#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum LaneStatus {
    Done,
    StepDone,
    Review,
    Question {
        question: String,
        #[serde(default)]
        kind: DecisionKind,
        #[serde(default)]
        context: BTreeMap<String, String>,
    },
    Failed {
        #[serde(default)]
        reason: String,
    },
}

/// Runs the configured lane command inside the worktree.
///
/// The command sees `CONDUCTOR_UNIT`, `CONDUCTOR_STEP` and, after a question
/// was answered, `CONDUCTOR_DECISION` (the value as JSON). Its last non-empty
/// stdout line must be a JSON status object.
#[derive(Debug, Clone)]
pub struct CommandLaneRunner {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandLaneRunner {
    pub fn new(command: Vec<String>, timeout: Duration, output_limit_bytes: usize) -> Result<Self> {
        if command.is_empty() {
            return Err(anyhow!("lane command must not be empty"));
        }
        Ok(Self {
            command,
            timeout,
            output_limit_bytes,
        })
    }

    pub fn from_config(cfg: &LaneConfig) -> Result<Self> {
        Self::new(
            cfg.command.clone(),
            Duration::from_secs(cfg.timeout_secs),
            cfg.output_limit_bytes,
        )
    }
}

impl LaneRunner for CommandLaneRunner {
    #[instrument(skip_all, fields(unit = %lane.unit, step = lane.step))]
    fn run(&self, lane: &Lane) -> Result<LaneOutcome> {
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..])
            .current_dir(&lane.worktree)
            .env("CONDUCTOR_UNIT", &lane.unit)
            .env("CONDUCTOR_STEP", lane.step.to_string());
        if let Some(decision) = &lane.decision {
            let value = serde_json::to_string(&decision.value).context("encode decision")?;
            cmd.env("CONDUCTOR_DECISION", value);
        }
        info!(worktree = %lane.worktree.display(), "running lane command");
        let output = run_command_with_timeout(cmd, None, self.timeout, self.output_limit_bytes)?;

        if output.timed_out {
            return Ok(LaneOutcome::Failed(format!(
                "lane command timed out after {}s",
                self.timeout.as_secs()
            )));
        }
        if !output.success() {
            return Ok(LaneOutcome::Failed(format!(
                "lane command exited with {}: {}",
                output.status,
                output.stderr_text()
            )));
        }
        parse_status(&output.stdout_text())
    }
}

fn parse_status(stdout: &str) -> Result<LaneOutcome> {
    let line = stdout
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .ok_or_else(|| anyhow!("lane command printed no status line"))?;
    let status: LaneStatus =
        serde_json::from_str(line.trim()).with_context(|| format!("parse lane status '{line}'"))?;
    debug!(?status, "lane status");
    Ok(match status {
        LaneStatus::Done => LaneOutcome::Done,
        LaneStatus::StepDone => LaneOutcome::StepDone,
        LaneStatus::Review => LaneOutcome::Review,
        LaneStatus::Question {
            question,
            kind,
            context,
        } => LaneOutcome::Question {
            question,
            kind,
            context,
        },
        LaneStatus::Failed { reason } => LaneOutcome::Failed(reason),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_read_from_last_line() {
        let outcome = parse_status("building...\n{\"status\":\"done\"}\n\n").expect("parse");
        assert_eq!(outcome, LaneOutcome::Done);
    }

    #[test]
    fn question_defaults_to_choice() {
        let outcome =
            parse_status(r#"{"status":"question","question":"which database?"}"#).expect("parse");
        assert_eq!(
            outcome,
            LaneOutcome::Question {
                question: "which database?".to_string(),
                kind: DecisionKind::Choice,
                context: BTreeMap::new(),
            }
        );
    }

    #[test]
    fn garbage_status_is_an_error() {
        assert!(parse_status("").is_err());
        assert!(parse_status("{\"status\":\"dancing\"}").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn command_sees_lane_environment() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = CommandLaneRunner::new(
            vec![
                "sh".to_string(),
                "-c".to_string(),
                r#"test "$CONDUCTOR_UNIT" = story-1 && test "$CONDUCTOR_STEP" = 2 && echo '{"status":"step_done"}'"#
                    .to_string(),
            ],
            Duration::from_secs(5),
            10_000,
        )
        .expect("runner");
        let lane = Lane {
            unit: "story-1".to_string(),
            step: 2,
            worktree: temp.path().to_path_buf(),
            decision: None,
        };
        assert_eq!(runner.run(&lane).expect("run"), LaneOutcome::StepDone);
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_is_a_failed_outcome() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = CommandLaneRunner::new(
            vec!["sh".to_string(), "-c".to_string(), "echo nope >&2; exit 1".to_string()],
            Duration::from_secs(5),
            10_000,
        )
        .expect("runner");
        let lane = Lane {
            unit: "story-1".to_string(),
            step: 0,
            worktree: temp.path().to_path_buf(),
            decision: None,
        };
        let LaneOutcome::Failed(reason) = runner.run(&lane).expect("run") else {
            panic!("expected failure");
        };
        assert!(reason.contains("nope"));
    }
}
