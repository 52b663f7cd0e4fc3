//! Orchestrator configuration stored under `.conductor/state/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::graph::DEFAULT_BOTTLENECK_THRESHOLD;

/// Orchestrator configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields fall back to the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConductorConfig {
    /// Minimum confidence for a decision to be accepted without a human.
    pub confidence_threshold: f64,

    /// Hard out-degree at which a unit is reported as a bottleneck.
    pub bottleneck_threshold: usize,

    /// Concurrent lanes.
    pub max_parallel: usize,

    /// Lane attempts per unit before it is marked failed (1 = no retry).
    pub max_lane_attempts: u32,

    /// Keep polling while every runnable lane is parked on an escalation,
    /// instead of returning a stalled report.
    pub wait_for_escalations: bool,

    /// How often parked lanes re-check their escalations.
    pub escalation_poll_interval_ms: u64,

    pub git: GitConfig,
    pub reasoner: ReasonerConfig,
    pub lane: LaneConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GitConfig {
    /// Branch every lane's worktree starts from.
    pub base_branch: String,
    /// Worktree directory, relative to the project root unless absolute.
    pub worktree_dir: PathBuf,
    /// Prefix for per-unit lane branches.
    pub branch_prefix: String,
    pub command_timeout_secs: u64,
    /// Retries for transient failures such as lock contention.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            base_branch: "main".to_string(),
            worktree_dir: PathBuf::from(".conductor/worktrees"),
            branch_prefix: "conductor/".to_string(),
            command_timeout_secs: 60,
            max_retries: 4,
            initial_backoff_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReasonerConfig {
    /// Command that reads a JSON reasoning request on stdin and prints a JSON
    /// answer. Empty means every uncertain decision escalates.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    /// Sampling temperature passed through to the reasoner.
    pub temperature: f64,
    pub output_limit_bytes: usize,
}

impl Default for ReasonerConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 120,
            temperature: 0.1,
            output_limit_bytes: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LaneConfig {
    /// Command executed inside each lane's worktree.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            command: vec!["just".to_string(), "lane".to_string()],
            timeout_secs: 30 * 60,
            output_limit_bytes: 100_000,
        }
    }
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.75,
            bottleneck_threshold: DEFAULT_BOTTLENECK_THRESHOLD,
            max_parallel: 3,
            max_lane_attempts: 1,
            wait_for_escalations: false,
            escalation_poll_interval_ms: 2_000,
            git: GitConfig::default(),
            reasoner: ReasonerConfig::default(),
            lane: LaneConfig::default(),
        }
    }
}

impl ConductorConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(anyhow!("confidence_threshold must be within [0, 1]"));
        }
        if self.bottleneck_threshold == 0 {
            return Err(anyhow!("bottleneck_threshold must be > 0"));
        }
        if self.max_parallel == 0 {
            return Err(anyhow!("max_parallel must be > 0"));
        }
        if self.max_lane_attempts == 0 {
            return Err(anyhow!("max_lane_attempts must be > 0"));
        }
        if self.escalation_poll_interval_ms == 0 {
            return Err(anyhow!("escalation_poll_interval_ms must be > 0"));
        }
        if self.git.base_branch.trim().is_empty() {
            return Err(anyhow!("git.base_branch must not be empty"));
        }
        if self.git.command_timeout_secs == 0 {
            return Err(anyhow!("git.command_timeout_secs must be > 0"));
        }
        if self.reasoner.timeout_secs == 0 {
            return Err(anyhow!("reasoner.timeout_secs must be > 0"));
        }
        if !self.reasoner.command.is_empty() && self.reasoner.command[0].trim().is_empty() {
            return Err(anyhow!("reasoner.command must start with a program"));
        }
        if self.lane.command.is_empty() || self.lane.command[0].trim().is_empty() {
            return Err(anyhow!("lane.command must be a non-empty array"));
        }
        if self.lane.timeout_secs == 0 {
            return Err(anyhow!("lane.timeout_secs must be > 0"));
        }
        Ok(())
    }

    pub fn escalation_poll_interval(&self) -> Duration {
        Duration::from_millis(self.escalation_poll_interval_ms)
    }

    pub fn reasoning_timeout(&self) -> Duration {
        Duration::from_secs(self.reasoner.timeout_secs)
    }

    /// Absolute worktree directory for a project root.
    pub fn worktree_dir(&self, root: &Path) -> PathBuf {
        if self.git.worktree_dir.is_absolute() {
            self.git.worktree_dir.clone()
        } else {
            root.join(&self.git.worktree_dir)
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ConductorConfig::default()`.
pub fn load_config(path: &Path) -> Result<ConductorConfig> {
    if !path.exists() {
        let cfg = ConductorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ConductorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ConductorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, ConductorConfig::default());
        assert_eq!(cfg.confidence_threshold, 0.75);
        assert_eq!(cfg.bottleneck_threshold, 3);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let cfg = ConductorConfig::default();
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "max_parallel = 8\n[git]\nbase_branch = \"trunk\"\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_parallel, 8);
        assert_eq!(cfg.git.base_branch, "trunk");
        assert_eq!(cfg.git.branch_prefix, "conductor/");
        assert_eq!(cfg.confidence_threshold, 0.75);
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let cfg = ConductorConfig {
            confidence_threshold: 1.5,
            ..ConductorConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
