//! Worktree coordinator: one isolated working copy per running unit.
//!
//! Records live in the state store under `worktrees/<unit>`; an in-memory
//! registry guards against two lanes racing to create the same unit's lane.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result as AnyResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::{OrchestratorError, Result};
use crate::io::config::GitConfig;
use crate::io::git::{Git, RetryPolicy};
use crate::io::store::StateStore;

const NAMESPACE: &str = "worktrees";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorktreeStatus {
    Active,
    Destroyed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worktree {
    pub unit_id: String,
    pub path: PathBuf,
    pub branch: String,
    pub base_branch: String,
    pub status: WorktreeStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub destroyed_at: Option<DateTime<Utc>>,
}

impl Worktree {
    pub fn is_active(&self) -> bool {
        self.status == WorktreeStatus::Active
    }
}

/// VCS operations the coordinator needs.
pub trait WorktreeBackend: Send + Sync {
    /// Check out `branch` at `path`. A branch kept by an earlier destroy is
    /// reattached with its commits; otherwise it is created from `base`.
    fn add(&self, path: &Path, branch: &str, base: &str) -> AnyResult<()>;

    /// Remove the working copy. Must succeed if it is already gone.
    fn remove(&self, path: &Path) -> AnyResult<()>;

    /// Safe-delete a branch; `Ok(false)` when it still has unmerged work.
    fn delete_branch(&self, branch: &str) -> AnyResult<bool>;
}

/// Production backend over `git worktree`.
#[derive(Debug, Clone)]
pub struct GitBackend {
    git: Git,
}

impl GitBackend {
    pub fn new(git: Git) -> Self {
        Self { git }
    }

    pub fn from_config(repo_root: &Path, cfg: &GitConfig) -> Self {
        let retry = RetryPolicy {
            max_retries: cfg.max_retries,
            initial_backoff: Duration::from_millis(cfg.initial_backoff_ms),
            ..RetryPolicy::default()
        };
        let git = Git::new(repo_root)
            .with_timeout(Duration::from_secs(cfg.command_timeout_secs))
            .with_retry(retry);
        Self { git }
    }
}

impl WorktreeBackend for GitBackend {
    fn add(&self, path: &Path, branch: &str, base: &str) -> AnyResult<()> {
        if self.git.branch_exists(branch)? {
            debug!(branch, "reusing kept branch");
            return self.git.worktree_attach(path, branch);
        }
        self.git.worktree_add(path, branch, base)
    }

    fn remove(&self, path: &Path) -> AnyResult<()> {
        let registered = self
            .git
            .worktree_list()?
            .iter()
            .any(|entry| same_path(&entry.path, path));
        if registered {
            self.git.worktree_remove(path)
        } else {
            if path.exists() {
                std::fs::remove_dir_all(path)?;
            }
            self.git.worktree_prune()
        }
    }

    fn delete_branch(&self, branch: &str) -> AnyResult<bool> {
        if !self.git.branch_exists(branch)? {
            return Ok(true);
        }
        self.git.delete_branch_if_merged(branch)
    }
}

fn same_path(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Creates and destroys per-unit worktrees, persisting every change.
pub struct WorktreeCoordinator {
    store: StateStore,
    backend: Arc<dyn WorktreeBackend>,
    worktree_dir: PathBuf,
    branch_prefix: String,
    /// Active worktrees by unit, including ones still being created.
    registry: Mutex<BTreeMap<String, Worktree>>,
}

impl WorktreeCoordinator {
    pub fn new(
        store: StateStore,
        backend: Arc<dyn WorktreeBackend>,
        worktree_dir: impl Into<PathBuf>,
        branch_prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            backend,
            worktree_dir: worktree_dir.into(),
            branch_prefix: branch_prefix.into(),
            registry: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn path_for(&self, unit_id: &str) -> PathBuf {
        self.worktree_dir.join(unit_id)
    }

    pub fn branch_for(&self, unit_id: &str) -> String {
        format!("{}{unit_id}", self.branch_prefix)
    }

    /// Create the lane worktree for `unit_id` from `base_branch`.
    #[instrument(skip_all, fields(unit = %unit_id, base = %base_branch))]
    pub fn create(&self, unit_id: &str, base_branch: &str) -> Result<Worktree> {
        let worktree = Worktree {
            unit_id: unit_id.to_string(),
            path: self.path_for(unit_id),
            branch: self.branch_for(unit_id),
            base_branch: base_branch.to_string(),
            status: WorktreeStatus::Active,
            created_at: Utc::now(),
            destroyed_at: None,
        };

        {
            let mut registry = self.registry();
            if let Some(existing) = registry.get(unit_id) {
                return Err(conflict(existing));
            }
            if let Some(persisted) = self.load(unit_id)?
                && persisted.is_active()
            {
                return Err(conflict(&persisted));
            }
            // Reserve the unit before releasing the lock for the slow git call.
            registry.insert(unit_id.to_string(), worktree.clone());
        }

        let created = self
            .backend
            .add(&worktree.path, &worktree.branch, base_branch)
            .map_err(|err| OrchestratorError::external("git worktree add", &err))
            .and_then(|()| {
                self.store
                    .persist(&key(unit_id), &worktree)
                    .map_err(OrchestratorError::from)
            });
        if let Err(err) = created {
            self.registry().remove(unit_id);
            return Err(err);
        }

        info!(path = %worktree.path.display(), branch = %worktree.branch, "worktree created");
        Ok(worktree)
    }

    /// Remove the unit's worktree and safe-delete its branch.
    ///
    /// Returns the destroyed record, or `None` if nothing was active.
    #[instrument(skip_all, fields(unit = %unit_id))]
    pub fn destroy(&self, unit_id: &str) -> Result<Option<Worktree>> {
        let Some(mut worktree) = self.active(unit_id)? else {
            debug!("no active worktree");
            return Ok(None);
        };

        self.backend
            .remove(&worktree.path)
            .map_err(|err| OrchestratorError::external("git worktree remove", &err))?;
        match self.backend.delete_branch(&worktree.branch) {
            Ok(true) => {}
            Ok(false) => warn!(branch = %worktree.branch, "branch kept: unmerged work"),
            Err(err) => warn!(branch = %worktree.branch, err = %err, "branch delete failed"),
        }

        worktree.status = WorktreeStatus::Destroyed;
        worktree.destroyed_at = Some(Utc::now());
        self.store.persist(&key(unit_id), &worktree)?;
        self.registry().remove(unit_id);
        info!("worktree destroyed");
        Ok(Some(worktree))
    }

    /// Destroy the unit's active worktree if it was created at or after `since`.
    pub fn destroy_created_after(
        &self,
        unit_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Worktree>> {
        match self.active(unit_id)? {
            Some(worktree) if worktree.created_at >= since => self.destroy(unit_id),
            _ => Ok(None),
        }
    }

    /// The unit's active worktree, from memory or the store.
    pub fn active(&self, unit_id: &str) -> Result<Option<Worktree>> {
        if let Some(worktree) = self.registry().get(unit_id) {
            return Ok(Some(worktree.clone()));
        }
        Ok(self.load(unit_id)?.filter(Worktree::is_active))
    }

    /// Every recorded worktree, active and destroyed, ordered by unit id.
    pub fn list(&self) -> Result<Vec<Worktree>> {
        Ok(self.store.load_all(NAMESPACE)?)
    }

    fn load(&self, unit_id: &str) -> Result<Option<Worktree>> {
        Ok(self.store.load(&key(unit_id))?)
    }

    fn registry(&self) -> MutexGuard<'_, BTreeMap<String, Worktree>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn key(unit_id: &str) -> String {
    format!("{NAMESPACE}/{unit_id}")
}

fn conflict(existing: &Worktree) -> OrchestratorError {
    OrchestratorError::WorktreeConflict {
        unit: existing.unit_id.clone(),
        path: existing.path.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedBackend;

    fn coordinator(temp: &Path) -> (WorktreeCoordinator, Arc<ScriptedBackend>) {
        let backend = Arc::new(ScriptedBackend::default());
        let coordinator = WorktreeCoordinator::new(
            StateStore::new(temp.join("state")),
            backend.clone(),
            temp.join("worktrees"),
            "conductor/",
        );
        (coordinator, backend)
    }

    #[test]
    fn create_persists_active_record() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (coordinator, backend) = coordinator(temp.path());
        let wt = coordinator.create("story-1", "main").expect("create");
        assert_eq!(wt.branch, "conductor/story-1");
        assert_eq!(wt.path, temp.path().join("worktrees/story-1"));
        assert_eq!(backend.calls(), vec!["add conductor/story-1 main"]);

        let listed = coordinator.list().expect("list");
        assert_eq!(listed, vec![wt]);
    }

    #[test]
    fn second_create_conflicts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (coordinator, _) = coordinator(temp.path());
        coordinator.create("story-1", "main").expect("create");
        let err = coordinator.create("story-1", "main").expect_err("conflict");
        assert!(matches!(err, OrchestratorError::WorktreeConflict { ref unit, .. } if unit == "story-1"));
    }

    #[test]
    fn persisted_active_record_conflicts_after_restart() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (first, _) = coordinator(temp.path());
        first.create("story-1", "main").expect("create");
        let (second, _) = coordinator(temp.path());
        assert!(matches!(
            second.create("story-1", "main"),
            Err(OrchestratorError::WorktreeConflict { .. })
        ));
        second.destroy("story-1").expect("destroy stale");
        second.create("story-1", "main").expect("recreate");
    }

    #[test]
    fn failed_add_releases_reservation() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (coordinator, backend) = coordinator(temp.path());
        backend.fail_next_add("fatal: invalid reference: nope");
        let err = coordinator.create("story-1", "nope").expect_err("fails");
        assert!(matches!(err, OrchestratorError::ExternalCall { .. }));
        assert!(coordinator.active("story-1").expect("active").is_none());
        coordinator.create("story-1", "main").expect("retry succeeds");
    }

    #[test]
    fn destroy_is_idempotent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (coordinator, backend) = coordinator(temp.path());
        coordinator.create("story-1", "main").expect("create");
        let destroyed = coordinator.destroy("story-1").expect("destroy").expect("record");
        assert_eq!(destroyed.status, WorktreeStatus::Destroyed);
        assert!(coordinator.destroy("story-1").expect("again").is_none());
        assert_eq!(
            backend.calls(),
            vec![
                "add conductor/story-1 main",
                "remove story-1",
                "delete-branch conductor/story-1",
            ]
        );
    }

    #[test]
    fn unmerged_branch_does_not_fail_destroy() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (coordinator, backend) = coordinator(temp.path());
        coordinator.create("story-1", "main").expect("create");
        backend.mark_unmerged("conductor/story-1");
        assert!(coordinator.destroy("story-1").expect("destroy").is_some());
    }

    #[test]
    fn recreate_after_unmerged_destroy_reattaches_branch() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (coordinator, backend) = coordinator(temp.path());
        coordinator.create("story-1", "main").expect("create");
        backend.mark_unmerged("conductor/story-1");
        coordinator.destroy("story-1").expect("destroy");

        let again = coordinator.create("story-1", "main").expect("recreate");
        assert!(again.is_active());
        assert_eq!(
            backend.calls().last().map(String::as_str),
            Some("attach conductor/story-1")
        );
    }

    #[test]
    fn destroy_created_after_respects_timestamp() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (coordinator, _) = coordinator(temp.path());
        coordinator.create("story-1", "main").expect("create");
        let later = Utc::now() + chrono::Duration::seconds(60);
        assert!(
            coordinator
                .destroy_created_after("story-1", later)
                .expect("noop")
                .is_none()
        );
        let earlier = Utc::now() - chrono::Duration::seconds(60);
        assert!(
            coordinator
                .destroy_created_after("story-1", earlier)
                .expect("destroy")
                .is_some()
        );
    }
}
