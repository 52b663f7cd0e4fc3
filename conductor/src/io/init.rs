//! Initialization helpers for `.conductor/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{ConductorConfig, write_config};
use super::plan_store::write_plan;
use crate::core::types::WorkUnit;

/// All canonical paths within `.conductor/` for a project root.
#[derive(Debug, Clone)]
pub struct ConductorPaths {
    pub root: PathBuf,
    pub conductor_dir: PathBuf,
    /// Root of the [`crate::io::store::StateStore`].
    pub state_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub plan_path: PathBuf,
    pub config_path: PathBuf,
    pub knowledge_path: PathBuf,
}

impl ConductorPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let conductor_dir = root.join(".conductor");
        let state_dir = conductor_dir.join("state");
        Self {
            root: root.clone(),
            conductor_dir: conductor_dir.clone(),
            state_dir: state_dir.clone(),
            gitignore_path: conductor_dir.join(".gitignore"),
            plan_path: conductor_dir.join("plan.json"),
            config_path: state_dir.join("config.toml"),
            knowledge_path: state_dir.join("knowledge.toml"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing conductor-owned files.
    pub force: bool,
}

/// Create `.conductor/` scaffolding in `root`.
///
/// Fails if `.conductor/` already exists unless `options.force` is set.
pub fn init_conductor(root: &Path, options: &InitOptions) -> Result<ConductorPaths> {
    let paths = ConductorPaths::new(root);
    if paths.conductor_dir.exists() && !paths.conductor_dir.is_dir() {
        return Err(anyhow!(
            "conductor init: .conductor exists but is not a directory"
        ));
    }
    if paths.conductor_dir.exists() && !options.force {
        return Err(anyhow!(
            "conductor init: .conductor already exists (use --force to overwrite)"
        ));
    }

    create_dir(&paths.conductor_dir)?;
    create_dir(&paths.state_dir)?;

    write_file(&paths.gitignore_path, CONDUCTOR_GITIGNORE)?;
    write_plan(&paths.plan_path, &sample_plan())?;
    write_config(&paths.config_path, &ConductorConfig::default())?;
    write_file(&paths.knowledge_path, KNOWLEDGE_PLACEHOLDER)?;

    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

fn sample_plan() -> Vec<WorkUnit> {
    vec![
        WorkUnit::new("design"),
        WorkUnit::new("implement").depends_on(["design"]),
        WorkUnit::new("docs").soft_depends_on(["implement"]),
    ]
}

const CONDUCTOR_GITIGNORE: &str = "state/\nworktrees/\n";
const KNOWLEDGE_PLACEHOLDER: &str = "# Pre-answered questions consulted before the reasoner.\n\
#\n\
# [[entry]]\n\
# question = \"which database?\"\n\
# kind = \"choice\"\n\
# value = \"postgres\"\n";
