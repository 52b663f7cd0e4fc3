//! I/O helpers: persistence, config, subprocesses and VCS.

pub mod config;
pub mod git;
pub mod init;
pub mod knowledge;
pub mod plan_store;
pub mod process;
pub mod reasoner;
pub mod store;
pub mod worktree;
