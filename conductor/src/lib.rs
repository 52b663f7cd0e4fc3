//! Workflow orchestration core.
//!
//! Takes a plan of work units with dependencies, derives an execution order,
//! and drives each unit through its lifecycle on parallel lanes, each in an
//! isolated git worktree. Uncertain decisions are escalated to humans and
//! block only the workflow that asked. The architecture enforces a strict
//! separation:
//!
//! - **[`core`]**: Pure, deterministic logic (graph analysis, lifecycle rules,
//!   metrics, export). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (state store, git, subprocesses,
//!   config). Isolated behind traits to enable scripted doubles in tests.
//!
//! Orchestration modules ([`workflow`], [`gate`], [`scheduler`], [`lane`])
//! coordinate core logic with I/O to implement CLI commands.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod gate;
pub mod hooks;
pub mod io;
pub mod lane;
pub mod logging;
pub mod scheduler;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod workflow;
