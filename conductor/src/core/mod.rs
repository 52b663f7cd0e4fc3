//! Deterministic, pure logic shared by the orchestration core.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod export;
pub mod graph;
pub mod invariants;
pub mod lifecycle;
pub mod metrics;
pub mod types;
