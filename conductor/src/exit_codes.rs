//! Stable exit codes for conductor CLI commands.

/// Command succeeded; for `run`, every unit is complete.
pub const OK: i32 = 0;
/// Invalid plan, config or arguments, or any other error.
pub const INVALID: i32 = 1;
/// `conductor run` stopped with lanes parked on pending escalations.
pub const ESCALATED: i32 = 2;
/// `conductor run` finished with failed or blocked units.
pub const FAILED: i32 = 3;
