//! Stable exit codes for arena CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid arguments, layout, or config, or any other error.
pub const INVALID: i32 = 1;
/// `arena run` completed but the plan or apply step failed.
pub const JOB_FAILED: i32 = 2;
