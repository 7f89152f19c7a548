//! Stable exit codes for `labscript` CLI commands.

/// Command succeeded; for `generate` and `simulate` the script passed validation.
pub const OK: i32 = 0;
/// Invalid arguments or configuration, or an infrastructure error (including a
/// validator that cannot be located by `labscript resolve`).
pub const INVALID: i32 = 1;
/// `generate` exhausted its attempts or `simulate` classified the run as failed.
pub const FAILED: i32 = 2;
