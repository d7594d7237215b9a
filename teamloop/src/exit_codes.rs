//! Stable exit codes for the `teamloop` CLI.

/// The run succeeded, or a non-run command completed.
pub const OK: i32 = 0;
/// Invalid invocation or configuration, or the run was aborted.
pub const INVALID: i32 = 1;
/// Verification still failed when the iteration budget ran out.
pub const EXHAUSTED: i32 = 2;
