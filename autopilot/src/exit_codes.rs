//! Stable exit codes for autopilot CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid input, config, or any other error before reaching the backend.
pub const INVALID: i32 = 1;
/// The backend rejected, failed, or timed out on a command.
pub const DISPATCH_FAILED: i32 = 2;
