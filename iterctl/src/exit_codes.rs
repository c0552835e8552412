//! Stable exit codes for iterctl commands and hook scripts.

/// Command succeeded (or a hook script passed).
pub const OK: i32 = 0;
/// Command failed due to invalid input, config, task list, or other errors.
pub const INVALID: i32 = 1;
/// Every task in the task list passes.
pub const COMPLETE: i32 = 2;
/// Another live process holds an overlapping workspace lock.
pub const LOCK_CONFLICT: i32 = 3;
/// The agent reported a usage or rate limit.
pub const API_LIMIT: i32 = 4;
/// Reserved hook exit code: verification failed, redo the unit of work.
pub const VERIFICATION_FAILED: i32 = 75;
