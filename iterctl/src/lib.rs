//! Agent iteration controller.
//!
//! Runs an external coding agent through a persisted task list one turn at a
//! time. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (task-id ordering, completion
//!   classification, error-line extraction, lock path relationships).
//!   No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (task list store, lock records,
//!   hook scripts, subprocesses, git inspection, config).
//!
//! Orchestration modules ([`looping`], [`hooks`], [`callbacks`]) coordinate
//! core logic with I/O to implement CLI commands.

pub mod callbacks;
pub mod core;
pub mod exit_codes;
pub mod hooks;
pub mod io;
pub mod logging;
pub mod looping;
pub mod task;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
