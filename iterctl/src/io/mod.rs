//! I/O adapters for iterctl commands.

pub mod background;
pub mod config;
pub mod executor;
pub mod git;
pub mod hooks;
pub mod iteration_log;
pub mod lock;
pub mod process;
pub mod task_store;
