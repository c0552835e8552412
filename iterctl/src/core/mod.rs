//! Deterministic, pure logic shared by iteration control.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod classifier;
pub mod error_line;
pub mod lock_path;
pub mod task_id;
pub mod types;
