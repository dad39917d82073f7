//! CLI command handlers
//!
//! Each handler returns the process exit code and logs its own failures.

pub mod evaluate;
pub mod train;
