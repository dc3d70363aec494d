//! CLI commands
//!
//! Argument parsing and dispatch to the subcommand handlers.

pub mod parser;
pub mod process;

// Re-exports (used by main.rs)
pub use parser::*;
pub use process::execute;
