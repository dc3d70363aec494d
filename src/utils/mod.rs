//! Logging and path helpers

pub mod config_paths;
pub mod logger;
