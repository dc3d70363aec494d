//! Config path management
//!
//! Persistent data (config.toml, processes.db) lives under ~/.cmdrelay/

use crate::config::{CONFIG_DIRECTORY, CONFIG_FILE_NAME, DATABASE_FILE_NAME};
use anyhow::Result;
use std::path::PathBuf;

/// Locations of the config file and the default ledger
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    /// Persistent config directory (~/.cmdrelay/)
    pub config_dir: PathBuf,
    /// Main config file
    pub config_file: PathBuf,
    /// Default SQLite ledger
    pub database_file: PathBuf,
}

impl ConfigPaths {
    pub fn new() -> Result<Self> {
        let home_dir =
            dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot find home directory"))?;
        Ok(Self::with_home(home_dir))
    }

    pub fn with_home(home_dir: PathBuf) -> Self {
        let config_dir = home_dir.join(CONFIG_DIRECTORY);
        Self {
            config_file: config_dir.join(CONFIG_FILE_NAME),
            database_file: config_dir.join(DATABASE_FILE_NAME),
            config_dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_live_under_home() {
        let home = tempfile::tempdir().expect("tempdir");
        let paths = ConfigPaths::with_home(home.path().to_path_buf());
        assert!(paths.config_dir.starts_with(home.path()));
        assert!(paths.config_file.ends_with(CONFIG_FILE_NAME));
        assert_eq!(paths.database_file.parent(), Some(paths.config_dir.as_path()));
    }
}
