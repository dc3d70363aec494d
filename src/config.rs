use crate::error::RelayError;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PREFIX: &str = "CMDRELAY";
pub const CONFIG_DIRECTORY: &str = ".cmdrelay";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const DATABASE_FILE_NAME: &str = "processes.db";

// Slow readers lag instead of blocking the writer; lagged readers catch up
// from the ledger, so this only bounds memory per live process.
pub const DEFAULT_FEED_CAPACITY: usize = 256;
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_millis(500);
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8192;

/// One allow-listed command. `max_args = None` means any number of arguments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AllowedCommand {
    pub name: String,
    pub command: String,
    #[serde(default, alias = "arg_count")]
    pub max_args: Option<usize>,
}

impl AllowedCommand {
    pub fn new(command: impl Into<String>, max_args: Option<usize>) -> Self {
        let command = command.into();
        Self {
            name: command.clone(),
            command,
            max_args,
        }
    }
}

/// Runtime settings.
///
/// Layered: built-in defaults, then an optional TOML/JSON/YAML file, then
/// `CMDRELAY_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    /// SQLite ledger location. `None` keeps everything in memory.
    pub database_path: Option<PathBuf>,
    pub feed_capacity: usize,
    pub kill_grace_ms: u64,
    pub read_buffer_size: usize,
    pub allowed_commands: Vec<AllowedCommand>,
    pub log_level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: None,
            feed_capacity: DEFAULT_FEED_CAPACITY,
            kill_grace_ms: DEFAULT_KILL_GRACE.as_millis() as u64,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            allowed_commands: Vec::new(),
            log_level: None,
        }
    }
}

impl Settings {
    /// Load settings. A `file` that was named explicitly must exist.
    pub fn load(file: Option<&Path>) -> Result<Self, RelayError> {
        Self::load_layers(file, true)
    }

    /// Like [`Settings::load`], but silently skips a missing default file.
    pub fn load_default(default_file: &Path) -> Result<Self, RelayError> {
        Self::load_layers(Some(default_file), false)
    }

    fn load_layers(file: Option<&Path>, required: bool) -> Result<Self, RelayError> {
        let mut builder = Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(File::from(path).required(required));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        if self.feed_capacity == 0 {
            return Err(RelayError::Config("feed_capacity must be at least 1".into()));
        }
        if self.read_buffer_size == 0 {
            return Err(RelayError::Config(
                "read_buffer_size must be at least 1".into(),
            ));
        }
        if let Some(entry) = self
            .allowed_commands
            .iter()
            .find(|entry| entry.command.trim().is_empty())
        {
            return Err(RelayError::Config(format!(
                "allowed command '{}' has an empty command",
                entry.name
            )));
        }
        Ok(())
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}
