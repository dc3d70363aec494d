//! Command allow-list checks applied before a process record is created.

use crate::config::{AllowedCommand, Settings};
use crate::error::RelayError;
use std::collections::HashMap;

/// Decides whether a command line may be run at all.
pub trait CommandPolicy: Send + Sync + 'static {
    fn check(&self, command: &str, args: &[String]) -> Result<(), RelayError>;
}

impl CommandPolicy for Box<dyn CommandPolicy> {
    fn check(&self, command: &str, args: &[String]) -> Result<(), RelayError> {
        (**self).check(command, args)
    }
}

/// Accepts everything. For tests and trusted embedders that validate upstream.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl CommandPolicy for AllowAll {
    fn check(&self, _command: &str, _args: &[String]) -> Result<(), RelayError> {
        Ok(())
    }
}

/// Exact-match allow-list keyed by executable.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    entries: HashMap<String, AllowedCommand>,
}

impl AllowList {
    pub fn new(entries: impl IntoIterator<Item = AllowedCommand>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|entry| (entry.command.clone(), entry))
                .collect(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.allowed_commands.iter().cloned())
    }
}

impl CommandPolicy for AllowList {
    fn check(&self, command: &str, args: &[String]) -> Result<(), RelayError> {
        let Some(entry) = self.entries.get(command) else {
            return Err(RelayError::Forbidden {
                command: command.to_string(),
                reason: "command is not on the allow-list".to_string(),
            });
        };
        match entry.max_args {
            Some(max) if args.len() > max => Err(RelayError::Forbidden {
                command: command.to_string(),
                reason: format!("at most {max} argument(s) allowed, got {}", args.len()),
            }),
            _ => Ok(()),
        }
    }
}
