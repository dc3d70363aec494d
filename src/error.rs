//! Error handling for the cmdrelay core
//!
//! Two layers: [`StoreError`] for the durable record store and output ledger,
//! and [`RelayError`] for the operations the supervisor exposes to callers.

use crate::process_record::{ProcessId, ProcessState};
use std::io;
use thiserror::Error;

/// Failures of the durable record store / output ledger.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("no process record for id {0}")]
    RecordMissing(ProcessId),
    #[error("process record {0} already exists")]
    Duplicate(ProcessId),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("blocking store task failed: {0}")]
    Join(String),
}

/// Wire encoding failures.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("msgpack encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("msgpack decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("frame of {0} bytes exceeds the {1} byte limit")]
    FrameTooLarge(usize, usize),
    #[error("timestamp out of range: {0}")]
    Timestamp(i64),
    #[error("unknown wire format '{0}' (expected text or msgpack)")]
    UnknownFormat(String),
}

/// Errors surfaced by supervisor operations.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Unknown process id
    #[error("process {0} not found")]
    NotFound(ProcessId),

    /// Double start of a process that already has a live handle
    #[error("process {0} is already running")]
    AlreadyRunning(ProcessId),

    /// Start requested for a process whose run is over
    #[error("process {id} already finished (state: {state})")]
    AlreadyFinished { id: ProcessId, state: ProcessState },

    /// Marked running, but neither this instance nor the recorded process
    /// group answered a stop request
    #[error("process {0} has no live handle in this instance")]
    NotLiveHere(ProcessId),

    /// Command rejected by the allow-list policy
    #[error("command '{command}' is not allowed: {reason}")]
    Forbidden { command: String, reason: String },

    /// The OS refused to create the process
    #[error("failed to spawn '{command}' for process {id}: {source}")]
    SpawnFailure {
        id: ProcessId,
        command: String,
        #[source]
        source: io::Error,
    },

    /// The process's own pipes or signal delivery broke after spawn
    #[error("I/O failure on process {id}: {source}")]
    IoFailure {
        id: ProcessId,
        #[source]
        source: io::Error,
    },

    /// Output could not be appended to the ledger during capture
    #[error("ledger write failed for process {id}: {source}")]
    Ledger {
        id: ProcessId,
        #[source]
        source: StoreError,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Coarse classification used for user messaging and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Bad request from the caller; no state was mutated
    Caller,
    /// The supervised OS process could not be run or observed
    Process,
    /// Durable storage failed
    Storage,
    Configuration,
}

impl ErrorCategory {
    pub fn display_name(&self) -> &'static str {
        match self {
            ErrorCategory::Caller => "Request",
            ErrorCategory::Process => "Process",
            ErrorCategory::Storage => "Storage",
            ErrorCategory::Configuration => "Configuration",
        }
    }
}

impl RelayError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            RelayError::NotFound(_)
            | RelayError::AlreadyRunning(_)
            | RelayError::AlreadyFinished { .. }
            | RelayError::Forbidden { .. } => ErrorCategory::Caller,
            RelayError::SpawnFailure { .. }
            | RelayError::IoFailure { .. }
            | RelayError::NotLiveHere(_) => ErrorCategory::Process,
            RelayError::Ledger { .. } | RelayError::Store(_) => ErrorCategory::Storage,
            RelayError::Config(_) => ErrorCategory::Configuration,
        }
    }

    /// Caller errors are surfaced immediately and never retried.
    pub fn is_caller_error(&self) -> bool {
        self.category() == ErrorCategory::Caller
    }

    pub fn user_message(&self) -> String {
        match self {
            RelayError::NotFound(id) => format!("No process with id {id}."),
            RelayError::AlreadyRunning(id) => format!("Process {id} is already running."),
            RelayError::AlreadyFinished { id, .. } => format!(
                "Process {id} has already finished. Create a new process to run the command again."
            ),
            RelayError::Forbidden { command, .. } => {
                format!("The command '{command}' is not on the allow-list.")
            }
            RelayError::SpawnFailure { command, source, .. } => {
                format!("Could not run '{command}': {source}")
            }
            RelayError::NotLiveHere(id) => format!(
                "Process {id} is marked running but did not stop. If the invocation that started it is gone, run `cmdrelay sweep`."
            ),
            RelayError::IoFailure { id, source } => {
                format!("Lost contact with process {id}: {source}")
            }
            RelayError::Ledger { id, .. } => {
                format!("Output of process {id} could not be saved; the run was aborted.")
            }
            RelayError::Store(err) => format!("Storage failure: {err}"),
            RelayError::Config(message) => format!("Invalid configuration: {message}"),
        }
    }
}

impl From<config::ConfigError> for RelayError {
    fn from(err: config::ConfigError) -> Self {
        RelayError::Config(err.to_string())
    }
}

pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_errors_are_classified() {
        let id = ProcessId::new();
        assert!(RelayError::NotFound(id).is_caller_error());
        assert!(RelayError::AlreadyRunning(id).is_caller_error());
        assert!(RelayError::Forbidden {
            command: "rm".into(),
            reason: "not listed".into()
        }
        .is_caller_error());
        assert!(!RelayError::SpawnFailure {
            id,
            command: "nope".into(),
            source: io::Error::from(io::ErrorKind::NotFound),
        }
        .is_caller_error());
    }

    #[test]
    fn ledger_failure_is_a_storage_error() {
        let err = RelayError::Ledger {
            id: ProcessId::new(),
            source: StoreError::Corrupt("bad timestamp".into()),
        };
        assert_eq!(err.category(), ErrorCategory::Storage);
        assert_eq!(err.category().display_name(), "Storage");
        assert!(err.user_message().contains("aborted"));
    }

    #[test]
    fn missing_live_handle_points_at_sweep() {
        let err = RelayError::NotLiveHere(ProcessId::new());
        assert_eq!(err.category(), ErrorCategory::Process);
        assert!(!err.is_caller_error());
        assert!(err.user_message().contains("cmdrelay sweep"));
    }
}
