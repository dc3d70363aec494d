//! cmdrelay library
//!
//! Runs allow-listed commands under a supervisor, persists every chunk of
//! their output to an append-only ledger, and streams it to any number of
//! readers that can disconnect and resume from a timestamp cursor without
//! gaps or duplicates.

pub mod active_table;
pub mod attach;
pub mod codec;
pub mod commands;
pub mod config;
pub mod error;
pub mod feed;
pub mod platform;
pub mod policy;
pub mod process_record;
pub mod signal;
pub mod storage;
pub mod supervisor;
pub mod utils;

// Re-export commonly used types for convenience
pub use attach::OutputStream;
pub use codec::{FrameDecoder, WireFormat, WireRecord};
pub use config::{AllowedCommand, Settings};
pub use error::{CodecError, ErrorCategory, RelayError, RelayResult, StoreError};
pub use policy::{AllowAll, AllowList, CommandPolicy};
pub use process_record::{epoch, parse_cursor, OutputRecord, ProcessId, ProcessRecord, ProcessState};
pub use storage::{InMemoryStore, ProcessStore, SqliteStore};
pub use supervisor::{ProcessSummary, Supervisor};
