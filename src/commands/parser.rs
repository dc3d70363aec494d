//! Command line parsing
//!
//! The CLI surface is declared with clap derive.

use crate::codec::WireFormat;
use crate::process_record::{parse_cursor, ProcessId};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::ffi::OsString;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "cmdrelay",
    version,
    about = "Run allow-listed commands, keep their output in a ledger and stream it back",
    propagate_version = true
)]
pub struct Cli {
    /// Config file (TOML/JSON/YAML), default ~/.cmdrelay/config.toml
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// SQLite ledger path (overrides the configured one)
    #[arg(long, global = true, value_name = "FILE")]
    pub database: Option<PathBuf>,

    /// Keep records in memory only; nothing survives this invocation
    #[arg(long, global = true, conflicts_with = "database")]
    pub ephemeral: bool,

    /// Skip the command allow-list
    #[arg(long, global = true)]
    pub allow_any: bool,

    /// Log level or filter expression (trace, debug, info, warn, error)
    #[arg(long, global = true, value_name = "FILTER")]
    pub log_level: Option<String>,

    /// Also write logs to this file
    #[arg(long, global = true, value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Create and start a process, then follow its output until it exits
    Run {
        #[arg(long, short, default_value = "")]
        label: String,
        #[arg(long, default_value_t = WireFormat::Text)]
        format: WireFormat,
        command: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Create a process record without starting it; prints the id
    Create {
        #[arg(long, short, default_value = "")]
        label: String,
        command: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Start a created process and follow its output until it exits
    Start {
        id: ProcessId,
        #[arg(long, default_value_t = WireFormat::Text)]
        format: WireFormat,
    },

    /// Print recorded output after a cursor
    Attach {
        id: ProcessId,
        /// RFC3339 timestamp or microseconds since the epoch
        #[arg(long, value_parser = parse_cursor_arg)]
        after: Option<DateTime<Utc>>,
        #[arg(long, default_value_t = WireFormat::Text)]
        format: WireFormat,
    },

    /// List every process with its state
    List {
        /// Print JSON including the full output
        #[arg(long)]
        json: bool,
    },

    /// Stop a running process, even one started by another invocation
    Kill { id: ProcessId },

    /// Stop a process and delete its record and output
    Remove { id: ProcessId },

    /// Mark processes left running by a dead supervisor as terminated
    Sweep,
}

fn parse_cursor_arg(raw: &str) -> Result<DateTime<Utc>, String> {
    parse_cursor(raw).ok_or_else(|| {
        format!("invalid cursor '{raw}': expected RFC3339 or microseconds since the epoch")
    })
}

impl Cli {
    /// Parse `std::env::args`; clap prints the error and exits on failure.
    pub fn parse_command() -> Self {
        Self::parse_command_from(std::env::args_os())
    }

    /// Parse a custom argv, returning clap's error instead of exiting.
    pub fn try_parse_command_from<I, T>(iter: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        Cli::try_parse_from(iter)
    }

    pub fn parse_command_from<I, T>(iter: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        match Self::try_parse_command_from(iter) {
            Ok(cli) => cli,
            Err(err) => err.exit(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_run_keeps_hyphenated_args() {
        let cli = Cli::try_parse_command_from(["cmdrelay", "run", "-l", "t1", "--", "ls", "-la", "/tmp"])
            .expect("parse");
        assert_eq!(
            cli.command,
            Commands::Run {
                label: "t1".into(),
                format: WireFormat::Text,
                command: "ls".into(),
                args: vec!["-la".into(), "/tmp".into()],
            }
        );
    }

    #[test]
    fn test_attach_parses_cursor_and_format() {
        let id = ProcessId::new();
        let id_text = id.to_string();
        let cli = Cli::try_parse_command_from([
            "cmdrelay",
            "attach",
            id_text.as_str(),
            "--after",
            "1704110400000001",
            "--format",
            "msgpack",
        ])
        .expect("parse");
        match cli.command {
            Commands::Attach { id: parsed, after, format } => {
                assert_eq!(parsed, id);
                assert_eq!(after.map(|ts| ts.timestamp_micros()), Some(1_704_110_400_000_001));
                assert_eq!(format, WireFormat::MsgPack);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_invalid_id_is_rejected() {
        assert!(Cli::try_parse_command_from(["cmdrelay", "kill", "not-a-uuid"]).is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_command_from(["cmdrelay", "list", "--ephemeral", "--json"])
            .expect("parse");
        assert!(cli.ephemeral);
        assert_eq!(cli.command, Commands::List { json: true });
    }

    #[test]
    fn test_ephemeral_conflicts_with_database() {
        assert!(Cli::try_parse_command_from([
            "cmdrelay",
            "--ephemeral",
            "--database",
            "x.db",
            "sweep"
        ])
        .is_err());
    }
}
