use chrono::{DateTime, Duration, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque identity of a logical process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(Uuid);

impl ProcessId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ProcessId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Lifecycle state of a logical process.
///
/// `initialized -> running -> terminated`, or `initialized -> error` when the
/// spawn fails. `terminated` and `error` are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    #[default]
    Initialized,
    Running,
    Terminated,
    Error,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Initialized => "initialized",
            ProcessState::Running => "running",
            ProcessState::Terminated => "terminated",
            ProcessState::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessState::Terminated | ProcessState::Error)
    }

    pub fn can_transition_to(&self, next: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (*self, next),
            (Initialized, Running) | (Initialized, Error) | (Running, Terminated) | (Running, Error)
        )
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ProcessState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initialized" => Ok(ProcessState::Initialized),
            "running" => Ok(ProcessState::Running),
            "terminated" => Ok(ProcessState::Terminated),
            "error" => Ok(ProcessState::Error),
            other => Err(format!("unknown process state '{other}'")),
        }
    }
}

/// Durable row describing one logical process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessRecord {
    pub id: ProcessId,
    pub label: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub state: ProcessState,
    /// Process group leader of the current or last run, recorded on start
    /// so that another instance sharing the store can signal it.
    #[serde(default)]
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
}

impl ProcessRecord {
    pub fn new(command: impl Into<String>, args: Vec<String>, label: impl Into<String>) -> Self {
        Self {
            id: ProcessId::new(),
            label: label.into(),
            command: command.into(),
            args,
            state: ProcessState::Initialized,
            pid: None,
            created_at: Utc::now().trunc_subsecs(6),
        }
    }

    /// `command arg1 arg2`, as shown in the output header.
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }
}

/// One append-only chunk of captured output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputRecord {
    pub process_id: ProcessId,
    pub data: String,
    pub created_at: DateTime<Utc>,
}

/// Assigns ledger timestamps for a single process.
///
/// Timestamps have microsecond resolution and strictly increase, so the
/// highest timestamp a client has seen is an exact resume cursor.
#[derive(Debug, Default)]
pub struct LedgerClock {
    last: Option<DateTime<Utc>>,
}

impl LedgerClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue after an existing ledger whose newest record is `last`.
    pub fn resume(last: Option<DateTime<Utc>>) -> Self {
        Self { last }
    }

    pub fn next(&mut self) -> DateTime<Utc> {
        self.next_after(Utc::now())
    }

    fn next_after(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let now = now.trunc_subsecs(6);
        let stamp = match self.last {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last = Some(stamp);
        stamp
    }
}

/// The cursor used by a first-time attach.
pub fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// Parse a resume cursor: RFC3339 text or integer microseconds since the epoch.
pub fn parse_cursor(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(micros) = raw.parse::<i64>() {
        return DateTime::<Utc>::from_timestamp_micros(micros);
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

pub(crate) fn display_time(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// How a supervised process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    Code(i32),
    Signal(String),
    Unknown,
}

impl ExitOutcome {
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return ExitOutcome::Code(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signum) = status.signal() {
                let name = nix::sys::signal::Signal::try_from(signum)
                    .map(|sig| sig.as_str().to_string())
                    .unwrap_or_else(|_| format!("signal {signum}"));
                return ExitOutcome::Signal(name);
            }
        }
        ExitOutcome::Unknown
    }
}

// Output framing. Ledger and live views carry these exact strings.

pub(crate) const STDERR_PREFIX: &str = "Error: ";

pub(crate) fn header_text(record: &ProcessRecord, started_at: DateTime<Utc>) -> String {
    format!(
        "Command: {}\nStarted at: {}\n\n",
        record.command_line(),
        display_time(started_at)
    )
}

pub(crate) fn closing_text(outcome: &ExitOutcome, ended_at: DateTime<Utc>) -> String {
    let how = match outcome {
        ExitOutcome::Code(code) => format!("with code {code}"),
        ExitOutcome::Signal(name) => format!("with signal {name}"),
        ExitOutcome::Unknown => "without exit status".to_string(),
    };
    format!("\nProcess exited {how}\nEnded at: {}\n", display_time(ended_at))
}

pub(crate) fn pipe_error_text(err: &std::io::Error) -> String {
    format!("\nProcess error: {err}\n")
}

pub(crate) fn spawn_error_text(err: &std::io::Error) -> String {
    format!("Failed to start: {err}\n")
}

pub(crate) const LOST_TEXT: &str = "\nProcess lost: supervisor restarted\n";

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_state_machine_transitions() {
        use ProcessState::*;
        assert!(Initialized.can_transition_to(Running));
        assert!(Initialized.can_transition_to(Error));
        assert!(Running.can_transition_to(Terminated));
        assert!(!Terminated.can_transition_to(Running));
        assert!(!Error.can_transition_to(Running));
        assert!(!Initialized.can_transition_to(Terminated));
        assert!(Terminated.is_terminal() && Error.is_terminal());
        assert!(!Running.is_terminal());
    }

    #[test]
    fn test_state_serialization_is_snake_case() {
        let json = serde_json::to_string(&ProcessState::Terminated).expect("serialize");
        assert_eq!(json, "\"terminated\"");
        assert_eq!("running".parse::<ProcessState>(), Ok(ProcessState::Running));
        assert!("finished".parse::<ProcessState>().is_err());
    }

    #[test]
    fn test_ledger_clock_is_strictly_increasing() {
        let mut clock = LedgerClock::new();
        let fixed = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let a = clock.next_after(fixed);
        let b = clock.next_after(fixed);
        let c = clock.next_after(fixed - Duration::seconds(5));
        assert_eq!(a, fixed);
        assert_eq!(b, fixed + Duration::microseconds(1));
        assert_eq!(c, fixed + Duration::microseconds(2));

        let mut resumed = LedgerClock::resume(Some(c));
        assert_eq!(resumed.next_after(fixed), fixed + Duration::microseconds(3));
    }

    #[test]
    fn test_parse_cursor_accepts_micros_and_rfc3339() {
        let ts = parse_cursor("1704110400000001").expect("micros");
        assert_eq!(ts.timestamp_micros(), 1_704_110_400_000_001);
        let ts = parse_cursor("2024-01-01T12:00:00.5Z").expect("rfc3339");
        assert_eq!(ts.timestamp_millis(), 1_704_110_400_500);
        assert!(parse_cursor("yesterday").is_none());
    }

    #[test]
    fn test_framing_matches_documented_layout() {
        let record = ProcessRecord::new("echo", vec!["hello".into()], "t1");
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(
            header_text(&record, ts),
            "Command: echo hello\nStarted at: 2024-01-01T12:00:00.000Z\n\n"
        );
        assert_eq!(
            closing_text(&ExitOutcome::Code(0), ts),
            "\nProcess exited with code 0\nEnded at: 2024-01-01T12:00:00.000Z\n"
        );
        assert_eq!(
            closing_text(&ExitOutcome::Signal("SIGKILL".into()), ts),
            "\nProcess exited with signal SIGKILL\nEnded at: 2024-01-01T12:00:00.000Z\n"
        );
    }

    #[test]
    fn test_record_backward_compatible_deserialization() {
        let json = r#"{
            "id": "6f1c0d3e-8f7a-4b3e-9c2d-1a2b3c4d5e6f",
            "label": "t1",
            "command": "ls",
            "created_at": "2024-01-01T12:00:00Z"
        }"#;
        let record: ProcessRecord = serde_json::from_str(json).expect("deserialize");
        assert!(record.args.is_empty());
        assert_eq!(record.state, ProcessState::Initialized);
        assert_eq!(record.pid, None);
        assert_eq!(record.command_line(), "ls");
    }
}
