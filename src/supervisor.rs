//! Process supervisor.
//!
//! The supervisor is the only component that spawns, signals or reaps OS
//! processes and the only writer of [`ProcessState`]. Every running process
//! gets one capture task that drains stdout and stderr, appends each chunk
//! to the ledger and only then publishes it to the live feed.

use crate::active_table::{ActiveProcess, ActiveTable, LiveGuard};
use crate::config::Settings;
use crate::error::{RelayError, RelayResult, StoreError};
use crate::platform;
use crate::policy::CommandPolicy;
use crate::process_record::{
    closing_text, header_text, pipe_error_text, spawn_error_text, ExitOutcome, LedgerClock,
    OutputRecord, ProcessId, ProcessRecord, ProcessState, LOST_TEXT, STDERR_PREFIX,
};
use crate::storage::ProcessStore;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

// Chunks waiting between the pipe readers and the ledger writer.
const CHUNK_QUEUE: usize = 64;

// How often a kill without a local handle re-reads the record, and how long
// past the grace period it waits for the owning instance to record the exit.
const REMOTE_KILL_POLL: Duration = Duration::from_millis(50);
const REMOTE_KILL_SETTLE: Duration = Duration::from_secs(5);

/// Snapshot row returned by [`Supervisor::list_processes`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessSummary {
    pub id: ProcessId,
    pub label: String,
    pub command: String,
    pub state: ProcessState,
    /// Everything captured so far, concatenated in ledger order
    pub output: String,
    /// Resume cursor for a client that has rendered `output`
    pub last_output_at: Option<DateTime<Utc>>,
}

impl ProcessSummary {
    fn from_parts(record: ProcessRecord, ledger: &[OutputRecord]) -> Self {
        Self {
            id: record.id,
            command: record.command_line(),
            label: record.label,
            state: record.state,
            output: ledger.iter().map(|row| row.data.as_str()).collect(),
            last_output_at: ledger.last().map(|row| row.created_at),
        }
    }
}

pub struct Supervisor<S: ProcessStore> {
    store: Arc<S>,
    policy: Arc<dyn CommandPolicy>,
    table: ActiveTable,
    settings: Arc<Settings>,
}

impl<S: ProcessStore> Clone for Supervisor<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            policy: Arc::clone(&self.policy),
            table: self.table.clone(),
            settings: Arc::clone(&self.settings),
        }
    }
}

impl<S: ProcessStore> Supervisor<S> {
    pub fn new(store: S, policy: impl CommandPolicy, settings: Settings) -> Self {
        Self {
            store: Arc::new(store),
            policy: Arc::new(policy),
            table: ActiveTable::new(),
            settings: Arc::new(settings),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub(crate) fn table(&self) -> &ActiveTable {
        &self.table
    }

    /// Validate against the policy and insert an `initialized` record.
    pub async fn create_process(
        &self,
        command: &str,
        args: &[String],
        label: &str,
    ) -> RelayResult<ProcessId> {
        self.policy.check(command, args)?;
        let record = self.store.create(command, args, label).await?;
        info!(
            process_id = %record.id,
            command = %record.command_line(),
            label,
            "process created"
        );
        Ok(record.id)
    }

    /// Spawn the OS process for an `initialized` record.
    ///
    /// Returns once the process is running and its header is in the ledger.
    /// Output capture continues in the background until the process exits.
    pub async fn start_process(&self, id: ProcessId) -> RelayResult<()> {
        // Claim the slot before reading the record so a concurrent start
        // cannot act on the same stale state.
        let guard = self
            .table
            .reserve(id, self.settings.feed_capacity)
            .ok_or(RelayError::AlreadyRunning(id))?;

        let record = self.store.get(id).await?.ok_or(RelayError::NotFound(id))?;
        match record.state {
            ProcessState::Initialized => {}
            ProcessState::Running => return Err(RelayError::AlreadyRunning(id)),
            state => return Err(RelayError::AlreadyFinished { id, state }),
        }

        let mut command = Command::new(&record.command);
        command
            .args(&record.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        platform::prepare_command(&mut command);

        let mut writer = LedgerWriter::new(Arc::clone(&self.store), id, Arc::clone(guard.active()));

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(process_id = %id, command = %record.command, error = %err, "spawn failed");
                self.record_spawn_failure(&mut writer, &err).await;
                return Err(RelayError::SpawnFailure {
                    id,
                    command: record.command,
                    source: err,
                });
            }
        };
        let pid = child.id();
        if let Some(pid) = pid {
            guard.active().set_pid(pid);
        }

        if let Err(err) = self.store.mark_running(id, pid).await {
            reap_now(&mut child, pid).await;
            return Err(err.into());
        }

        if let Err(err) = writer.append_with(|ts| header_text(&record, ts)).await {
            error!(process_id = %id, error = %err, "could not write output header, aborting run");
            reap_now(&mut child, pid).await;
            self.settle_state(id, ProcessState::Error).await;
            return Err(RelayError::Ledger { id, source: err });
        }

        info!(process_id = %id, pid = ?pid, command = %record.command_line(), "process started");

        let capture = Capture {
            writer,
            child,
            pid,
            guard,
            kill_grace: self.settings.kill_grace(),
            read_buffer_size: self.settings.read_buffer_size,
        };
        tokio::spawn(capture.run());
        Ok(())
    }

    /// Terminate a process. Returns once its exit has been recorded.
    ///
    /// A process started by another instance sharing the store is stopped
    /// through its recorded process group; the owner writes the exit.
    /// Records that are not running are left as they are.
    pub async fn kill_process(&self, id: ProcessId) -> RelayResult<()> {
        if let Some(active) = self.table.get(id) {
            active.request_kill();
            active.wait_exited().await;
            return Ok(());
        }

        let record = self.store.get(id).await?.ok_or(RelayError::NotFound(id))?;
        if record.state != ProcessState::Running {
            debug!(process_id = %id, state = %record.state, "kill on idle process ignored");
            return Ok(());
        }
        self.kill_elsewhere(&record).await
    }

    async fn kill_elsewhere(&self, record: &ProcessRecord) -> RelayResult<()> {
        let id = record.id;
        let Some(pid) = record.pid else {
            warn!(process_id = %id, "running process has no recorded pid");
            return Err(RelayError::NotLiveHere(id));
        };

        info!(process_id = %id, pid, "stopping process owned by another instance");
        platform::request_stop(pid).map_err(|source| RelayError::IoFailure { id, source })?;

        let force_at = Instant::now() + self.settings.kill_grace();
        let give_up = force_at + REMOTE_KILL_SETTLE;
        let mut forced = false;
        loop {
            tokio::time::sleep(REMOTE_KILL_POLL).await;
            match self.store.get(id).await? {
                Some(current) if !current.state.is_terminal() => {}
                _ => return Ok(()),
            }
            let now = Instant::now();
            if !forced && now >= force_at {
                warn!(process_id = %id, pid, "process ignored SIGTERM, sending SIGKILL");
                platform::force_stop(pid).map_err(|source| RelayError::IoFailure { id, source })?;
                forced = true;
            }
            if now >= give_up {
                warn!(process_id = %id, pid, "no instance recorded the exit");
                return Err(RelayError::NotLiveHere(id));
            }
        }
    }

    /// Kill, then delete the record and its ledger in one step.
    pub async fn remove_process(&self, id: ProcessId) -> RelayResult<()> {
        match self.kill_process(id).await {
            Ok(()) => {}
            // Nobody owns it any more, so there is nothing left to stop.
            Err(RelayError::NotLiveHere(_)) => {
                warn!(process_id = %id, "removing running record without a live owner");
            }
            Err(err) => return Err(err),
        }
        if !self.store.delete(id).await? {
            return Err(RelayError::NotFound(id));
        }
        // A start that slipped in between would lose its ledger; stop it.
        if let Some(active) = self.table.get(id) {
            active.request_kill();
        }
        info!(process_id = %id, "process removed");
        Ok(())
    }

    pub async fn get_process(&self, id: ProcessId) -> RelayResult<ProcessRecord> {
        self.store.get(id).await?.ok_or(RelayError::NotFound(id))
    }

    /// Every record with its output so far, oldest first.
    pub async fn list_processes(&self) -> RelayResult<Vec<ProcessSummary>> {
        let records = self.store.list().await?;
        let mut summaries = Vec::with_capacity(records.len());
        for record in records {
            let ledger = self.store.full_output(record.id).await?;
            summaries.push(ProcessSummary::from_parts(record, &ledger));
        }
        Ok(summaries)
    }

    pub fn is_live(&self, id: ProcessId) -> bool {
        self.table.contains(id)
    }

    pub fn live_pid(&self, id: ProcessId) -> Option<u32> {
        self.table.get(id).and_then(|active| active.pid())
    }

    pub fn live_count(&self) -> usize {
        self.table.len()
    }

    /// Number of attached live readers for `id`.
    pub fn reader_count(&self, id: ProcessId) -> usize {
        self.table.get(id).map_or(0, |active| active.reader_count())
    }

    /// Kill everything that is live in this instance.
    pub async fn shutdown(&self) {
        let ids = self.table.ids();
        if ids.is_empty() {
            return;
        }
        info!(count = ids.len(), "stopping live processes");
        let results = join_all(ids.iter().map(|id| self.kill_process(*id))).await;
        for (id, result) in ids.iter().zip(results) {
            if let Err(err) = result {
                warn!(process_id = %id, error = %err, "failed to stop process during shutdown");
            }
        }
    }

    /// Close out records left `running` by a supervisor that is gone.
    ///
    /// Only call this when no other instance shares the store.
    pub async fn sweep_stale(&self) -> RelayResult<Vec<ProcessId>> {
        let mut swept = Vec::new();
        for record in self.store.list().await? {
            if record.state != ProcessState::Running || self.table.contains(record.id) {
                continue;
            }
            let mut clock = LedgerClock::resume(self.store.last_output_at(record.id).await?);
            let note = OutputRecord {
                process_id: record.id,
                data: LOST_TEXT.to_string(),
                created_at: clock.next(),
            };
            self.store.append_output(&note).await?;
            self.store
                .set_state(record.id, ProcessState::Terminated)
                .await?;
            warn!(process_id = %record.id, "marked orphaned process as terminated");
            swept.push(record.id);
        }
        Ok(swept)
    }

    async fn record_spawn_failure(&self, writer: &mut LedgerWriter<S>, err: &io::Error) {
        if let Err(store_err) = writer.append(spawn_error_text(err)).await {
            error!(process_id = %writer.id, error = %store_err, "could not record spawn failure");
        }
        self.settle_state(writer.id, ProcessState::Error).await;
    }

    async fn settle_state(&self, id: ProcessId, state: ProcessState) {
        settle_state(self.store.as_ref(), id, state).await;
    }
}

async fn settle_state<S: ProcessStore>(store: &S, id: ProcessId, state: ProcessState) {
    match store.set_state(id, state).await {
        Ok(()) => {}
        Err(StoreError::RecordMissing(_)) => {
            debug!(process_id = %id, "record removed before final state could be written");
        }
        Err(err) => {
            error!(process_id = %id, state = %state, error = %err, "failed to persist process state");
        }
    }
}

async fn reap_now(child: &mut Child, pid: Option<u32>) {
    if let Some(pid) = pid {
        let _ = platform::force_stop(pid);
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

/// Appends to the ledger and then publishes to the feed, one record at a
/// time. Owns the per-process clock.
struct LedgerWriter<S: ProcessStore> {
    store: Arc<S>,
    id: ProcessId,
    active: Arc<ActiveProcess>,
    clock: LedgerClock,
}

impl<S: ProcessStore> LedgerWriter<S> {
    fn new(store: Arc<S>, id: ProcessId, active: Arc<ActiveProcess>) -> Self {
        Self {
            store,
            id,
            active,
            clock: LedgerClock::new(),
        }
    }

    async fn append(&mut self, data: String) -> Result<(), StoreError> {
        self.append_with(|_| data).await
    }

    async fn append_with(
        &mut self,
        render: impl FnOnce(DateTime<Utc>) -> String,
    ) -> Result<(), StoreError> {
        let created_at = self.clock.next();
        let record = OutputRecord {
            process_id: self.id,
            data: render(created_at),
            created_at,
        };
        if record.data.is_empty() {
            return Ok(());
        }
        self.store.append_output(&record).await?;
        self.active.publish(record);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pipe {
    Stdout,
    Stderr,
}

impl Pipe {
    fn as_str(self) -> &'static str {
        match self {
            Pipe::Stdout => "stdout",
            Pipe::Stderr => "stderr",
        }
    }
}

#[derive(Debug)]
enum Chunk {
    Output { pipe: Pipe, text: String },
    Failed { pipe: Pipe, error: io::Error },
}

struct Capture<S: ProcessStore> {
    writer: LedgerWriter<S>,
    child: Child,
    pid: Option<u32>,
    guard: LiveGuard,
    kill_grace: Duration,
    read_buffer_size: usize,
}

impl<S: ProcessStore> Capture<S> {
    async fn run(mut self) {
        let id = self.writer.id;
        let (tx, mut rx) = mpsc::channel(CHUNK_QUEUE);
        if let Some(stdout) = self.child.stdout.take() {
            tokio::spawn(pump(stdout, Pipe::Stdout, tx.clone(), self.read_buffer_size));
        }
        if let Some(stderr) = self.child.stderr.take() {
            tokio::spawn(pump(stderr, Pipe::Stderr, tx.clone(), self.read_buffer_size));
        }
        drop(tx);

        let mut kill_rx = self.guard.kill_signal();
        let mut kill_requested = *kill_rx.borrow_and_update();
        let mut force_at = None;
        if kill_requested {
            force_at = Some(self.begin_kill());
        }

        let mut pipes_open = true;
        let mut ledger_failure = None;

        let status = loop {
            tokio::select! {
                chunk = rx.recv(), if pipes_open => {
                    let data = match chunk {
                        Some(Chunk::Output { pipe: Pipe::Stdout, text }) => text,
                        Some(Chunk::Output { pipe: Pipe::Stderr, text }) => {
                            format!("{STDERR_PREFIX}{text}")
                        }
                        Some(Chunk::Failed { pipe, error }) => {
                            warn!(process_id = %id, pipe = pipe.as_str(), error = %error, "pipe read failed");
                            pipe_error_text(&error)
                        }
                        None => {
                            pipes_open = false;
                            continue;
                        }
                    };
                    if let Err(err) = self.writer.append(data).await {
                        ledger_failure = Some(err);
                        break self.abort().await;
                    }
                }
                status = self.child.wait(), if !pipes_open => break status,
                changed = kill_rx.changed(), if !kill_requested => {
                    kill_requested = true;
                    if changed.is_ok() {
                        force_at = Some(self.begin_kill());
                    }
                }
                _ = tokio::time::sleep_until(force_at.unwrap_or_else(Instant::now)), if force_at.is_some() => {
                    force_at = None;
                    warn!(process_id = %id, pid = ?self.pid, "process ignored SIGTERM, sending SIGKILL");
                    self.force_kill();
                }
            }
        };
        drop(rx);

        let state = match ledger_failure {
            Some(err) => {
                error!(process_id = %id, error = %err, "ledger write failed, run aborted");
                ProcessState::Error
            }
            None => self.write_closing(status).await,
        };

        settle_state(self.writer.store.as_ref(), id, state).await;
        info!(process_id = %id, state = %state, "process finished");
        // Dropping the guard closes the feed and wakes waiting killers.
        drop(self.guard);
    }

    async fn write_closing(&mut self, status: io::Result<ExitStatus>) -> ProcessState {
        let id = self.writer.id;
        let outcome = match status {
            Ok(status) => ExitOutcome::from_status(status),
            Err(err) => {
                warn!(process_id = %id, error = %err, "failed to collect exit status");
                if let Err(store_err) = self.writer.append(pipe_error_text(&err)).await {
                    error!(process_id = %id, error = %store_err, "ledger write failed");
                    return ProcessState::Error;
                }
                ExitOutcome::Unknown
            }
        };
        match self
            .writer
            .append_with(|ts| closing_text(&outcome, ts))
            .await
        {
            Ok(()) => ProcessState::Terminated,
            Err(err) => {
                error!(process_id = %id, error = %err, "could not write closing record");
                ProcessState::Error
            }
        }
    }

    /// SIGTERM the group. Returns when to escalate.
    fn begin_kill(&mut self) -> Instant {
        info!(process_id = %self.writer.id, pid = ?self.pid, "stopping process");
        let delivered = match self.pid {
            Some(pid) => platform::request_stop(pid),
            None => Err(io::Error::from(io::ErrorKind::NotFound)),
        };
        if let Err(err) = delivered {
            debug!(process_id = %self.writer.id, error = %err, "group signal unavailable, killing child directly");
            let _ = self.child.start_kill();
        }
        Instant::now() + self.kill_grace
    }

    fn force_kill(&mut self) {
        if let Some(pid) = self.pid {
            if let Err(err) = platform::force_stop(pid) {
                debug!(process_id = %self.writer.id, error = %err, "SIGKILL to process group failed");
            }
        }
        // Errors only when the child has already been reaped.
        let _ = self.child.start_kill();
    }

    async fn abort(&mut self) -> io::Result<ExitStatus> {
        self.force_kill();
        self.child.wait().await
    }
}

async fn pump<R>(mut reader: R, pipe: Pipe, tx: mpsc::Sender<Chunk>, buffer_size: usize)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut buffer = vec![0u8; buffer_size];
    let mut decoder = Utf8Chunker::default();
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => break,
            Ok(read) => {
                let text = decoder.push(&buffer[..read]);
                if !text.is_empty() && tx.send(Chunk::Output { pipe, text }).await.is_err() {
                    return;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => {
                let rest = decoder.finish();
                if !rest.is_empty() {
                    let _ = tx.send(Chunk::Output { pipe, text: rest }).await;
                }
                let _ = tx.send(Chunk::Failed { pipe, error }).await;
                return;
            }
        }
    }
    let rest = decoder.finish();
    if !rest.is_empty() {
        let _ = tx.send(Chunk::Output { pipe, text: rest }).await;
    }
}

/// Turns raw pipe reads into text without splitting a UTF-8 sequence
/// across two chunks. Invalid bytes become U+FFFD.
#[derive(Debug, Default)]
struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let keep = incomplete_suffix_len(&self.pending);
        let rest = self.pending.split_off(self.pending.len() - keep);
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = rest;
        text
    }

    fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

fn incomplete_suffix_len(bytes: &[u8]) -> usize {
    let tail_start = bytes.len().saturating_sub(3);
    for i in (tail_start..bytes.len()).rev() {
        let byte = bytes[i];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let needed = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        let have = bytes.len() - i;
        return if have < needed { have } else { 0 };
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::AllowAll;
    use crate::process_record::epoch;
    use crate::storage::InMemoryStore;
    use async_trait::async_trait;
    use futures::TryStreamExt;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn supervisor() -> Supervisor<InMemoryStore> {
        Supervisor::new(InMemoryStore::new(), AllowAll, Settings::default())
    }

    async fn wait_until_settled<S: ProcessStore>(sup: &Supervisor<S>, id: ProcessId) -> ProcessRecord {
        for _ in 0..200 {
            if !sup.is_live(id) {
                return sup.get_process(id).await.expect("record");
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("process {id} did not finish");
    }

    #[test]
    fn test_utf8_chunker_holds_split_sequences() {
        let mut chunker = Utf8Chunker::default();
        let bytes = "héllo €".as_bytes();
        let euro_start = bytes.len() - 3;
        let first = chunker.push(&bytes[..euro_start + 1]);
        let second = chunker.push(&bytes[euro_start + 1..]);
        assert_eq!(first, "héllo ");
        assert_eq!(second, "€");
        assert_eq!(chunker.finish(), "");
    }

    #[test]
    fn test_utf8_chunker_replaces_invalid_bytes() {
        let mut chunker = Utf8Chunker::default();
        assert_eq!(chunker.push(&[b'a', 0xFF, b'b']), "a\u{FFFD}b");
        assert_eq!(chunker.push(&[0xE2, 0x82]), "");
        assert_eq!(chunker.finish(), "\u{FFFD}");
    }

    #[tokio::test]
    async fn test_stderr_is_prefixed_and_exit_code_recorded() {
        let sup = supervisor();
        let id = sup
            .create_process("sh", &["-c".into(), "echo out; echo err >&2; exit 3".into()], "mixed")
            .await
            .unwrap();
        sup.start_process(id).await.unwrap();
        let record = wait_until_settled(&sup, id).await;
        assert_eq!(record.state, ProcessState::Terminated);

        let output: String = sup
            .store()
            .full_output(id)
            .await
            .unwrap()
            .into_iter()
            .map(|row| row.data)
            .collect();
        assert!(output.contains("out\n"));
        assert!(output.contains("Error: err\n"));
        assert!(output.contains("\nProcess exited with code 3\n"));
    }

    #[tokio::test]
    async fn test_spawn_failure_marks_record_as_error() {
        let sup = supervisor();
        let id = sup
            .create_process("/definitely/not/a/binary", &[], "missing")
            .await
            .unwrap();
        let err = sup.start_process(id).await.expect_err("spawn must fail");
        assert!(matches!(err, RelayError::SpawnFailure { .. }));
        assert!(!sup.is_live(id));

        let record = sup.get_process(id).await.unwrap();
        assert_eq!(record.state, ProcessState::Error);
        let ledger = sup.store().full_output(id).await.unwrap();
        assert_eq!(ledger.len(), 1);
        assert!(ledger[0].data.starts_with("Failed to start: "));

        let again = sup.start_process(id).await.expect_err("terminal");
        assert!(matches!(again, RelayError::AlreadyFinished { .. }));
    }

    #[tokio::test]
    async fn test_kill_escalates_to_sigkill() {
        let settings = Settings {
            kill_grace_ms: 100,
            ..Settings::default()
        };
        let sup = Supervisor::new(InMemoryStore::new(), AllowAll, settings);
        let id = sup
            .create_process("sh", &["-c".into(), "trap '' TERM; echo ready; sleep 30".into()], "stubborn")
            .await
            .unwrap();
        sup.start_process(id).await.unwrap();

        // The trap must be installed before the first signal arrives.
        for _ in 0..200 {
            let ledger = sup.store().full_output(id).await.unwrap();
            if ledger.iter().any(|row| row.data.contains("ready")) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let started = std::time::Instant::now();
        tokio::time::timeout(Duration::from_secs(10), sup.kill_process(id))
            .await
            .expect("kill finished")
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(100));

        let summary = sup.list_processes().await.unwrap().remove(0);
        assert_eq!(summary.state, ProcessState::Terminated);
        assert!(summary.output.contains("Process exited with signal SIGKILL"));
    }

    #[tokio::test]
    async fn test_sweep_marks_orphans_terminated() {
        let sup = supervisor();
        let record = sup.store().create("sleep", &["5".into()], "orphan").await.unwrap();
        sup.store()
            .set_state(record.id, ProcessState::Running)
            .await
            .unwrap();

        let swept = sup.sweep_stale().await.unwrap();
        assert_eq!(swept, vec![record.id]);
        let summary = sup.list_processes().await.unwrap().remove(0);
        assert_eq!(summary.state, ProcessState::Terminated);
        assert_eq!(summary.output, LOST_TEXT);
        assert!(sup.sweep_stale().await.unwrap().is_empty());
    }

    /// Lets `budget` appends through, then fails every append.
    struct FailingStore {
        inner: InMemoryStore,
        budget: AtomicUsize,
    }

    impl FailingStore {
        fn new(budget: usize) -> Self {
            Self {
                inner: InMemoryStore::new(),
                budget: AtomicUsize::new(budget),
            }
        }
    }

    #[async_trait]
    impl ProcessStore for FailingStore {
        async fn insert(&self, record: &ProcessRecord) -> Result<(), StoreError> {
            self.inner.insert(record).await
        }

        async fn get(&self, id: ProcessId) -> Result<Option<ProcessRecord>, StoreError> {
            self.inner.get(id).await
        }

        async fn list(&self) -> Result<Vec<ProcessRecord>, StoreError> {
            self.inner.list().await
        }

        async fn set_state(&self, id: ProcessId, state: ProcessState) -> Result<(), StoreError> {
            self.inner.set_state(id, state).await
        }

        async fn mark_running(&self, id: ProcessId, pid: Option<u32>) -> Result<(), StoreError> {
            self.inner.mark_running(id, pid).await
        }

        async fn append_output(&self, record: &OutputRecord) -> Result<(), StoreError> {
            let allowed = self
                .budget
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if !allowed {
                return Err(StoreError::Corrupt("disk full".into()));
            }
            self.inner.append_output(record).await
        }

        async fn output_after(
            &self,
            id: ProcessId,
            after: DateTime<Utc>,
        ) -> Result<Vec<OutputRecord>, StoreError> {
            self.inner.output_after(id, after).await
        }

        async fn last_output_at(&self, id: ProcessId) -> Result<Option<DateTime<Utc>>, StoreError> {
            self.inner.last_output_at(id).await
        }

        async fn delete(&self, id: ProcessId) -> Result<bool, StoreError> {
            self.inner.delete(id).await
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ledger_failure_aborts_the_run() {
        let sup = Supervisor::new(FailingStore::new(3), AllowAll, Settings::default());
        let id = sup
            .create_process(
                "sh",
                &["-c".into(), "while true; do echo tick; sleep 0.01; done".into()],
                "flaky",
            )
            .await
            .unwrap();
        sup.start_process(id).await.unwrap();
        let pid = sup.get_process(id).await.unwrap().pid.expect("pid recorded");
        let stream = sup.attach(id, epoch()).await.unwrap();

        let streamed: Vec<OutputRecord> = tokio::time::timeout(Duration::from_secs(10), stream.try_collect())
            .await
            .expect("stream ends once the run is aborted")
            .unwrap();

        let record = wait_until_settled(&sup, id).await;
        assert_eq!(record.state, ProcessState::Error);
        let ledger = sup.store().full_output(id).await.unwrap();
        assert_eq!(ledger.len(), 3);
        assert_eq!(streamed, ledger);
        assert!(ledger[0].data.starts_with("Command: sh -c"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sup.store().full_output(id).await.unwrap().len(), 3);

        // The group leader was killed and reaped.
        let leader = nix::unistd::Pid::from_raw(pid as i32);
        assert_eq!(
            nix::sys::signal::kill(leader, None),
            Err(nix::errno::Errno::ESRCH)
        );
    }
}
