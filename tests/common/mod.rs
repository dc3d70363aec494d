#![allow(dead_code)]

use cmdrelay::{
    AllowAll, InMemoryStore, OutputRecord, ProcessId, ProcessRecord, ProcessStore, Settings,
    Supervisor,
};
use futures::TryStreamExt;
use std::time::Duration;

pub fn supervisor() -> Supervisor<InMemoryStore> {
    Supervisor::new(InMemoryStore::new(), AllowAll, Settings::default())
}

pub fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

pub fn concat(rows: &[OutputRecord]) -> String {
    rows.iter().map(|row| row.data.as_str()).collect()
}

pub async fn collect(stream: cmdrelay::OutputStream) -> Vec<OutputRecord> {
    stream.try_collect().await.expect("stream without errors")
}

pub async fn ledger<S: ProcessStore>(sup: &Supervisor<S>, id: ProcessId) -> Vec<OutputRecord> {
    sup.store().full_output(id).await.expect("ledger")
}

/// Wait until the process is no longer live and return its final record.
pub async fn wait_finished<S: ProcessStore>(sup: &Supervisor<S>, id: ProcessId) -> ProcessRecord {
    for _ in 0..400 {
        if !sup.is_live(id) {
            return sup.get_process(id).await.expect("record");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("process {id} still live after 10s");
}

/// Replace the timestamp after `Started at: ` / `Ended at: ` with `<ts>`.
pub fn mask_times(text: &str) -> String {
    text.split_inclusive('\n')
        .map(|line| {
            for prefix in ["Started at: ", "Ended at: "] {
                if line.starts_with(prefix) {
                    let newline = if line.ends_with('\n') { "\n" } else { "" };
                    return format!("{prefix}<ts>{newline}");
                }
            }
            line.to_string()
        })
        .collect()
}

pub fn assert_strictly_increasing(rows: &[OutputRecord]) {
    for pair in rows.windows(2) {
        assert!(
            pair[0].created_at < pair[1].created_at,
            "timestamps not strictly increasing: {:?} then {:?}",
            pair[0].created_at,
            pair[1].created_at
        );
    }
}
