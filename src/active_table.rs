//! Processes that are live in this supervisor instance.
//!
//! An entry exists from the moment a start is accepted until the exit has
//! been written to the ledger. Presence in the table is what "live here"
//! means; the durable state is tracked separately by the store.

use crate::feed::{FeedReader, OutputFeed};
use crate::process_record::{OutputRecord, ProcessId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};
use tokio::sync::watch;

/// Shared view of one live process. Only the supervisor's capture task
/// writes through it; everyone else may subscribe, ask for a kill, or wait.
#[derive(Debug)]
pub struct ActiveProcess {
    pid: OnceLock<u32>,
    feed: Mutex<Option<OutputFeed>>,
    kill_tx: watch::Sender<bool>,
    exited_rx: watch::Receiver<bool>,
}

impl ActiveProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid.get().copied()
    }

    /// `None` once the feed has been closed.
    pub fn subscribe(&self) -> Option<FeedReader> {
        self.feed.lock().as_ref().map(OutputFeed::subscribe)
    }

    pub fn reader_count(&self) -> usize {
        self.feed
            .lock()
            .as_ref()
            .map_or(0, OutputFeed::reader_count)
    }

    /// Idempotent.
    pub fn request_kill(&self) {
        self.kill_tx.send_replace(true);
    }

    pub fn kill_requested(&self) -> bool {
        *self.kill_tx.borrow()
    }

    /// Resolves once the exit has been recorded and the entry removed.
    pub async fn wait_exited(&self) {
        let mut rx = self.exited_rx.clone();
        // A dropped sender also means the capture task is gone.
        let _ = rx.wait_for(|exited| *exited).await;
    }

    pub(crate) fn set_pid(&self, pid: u32) {
        let _ = self.pid.set(pid);
    }

    pub(crate) fn publish(&self, record: OutputRecord) {
        if let Some(feed) = self.feed.lock().as_ref() {
            feed.publish(record);
        }
    }

    fn close_feed(&self) {
        self.feed.lock().take();
    }
}

#[derive(Debug, Clone, Default)]
pub struct ActiveTable {
    entries: Arc<DashMap<ProcessId, Arc<ActiveProcess>>>,
}

impl ActiveTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id` for a start. `None` if it is already live here.
    pub(crate) fn reserve(&self, id: ProcessId, feed_capacity: usize) -> Option<LiveGuard> {
        match self.entries.entry(id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let (kill_tx, kill_rx) = watch::channel(false);
                let (exited_tx, exited_rx) = watch::channel(false);
                let active = Arc::new(ActiveProcess {
                    pid: OnceLock::new(),
                    feed: Mutex::new(Some(OutputFeed::new(feed_capacity))),
                    kill_tx,
                    exited_rx,
                });
                slot.insert(Arc::clone(&active));
                Some(LiveGuard {
                    table: self.clone(),
                    id,
                    active,
                    kill_rx,
                    exited_tx,
                })
            }
        }
    }

    pub fn get(&self, id: ProcessId) -> Option<Arc<ActiveProcess>> {
        self.entries.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: ProcessId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<ProcessId> {
        self.entries.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn release(&self, id: ProcessId, active: &Arc<ActiveProcess>) {
        self.entries
            .remove_if(&id, |_, current| Arc::ptr_eq(current, active));
    }
}

/// Owned by whoever drives the process. Dropping it closes the feed,
/// removes the table entry and wakes everyone waiting for the exit, in that
/// order.
#[derive(Debug)]
pub(crate) struct LiveGuard {
    table: ActiveTable,
    id: ProcessId,
    active: Arc<ActiveProcess>,
    kill_rx: watch::Receiver<bool>,
    exited_tx: watch::Sender<bool>,
}

impl LiveGuard {
    pub(crate) fn active(&self) -> &Arc<ActiveProcess> {
        &self.active
    }

    pub(crate) fn kill_signal(&self) -> watch::Receiver<bool> {
        self.kill_rx.clone()
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.active.close_feed();
        self.table.release(self.id, &self.active);
        self.exited_tx.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FeedEvent;

    #[test]
    fn test_reserve_is_exclusive() {
        let table = ActiveTable::new();
        let id = ProcessId::new();
        let guard = table.reserve(id, 8).expect("first reservation");
        assert!(table.reserve(id, 8).is_none());
        assert!(table.contains(id));
        drop(guard);
        assert!(!table.contains(id));
        assert!(table.reserve(id, 8).is_some());
    }

    #[tokio::test]
    async fn test_guard_drop_closes_feed_and_signals_exit() {
        let table = ActiveTable::new();
        let id = ProcessId::new();
        let guard = table.reserve(id, 8).expect("reserve");
        let active = table.get(id).expect("present");
        let mut reader = active.subscribe().expect("open feed");

        let waiter = {
            let active = Arc::clone(&active);
            tokio::spawn(async move { active.wait_exited().await })
        };
        drop(guard);

        waiter.await.expect("waiter");
        assert_eq!(reader.next().await, FeedEvent::Closed);
        assert!(active.subscribe().is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_kill_request_is_sticky() {
        let table = ActiveTable::new();
        let guard = table.reserve(ProcessId::new(), 8).expect("reserve");
        let rx = guard.kill_signal();
        guard.active().request_kill();
        guard.active().request_kill();
        assert!(*rx.borrow());
        assert!(guard.active().kill_requested());
    }
}
