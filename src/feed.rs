//! Live output fan-out for one running process.
//!
//! One writer, any number of readers. Each reader has its own cursor into a
//! bounded ring, so a slow reader lags on its own and never blocks the
//! writer or the other readers.

use crate::process_record::OutputRecord;
use tokio::sync::broadcast::{self, error::RecvError};

#[derive(Debug, Clone)]
pub struct OutputFeed {
    tx: broadcast::Sender<OutputRecord>,
}

impl OutputFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to every current reader. Returns how many readers it reached.
    pub fn publish(&self, record: OutputRecord) -> usize {
        // No readers attached is the common case, not an error.
        self.tx.send(record).unwrap_or(0)
    }

    pub fn subscribe(&self) -> FeedReader {
        FeedReader {
            rx: self.tx.subscribe(),
        }
    }

    pub fn reader_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// What a reader observes next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    Record(OutputRecord),
    /// The reader fell this many records behind; they were overwritten.
    Lagged(u64),
    /// The writer is gone. No more records will arrive.
    Closed,
}

#[derive(Debug)]
pub struct FeedReader {
    rx: broadcast::Receiver<OutputRecord>,
}

impl FeedReader {
    pub async fn next(&mut self) -> FeedEvent {
        match self.rx.recv().await {
            Ok(record) => FeedEvent::Record(record),
            Err(RecvError::Lagged(skipped)) => FeedEvent::Lagged(skipped),
            Err(RecvError::Closed) => FeedEvent::Closed,
        }
    }
}
