//! Replay-then-follow output streams.
//!
//! The live feed is subscribed *before* the ledger is queried. Every record
//! is in the ledger before it is published, so the two views overlap but
//! never leave a hole, and the overlap is dropped by comparing timestamps
//! against the last delivered one.

use crate::error::{RelayError, RelayResult};
use crate::feed::{FeedEvent, FeedReader};
use crate::process_record::{OutputRecord, ProcessId};
use crate::storage::ProcessStore;
use crate::supervisor::Supervisor;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, warn};

/// Ordered output of one process, historical records first.
///
/// Ends when the process has exited and everything has been delivered.
/// Dropping it detaches from the live feed and nothing else.
pub struct OutputStream {
    process_id: ProcessId,
    live: bool,
    inner: BoxStream<'static, RelayResult<OutputRecord>>,
}

impl OutputStream {
    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    /// Whether a live tail was attached when the stream was opened.
    pub fn is_live(&self) -> bool {
        self.live
    }
}

impl fmt::Debug for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputStream")
            .field("process_id", &self.process_id)
            .field("live", &self.live)
            .finish_non_exhaustive()
    }
}

impl Stream for OutputStream {
    type Item = RelayResult<OutputRecord>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

struct AttachState<S: ProcessStore> {
    store: Arc<S>,
    id: ProcessId,
    cursor: DateTime<Utc>,
    backlog: VecDeque<OutputRecord>,
    reader: Option<FeedReader>,
    failed: bool,
}

impl<S: ProcessStore> AttachState<S> {
    async fn next_record(&mut self) -> Option<RelayResult<OutputRecord>> {
        loop {
            if let Some(record) = self.backlog.pop_front() {
                self.cursor = record.created_at;
                return Some(Ok(record));
            }
            if self.failed {
                return None;
            }
            let reader = self.reader.as_mut()?;
            match reader.next().await {
                FeedEvent::Record(record) => {
                    if record.created_at <= self.cursor {
                        continue;
                    }
                    self.cursor = record.created_at;
                    return Some(Ok(record));
                }
                FeedEvent::Lagged(skipped) => {
                    warn!(process_id = %self.id, skipped, "reader lagged, catching up from ledger");
                    match self.store.output_after(self.id, self.cursor).await {
                        Ok(rows) => self.backlog.extend(rows),
                        Err(err) => {
                            self.failed = true;
                            return Some(Err(err.into()));
                        }
                    }
                }
                FeedEvent::Closed => {
                    debug!(process_id = %self.id, "live feed closed");
                    self.reader = None;
                    return None;
                }
            }
        }
    }
}

impl<S: ProcessStore> Supervisor<S> {
    /// Stream every record after `after`, then follow the process live
    /// until it exits.
    ///
    /// A process that is not live in this instance yields its history and
    /// ends.
    pub async fn attach(&self, id: ProcessId, after: DateTime<Utc>) -> RelayResult<OutputStream> {
        if self.store().get(id).await?.is_none() {
            return Err(RelayError::NotFound(id));
        }

        let reader = self.table().get(id).and_then(|active| active.subscribe());
        let backlog = self.store().output_after(id, after).await?;
        let live = reader.is_some();
        debug!(process_id = %id, replay = backlog.len(), live, "attached");

        let state = AttachState {
            store: Arc::clone(self.store()),
            id,
            cursor: after,
            backlog: backlog.into(),
            reader,
            failed: false,
        };
        let inner = stream::unfold(state, |mut state| async move {
            state.next_record().await.map(|item| (item, state))
        })
        .boxed();

        Ok(OutputStream {
            process_id: id,
            live,
            inner,
        })
    }
}
