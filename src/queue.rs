//! Submission queue: coalesces concurrent `Add` calls into size/age-bounded
//! batches before handing them to a single flush function.
//!
//! A dedicated dispatcher task owns the in-flight batch so that flush
//! invocations never race with each other; callers only ever see the
//! result of the batch their entry landed in.

use crate::entry::Entry;
use crate::error::{Result, TesseraError};
use crate::storage::traits::StorageError;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// The outcome of a successful `Add`. `is_duplicate` is always `false` for
/// indices freshly assigned here; the antispam decorator sets it when it
/// short-circuits a call before it ever reaches the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Index {
    pub index: u64,
    pub is_duplicate: bool,
}

impl Index {
    pub fn fresh(index: u64) -> Self {
        Self { index, is_duplicate: false }
    }

    pub fn duplicate_of(index: u64) -> Self {
        Self { index, is_duplicate: true }
    }
}

pub type FlushFuture = Pin<Box<dyn Future<Output = Result<u64>> + Send>>;

/// Flushes one batch of entries, assigning them contiguous indices, and
/// returns the first assigned index (from which every entry's index in the
/// batch follows positionally). An `Err` is broadcast to every outstanding
/// future in the batch.
pub type FlushFn = Arc<dyn Fn(Vec<Entry>) -> FlushFuture + Send + Sync>;

struct PendingAdd {
    entry: Entry,
    reply: oneshot::Sender<Result<Index>>,
}

enum QueueMsg {
    Add(PendingAdd),
    Flush,
}

/// Public handle to a running submission queue. Cloning shares the same
/// dispatcher task; dropping the last handle closes the queue, flushing
/// whatever batch is still outstanding.
#[derive(Clone)]
pub struct SubmissionQueue {
    sender: mpsc::UnboundedSender<QueueMsg>,
}

impl SubmissionQueue {
    /// Spawn a new queue with the given flush function and thresholds.
    pub fn new(flush_fn: FlushFn, max_batch_size: usize, max_batch_age: Duration) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(Self::dispatch(receiver, flush_fn, max_batch_size, max_batch_age));
        Self { sender }
    }

    /// Submit an entry, suspending until the batch it lands in has flushed.
    pub async fn add(&self, entry: Entry) -> Result<Index> {
        let (reply, receiver) = oneshot::channel();
        self.sender
            .send(QueueMsg::Add(PendingAdd { entry, reply }))
            .map_err(|_| TesseraError::queue("submission queue dispatcher is no longer running"))?;
        receiver
            .await
            .map_err(|_| TesseraError::queue("submission queue dropped the request before replying"))?
    }

    /// Force an immediate flush of whatever is currently buffered, even if
    /// neither threshold has been reached. Mainly useful for tests and for
    /// a graceful-shutdown path.
    pub fn flush_now(&self) {
        let _ = self.sender.send(QueueMsg::Flush);
    }

    async fn dispatch(
        mut receiver: mpsc::UnboundedReceiver<QueueMsg>,
        flush_fn: FlushFn,
        max_batch_size: usize,
        max_batch_age: Duration,
    ) {
        let mut batch: Vec<PendingAdd> = Vec::new();

        loop {
            let msg = if batch.is_empty() {
                receiver.recv().await
            } else {
                let deadline = Instant::now() + max_batch_age;
                tokio::select! {
                    msg = receiver.recv() => msg,
                    _ = tokio::time::sleep_until(deadline) => {
                        Self::flush_batch(&mut batch, &flush_fn).await;
                        continue;
                    }
                }
            };

            match msg {
                Some(QueueMsg::Add(pending)) => {
                    batch.push(pending);
                    if batch.len() >= max_batch_size {
                        Self::flush_batch(&mut batch, &flush_fn).await;
                    }
                }
                Some(QueueMsg::Flush) => {
                    Self::flush_batch(&mut batch, &flush_fn).await;
                }
                None => {
                    // All senders dropped: flush whatever remains and exit.
                    Self::flush_batch(&mut batch, &flush_fn).await;
                    return;
                }
            }
        }
    }

    async fn flush_batch(batch: &mut Vec<PendingAdd>, flush_fn: &FlushFn) {
        if batch.is_empty() {
            return;
        }
        let taken = std::mem::take(batch);
        let entries: Vec<Entry> = taken.iter().map(|p| p.entry.clone()).collect();
        let count = entries.len();

        match flush_fn(entries).await {
            Ok(first_index) => {
                tracing::debug!(target: "tessera::queue", first_index, count, "flushed batch");
                for (i, pending) in taken.into_iter().enumerate() {
                    let _ = pending.reply.send(Ok(Index::fresh(first_index + i as u64)));
                }
            }
            Err(e) => {
                tracing::warn!(target: "tessera::queue", error = %e, count, "flush failed, pushing error to all waiters");
                for pending in taken {
                    let _ = pending.reply.send(Err(rebroadcast(&e)));
                }
            }
        }
    }
}

/// `TesseraError` does not implement `Clone` (some variants wrap
/// non-`Clone` sources); reconstruct an equivalent error to hand to every
/// future in a failed batch, preserving the pushback sentinel so callers
/// can distinguish "retry later" from everything else.
fn rebroadcast(e: &TesseraError) -> TesseraError {
    match e {
        TesseraError::Storage(StorageError::Pushback(outstanding, limit)) => {
            TesseraError::Storage(StorageError::Pushback(*outstanding, *limit))
        }
        other => TesseraError::internal(other.to_string()),
    }
}
