/// Bounded row set between two transforms
///
/// Exactly one producer and one consumer per row set. `put` waits while the buffer
/// is full, `get` waits until a row is available or the row set is done and
/// drained. Both wake up on a stop request. Backpressure comes from the bounded
/// tokio mpsc channel underneath.

use crate::error::ChannelError;
use crate::row::{Row, RowSchema};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tokio::sync::{mpsc, Notify};
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;

/// Outcome of a non-blocking read
#[derive(Debug)]
pub enum Fetch {
    Row(Row),
    /// Nothing buffered yet, the producer is still running
    Empty,
    /// Done and drained: no more rows will ever arrive
    Drained,
}

/// Capacity limited queue of rows with a terminal flag
#[derive(Debug)]
pub struct RowSet {
    /// "from - to"
    name: String,
    from: String,
    to: String,
    capacity: usize,
    /// Schema of every row on this set, fixed by the first put
    schema: OnceLock<Arc<RowSchema>>,
    /// Taken out by `mark_done`; `None` means terminal
    sender: Mutex<Option<mpsc::Sender<Row>>>,
    receiver: Mutex<mpsc::Receiver<Row>>,
    buffered: AtomicUsize,
    /// Cancelled once the row set is terminal
    done: CancellationToken,
    /// Shared by every input row set of the consuming transform
    consumer_signal: Arc<Notify>,
    /// Stop request of the owning pipeline
    stop: CancellationToken,
}

impl RowSet {
    pub fn new(
        from: &str,
        to: &str,
        capacity: usize,
        consumer_signal: Arc<Notify>,
        stop: CancellationToken,
    ) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            name: format!("{} - {}", from, to),
            from: from.to_string(),
            to: to.to_string(),
            capacity,
            schema: OnceLock::new(),
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(rx),
            buffered: AtomicUsize::new(0),
            done: CancellationToken::new(),
            consumer_signal,
            stop,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn from(&self) -> &str {
        &self.from
    }

    pub fn to(&self) -> &str {
        &self.to
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Rows currently waiting in the buffer
    pub fn buffered(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    pub fn schema(&self) -> Option<Arc<RowSchema>> {
        self.schema.get().cloned()
    }

    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Push a row, waiting while the buffer is full
    ///
    /// The first put fixes the schema of the row set; later rows must have the same
    /// arity.
    pub async fn put(&self, schema: &Arc<RowSchema>, row: Row) -> Result<(), ChannelError> {
        if self.stop.is_cancelled() {
            return Err(ChannelError::Stopped(self.name.clone()));
        }
        let expected = self.schema.get_or_init(|| schema.clone());
        if expected.len() != row.len() {
            return Err(ChannelError::SchemaMismatch {
                rowset: self.name.clone(),
                expected: expected.len(),
                actual: row.len(),
            });
        }

        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| ChannelError::Closed(self.name.clone()))?;

        let permit = tokio::select! {
            biased;
            _ = self.stop.cancelled() => return Err(ChannelError::Stopped(self.name.clone())),
            _ = self.done.cancelled() => return Err(ChannelError::Closed(self.name.clone())),
            permit = sender.reserve() => permit.map_err(|_| ChannelError::Closed(self.name.clone()))?,
        };

        // Sending under the sender lock orders the row before any mark_done
        {
            let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
            if guard.is_none() {
                return Err(ChannelError::Closed(self.name.clone()));
            }
            self.buffered.fetch_add(1, Ordering::SeqCst);
            permit.send(row);
        }
        self.consumer_signal.notify_one();
        Ok(())
    }

    /// Non-blocking read
    pub fn try_get(&self) -> Fetch {
        let done = self.done.is_cancelled();
        let mut receiver = self.receiver.lock().unwrap_or_else(PoisonError::into_inner);
        match receiver.try_recv() {
            Ok(row) => {
                self.buffered.fetch_sub(1, Ordering::SeqCst);
                Fetch::Row(row)
            }
            Err(TryRecvError::Empty) if done => Fetch::Drained,
            Err(TryRecvError::Empty) => Fetch::Empty,
            Err(TryRecvError::Disconnected) => Fetch::Drained,
        }
    }

    /// Wait for the next row. `Ok(None)` means done and drained.
    pub async fn get(&self) -> Result<Option<Row>, ChannelError> {
        loop {
            match self.try_get() {
                Fetch::Row(row) => return Ok(Some(row)),
                Fetch::Drained => return Ok(None),
                Fetch::Empty => {}
            }
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => return Err(ChannelError::Stopped(self.name.clone())),
                _ = self.consumer_signal.notified() => {}
            }
        }
    }

    /// Mark the row set terminal. Idempotent; wakes the consumer and a blocked
    /// producer.
    pub fn mark_done(&self) {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.done.cancel();
        if sender.is_some() {
            tracing::debug!("🏁 Row set '{}' done", self.name);
            drop(sender);
            self.consumer_signal.notify_one();
        }
    }
}
