//! Bounded result queue between session producers and the consumer.
//!
//! Capacity is enforced with a semaphore in front of an unbounded channel:
//! a producer takes one permit per buffered entry and the consumer returns it
//! after receiving. The buffered length therefore never exceeds the permit
//! count, and closing the semaphore wakes every blocked producer at once.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};

use crate::error::ScanError;
use crate::key::ResultEntry;

#[derive(Debug)]
struct QueueShared {
    permits: Semaphore,
    capacity: usize,
    peak: AtomicUsize,
}

impl QueueShared {
    fn len(&self) -> usize {
        self.capacity.saturating_sub(self.permits.available_permits())
    }
}

/// Outcome of a bounded consumer poll.
#[derive(Debug)]
pub enum QueuePoll {
    Entry(ResultEntry),
    /// Nothing arrived within the poll interval.
    Empty,
    /// Every producer handle was dropped and the queue is drained.
    Closed,
}

/// Creates a queue holding at most `capacity` entries.
pub fn bounded(capacity: usize) -> (QueueProducer, QueueConsumer) {
    let capacity = capacity.max(1);
    let shared = Arc::new(QueueShared {
        permits: Semaphore::new(capacity),
        capacity,
        peak: AtomicUsize::new(0),
    });
    let (tx, rx) = mpsc::unbounded_channel();
    (
        QueueProducer {
            tx,
            shared: Arc::clone(&shared),
        },
        QueueConsumer { rx, shared },
    )
}

/// Cloneable producer side of the result queue.
#[derive(Debug, Clone)]
pub struct QueueProducer {
    tx: mpsc::UnboundedSender<ResultEntry>,
    shared: Arc<QueueShared>,
}

impl QueueProducer {
    /// Tries to enqueue `entry`, waiting at most `timeout` for space.
    ///
    /// Returns `Ok(false)` when the wait timed out; the caller keeps the
    /// entry and retries after re-checking cancellation. Fails with
    /// `QueueFullOnForceClose` once the queue was closed.
    pub async fn offer(&self, entry: ResultEntry, timeout: Duration) -> Result<bool, ScanError> {
        let permit = match tokio::time::timeout(timeout, self.shared.permits.acquire()).await {
            Err(_) => return Ok(false),
            Ok(Err(_)) => return Err(ScanError::QueueFullOnForceClose),
            Ok(Ok(permit)) => permit,
        };
        permit.forget();
        let len = self.shared.len();
        self.shared.peak.fetch_max(len, Ordering::Relaxed);
        self.tx
            .send(entry)
            .map_err(|_| ScanError::QueueFullOnForceClose)?;
        Ok(true)
    }

    /// Enqueues `entry`, retrying timed-out offers until `keep_going` returns
    /// false. Returns whether the entry was enqueued.
    pub async fn offer_until<F>(
        &self,
        entry: ResultEntry,
        timeout: Duration,
        mut keep_going: F,
    ) -> Result<bool, ScanError>
    where
        F: FnMut() -> bool,
    {
        loop {
            if !keep_going() {
                return Ok(false);
            }
            let permit = match tokio::time::timeout(timeout, self.shared.permits.acquire()).await
            {
                Err(_) => continue,
                Ok(Err(_)) => return Err(ScanError::QueueFullOnForceClose),
                Ok(Ok(permit)) => permit,
            };
            permit.forget();
            let len = self.shared.len();
            self.shared.peak.fetch_max(len, Ordering::Relaxed);
            return match self.tx.send(entry) {
                Ok(()) => Ok(true),
                Err(returned) => {
                    tracing::trace!(row = %hex::encode(&returned.0.key.row), "queue consumer gone");
                    Err(ScanError::QueueFullOnForceClose)
                }
            };
        }
    }

    pub fn len(&self) -> usize {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.shared.permits.is_closed()
    }
}

/// Single consumer side of the result queue.
#[derive(Debug)]
pub struct QueueConsumer {
    rx: mpsc::UnboundedReceiver<ResultEntry>,
    shared: Arc<QueueShared>,
}

impl QueueConsumer {
    /// Waits up to `timeout` for the next entry.
    pub async fn poll(&mut self, timeout: Duration) -> QueuePoll {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Err(_) => QueuePoll::Empty,
            Ok(None) => QueuePoll::Closed,
            Ok(Some(entry)) => {
                self.shared.permits.add_permits(1);
                QueuePoll::Entry(entry)
            }
        }
    }

    /// Takes an already buffered entry without waiting.
    pub fn try_poll(&mut self) -> QueuePoll {
        match self.rx.try_recv() {
            Ok(entry) => {
                self.shared.permits.add_permits(1);
                QueuePoll::Entry(entry)
            }
            Err(mpsc::error::TryRecvError::Empty) => QueuePoll::Empty,
            Err(mpsc::error::TryRecvError::Disconnected) => QueuePoll::Closed,
        }
    }

    /// Refuses further offers and wakes blocked producers. Already buffered
    /// entries stay drainable.
    pub fn close(&self) {
        self.shared.permits.close();
    }

    /// Handle that can close the queue without holding the consumer.
    pub fn closer(&self) -> QueueCloser {
        QueueCloser {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn len(&self) -> usize {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Largest buffered length observed so far.
    pub fn peak(&self) -> usize {
        self.shared.peak.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

/// Detached close handle for a result queue.
#[derive(Debug, Clone)]
pub struct QueueCloser {
    shared: Arc<QueueShared>,
}

impl QueueCloser {
    pub fn close(&self) {
        self.shared.permits.close();
    }

    pub fn len(&self) -> usize {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn peak(&self) -> usize {
        self.shared.peak.load(Ordering::Relaxed)
    }
}
