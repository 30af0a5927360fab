//! Scan sessions.
//!
//! A session owns one producer task that scans ranges (directly or through
//! the chunk scheduler) and publishes results into a bounded queue. The
//! consumer pulls with [`ScanSession::has_next`] / [`ScanSession::next`].
//!
//! State machine: `New -> Running -> Stopping -> Terminated`, with `Failed`
//! reachable from any live state on an unrecoverable producer error. States
//! only move forward and nothing leaves `Terminated`/`Failed`.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures_util::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{Ledger, SessionCheckpoint, SessionKind};
use crate::chunk::{Authorizations, ScanOptions};
use crate::config::ScanConfig;
use crate::error::ScanError;
use crate::key::ResultEntry;
use crate::producer::RangeProducer;
use crate::queue::{QueueCloser, QueueConsumer, QueuePoll, QueueProducer};
use crate::scheduler::ChunkScheduler;
use crate::stats::{ScanSessionStats, ScanStatsSnapshot};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum SessionState {
    New = 0,
    Running = 1,
    Stopping = 2,
    Terminated = 3,
    Failed = 4,
}

impl SessionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::New,
            1 => Self::Running,
            2 => Self::Stopping,
            3 => Self::Terminated,
            _ => Self::Failed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State transition published to the orchestrator listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub session: u64,
    pub kind: SessionKind,
    pub table: String,
    pub state: SessionState,
}

/// Identity and state of a live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: u64,
    pub kind: SessionKind,
    pub table: String,
    pub state: SessionState,
}

/// Work a producer task performs.
pub(crate) enum ProducerPlan {
    Ranges(RangeProducer),
    Chunks(ChunkScheduler),
}

impl ProducerPlan {
    async fn run(self, ctx: ProducerContext) -> Result<(), ScanError> {
        match self {
            Self::Ranges(producer) => producer.run(&ctx).await,
            Self::Chunks(scheduler) => scheduler.run(&ctx).await,
        }
    }
}

/// State shared between a session handle, its producer and the orchestrator.
pub(crate) struct SessionShared {
    pub id: u64,
    pub kind: SessionKind,
    pub table: String,
    pub auths: Authorizations,
    pub options: ScanOptions,
    pub cancel: CancellationToken,
    pub stats: ScanSessionStats,
    state: AtomicU8,
    started: AtomicBool,
    force_closed: AtomicBool,
    error: Mutex<Option<ScanError>>,
    ledger: Mutex<Ledger>,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
    closer: QueueCloser,
    handle: Mutex<Option<JoinHandle<()>>>,
    close_wait: Duration,
}

impl SessionShared {
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            kind: self.kind,
            table: self.table.clone(),
            state: self.state(),
        }
    }

    /// Moves the state forward to `to`. Returns whether this call performed
    /// the transition.
    pub fn transition(&self, to: SessionState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let from = SessionState::from_u8(current);
            if from.is_terminal() || from >= to {
                return false;
            }
            match self.state.compare_exchange(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    debug!(session = self.id, from = %from, to = %to, "session state change");
                    self.publish(to);
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Records a producer failure. The first recorded error wins; failures
    /// observed after cancellation are attributed to the close and dropped.
    pub fn record_error(&self, err: ScanError) -> bool {
        if self.cancel.is_cancelled() {
            debug!(session = self.id, error = %err, "suppressing error raised during close");
            return false;
        }
        {
            let mut slot = self.lock_error();
            if slot.is_some() {
                return false;
            }
            error!(session = self.id, table = %self.table, error = %err, "scan session failed");
            *slot = Some(err);
        }
        self.cancel.cancel();
        self.closer.close();
        self.transition(SessionState::Failed);
        true
    }

    pub fn error(&self) -> Option<ScanError> {
        self.lock_error().clone()
    }

    pub fn is_force_closed(&self) -> bool {
        self.force_closed.load(Ordering::Acquire)
    }

    pub fn lock_ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Flags the force close, cancels the producer and waits for it to
    /// unwind (aborting it after `close_wait`).
    pub async fn force_close(&self) {
        if self.force_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.closer.close();
        self.join_producer().await;
        self.transition(SessionState::Terminated);
        info!(session = self.id, table = %self.table, "closed scan session");
    }

    /// Synchronous variant used when a session handle is dropped.
    fn force_close_now(&self) {
        if self.force_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.closer.close();
        if let Some(handle) = self.lock_handle().take() {
            handle.abort();
        }
        self.transition(SessionState::Terminated);
    }

    async fn join_producer(&self) {
        let handle = self.lock_handle().take();
        let Some(mut handle) = handle else {
            return;
        };
        match tokio::time::timeout(self.close_wait, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) if err.is_cancelled() => {}
            Ok(Err(err)) => {
                warn!(session = self.id, error = %err, "scan producer panicked");
            }
            Err(_) => {
                warn!(
                    session = self.id,
                    wait_ms = self.close_wait.as_millis() as u64,
                    "scan producer did not stop in time; aborting"
                );
                handle.abort();
            }
        }
    }

    fn publish(&self, state: SessionState) {
        if let Some(events) = &self.events {
            let _ = events.send(SessionEvent {
                session: self.id,
                kind: self.kind,
                table: self.table.clone(),
                state,
            });
        }
    }

    fn lock_error(&self) -> MutexGuard<'_, Option<ScanError>> {
        self.error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_handle(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Everything a producer (or one of its chunk tasks) needs to publish
/// results.
#[derive(Clone)]
pub(crate) struct ProducerContext {
    pub shared: Arc<SessionShared>,
    pub queue: QueueProducer,
    pub config: Arc<ScanConfig>,
}

impl ProducerContext {
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Enqueues `entry` as progress of ledger `slot`, retrying the bounded
    /// offer until it succeeds or the session is cancelled. Returns
    /// `Ok(false)` when cancelled.
    pub async fn emit(&self, slot: usize, entry: ResultEntry) -> Result<bool, ScanError> {
        let key = entry.key.clone();
        let cancel = &self.shared.cancel;
        match self
            .queue
            .offer_until(entry, self.config.offer_timeout, || !cancel.is_cancelled())
            .await
        {
            Ok(true) => {
                self.shared.lock_ledger().record_enqueued(slot, &key);
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(ScanError::QueueFullOnForceClose) if self.is_cancelled() => Ok(false),
            Err(err) => Err(err),
        }
    }
}

/// Parameters for building a session.
pub(crate) struct SessionParams {
    pub id: u64,
    pub kind: SessionKind,
    pub table: String,
    pub auths: Authorizations,
    pub options: ScanOptions,
    pub ledger: Ledger,
    pub plan: ProducerPlan,
    pub config: Arc<ScanConfig>,
    pub events: Option<mpsc::UnboundedSender<SessionEvent>>,
}

/// One logical scan stream.
pub struct ScanSession {
    shared: Arc<SessionShared>,
    config: Arc<ScanConfig>,
    consumer: tokio::sync::Mutex<QueueConsumer>,
    buffered: Mutex<Option<ResultEntry>>,
    launch: Mutex<Option<(ProducerPlan, QueueProducer)>>,
}

impl fmt::Debug for ScanSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanSession")
            .field("id", &self.shared.id)
            .field("kind", &self.shared.kind)
            .field("table", &self.shared.table)
            .field("state", &self.shared.state())
            .finish()
    }
}

impl ScanSession {
    pub(crate) fn new(params: SessionParams) -> Self {
        let (queue, consumer) = crate::queue::bounded(params.config.max_results);
        let shared = Arc::new(SessionShared {
            id: params.id,
            kind: params.kind,
            table: params.table,
            auths: params.auths,
            options: params.options,
            cancel: CancellationToken::new(),
            stats: ScanSessionStats::default(),
            state: AtomicU8::new(SessionState::New as u8),
            started: AtomicBool::new(false),
            force_closed: AtomicBool::new(false),
            error: Mutex::new(None),
            ledger: Mutex::new(params.ledger),
            events: params.events,
            closer: consumer.closer(),
            handle: Mutex::new(None),
            close_wait: params.config.close_wait,
        });
        Self {
            shared,
            config: params.config,
            consumer: tokio::sync::Mutex::new(consumer),
            buffered: Mutex::new(None),
            launch: Mutex::new(Some((params.plan, queue))),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<SessionShared> {
        &self.shared
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn kind(&self) -> SessionKind {
        self.shared.kind
    }

    pub fn table(&self) -> &str {
        &self.shared.table
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Entries currently buffered in the result queue.
    pub fn queue_len(&self) -> usize {
        self.shared.closer.len()
    }

    /// Largest number of entries ever buffered in the result queue.
    pub fn queue_peak(&self) -> usize {
        self.shared.closer.peak()
    }

    /// Spawns the producer task. Safe to race: exactly one caller performs
    /// the start, later calls are no-ops.
    pub fn start(&self) -> Result<(), ScanError> {
        let shared = &self.shared;
        if shared
            .state
            .compare_exchange(
                SessionState::New as u8,
                SessionState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            let state = shared.state();
            if state.is_terminal() && !shared.started.load(Ordering::Acquire) {
                return Err(ScanError::InvalidState {
                    session: shared.id,
                    state: state.as_str(),
                });
            }
            return Ok(());
        }
        shared.started.store(true, Ordering::Release);
        shared.publish(SessionState::Running);

        let launch = self
            .launch
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some((plan, queue)) = launch else {
            shared.transition(SessionState::Stopping);
            return Ok(());
        };

        let ctx = ProducerContext {
            shared: Arc::clone(shared),
            queue,
            config: Arc::clone(&self.config),
        };
        let task_shared = Arc::clone(shared);
        info!(
            session = shared.id,
            kind = shared.kind.as_str(),
            table = %shared.table,
            "starting scan session"
        );
        let handle = tokio::spawn(async move {
            let result = plan.run(ctx).await;
            match result {
                Ok(()) => {
                    debug!(session = task_shared.id, "scan producer finished");
                    task_shared.transition(SessionState::Stopping);
                }
                Err(err) if err.is_control_flow() => {
                    debug!(session = task_shared.id, error = %err, "scan producer stopped");
                    task_shared.transition(SessionState::Stopping);
                }
                Err(err) => {
                    if !task_shared.record_error(err) {
                        task_shared.transition(SessionState::Stopping);
                    }
                }
            }
        });
        *shared.lock_handle() = Some(handle);
        Ok(())
    }

    /// Waits until a result is buffered (`true`) or the stream ended
    /// (`false`), re-raising a recorded producer failure.
    ///
    /// Starts the session on first use.
    pub async fn has_next(&self) -> Result<bool, ScanError> {
        let started = Instant::now();
        let result = self.wait_for_result().await;
        self.shared.stats.record_has_next(started.elapsed());
        result
    }

    async fn wait_for_result(&self) -> Result<bool, ScanError> {
        if self.lock_buffered().is_some() {
            return Ok(true);
        }
        if let Some(err) = self.shared.error() {
            return Err(err);
        }
        if self.shared.is_force_closed() {
            return Ok(false);
        }
        if self.shared.state() == SessionState::New {
            self.start()?;
        }

        let mut consumer = self.consumer.lock().await;
        loop {
            if self.lock_buffered().is_some() {
                return Ok(true);
            }
            if let Some(err) = self.shared.error() {
                return Err(err);
            }
            if self.shared.is_force_closed() {
                return Ok(false);
            }
            match consumer.poll(self.config.poll_interval).await {
                QueuePoll::Entry(entry) => {
                    *self.lock_buffered() = Some(entry);
                    return Ok(true);
                }
                QueuePoll::Empty => continue,
                QueuePoll::Closed => {
                    if let Some(err) = self.shared.error() {
                        return Err(err);
                    }
                    self.shared.transition(SessionState::Terminated);
                    return Ok(false);
                }
            }
        }
    }

    /// Takes the result buffered by the last successful `has_next`.
    pub fn next(&self) -> Result<ResultEntry, ScanError> {
        match self.lock_buffered().take() {
            Some(entry) => {
                self.shared.stats.record_delivered();
                Ok(entry)
            }
            None => Err(self.shared.error().unwrap_or(ScanError::NoBufferedResult)),
        }
    }

    /// `has_next` followed by `next`.
    pub async fn next_entry(&self) -> Result<Option<ResultEntry>, ScanError> {
        if self.has_next().await? {
            self.next().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Adapts the session into a stream that ends after the last result or
    /// the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<ResultEntry, ScanError>> {
        futures_util::stream::unfold(Some(self), |state| async move {
            let session = state?;
            match session.next_entry().await {
                Ok(Some(entry)) => Some((Ok(entry), Some(session))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
    }

    /// Stops the producer and ends the stream. Idempotent and safe from any
    /// state.
    pub async fn close(&self) {
        self.lock_launch().take();
        self.shared.force_close().await;
    }

    /// Accumulated statistics, when statistics collection is enabled.
    pub fn get_statistics(&self) -> Option<ScanStatsSnapshot> {
        self.config
            .accrue_stats
            .then(|| self.shared.stats.snapshot())
    }

    /// Stops production and externalizes what remains to be scanned.
    ///
    /// Results already enqueued stay drainable from this session; the
    /// checkpoint resumes after the last enqueued key of every range.
    pub async fn checkpoint(&self) -> Result<SessionCheckpoint, ScanError> {
        self.shared.cancel.cancel();
        if self.lock_launch().take().is_some() {
            self.shared.transition(SessionState::Stopping);
        }
        self.shared.join_producer().await;
        if let Some(err) = self.shared.error() {
            return Err(err);
        }
        let shared = &self.shared;
        let checkpoint =
            shared
                .lock_ledger()
                .checkpoint(shared.kind, &shared.table, &shared.auths, &shared.options);
        info!(
            session = shared.id,
            ranges = checkpoint.ranges.len(),
            chunks = checkpoint.chunks.len(),
            "checkpointed scan session"
        );
        Ok(checkpoint)
    }

    fn lock_buffered(&self) -> MutexGuard<'_, Option<ResultEntry>> {
        self.buffered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_launch(&self) -> MutexGuard<'_, Option<(ProducerPlan, QueueProducer)>> {
        self.launch
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for ScanSession {
    fn drop(&mut self) {
        self.shared.force_close_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_only_move_forward() {
        assert!(SessionState::New < SessionState::Running);
        assert!(SessionState::Stopping < SessionState::Terminated);
        assert!(SessionState::Terminated.is_terminal());
        assert!(SessionState::Failed.is_terminal());
        for state in [
            SessionState::New,
            SessionState::Running,
            SessionState::Stopping,
            SessionState::Terminated,
            SessionState::Failed,
        ] {
            assert_eq!(SessionState::from_u8(state as u8), state);
        }
    }
}
