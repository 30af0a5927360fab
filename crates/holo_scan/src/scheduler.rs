//! Chunk scheduler for batch sessions.
//!
//! A single dispatch loop pulls chunk batches lazily, keeps at most
//! `thread_count * range_multiplier` chunk tasks submitted and buffers up to
//! `thread_count * queue_multiplier` more before parking. Worker concurrency
//! is a semaphore of `thread_count` permits. Chunks that hit the scan time
//! budget are resubmitted and resume from the last key they enqueued; with
//! backoff enabled, locations that keep timing out are deferred while other
//! work is available.

use std::collections::{HashMap, VecDeque};
use std::iter::Peekable;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::{self, Either};
use futures_util::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, trace, warn};

use crate::chunk::Chunk;
use crate::error::ScanError;
use crate::key::{KeyRange, ResultEntry};
use crate::pool::{PoolRegistry, PooledResource, ResourcePool};
use crate::producer::{acquire_until_cancelled, ScanFailure};
use crate::session::ProducerContext;
use crate::stats::ScanStatsSnapshot;
use crate::storage::{ScanRequest, ScanStrategy};

/// Lazy source of chunk batches.
pub type ChunkBatches = Box<dyn Iterator<Item = Vec<Chunk>> + Send>;

/// A chunk registered in the session ledger, ready for dispatch.
#[derive(Debug, Clone)]
pub(crate) struct Submission {
    chunk: Arc<Chunk>,
    slots: Arc<[usize]>,
    /// Transient failures seen so far.
    attempts: usize,
    delay: Option<Duration>,
    submitted_once: bool,
}

impl Submission {
    pub fn new(chunk: Chunk, slots: Vec<usize>) -> Self {
        Self {
            chunk: Arc::new(chunk),
            slots: slots.into(),
            attempts: 0,
            delay: None,
            submitted_once: false,
        }
    }

    fn location(&self) -> Option<&str> {
        self.chunk.last_known_location.as_deref()
    }
}

#[derive(Debug)]
enum TaskOutcome {
    Finished,
    TimeSliced,
    Cancelled,
    Transient(ScanFailure),
    Failed(ScanError),
}

struct TaskReport {
    submission: Submission,
    outcome: TaskOutcome,
    stats: ScanStatsSnapshot,
}

/// Result of one scan of a chunk's remaining ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkEnd {
    Finished,
    TimeSliced,
    Cancelled,
}

struct ChunkRun {
    end: ChunkEnd,
    /// Slots fully covered by this run.
    covered: Vec<usize>,
    /// Entries held back for the speculative winner.
    buffered: Vec<(usize, ResultEntry)>,
    stats: ScanStatsSnapshot,
}

pub(crate) struct ChunkScheduler {
    pools: Arc<PoolRegistry>,
    batches: Peekable<ChunkBatches>,
    pending: VecDeque<Submission>,
    deferred: VecDeque<Submission>,
    in_flight: usize,
    /// Time-sliced executions per location not yet worked off.
    failures: HashMap<String, usize>,
    /// Chunks ever submitted per location.
    server_count: HashMap<String, usize>,
}

impl ChunkScheduler {
    /// `resumed` chunks are already registered in the ledger and run before
    /// anything pulled from `batches`.
    pub fn new(pools: Arc<PoolRegistry>, batches: ChunkBatches, resumed: Vec<Submission>) -> Self {
        Self {
            pools,
            batches: batches.peekable(),
            pending: resumed.into(),
            deferred: VecDeque::new(),
            in_flight: 0,
            failures: HashMap::new(),
            server_count: HashMap::new(),
        }
    }

    pub async fn run(mut self, ctx: &ProducerContext) -> Result<(), ScanError> {
        let workers = Arc::new(Semaphore::new(ctx.config.thread_count.max(1)));
        let max_in_flight = ctx.config.max_in_flight().max(1);
        let max_pending = ctx.config.max_pending().max(1);
        let mut tasks = JoinSet::new();
        let mut chunks = 0usize;

        let result = loop {
            if ctx.is_cancelled() {
                break Ok(());
            }
            if let Err(err) = self.drain_completed(ctx, &workers, &mut tasks) {
                break Err(err);
            }
            self.retry_deferred(ctx, &workers, &mut tasks);

            let more_batches = self.batches.peek().is_some();
            if more_batches || !self.pending.is_empty() {
                if self.in_flight < max_in_flight {
                    if self.pending.is_empty() {
                        chunks += self.pull_batch(ctx);
                    }
                    while self.in_flight < max_in_flight {
                        let Some(submission) = self.pending.pop_front() else {
                            break;
                        };
                        self.admit(ctx, &workers, &mut tasks, submission);
                    }
                    continue;
                }
                if more_batches && self.pending.len() < max_pending {
                    chunks += self.pull_batch(ctx);
                    continue;
                }
            } else if self.in_flight == 0 {
                break Ok(());
            } else if tasks.is_empty() && self.deferred.is_empty() {
                warn!(
                    session = ctx.shared.id,
                    in_flight = self.in_flight,
                    "chunk accounting drifted; finishing dispatch"
                );
                break Ok(());
            }

            let park = ctx.config.park_interval;
            tokio::select! {
                _ = ctx.shared.cancel.cancelled() => {}
                Some(joined) = tasks.join_next() => {
                    if let Err(err) = self.on_complete(ctx, &workers, &mut tasks, joined) {
                        break Err(err);
                    }
                }
                _ = tokio::time::sleep(park) => {}
            }
        };

        if result.is_err() {
            tasks.abort_all();
        }
        while tasks.join_next().await.is_some() {}

        if ctx.is_cancelled() && !ctx.shared.is_force_closed() {
            // Keep the checkpoint complete: every chunk not yet pulled still
            // has to be scanned by a resumed session.
            while self.batches.peek().is_some() {
                chunks += self.pull_batch(ctx);
            }
        }
        if result.is_ok() && !ctx.is_cancelled() {
            debug!(session = ctx.shared.id, chunks, "chunk dispatch finished");
            log_summary(ctx);
        }
        result
    }

    fn drain_completed(
        &mut self,
        ctx: &ProducerContext,
        workers: &Arc<Semaphore>,
        tasks: &mut JoinSet<TaskReport>,
    ) -> Result<(), ScanError> {
        while let Some(Some(joined)) = tasks.join_next().now_or_never() {
            self.on_complete(ctx, workers, tasks, joined)?;
        }
        Ok(())
    }

    /// Pulls one batch and registers its chunks in the ledger.
    fn pull_batch(&mut self, ctx: &ProducerContext) -> usize {
        let Some(batch) = self.batches.next() else {
            return 0;
        };
        let count = batch.len();
        let mut ledger = ctx.shared.lock_ledger();
        for chunk in batch {
            let slots = ledger.register_chunk(chunk.clone(), &[]);
            self.pending.push_back(Submission::new(chunk, slots));
        }
        trace!(session = ctx.shared.id, chunks = count, "pulled chunk batch");
        count
    }

    fn admit(
        &mut self,
        ctx: &ProducerContext,
        workers: &Arc<Semaphore>,
        tasks: &mut JoinSet<TaskReport>,
        mut submission: Submission,
    ) {
        if !submission.submitted_once {
            submission.submitted_once = true;
            self.in_flight += 1;
            if let Some(location) = submission.location() {
                *self.server_count.entry(location.to_string()).or_default() += 1;
            }
            ctx.shared.stats.record_in_flight(self.in_flight);
        }
        if ctx.config.backoff_enabled && !self.can_run(&submission) {
            ctx.shared
                .stats
                .record_deferred(submission.chunk.location_label());
            trace!(
                session = ctx.shared.id,
                location = submission.chunk.location_label(),
                "deferring chunk for a struggling location"
            );
            self.deferred.push_back(submission);
            return;
        }
        self.spawn(ctx, workers, tasks, submission, false);
    }

    /// Decides whether a chunk for a location with time-sliced history may
    /// run now. Each denial works off one recorded failure.
    fn can_run(&mut self, submission: &Submission) -> bool {
        let Some(location) = submission.location() else {
            return true;
        };
        let server_count = self.server_count.get(location).copied().unwrap_or(0);
        let no_more_work = self.pending.is_empty() && self.batches.peek().is_none();
        if no_more_work && self.in_flight <= server_count {
            return true;
        }
        match self.failures.get_mut(location) {
            None | Some(0) => true,
            Some(count) => {
                *count -= 1;
                *count == 0 || self.in_flight <= server_count
            }
        }
    }

    fn retry_deferred(
        &mut self,
        ctx: &ProducerContext,
        workers: &Arc<Semaphore>,
        tasks: &mut JoinSet<TaskReport>,
    ) {
        for _ in 0..self.deferred.len() {
            let Some(submission) = self.deferred.pop_front() else {
                break;
            };
            self.admit(ctx, workers, tasks, submission);
        }
    }

    fn spawn(
        &self,
        ctx: &ProducerContext,
        workers: &Arc<Semaphore>,
        tasks: &mut JoinSet<TaskReport>,
        submission: Submission,
        resubmission: bool,
    ) {
        ctx.shared
            .stats
            .record_submitted(submission.chunk.location_label(), resubmission);
        let ctx = ctx.clone();
        let pools = Arc::clone(&self.pools);
        let workers = Arc::clone(workers);
        tasks.spawn(run_chunk(ctx, pools, workers, submission));
    }

    fn on_complete(
        &mut self,
        ctx: &ProducerContext,
        workers: &Arc<Semaphore>,
        tasks: &mut JoinSet<TaskReport>,
        joined: Result<TaskReport, JoinError>,
    ) -> Result<(), ScanError> {
        let report = match joined {
            Ok(report) => report,
            Err(err) if err.is_cancelled() => {
                self.in_flight = self.in_flight.saturating_sub(1);
                return Ok(());
            }
            Err(err) => {
                return Err(ScanError::producer(anyhow::anyhow!(
                    "chunk task panicked: {err}"
                )))
            }
        };
        let TaskReport {
            mut submission,
            outcome,
            stats,
        } = report;
        let location = submission.chunk.location_label().to_string();

        match outcome {
            TaskOutcome::Finished => {
                self.in_flight = self.in_flight.saturating_sub(1);
                ctx.shared.stats.merge_completed(&location, &stats);
                trace!(session = ctx.shared.id, location = %location, "chunk finished");
                Ok(())
            }
            TaskOutcome::Cancelled => {
                self.in_flight = self.in_flight.saturating_sub(1);
                ctx.shared.stats.merge(&stats);
                Ok(())
            }
            TaskOutcome::TimeSliced => {
                self.bump_failures(&submission);
                ctx.shared.stats.record_chunk_time_slice(&location);
                ctx.shared.stats.merge(&stats);
                let budget_ms = ctx
                    .config
                    .scan_limit
                    .map_or(0, |limit| limit.as_millis() as u64);
                let reason = ScanError::ScanTimeout { budget_ms };
                debug!(
                    session = ctx.shared.id,
                    location = %location,
                    reason = %reason,
                    "resubmitting chunk"
                );
                submission.delay = None;
                self.resubmit(ctx, workers, tasks, submission);
                Ok(())
            }
            TaskOutcome::Transient(err) => {
                ctx.shared.stats.merge(&stats);
                if submission.attempts >= ctx.config.scan_retry_limit {
                    return Err(err.into_error(&submission.chunk.table));
                }
                let delay = ctx.config.retry_backoff(submission.attempts);
                submission.attempts += 1;
                submission.delay = Some(delay);
                self.bump_failures(&submission);
                ctx.shared.stats.record_retry();
                warn!(
                    session = ctx.shared.id,
                    location = %location,
                    attempt = submission.attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient chunk failure; resubmitting"
                );
                self.resubmit(ctx, workers, tasks, submission);
                Ok(())
            }
            TaskOutcome::Failed(err) => {
                ctx.shared.stats.merge(&stats);
                Err(err)
            }
        }
    }

    fn resubmit(
        &mut self,
        ctx: &ProducerContext,
        workers: &Arc<Semaphore>,
        tasks: &mut JoinSet<TaskReport>,
        submission: Submission,
    ) {
        if ctx.config.backoff_enabled && !self.can_run(&submission) {
            ctx.shared
                .stats
                .record_deferred(submission.chunk.location_label());
            self.deferred.push_back(submission);
            return;
        }
        self.spawn(ctx, workers, tasks, submission, true);
    }

    fn bump_failures(&mut self, submission: &Submission) {
        if let Some(location) = submission.location() {
            *self.failures.entry(location.to_string()).or_default() += 1;
        }
    }
}

async fn run_chunk(
    ctx: ProducerContext,
    pools: Arc<PoolRegistry>,
    workers: Arc<Semaphore>,
    submission: Submission,
) -> TaskReport {
    let report = |submission, outcome, stats| TaskReport {
        submission,
        outcome,
        stats,
    };
    let permit = tokio::select! {
        _ = ctx.shared.cancel.cancelled() => None,
        permit = workers.acquire_owned() => permit.ok(),
    };
    let Some(_permit) = permit else {
        return report(submission, TaskOutcome::Cancelled, ScanStatsSnapshot::default());
    };
    if let Some(delay) = submission.delay {
        tokio::select! {
            _ = ctx.shared.cancel.cancelled() => {
                return report(submission, TaskOutcome::Cancelled, ScanStatsSnapshot::default());
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }

    let pool = match pools.pool_for(&submission.chunk.table, &submission.chunk.auths) {
        Ok(pool) => pool,
        Err(err) => {
            return report(submission, TaskOutcome::Failed(err), ScanStatsSnapshot::default());
        }
    };

    let scanned = if ctx.config.speculative_scanning {
        race(&ctx, &pool, &submission).await
    } else {
        scan_chunk(&ctx, &pool, &submission, ScanStrategy::Sequential, false).await
    };
    match scanned {
        Ok(run) => {
            let outcome = match run.end {
                ChunkEnd::Finished => TaskOutcome::Finished,
                ChunkEnd::TimeSliced => TaskOutcome::TimeSliced,
                ChunkEnd::Cancelled => TaskOutcome::Cancelled,
            };
            report(submission, outcome, run.stats)
        }
        Err(failure) => {
            let outcome = if failure.is_transient() {
                TaskOutcome::Transient(failure)
            } else {
                TaskOutcome::Failed(failure.into_error(&submission.chunk.table))
            };
            report(submission, outcome, ScanStatsSnapshot::default())
        }
    }
}

/// Runs the sequential and batch strategies side by side and keeps the first
/// to succeed. The loser is dropped before any result is emitted, so its
/// lease and worker slot are free while the winner waits on the queue.
async fn race(
    ctx: &ProducerContext,
    pool: &Arc<ResourcePool>,
    submission: &Submission,
) -> Result<ChunkRun, ScanFailure> {
    let sequential = Box::pin(scan_chunk(ctx, pool, submission, ScanStrategy::Sequential, true));
    let batch = Box::pin(scan_chunk(ctx, pool, submission, ScanStrategy::Batch, true));

    let (mut run, winner) = match future::select(sequential, batch).await {
        Either::Left((Ok(run), batch)) => {
            drop(batch);
            (run, ScanStrategy::Sequential)
        }
        Either::Right((Ok(run), sequential)) => {
            drop(sequential);
            (run, ScanStrategy::Batch)
        }
        Either::Left((Err(failure), batch)) => {
            trace!(
                session = ctx.shared.id,
                error = %failure,
                "sequential strategy failed; waiting for batch"
            );
            (settle(failure, batch.await)?, ScanStrategy::Batch)
        }
        Either::Right((Err(failure), sequential)) => {
            trace!(
                session = ctx.shared.id,
                error = %failure,
                "batch strategy failed; waiting for sequential"
            );
            (settle(failure, sequential.await)?, ScanStrategy::Sequential)
        }
    };

    match winner {
        ScanStrategy::Sequential => run.stats.speculative_sequential_wins += 1,
        ScanStrategy::Batch => run.stats.speculative_batch_wins += 1,
    }
    for (slot, entry) in std::mem::take(&mut run.buffered) {
        if !ctx.emit(slot, entry).await? {
            run.end = ChunkEnd::Cancelled;
            return Ok(run);
        }
    }
    if run.end == ChunkEnd::Finished {
        let mut ledger = ctx.shared.lock_ledger();
        for slot in &run.covered {
            ledger.mark_done(*slot);
        }
    }
    Ok(run)
}

/// Outcome of a race whose first finisher failed. A batch strategy that
/// could not get a resource says nothing about the chunk, so the sibling's
/// failure wins in that case.
fn settle(
    first: ScanFailure,
    sibling: Result<ChunkRun, ScanFailure>,
) -> Result<ChunkRun, ScanFailure> {
    match (first, sibling) {
        (_, Ok(run)) => Ok(run),
        (ScanFailure::Scan(ScanError::AcquireTimeout { .. }), Err(second)) => Err(second),
        (first, Err(_)) => Err(first),
    }
}

/// Scans the unfinished ranges of a chunk with one resource.
///
/// With `speculative` set, entries are buffered instead of enqueued and the
/// batch strategy gives up after a single bounded acquire, so two racing
/// strategies never wait on each other for pool capacity. The buffer holds a
/// whole chunk; its size is bounded by the chunk's ranges (one tablet's
/// share of the batch), not by `max_results`, and the scan time budget cuts
/// it short like any other slice.
async fn scan_chunk(
    ctx: &ProducerContext,
    pool: &Arc<ResourcePool>,
    submission: &Submission,
    strategy: ScanStrategy,
    speculative: bool,
) -> Result<ChunkRun, ScanFailure> {
    let mut run = ChunkRun {
        end: ChunkEnd::Finished,
        covered: Vec::new(),
        buffered: Vec::new(),
        stats: ScanStatsSnapshot::default(),
    };
    let active = active_ranges(ctx, submission)?;
    if active.is_empty() {
        return Ok(run);
    }

    let started = Instant::now();
    let deadline = ctx
        .config
        .scan_limit
        .map(|limit| tokio::time::Instant::now() + limit);

    let resource = if speculative && strategy == ScanStrategy::Batch {
        Some(pool.acquire().await?)
    } else {
        acquire_until_cancelled(pool, ctx).await?
    };
    let Some(mut resource) = resource else {
        run.end = ChunkEnd::Cancelled;
        return Ok(run);
    };
    run.stats.passes += 1;

    let request = ScanRequest {
        ranges: active.iter().map(|(_, range)| range.clone()).collect(),
        options: submission.chunk.options.clone(),
        strategy,
    };
    if let Err(err) = resource.seek(&request).await {
        resource.release().await;
        return Err(ScanFailure::Storage(err));
    }
    run.stats.record_start(started.elapsed());

    // The budget applies from the second page on so every slice progresses.
    let mut fetched = false;
    loop {
        let fetch_started = Instant::now();
        let page = tokio::select! {
            _ = ctx.shared.cancel.cancelled() => {
                return finish(resource, run, ChunkEnd::Cancelled).await;
            }
            _ = budget_expired(deadline.filter(|_| fetched)) => {
                return finish(resource, run, ChunkEnd::TimeSliced).await;
            }
            page = resource.next_page() => page,
        };
        let entries = match page {
            Ok(Some(entries)) => entries,
            Ok(None) => break,
            Err(err) => {
                resource.release().await;
                return Err(ScanFailure::Storage(err));
            }
        };
        fetched = true;
        run.stats
            .record_page(entries.len(), fetch_started.elapsed());

        for entry in entries {
            let Some(slot) = active
                .iter()
                .find(|(_, range)| range.contains(&entry.key))
                .map(|(slot, _)| *slot)
            else {
                trace!(key = %entry.key, "entry outside the requested ranges");
                continue;
            };
            if speculative {
                run.buffered.push((slot, entry));
            } else if !ctx.emit(slot, entry).await? {
                return finish(resource, run, ChunkEnd::Cancelled).await;
            }
        }
        if deadline.is_some_and(|deadline| tokio::time::Instant::now() >= deadline) {
            return finish(resource, run, ChunkEnd::TimeSliced).await;
        }
    }

    resource.release().await;
    run.covered = active.iter().map(|(slot, _)| *slot).collect();
    if !speculative {
        let mut ledger = ctx.shared.lock_ledger();
        for slot in &run.covered {
            ledger.mark_done(*slot);
        }
    }
    Ok(run)
}

async fn finish(
    resource: PooledResource,
    mut run: ChunkRun,
    end: ChunkEnd,
) -> Result<ChunkRun, ScanFailure> {
    resource.release().await;
    run.end = end;
    Ok(run)
}

async fn budget_expired(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Remaining part of every unfinished range of the chunk, resumed after the
/// last enqueued key. Ranges found exhausted are marked done.
fn active_ranges(
    ctx: &ProducerContext,
    submission: &Submission,
) -> Result<Vec<(usize, KeyRange)>, ScanError> {
    let mut ledger = ctx.shared.lock_ledger();
    let mut active = Vec::with_capacity(submission.slots.len());
    for slot in submission.slots.iter().copied() {
        let Some(view) = ledger.view(slot) else {
            continue;
        };
        if view.done {
            continue;
        }
        let range = match &view.last_key {
            None => view.range,
            Some(last) => match ctx.config.advancer.advance(last, &view.range) {
                Ok(range) => range,
                Err(ScanError::RangeExhausted) => {
                    ledger.mark_done(slot);
                    continue;
                }
                Err(err) => return Err(err),
            },
        };
        active.push((slot, range));
    }
    Ok(active)
}

/// Logs a one-line summary of a finished batch session.
fn log_summary(ctx: &ProducerContext) {
    let stats = ctx.shared.stats.snapshot();
    info!(
        session = ctx.shared.id,
        chunks = stats.chunks_completed,
        time_slices = stats.time_slices,
        deferrals = stats.deferrals,
        peak_in_flight = stats.peak_in_flight,
        "batch scan complete"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Authorizations;
    use crate::memory::MemoryStore;

    fn scheduler() -> ChunkScheduler {
        let store = MemoryStore::builder().build();
        let pools = Arc::new(PoolRegistry::new(
            Arc::new(store),
            2,
            Duration::from_millis(10),
        ));
        ChunkScheduler::new(pools, Box::new(std::iter::empty()), Vec::new())
    }

    fn submission(location: &str) -> Submission {
        let chunk = Chunk::new("t", Authorizations::empty(), vec![KeyRange::all()])
            .with_location(location);
        Submission::new(chunk, vec![0])
    }

    #[test]
    fn unrecorded_location_is_always_runnable() {
        let mut scheduler = scheduler();
        scheduler.pending.push_back(submission("ts-1"));
        scheduler.in_flight = 8;
        assert!(scheduler.can_run(&submission("ts-9")));
    }

    #[test]
    fn denials_work_off_recorded_failures() {
        let mut scheduler = scheduler();
        scheduler.pending.push_back(submission("ts-2"));
        scheduler.in_flight = 3;
        scheduler.server_count.insert("ts-1".to_string(), 1);
        scheduler.failures.insert("ts-1".to_string(), 2);

        let chunk = submission("ts-1");
        assert!(!scheduler.can_run(&chunk));
        assert!(scheduler.can_run(&chunk));
        assert_eq!(scheduler.failures.get("ts-1"), Some(&0));
        assert!(scheduler.can_run(&chunk));
    }

    #[test]
    fn last_remaining_work_runs_regardless_of_failures() {
        let mut scheduler = scheduler();
        scheduler.in_flight = 1;
        scheduler.server_count.insert("ts-1".to_string(), 1);
        scheduler.failures.insert("ts-1".to_string(), 5);

        assert!(scheduler.can_run(&submission("ts-1")));
        assert_eq!(scheduler.failures.get("ts-1"), Some(&5));
    }
}
