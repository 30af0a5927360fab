//! Sequential range producer.
//!
//! Pops ranges in start-key order, scans each one in passes against a pooled
//! resource and publishes every entry into the session queue. A pass ends
//! when the range is exhausted, when the fairness slice was emitted, or on a
//! transient storage failure; the next pass resumes through the range
//! advancer from the last key read.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::advance::RangeAdvancer;
use crate::chunk::ScanOptions;
use crate::compact::DayCompactor;
use crate::error::{classify, storage_failure, FailureClass, ScanError};
use crate::key::{Key, KeyRange, ResultEntry};
use crate::pool::{PooledResource, ResourcePool};
use crate::session::ProducerContext;
use crate::storage::ScanRequest;

/// How a single pass over a range ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassOutcome {
    Exhausted,
    /// Fairness slice reached; resume in a new pass.
    Yielded,
    Cancelled,
}

/// Failure of one scan attempt: an engine error, or a collaborator error
/// still to be classified.
#[derive(Debug)]
pub(crate) enum ScanFailure {
    Scan(ScanError),
    Storage(anyhow::Error),
}

impl ScanFailure {
    /// Whether another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Scan(err) => matches!(err, ScanError::Unavailable { .. }),
            Self::Storage(err) => classify(err) == FailureClass::Transient,
        }
    }

    /// The error surfaced once no further attempt is made.
    pub fn into_error(self, table: &str) -> ScanError {
        match self {
            Self::Scan(ScanError::Unavailable { cause, .. }) => ScanError::Producer(cause),
            Self::Scan(err) => err,
            Self::Storage(err) => storage_failure(table, err),
        }
    }
}

impl From<ScanError> for ScanFailure {
    fn from(err: ScanError) -> Self {
        Self::Scan(err)
    }
}

impl fmt::Display for ScanFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scan(err) => write!(f, "{err}"),
            Self::Storage(err) => write!(f, "{err:#}"),
        }
    }
}

/// Producer for scanner and range-stream sessions.
pub(crate) struct RangeProducer {
    pool: Arc<ResourcePool>,
    options: ScanOptions,
    advancer: RangeAdvancer,
    slots: VecDeque<usize>,
    compactor: Option<DayCompactor>,
}

impl RangeProducer {
    /// `slots` are ledger slots in the order they should be scanned.
    pub fn new(
        pool: Arc<ResourcePool>,
        options: ScanOptions,
        advancer: RangeAdvancer,
        slots: Vec<usize>,
        compactor: Option<DayCompactor>,
    ) -> Self {
        Self {
            pool,
            options,
            advancer,
            slots: slots.into(),
            compactor,
        }
    }

    pub async fn run(mut self, ctx: &ProducerContext) -> Result<(), ScanError> {
        while let Some(slot) = self.slots.pop_front() {
            if ctx.is_cancelled() {
                return Ok(());
            }
            let Some(view) = ctx.shared.lock_ledger().view(slot) else {
                continue;
            };
            if view.done {
                continue;
            }
            if !self.scan_range(ctx, slot, &view.range, view.last_key).await? {
                return Ok(());
            }
            ctx.shared.lock_ledger().mark_done(slot);
        }
        debug!(session = ctx.shared.id, "all ranges scanned");
        Ok(())
    }

    /// Scans `range` to exhaustion. Returns `false` when cancelled.
    async fn scan_range(
        &mut self,
        ctx: &ProducerContext,
        slot: usize,
        range: &KeyRange,
        resume_after: Option<Key>,
    ) -> Result<bool, ScanError> {
        let mut last_read = resume_after;
        let mut retries = 0usize;
        let compacted_before = self.compactor.as_ref().map_or(0, DayCompactor::compacted_days);

        loop {
            if ctx.is_cancelled() {
                return Ok(false);
            }
            let pass_range = match &last_read {
                None => range.clone(),
                Some(last) => match self.advancer.advance(last, range) {
                    Ok(next) => next,
                    Err(ScanError::RangeExhausted) => {
                        trace!(session = ctx.shared.id, range = %range, "range exhausted");
                        break;
                    }
                    Err(err) => return Err(err),
                },
            };

            match self.scan_pass(ctx, slot, &pass_range, &mut last_read).await {
                Ok(PassOutcome::Exhausted) => break,
                Ok(PassOutcome::Yielded) => {
                    ctx.shared.stats.record_time_slice();
                    trace!(
                        session = ctx.shared.id,
                        range = %pass_range,
                        "yielding resource after fairness slice"
                    );
                }
                Ok(PassOutcome::Cancelled) => return Ok(false),
                Err(failure) => {
                    if !failure.is_transient() || retries >= ctx.config.scan_retry_limit {
                        return Err(failure.into_error(self.pool.table()));
                    }
                    let delay = ctx.config.retry_backoff(retries);
                    retries += 1;
                    ctx.shared.stats.record_retry();
                    warn!(
                        session = ctx.shared.id,
                        table = %self.pool.table(),
                        range = %pass_range,
                        attempt = retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure,
                        "transient scan failure; retrying"
                    );
                    tokio::select! {
                        _ = ctx.shared.cancel.cancelled() => return Ok(false),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        if let Some(compactor) = self.compactor.as_mut() {
            let mut tail = Vec::new();
            compactor.finish(&mut tail);
            let compacted = compactor.compacted_days() - compacted_before;
            ctx.shared.stats.record_compacted_days(compacted);
            for entry in tail {
                if !ctx.emit(slot, entry).await? {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    async fn scan_pass(
        &mut self,
        ctx: &ProducerContext,
        slot: usize,
        pass_range: &KeyRange,
        last_read: &mut Option<Key>,
    ) -> Result<PassOutcome, ScanFailure> {
        let started = Instant::now();
        let Some(mut resource) = self.acquire(ctx).await? else {
            return Ok(PassOutcome::Cancelled);
        };
        ctx.shared.stats.record_pass();

        let request = ScanRequest::single(pass_range.clone(), self.options.clone());
        if let Err(err) = resource.seek(&request).await {
            resource.release().await;
            return Err(ScanFailure::Storage(err));
        }
        ctx.shared.stats.record_start(started.elapsed());

        let slice = ctx.config.fairness.then(|| ctx.config.fairness_slice());
        let mut emitted = 0usize;
        let mut staged = Vec::new();
        loop {
            let fetch_started = Instant::now();
            let page = tokio::select! {
                _ = ctx.shared.cancel.cancelled() => {
                    resource.release().await;
                    return Ok(PassOutcome::Cancelled);
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
            ctx.shared
                .stats
                .record_page(entries.len(), fetch_started.elapsed());

            for entry in entries {
                *last_read = Some(entry.key.clone());
                self.stage(entry, &mut staged);
                for out in staged.drain(..) {
                    if !ctx.emit(slot, out).await? {
                        resource.release().await;
                        return Ok(PassOutcome::Cancelled);
                    }
                    emitted += 1;
                }
            }
            if slice.is_some_and(|slice| emitted >= slice) {
                resource.release().await;
                return Ok(PassOutcome::Yielded);
            }
        }
        resource.release().await;
        Ok(PassOutcome::Exhausted)
    }

    fn stage(&mut self, entry: ResultEntry, staged: &mut Vec<ResultEntry>) {
        match self.compactor.as_mut() {
            Some(compactor) => compactor.push(entry, staged),
            None => staged.push(entry),
        }
    }

    /// Acquires a resource, retrying bounded waits until cancelled.
    async fn acquire(&self, ctx: &ProducerContext) -> Result<Option<PooledResource>, ScanError> {
        acquire_until_cancelled(&self.pool, ctx).await
    }
}

/// Retries bounded pool acquires until one succeeds or the session is
/// cancelled (`Ok(None)`).
pub(crate) async fn acquire_until_cancelled(
    pool: &Arc<ResourcePool>,
    ctx: &ProducerContext,
) -> Result<Option<PooledResource>, ScanError> {
    loop {
        if ctx.is_cancelled() {
            return Ok(None);
        }
        let attempt = tokio::select! {
            _ = ctx.shared.cancel.cancelled() => return Ok(None),
            attempt = pool.acquire() => attempt,
        };
        match attempt {
            Ok(resource) => return Ok(Some(resource)),
            Err(ScanError::AcquireTimeout { .. }) => {
                trace!(session = ctx.shared.id, table = %pool.table(), "resource pool busy");
            }
            Err(err) => return Err(err),
        }
    }
}
