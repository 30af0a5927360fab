//! Session factory and lifecycle owner.
//!
//! The orchestrator owns the resource pools, hands out sessions and runs one
//! listener task that observes session state changes. Terminal sessions are
//! deregistered by the listener; once the orchestrator is locked down and the
//! last session finished, the listener closes every pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::advance::RangeAdvancer;
use crate::cache::{ModelCache, QueryModel};
use crate::checkpoint::{Ledger, RangeCheckpoint, SessionCheckpoint, SessionKind};
use crate::chunk::{Authorizations, ScanOptions};
use crate::compact::DayCompactor;
use crate::config::ScanConfig;
use crate::dedup::{DedupSession, Deduplicator};
use crate::error::ScanError;
use crate::key::{Key, KeyRange};
use crate::locator::TabletLocator;
use crate::pool::PoolRegistry;
use crate::producer::RangeProducer;
use crate::scheduler::{ChunkBatches, ChunkScheduler, Submission};
use crate::session::{
    ProducerPlan, ScanSession, SessionEvent, SessionInfo, SessionParams, SessionShared,
};
use crate::storage::StorageClient;

type SessionMap = HashMap<u64, Arc<SessionShared>>;

pub struct ScanOrchestrator {
    config: Arc<ScanConfig>,
    pools: Arc<PoolRegistry>,
    sessions: Arc<Mutex<SessionMap>>,
    locked: Arc<AtomicBool>,
    next_id: AtomicU64,
    events: mpsc::UnboundedSender<SessionEvent>,
    listener: Mutex<Option<JoinHandle<()>>>,
    model_cache: Arc<ModelCache<QueryModel>>,
}

impl std::fmt::Debug for ScanOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanOrchestrator")
            .field("sessions", &self.lock_sessions().len())
            .field("locked", &self.is_locked())
            .finish()
    }
}

impl ScanOrchestrator {
    /// Validates `config` and starts the lifecycle listener. Must be called
    /// from within a tokio runtime.
    pub fn new(client: Arc<dyn StorageClient>, config: ScanConfig) -> Result<Self, ScanError> {
        let cache = Arc::new(ModelCache::from_config(&config));
        Self::with_model_cache(client, config, cache)
    }

    /// Like [`ScanOrchestrator::new`] with a caller-provided model cache.
    pub fn with_model_cache(
        client: Arc<dyn StorageClient>,
        config: ScanConfig,
        model_cache: Arc<ModelCache<QueryModel>>,
    ) -> Result<Self, ScanError> {
        config.validate()?;
        let pools = Arc::new(PoolRegistry::new(
            client,
            config.pool_capacity(),
            config.acquire_timeout,
        ));
        let sessions = Arc::new(Mutex::new(SessionMap::new()));
        let locked = Arc::new(AtomicBool::new(false));
        let (events, receiver) = mpsc::unbounded_channel();
        let listener = tokio::spawn(run_listener(
            receiver,
            Arc::clone(&sessions),
            Arc::clone(&locked),
            Arc::clone(&pools),
        ));
        Ok(Self {
            config: Arc::new(config),
            pools,
            sessions,
            locked,
            next_id: AtomicU64::new(1),
            events,
            listener: Mutex::new(Some(listener)),
            model_cache,
        })
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn pools(&self) -> &PoolRegistry {
        &self.pools
    }

    pub fn model_cache(&self) -> &Arc<ModelCache<QueryModel>> {
        &self.model_cache
    }

    /// Sequential session over `ranges`, scanned in start-key order.
    pub fn new_scanner_session(
        &self,
        table: impl Into<String>,
        auths: Authorizations,
        ranges: Vec<KeyRange>,
        options: ScanOptions,
    ) -> Result<ScanSession, ScanError> {
        let table = table.into();
        let mut ledger = Ledger::default();
        let slots = sorted_slots(&mut ledger, ranges, |range| (range, None));
        let pool = self.pools.pool_for(&table, &auths)?;
        let producer =
            RangeProducer::new(pool, options.clone(), self.config.advancer, slots, None);
        self.register(
            SessionKind::Scanner,
            table,
            auths,
            options,
            ledger,
            ProducerPlan::Ranges(producer),
        )
    }

    /// Sequential session over index ranges with per-day shard compaction.
    pub fn new_range_stream_session(
        &self,
        table: impl Into<String>,
        auths: Authorizations,
        ranges: Vec<KeyRange>,
        options: ScanOptions,
    ) -> Result<ScanSession, ScanError> {
        let table = table.into();
        let mut ledger = Ledger::default();
        let slots = sorted_slots(&mut ledger, ranges, |range| (range, None));
        let pool = self.pools.pool_for(&table, &auths)?;
        let producer = RangeProducer::new(
            pool,
            options.clone(),
            RangeAdvancer::ShardIndex,
            slots,
            Some(self.compactor()),
        );
        self.register(
            SessionKind::RangeStream,
            table,
            auths,
            options,
            ledger,
            ProducerPlan::Ranges(producer),
        )
    }

    /// Chunked session fed lazily by `batches`.
    pub fn new_batch_session(
        &self,
        table: impl Into<String>,
        auths: Authorizations,
        batches: ChunkBatches,
    ) -> Result<ScanSession, ScanError> {
        let scheduler = ChunkScheduler::new(Arc::clone(&self.pools), batches, Vec::new());
        self.register(
            SessionKind::Batch,
            table.into(),
            auths,
            ScanOptions::default(),
            Ledger::default(),
            ProducerPlan::Chunks(scheduler),
        )
    }

    /// Chunked session over `ranges`, binned by the tablets of `locator`.
    pub fn new_tablet_session(
        &self,
        locator: &TabletLocator,
        auths: Authorizations,
        ranges: Vec<KeyRange>,
        options: ScanOptions,
        batch_size: usize,
    ) -> Result<ScanSession, ScanError> {
        let batches = locator.chunk_batches(auths.clone(), ranges, options, batch_size);
        self.new_batch_session(locator.table(), auths, batches)
    }

    /// Fresh session continuing the scan captured in `checkpoint`.
    pub fn resume_session(&self, checkpoint: SessionCheckpoint) -> Result<ScanSession, ScanError> {
        let SessionCheckpoint {
            kind,
            table,
            auths,
            options,
            ranges,
            chunks,
        } = checkpoint;
        let mut ledger = Ledger::default();
        let plan = match kind {
            SessionKind::Scanner | SessionKind::RangeStream => {
                let pending = ranges.into_iter().filter(|range| !range.done).collect::<Vec<_>>();
                let slots = sorted_slots(&mut ledger, pending, |range| {
                    (range.range, range.last_key)
                });
                let pool = self.pools.pool_for(&table, &auths)?;
                let (advancer, compactor) = match kind {
                    SessionKind::RangeStream => {
                        (RangeAdvancer::ShardIndex, Some(self.compactor()))
                    }
                    _ => (self.config.advancer, None),
                };
                ProducerPlan::Ranges(RangeProducer::new(
                    pool,
                    options.clone(),
                    advancer,
                    slots,
                    compactor,
                ))
            }
            SessionKind::Batch => {
                let mut resumed = Vec::with_capacity(chunks.len());
                for checkpoint in chunks {
                    let last_keys = checkpoint
                        .ranges
                        .iter()
                        .map(|range| range.last_key.clone())
                        .collect::<Vec<_>>();
                    let slots = ledger.register_chunk(checkpoint.chunk.clone(), &last_keys);
                    for (slot, range) in slots.iter().zip(&checkpoint.ranges) {
                        if range.done {
                            ledger.mark_done(*slot);
                        }
                    }
                    resumed.push(Submission::new(checkpoint.chunk, slots));
                }
                ProducerPlan::Chunks(ChunkScheduler::new(
                    Arc::clone(&self.pools),
                    Box::new(std::iter::empty()),
                    resumed,
                ))
            }
        };
        self.register(kind, table, auths, options, ledger, plan)
    }

    /// Wraps `session` with the configured duplicate filter.
    pub fn dedup(&self, session: ScanSession) -> Result<DedupSession, ScanError> {
        Ok(DedupSession::new(session, Deduplicator::from_config(&self.config)?))
    }

    /// Live sessions ordered by id.
    pub fn current_sessions(&self) -> Vec<SessionInfo> {
        let mut infos = self
            .lock_sessions()
            .values()
            .map(|shared| shared.info())
            .collect::<Vec<_>>();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Force-closes one session. Returns whether it was registered.
    pub async fn close_session(&self, id: u64) -> bool {
        let shared = self.lock_sessions().get(&id).cloned();
        match shared {
            Some(shared) => {
                shared.force_close().await;
                true
            }
            None => false,
        }
    }

    /// Refuses new sessions. Pools close once the live sessions finish.
    pub fn lockdown(&self) {
        if self.locked.swap(true, Ordering::AcqRel) {
            return;
        }
        let remaining = self.lock_sessions().len();
        info!(remaining, "scan orchestrator locked down");
        if remaining == 0 {
            self.pools.close_all();
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    /// Locks down, closes every live session and every pool.
    pub async fn shutdown(&self) {
        self.lockdown();
        let live = self.lock_sessions().values().cloned().collect::<Vec<_>>();
        for shared in live {
            shared.force_close().await;
        }
        self.pools.close_all();
        info!("scan orchestrator shut down");
    }

    fn compactor(&self) -> DayCompactor {
        DayCompactor::new(self.config.shards_per_day_threshold, self.config.max_median)
    }

    fn register(
        &self,
        kind: SessionKind,
        table: String,
        auths: Authorizations,
        options: ScanOptions,
        ledger: Ledger,
        plan: ProducerPlan,
    ) -> Result<ScanSession, ScanError> {
        let mut sessions = self.lock_sessions();
        // Decision: check the lock under the registry mutex so lockdown
        // counts a consistent set of sessions.
        if self.is_locked() {
            return Err(ScanError::FactoryLocked);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = ScanSession::new(SessionParams {
            id,
            kind,
            table,
            auths,
            options,
            ledger,
            plan,
            config: Arc::clone(&self.config),
            events: Some(self.events.clone()),
        });
        sessions.insert(id, Arc::clone(session.shared()));
        debug!(
            session = id,
            kind = kind.as_str(),
            table = %session.table(),
            "registered scan session"
        );
        Ok(session)
    }

    fn lock_sessions(&self) -> MutexGuard<'_, SessionMap> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for ScanOrchestrator {
    fn drop(&mut self) {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(listener) = listener {
            listener.abort();
        }
    }
}

/// Registers `ranges` in start-key order and returns their ledger slots.
fn sorted_slots<T>(
    ledger: &mut Ledger,
    mut ranges: Vec<T>,
    split: impl Fn(T) -> (KeyRange, Option<Key>),
) -> Vec<usize>
where
    T: RangeOrder,
{
    ranges.sort_by(|a, b| a.range().cmp(b.range()));
    ranges
        .into_iter()
        .map(|item| {
            let (range, last_key) = split(item);
            ledger.register_range(range, last_key)
        })
        .collect()
}

trait RangeOrder {
    fn range(&self) -> &KeyRange;
}

impl RangeOrder for KeyRange {
    fn range(&self) -> &KeyRange {
        self
    }
}

impl RangeOrder for RangeCheckpoint {
    fn range(&self) -> &KeyRange {
        &self.range
    }
}

async fn run_listener(
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    sessions: Arc<Mutex<SessionMap>>,
    locked: Arc<AtomicBool>,
    pools: Arc<PoolRegistry>,
) {
    while let Some(event) = events.recv().await {
        info!(
            session = event.session,
            kind = event.kind.as_str(),
            table = %event.table,
            state = %event.state,
            "scan session state"
        );
        if !event.state.is_terminal() {
            continue;
        }
        let remaining = {
            let mut sessions = sessions
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            sessions.remove(&event.session);
            sessions.len()
        };
        if remaining == 0 && locked.load(Ordering::Acquire) && !pools.is_closed() {
            info!("last session finished after lockdown; closing resource pools");
            pools.close_all();
        }
    }
}
