//! HoloScan: concurrent range-scan orchestration over a partitioned, sorted
//! key/value store.
//!
//! A process embedding HoloScan owns one [`ScanOrchestrator`], which hands
//! out [`ScanSession`]s:
//! - scanner and range-stream sessions walk their ranges sequentially with a
//!   single pooled resource, resuming after the last key on every yield,
//! - batch sessions fan chunks of ranges out over a bounded worker set with
//!   optional location backoff and speculative strategy races.
//!
//! Every session feeds a bounded result queue that the consumer drains with
//! `has_next`/`next`, and can be closed or checkpointed at any time.

pub mod advance;
pub mod cache;
pub mod checkpoint;
pub mod chunk;
pub mod compact;
pub mod config;
pub mod dedup;
pub mod error;
pub mod key;
pub mod locator;
pub mod memory;
pub mod orchestrator;
pub mod pool;
mod producer;
pub mod queue;
mod scheduler;
pub mod session;
pub mod stats;
pub mod storage;

pub use advance::RangeAdvancer;
pub use cache::{CacheKey, CacheStats, ModelCache, QueryModel};
pub use checkpoint::{ChunkCheckpoint, RangeCheckpoint, SessionCheckpoint, SessionKind};
pub use chunk::{Authorizations, Chunk, IteratorSetting, ScanOptions};
pub use compact::{DayCompactor, IndexInfo};
pub use config::ScanConfig;
pub use dedup::{dedup_key, DedupSession, Deduplicator};
pub use error::{ScanError, StorageError};
pub use key::{Key, KeyRange, PartialKey, ResultEntry};
pub use locator::{Tablet, TabletLocator};
pub use memory::{InjectedFailure, MemoryStore, MemoryStoreBuilder, StoreGauges};
pub use orchestrator::ScanOrchestrator;
pub use pool::{PoolRegistry, PoolSnapshot, PooledResource, ResourcePool};
pub use queue::{QueueCloser, QueueConsumer, QueuePoll, QueueProducer};
pub use scheduler::ChunkBatches;
pub use session::{ScanSession, SessionEvent, SessionInfo, SessionState};
pub use stats::{LocationStats, ScanSessionStats, ScanStatsSnapshot};
pub use storage::{ScanRequest, ScanResource, ScanStrategy, StorageClient};
