//! Storage collaborator contract.
//!
//! A [`StorageClient`] opens [`ScanResource`] handles bound to one
//! `(table, authorizations)` pair. A resource is re-targeted with
//! [`ScanResource::seek`] and drained page by page; the engine never shares a
//! resource across concurrent callers.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::chunk::{Authorizations, ScanOptions};
use crate::key::{KeyRange, ResultEntry};

/// How a resource executes a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStrategy {
    /// One range at a time, results in key order across the whole request.
    Sequential,
    /// All ranges at once; ordering holds only within each range.
    Batch,
}

impl ScanStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Batch => "batch",
        }
    }

    /// The strategy raced against this one during speculative execution.
    pub fn sibling(self) -> Self {
        match self {
            Self::Sequential => Self::Batch,
            Self::Batch => Self::Sequential,
        }
    }
}

impl fmt::Display for ScanStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a resource should scan next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    pub ranges: Vec<KeyRange>,
    pub options: ScanOptions,
    pub strategy: ScanStrategy,
}

impl ScanRequest {
    /// Sequential request over a single range.
    pub fn single(range: KeyRange, options: ScanOptions) -> Self {
        Self {
            ranges: vec![range],
            options,
            strategy: ScanStrategy::Sequential,
        }
    }
}

/// Opens scan resources against the store.
///
/// Errors should embed a [`crate::StorageError`] so the engine can classify
/// them; unclassified errors are treated as producer failures.
#[async_trait]
pub trait StorageClient: Send + Sync + 'static {
    async fn open(
        &self,
        table: &str,
        auths: &Authorizations,
    ) -> anyhow::Result<Box<dyn ScanResource>>;
}

/// Live, exclusively-owned scan handle.
#[async_trait]
pub trait ScanResource: Send {
    /// Stable identity, unique per storage client.
    fn id(&self) -> u64;

    /// Binds the resource to a new request, discarding any previous cursor.
    async fn seek(&mut self, request: &ScanRequest) -> anyhow::Result<()>;

    /// Returns the next page of results in key order, or `None` once the
    /// request is exhausted.
    async fn next_page(&mut self) -> anyhow::Result<Option<Vec<ResultEntry>>>;

    /// Clears the active range binding before the resource is pooled again.
    async fn reset(&mut self);
}
