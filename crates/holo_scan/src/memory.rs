//! In-process storage client.
//!
//! Tables are sorted entry vectors. A seek materializes the request into
//! pages up front; latency and failures can be injected per seek or open so
//! tests and the workload driver can exercise retries, time slicing and
//! speculative racing deterministically.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, trace};

use crate::chunk::{Authorizations, ScanOptions};
use crate::error::{ScanError, StorageError};
use crate::key::{KeyRange, ResultEntry};
use crate::locator::TabletLocator;
use crate::storage::{ScanRequest, ScanResource, ScanStrategy, StorageClient};

const DEFAULT_PAGE_SIZE: usize = 64;

/// Failure injected into a seek or an open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    /// Classified as [`StorageError::Transient`].
    Transient,
    /// Unclassified error.
    Fatal,
}

/// Point-in-time store counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreGauges {
    pub opened: u64,
    pub seeks: u64,
    pub pages: u64,
    /// Resources currently bound to a request.
    pub active_scans: usize,
    pub peak_active_scans: usize,
    /// Calls that found their resource already in use.
    pub exclusivity_violations: u64,
}

#[derive(Debug, Default)]
struct Gauges {
    opened: AtomicU64,
    seeks: AtomicU64,
    pages: AtomicU64,
    active: AtomicUsize,
    peak_active: AtomicUsize,
    violations: AtomicU64,
}

#[derive(Debug)]
struct StoreInner {
    tables: HashMap<String, Arc<Vec<ResultEntry>>>,
    locators: HashMap<String, TabletLocator>,
    page_size: usize,
    latency: Duration,
    strategy_latency: HashMap<ScanStrategy, Duration>,
    seek_failures: BTreeMap<u64, InjectedFailure>,
    open_failures: BTreeMap<u64, InjectedFailure>,
    rejected_labels: HashSet<String>,
    open_attempts: AtomicU64,
    next_id: AtomicU64,
    in_use: Mutex<HashSet<u64>>,
    gauges: Gauges,
}

#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

#[derive(Debug, Default)]
pub struct MemoryStoreBuilder {
    tables: HashMap<String, Vec<ResultEntry>>,
    splits: HashMap<String, (Vec<Vec<u8>>, Vec<String>)>,
    page_size: Option<usize>,
    latency: Duration,
    strategy_latency: HashMap<ScanStrategy, Duration>,
    seek_failures: BTreeMap<u64, InjectedFailure>,
    open_failures: BTreeMap<u64, InjectedFailure>,
    rejected_labels: HashSet<String>,
}

impl MemoryStoreBuilder {
    pub fn table(mut self, name: impl Into<String>, entries: Vec<ResultEntry>) -> Self {
        self.tables.insert(name.into(), entries);
        self
    }

    /// Splits `table` into tablets at `split_rows`, served round-robin from
    /// `locations`.
    pub fn tablets<R, L>(
        mut self,
        table: impl Into<String>,
        split_rows: impl IntoIterator<Item = R>,
        locations: impl IntoIterator<Item = L>,
    ) -> Self
    where
        R: Into<Vec<u8>>,
        L: Into<String>,
    {
        self.splits.insert(
            table.into(),
            (
                split_rows.into_iter().map(Into::into).collect(),
                locations.into_iter().map(Into::into).collect(),
            ),
        );
        self
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size.max(1));
        self
    }

    /// Delay before every page.
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Delay before every page of requests using `strategy`.
    pub fn strategy_latency(mut self, strategy: ScanStrategy, latency: Duration) -> Self {
        self.strategy_latency.insert(strategy, latency);
        self
    }

    /// Fails the `seek`-th seek (1-based, counted across the store).
    pub fn fail_seek(self, seek: u64, failure: InjectedFailure) -> Self {
        self.fail_seeks(seek, 1, failure)
    }

    /// Fails `count` consecutive seeks starting at `first` (1-based).
    pub fn fail_seeks(mut self, first: u64, count: u64, failure: InjectedFailure) -> Self {
        for seek in first..first.saturating_add(count) {
            self.seek_failures.insert(seek, failure);
        }
        self
    }

    /// Fails the `open`-th resource open (1-based, counted across the store).
    pub fn fail_open(mut self, open: u64, failure: InjectedFailure) -> Self {
        self.open_failures.insert(open, failure);
        self
    }

    /// Rejects opens whose authorizations include `label`.
    pub fn reject_label(mut self, label: impl Into<String>) -> Self {
        self.rejected_labels.insert(label.into());
        self
    }

    /// Sorts every table and builds the store.
    ///
    /// Tablet layouts that do not describe a valid split are ignored.
    pub fn build(self) -> MemoryStore {
        let mut locators = HashMap::new();
        for (table, (splits, locations)) in self.splits {
            match TabletLocator::from_splits(table.clone(), splits, &locations) {
                Ok(locator) => {
                    locators.insert(table, locator);
                }
                Err(err) => debug!(table = %table, error = %err, "ignoring tablet layout"),
            }
        }
        let tables = self
            .tables
            .into_iter()
            .map(|(name, mut entries)| {
                entries.sort_by(|a, b| a.key.cmp(&b.key));
                (name, Arc::new(entries))
            })
            .collect();
        MemoryStore {
            inner: Arc::new(StoreInner {
                tables,
                locators,
                page_size: self.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
                latency: self.latency,
                strategy_latency: self.strategy_latency,
                seek_failures: self.seek_failures,
                open_failures: self.open_failures,
                rejected_labels: self.rejected_labels,
                open_attempts: AtomicU64::new(0),
                next_id: AtomicU64::new(1),
                in_use: Mutex::new(HashSet::new()),
                gauges: Gauges::default(),
            }),
        }
    }
}

impl MemoryStore {
    pub fn builder() -> MemoryStoreBuilder {
        MemoryStoreBuilder::default()
    }

    /// Tablet layout of `table`; a single unbounded tablet when none was
    /// configured.
    pub fn locator(&self, table: &str) -> Result<TabletLocator, ScanError> {
        match self.inner.locators.get(table) {
            Some(locator) => Ok(locator.clone()),
            None => TabletLocator::from_splits(table, Vec::<Vec<u8>>::new(), &["local"]),
        }
    }

    pub fn gauges(&self) -> StoreGauges {
        let gauges = &self.inner.gauges;
        StoreGauges {
            opened: gauges.opened.load(Ordering::Relaxed),
            seeks: gauges.seeks.load(Ordering::Relaxed),
            pages: gauges.pages.load(Ordering::Relaxed),
            active_scans: gauges.active.load(Ordering::Relaxed),
            peak_active_scans: gauges.peak_active.load(Ordering::Relaxed),
            exclusivity_violations: gauges.violations.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl StorageClient for MemoryStore {
    async fn open(
        &self,
        table: &str,
        auths: &Authorizations,
    ) -> anyhow::Result<Box<dyn ScanResource>> {
        let attempt = self.inner.open_attempts.fetch_add(1, Ordering::Relaxed) + 1;
        match self.inner.open_failures.get(&attempt) {
            Some(InjectedFailure::Transient) => {
                let reason = format!("injected failure on open {attempt}");
                return Err(StorageError::Transient(reason).into());
            }
            Some(InjectedFailure::Fatal) => {
                return Err(anyhow!("storage node refused open {attempt}"));
            }
            None => {}
        }
        let entries = self
            .inner
            .tables
            .get(table)
            .cloned()
            .ok_or_else(|| StorageError::TableNotFound(table.to_string()))?;
        if let Some(label) = auths
            .iter()
            .find(|label| self.inner.rejected_labels.contains(*label))
        {
            let reason = format!("label `{label}` is not granted");
            return Err(StorageError::AuthRejected(reason).into());
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.gauges.opened.fetch_add(1, Ordering::Relaxed);
        trace!(table = %table, resource = id, "opened memory scan resource");
        Ok(Box::new(MemoryResource {
            id,
            store: Arc::clone(&self.inner),
            entries,
            pages: VecDeque::new(),
            latency: Duration::ZERO,
            bound: false,
        }))
    }
}

struct MemoryResource {
    id: u64,
    store: Arc<StoreInner>,
    entries: Arc<Vec<ResultEntry>>,
    pages: VecDeque<Vec<ResultEntry>>,
    latency: Duration,
    bound: bool,
}

impl MemoryResource {
    fn enter(&self) -> UseGuard {
        let mut in_use = self
            .store
            .in_use
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !in_use.insert(self.id) {
            self.store.gauges.violations.fetch_add(1, Ordering::Relaxed);
        }
        UseGuard {
            store: Arc::clone(&self.store),
            id: self.id,
        }
    }

    fn bind(&mut self) {
        if self.bound {
            return;
        }
        self.bound = true;
        let gauges = &self.store.gauges;
        let active = gauges.active.fetch_add(1, Ordering::AcqRel) + 1;
        gauges.peak_active.fetch_max(active, Ordering::AcqRel);
    }

    fn unbind(&mut self) {
        if self.bound {
            self.bound = false;
            self.store.gauges.active.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn range_entries(&self, range: &KeyRange, options: &ScanOptions) -> Vec<ResultEntry> {
        let first = self
            .entries
            .partition_point(|entry| range.before_start(&entry.key));
        self.entries[first..]
            .iter()
            .take_while(|entry| !range.after_end(&entry.key))
            .filter(|entry| options.accepts_family(&entry.key.family))
            .cloned()
            .collect()
    }

    fn paginate(&self, request: &ScanRequest) -> VecDeque<Vec<ResultEntry>> {
        let page_size = self.store.page_size;
        let mut ranges = request.ranges.clone();
        ranges.sort();
        let per_range = ranges
            .iter()
            .map(|range| self.range_entries(range, &request.options))
            .collect::<Vec<_>>();

        match request.strategy {
            ScanStrategy::Sequential => per_range
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .chunks(page_size)
                .map(<[ResultEntry]>::to_vec)
                .collect(),
            ScanStrategy::Batch => {
                // Round-robin one page per range.
                let mut cursors = per_range
                    .into_iter()
                    .map(Vec::into_iter)
                    .collect::<Vec<_>>();
                let mut pages = VecDeque::new();
                loop {
                    let mut progressed = false;
                    for cursor in cursors.iter_mut() {
                        let page = cursor.by_ref().take(page_size).collect::<Vec<_>>();
                        if !page.is_empty() {
                            progressed = true;
                            pages.push_back(page);
                        }
                    }
                    if !progressed {
                        break;
                    }
                }
                pages
            }
        }
    }
}

struct UseGuard {
    store: Arc<StoreInner>,
    id: u64,
}

impl Drop for UseGuard {
    fn drop(&mut self) {
        self.store
            .in_use
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.id);
    }
}

#[async_trait]
impl ScanResource for MemoryResource {
    fn id(&self) -> u64 {
        self.id
    }

    async fn seek(&mut self, request: &ScanRequest) -> anyhow::Result<()> {
        let seek = self.store.gauges.seeks.fetch_add(1, Ordering::Relaxed) + 1;
        self.unbind();
        self.pages.clear();
        match self.store.seek_failures.get(&seek) {
            Some(InjectedFailure::Transient) => {
                let reason = format!("injected failure on seek {seek}");
                return Err(StorageError::Transient(reason).into());
            }
            Some(InjectedFailure::Fatal) => {
                return Err(anyhow!("storage node crashed during seek {seek}"));
            }
            None => {}
        }
        let pages = {
            let _guard = self.enter();
            self.paginate(request)
        };
        self.pages = pages;
        self.latency = self
            .store
            .strategy_latency
            .get(&request.strategy)
            .copied()
            .unwrap_or(self.store.latency);
        self.bind();
        Ok(())
    }

    async fn next_page(&mut self) -> anyhow::Result<Option<Vec<ResultEntry>>> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let _guard = self.enter();
        match self.pages.pop_front() {
            Some(page) => {
                self.store.gauges.pages.fetch_add(1, Ordering::Relaxed);
                Ok(Some(page))
            }
            None => Ok(None),
        }
    }

    async fn reset(&mut self) {
        self.pages.clear();
        self.unbind();
    }
}

impl Drop for MemoryResource {
    fn drop(&mut self) {
        self.unbind();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Key;

    fn entries(rows: &[&str]) -> Vec<ResultEntry> {
        rows.iter()
            .map(|row| ResultEntry::new(Key::new(*row, "f", "q", "", 1), *row))
            .collect()
    }

    #[tokio::test]
    async fn sequential_pages_follow_key_order() {
        let store = MemoryStore::builder()
            .table("t", entries(&["d", "a", "c", "b"]))
            .page_size(3)
            .build();
        let mut resource = store.open("t", &Authorizations::empty()).await.expect("open");
        resource
            .seek(&ScanRequest::single(KeyRange::all(), ScanOptions::default()))
            .await
            .expect("seek");
        let first = resource.next_page().await.expect("page").expect("entries");
        let second = resource.next_page().await.expect("page").expect("entries");
        assert!(resource.next_page().await.expect("page").is_none());
        let rows = first
            .iter()
            .chain(second.iter())
            .map(|entry| entry.key.row.clone())
            .collect::<Vec<_>>();
        assert_eq!(rows, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
        assert_eq!(store.gauges().active_scans, 1);
        resource.reset().await;
        assert_eq!(store.gauges().active_scans, 0);
    }

    #[tokio::test]
    async fn batch_strategy_interleaves_ranges() {
        let store = MemoryStore::builder()
            .table("t", entries(&["a1", "a2", "c1", "c2"]))
            .page_size(1)
            .build();
        let mut resource = store.open("t", &Authorizations::empty()).await.expect("open");
        let request = ScanRequest {
            ranges: vec![
                KeyRange::row_span("a", "b").expect("range"),
                KeyRange::row_span("c", "d").expect("range"),
            ],
            options: ScanOptions::default(),
            strategy: ScanStrategy::Batch,
        };
        resource.seek(&request).await.expect("seek");
        let mut rows = Vec::new();
        while let Some(page) = resource.next_page().await.expect("page") {
            rows.extend(page.into_iter().map(|entry| entry.key.row));
        }
        assert_eq!(rows, vec![b"a1".to_vec(), b"c1".to_vec(), b"a2".to_vec(), b"c2".to_vec()]);
    }

    #[tokio::test]
    async fn injected_failures_are_classified() {
        let store = MemoryStore::builder()
            .table("t", entries(&["a"]))
            .fail_seek(1, InjectedFailure::Transient)
            .reject_label("SECRET")
            .build();
        let mut resource = store.open("t", &Authorizations::empty()).await.expect("open");
        let request = ScanRequest::single(KeyRange::all(), ScanOptions::default());
        let err = resource.seek(&request).await.expect_err("injected");
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::Transient(_))
        ));
        resource.seek(&request).await.expect("second seek succeeds");

        let rejected = store.open("t", &Authorizations::new(["SECRET"])).await;
        assert!(matches!(
            rejected.err().and_then(|err| err.downcast::<StorageError>().ok()),
            Some(StorageError::AuthRejected(_))
        ));
    }

    #[tokio::test]
    async fn family_filter_applies() {
        let store = MemoryStore::builder()
            .table(
                "t",
                vec![
                    ResultEntry::new(Key::new("a", "keep", "", "", 1), "1"),
                    ResultEntry::new(Key::new("a", "skip", "", "", 1), "2"),
                ],
            )
            .build();
        let mut resource = store.open("t", &Authorizations::empty()).await.expect("open");
        let options = ScanOptions::default().fetch_family("keep");
        resource
            .seek(&ScanRequest::single(KeyRange::all(), options))
            .await
            .expect("seek");
        let page = resource.next_page().await.expect("page").expect("entries");
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].key.family, b"keep".to_vec());
    }
}
