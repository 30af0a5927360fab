//! Bounded pool of scan resources for one `(table, authorizations)` pair.
//!
//! Capacity is a semaphore; resources are created lazily by the storage
//! client and parked in an idle list between leases. A leased-id set guards
//! exclusive ownership: the same resource is never handed out twice.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error};

use crate::chunk::Authorizations;
use crate::error::{open_failure, ScanError};
use crate::key::ResultEntry;
use crate::storage::{ScanRequest, ScanResource, StorageClient};

#[derive(Default)]
struct PoolInner {
    idle: Vec<Box<dyn ScanResource>>,
    leased: HashSet<u64>,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub capacity: usize,
    pub leased: usize,
    pub idle: usize,
    pub created: u64,
    pub reused: u64,
    pub discarded: u64,
}

pub struct ResourcePool {
    table: String,
    auths: Authorizations,
    client: Arc<dyn StorageClient>,
    capacity: usize,
    acquire_timeout: Duration,
    permits: Arc<Semaphore>,
    inner: Mutex<PoolInner>,
    closed: AtomicBool,
    created: AtomicU64,
    reused: AtomicU64,
    discarded: AtomicU64,
}

impl std::fmt::Debug for ResourcePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourcePool")
            .field("table", &self.table)
            .field("auths", &self.auths)
            .field("capacity", &self.capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ResourcePool {
    pub fn new(
        client: Arc<dyn StorageClient>,
        table: impl Into<String>,
        auths: Authorizations,
        capacity: usize,
        acquire_timeout: Duration,
    ) -> Arc<Self> {
        let capacity = capacity.max(1);
        Arc::new(Self {
            table: table.into(),
            auths,
            client,
            capacity,
            acquire_timeout,
            permits: Arc::new(Semaphore::new(capacity)),
            inner: Mutex::new(PoolInner::default()),
            closed: AtomicBool::new(false),
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn auths(&self) -> &Authorizations {
        &self.auths
    }

    /// Fixed maximum number of concurrently leased resources.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Acquires a resource, waiting at most the configured acquire timeout.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledResource, ScanError> {
        self.acquire_within(self.acquire_timeout).await
    }

    /// Acquires a resource, waiting at most `wait`.
    ///
    /// Fails with `PoolClosed` once the pool is closed (including while
    /// blocked) and with `AcquireTimeout` when no resource freed up in time.
    /// A transient failure opening a new resource is `Unavailable`.
    pub async fn acquire_within(
        self: &Arc<Self>,
        wait: Duration,
    ) -> Result<PooledResource, ScanError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let permit = match tokio::time::timeout(wait, Arc::clone(&self.permits).acquire_owned())
            .await
        {
            Err(_) => {
                return Err(ScanError::AcquireTimeout {
                    table: self.table.clone(),
                    waited_ms: wait.as_millis() as u64,
                })
            }
            Ok(Err(_)) => return Err(self.closed_error()),
            Ok(Ok(permit)) => permit,
        };

        let pooled = {
            let mut inner = self.lock_inner();
            inner.idle.pop()
        };
        let resource = match pooled {
            Some(resource) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                resource
            }
            None => {
                let resource = self
                    .client
                    .open(&self.table, &self.auths)
                    .await
                    .map_err(|err| open_failure(&self.table, err))?;
                self.created.fetch_add(1, Ordering::Relaxed);
                debug!(
                    table = %self.table,
                    resource = resource.id(),
                    "opened scan resource"
                );
                resource
            }
        };

        let id = resource.id();
        {
            let mut inner = self.lock_inner();
            if !inner.leased.insert(id) {
                error!(table = %self.table, resource = id, "scan resource leased twice");
                return Err(ScanError::producer(anyhow!(
                    "scan resource {id} for table `{}` is already leased",
                    self.table
                )));
            }
        }

        Ok(PooledResource {
            id,
            resource: Some(resource),
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    /// Refuses further acquires, fails blocked acquirers and drops idle
    /// resources. Leased resources are dropped when they come back.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.permits.close();
        let idle = {
            let mut inner = self.lock_inner();
            std::mem::take(&mut inner.idle)
        };
        self.discarded.fetch_add(idle.len() as u64, Ordering::Relaxed);
        debug!(table = %self.table, dropped = idle.len(), "closed resource pool");
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let inner = self.lock_inner();
        PoolSnapshot {
            capacity: self.capacity,
            leased: inner.leased.len(),
            idle: inner.idle.len(),
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }

    fn check_in(&self, resource: Box<dyn ScanResource>) {
        let mut inner = self.lock_inner();
        inner.leased.remove(&resource.id());
        if self.is_closed() {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        inner.idle.push(resource);
    }

    fn forget(&self, id: u64) {
        let mut inner = self.lock_inner();
        inner.leased.remove(&id);
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    fn closed_error(&self) -> ScanError {
        ScanError::PoolClosed {
            table: self.table.clone(),
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, PoolInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Exclusive lease on a pooled resource.
///
/// [`PooledResource::release`] resets the resource and returns it to the
/// pool. A lease dropped without release (an aborted task, for example)
/// discards its resource instead, since it cannot be reset synchronously.
pub struct PooledResource {
    id: u64,
    resource: Option<Box<dyn ScanResource>>,
    pool: Arc<ResourcePool>,
    _permit: OwnedSemaphorePermit,
}

impl PooledResource {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn seek(&mut self, request: &ScanRequest) -> anyhow::Result<()> {
        self.active()?.seek(request).await
    }

    pub async fn next_page(&mut self) -> anyhow::Result<Option<Vec<ResultEntry>>> {
        self.active()?.next_page().await
    }

    /// Clears the range binding and returns the resource to its pool.
    pub async fn release(mut self) {
        if let Some(mut resource) = self.resource.take() {
            resource.reset().await;
            self.pool.check_in(resource);
        }
    }

    fn active(&mut self) -> anyhow::Result<&mut Box<dyn ScanResource>> {
        let id = self.id;
        self.resource
            .as_mut()
            .ok_or_else(|| anyhow!("scan resource {id} was already released"))
    }
}

impl Drop for PooledResource {
    fn drop(&mut self) {
        if self.resource.take().is_some() {
            self.pool.forget(self.id);
        }
    }
}

/// Lazily created pools, one per `(table, authorizations)`.
pub struct PoolRegistry {
    client: Arc<dyn StorageClient>,
    capacity: usize,
    acquire_timeout: Duration,
    pools: Mutex<HashMap<(String, Authorizations), Arc<ResourcePool>>>,
    closed: AtomicBool,
}

impl PoolRegistry {
    pub fn new(client: Arc<dyn StorageClient>, capacity: usize, acquire_timeout: Duration) -> Self {
        Self {
            client,
            capacity,
            acquire_timeout,
            pools: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns the pool for `(table, auths)`, creating it on first use.
    pub fn pool_for(
        &self,
        table: &str,
        auths: &Authorizations,
    ) -> Result<Arc<ResourcePool>, ScanError> {
        let mut pools = self
            .pools
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.closed.load(Ordering::Acquire) {
            return Err(ScanError::PoolClosed {
                table: table.to_string(),
            });
        }
        let pool = pools
            .entry((table.to_string(), auths.clone()))
            .or_insert_with(|| {
                ResourcePool::new(
                    Arc::clone(&self.client),
                    table,
                    auths.clone(),
                    self.capacity,
                    self.acquire_timeout,
                )
            });
        Ok(Arc::clone(pool))
    }

    pub fn pools(&self) -> Vec<Arc<ResourcePool>> {
        self.pools
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Closes every pool and refuses to create new ones.
    pub fn close_all(&self) {
        let pools = {
            let pools = self
                .pools
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            self.closed.store(true, Ordering::Release);
            pools.values().cloned().collect::<Vec<_>>()
        };
        for pool in pools {
            pool.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
