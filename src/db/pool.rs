//! Connection pool management.
//!
//! The pool bounds outstanding checkouts with a semaphore sized `max_size`. Each
//! [`PooledHandle`] owns a permit, so a slot is released exactly once: when the
//! handle is returned or dropped, or when a checkout is cancelled before it
//! finished.
//!
//! Idle connections live in a FIFO queue. Returned connections go to the tail and
//! checkouts take from the front, so the front always holds the connection that
//! has been idle the longest. A background task holding a `Weak` reference evicts
//! connections idle past `idle_timeout` while keeping at least `min_size` alive.

use crate::config::{DatabaseConfig, PoolConfig};
use crate::db::connection::{Connection, ConnectionFactory};
use crate::db::driver::SqlxConnectionFactory;
use crate::db::handle::PooledHandle;
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionConfig, DatabaseType};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Identifier of a pooled connection, unique within its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ResourceId(u64);

impl ResourceId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A raw connection plus the bookkeeping the pool needs to recycle it.
pub(crate) struct PooledResource {
    pub(crate) id: ResourceId,
    pub(crate) connection: Box<dyn Connection>,
    last_used: Instant,
}

/// Registry entry for every live connection, idle or checked out.
#[derive(Debug, Clone, Copy)]
struct ResourceEntry {
    created_at: Instant,
    last_used: Instant,
    in_use: bool,
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub connections_created: u64,
    pub connections_closed: u64,
    pub acquisitions: u64,
    pub exhausted_count: u64,
    pub total_wait_time_ms: u64,
    pub validation_failures: u64,
}

impl PoolStats {
    /// Calculate average wait time in milliseconds
    pub fn avg_wait_time_ms(&self) -> f64 {
        if self.acquisitions == 0 {
            0.0
        } else {
            self.total_wait_time_ms as f64 / self.acquisitions as f64
        }
    }
}

/// Atomic pool stats for concurrent updates
#[derive(Debug, Default)]
struct AtomicPoolStats {
    connections_created: AtomicU64,
    connections_closed: AtomicU64,
    acquisitions: AtomicU64,
    exhausted_count: AtomicU64,
    total_wait_time_ms: AtomicU64,
    validation_failures: AtomicU64,
}

impl AtomicPoolStats {
    fn record_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    fn record_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_acquisition(&self, wait_time_ms: u64) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.total_wait_time_ms
            .fetch_add(wait_time_ms, Ordering::Relaxed);
    }

    fn record_exhausted(&self) {
        self.exhausted_count.fetch_add(1, Ordering::Relaxed);
    }

    fn record_validation_failure(&self) {
        self.validation_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PoolStats {
        PoolStats {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            exhausted_count: self.exhausted_count.load(Ordering::Relaxed),
            total_wait_time_ms: self.total_wait_time_ms.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
        }
    }
}

/// Diagnostic view of one pooled connection.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceInfo {
    pub id: ResourceId,
    pub created_at: DateTime<Utc>,
    pub idle_secs: u64,
    pub in_use: bool,
}

/// Bounded pool of database connections.
pub struct ConnectionPool {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    available: Mutex<VecDeque<PooledResource>>,
    registry: RwLock<HashMap<ResourceId, ResourceEntry>>,
    semaphore: Arc<Semaphore>,
    next_id: AtomicU64,
    stats: AtomicPoolStats,
    closed: AtomicBool,
    eviction_task: Mutex<Option<JoinHandle<()>>>,
    /// Pool start time as Instant (for computing creation timestamps)
    system_start_instant: Instant,
    /// Pool start time as UTC DateTime
    system_start_datetime: DateTime<Utc>,
}

/// A resource popped from the idle queue but not yet handed out.
///
/// Disposes the resource if the checkout is cancelled mid-validation.
struct PendingResource<'a> {
    pool: &'a ConnectionPool,
    resource: Option<PooledResource>,
}

impl PendingResource<'_> {
    fn take(mut self) -> Option<PooledResource> {
        self.resource.take()
    }
}

impl Drop for PendingResource<'_> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.dispose(resource, "validation failed");
        }
    }
}

impl ConnectionPool {
    /// Create a new connection pool.
    ///
    /// Opens `min_size` connections eagerly. A factory failure during warm-up stops
    /// the warm-up and the pool starts smaller; later checkouts create connections
    /// on demand.
    pub async fn new(config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> DbResult<Arc<Self>> {
        config.validate()?;

        let pool = Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(config.max_size)),
            available: Mutex::new(VecDeque::with_capacity(config.max_size)),
            registry: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            stats: AtomicPoolStats::default(),
            closed: AtomicBool::new(false),
            eviction_task: Mutex::new(None),
            system_start_instant: Instant::now(),
            system_start_datetime: Utc::now(),
            factory,
            config,
        });

        for _ in 0..pool.config.min_size {
            match pool.create_resource().await {
                Ok(resource) => {
                    pool.lock_available().push_back(resource);
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        created = pool.size(),
                        min_size = pool.config.min_size,
                        "Failed to pre-populate connection pool"
                    );
                    break;
                }
            }
        }

        pool.start_eviction_task();

        info!(
            db_type = %pool.factory.database_type(),
            min_size = pool.config.min_size,
            max_size = pool.config.max_size,
            size = pool.size(),
            "Connection pool created"
        );
        Ok(pool)
    }

    /// Create a pool from a connection URL.
    ///
    /// Pool options are read from the URL query (see [`DatabaseConfig::parse`]); the
    /// rest of the URL is handed to sqlx.
    pub async fn connect(url: &str) -> DbResult<Arc<Self>> {
        let db_config = DatabaseConfig::parse(url)?;
        let pool_config = db_config.pool_options.to_pool_config()?;
        let config =
            ConnectionConfig::new("default", db_config.connection_string, db_config.pool_options)?;
        debug!(target_url = %config.masked_connection_string(), "Connecting pool");
        Self::new(pool_config, Arc::new(SqlxConnectionFactory::new(config))).await
    }

    /// Check out a connection using the configured checkout timeout.
    pub async fn get(self: &Arc<Self>) -> DbResult<PooledHandle> {
        self.checkout(self.config.checkout_timeout).await
    }

    /// Check out a connection, waiting at most `timeout` for a free slot.
    ///
    /// Idle connections are validated before they are handed out; invalid ones are
    /// discarded and replaced transparently. Dropping the returned future before it
    /// completes never leaks a slot.
    pub async fn checkout(self: &Arc<Self>, timeout: Duration) -> DbResult<PooledHandle> {
        if self.is_closed() {
            return Err(DbError::PoolClosed);
        }

        let start = Instant::now();
        let permit =
            match tokio::time::timeout(timeout, Arc::clone(&self.semaphore).acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(DbError::PoolClosed),
                Err(_) => {
                    self.stats.record_exhausted();
                    warn!(
                        timeout_ms = timeout.as_millis() as u64,
                        max_size = self.config.max_size,
                        "Connection pool exhausted"
                    );
                    return Err(DbError::pool_exhausted(start.elapsed()));
                }
            };

        let resource = match self.take_available().await {
            Some(resource) => resource,
            // On failure the permit drops here and frees the slot
            None => self.create_resource().await?,
        };

        self.mark_in_use(resource.id);
        self.stats
            .record_acquisition(start.elapsed().as_millis() as u64);
        debug!(resource_id = %resource.id, "Connection checked out");

        Ok(PooledHandle::new(resource, Arc::clone(self), permit))
    }

    /// Pop idle connections front-first until one passes validation.
    ///
    /// At most `max_size` stale connections are discarded per call; after that the
    /// caller opens a fresh connection instead.
    async fn take_available(&self) -> Option<PooledResource> {
        for _ in 0..self.config.max_size {
            let resource = self.lock_available().pop_front()?;
            let mut pending = PendingResource {
                pool: self,
                resource: Some(resource),
            };
            let validation = match pending.resource.as_mut() {
                Some(resource) => self.validate(resource).await,
                None => continue,
            };
            match validation {
                Ok(()) => return pending.take(),
                Err(e) => {
                    self.stats.record_validation_failure();
                    warn!(error = %e, "Discarding invalid pooled connection");
                    // PendingResource disposes on drop
                }
            }
        }
        None
    }

    /// Check an idle connection before reuse.
    async fn validate(&self, resource: &mut PooledResource) -> DbResult<()> {
        let id = resource.id.as_u64();
        let idle = resource.last_used.elapsed();
        if idle >= self.config.idle_timeout {
            return Err(DbError::resource_invalid(
                id,
                format!("idle for {}ms", idle.as_millis()),
            ));
        }

        if !resource.connection.is_open() {
            resource
                .connection
                .reopen()
                .await
                .map_err(|e| DbError::resource_invalid(id, format!("reopen failed: {}", e)))?;
            debug!(resource_id = %resource.id, "Reopened closed pooled connection");
        }

        if self.config.validate_on_checkout {
            resource
                .connection
                .ping()
                .await
                .map_err(|e| DbError::resource_invalid(id, format!("ping failed: {}", e)))?;
        }
        Ok(())
    }

    async fn create_resource(&self) -> DbResult<PooledResource> {
        let connection = self.factory.connect().await?;
        let id = ResourceId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let now = Instant::now();
        self.write_registry().insert(
            id,
            ResourceEntry {
                created_at: now,
                last_used: now,
                in_use: false,
            },
        );
        self.stats.record_created();
        debug!(resource_id = %id, "Created pooled connection");
        Ok(PooledResource {
            id,
            connection,
            last_used: now,
        })
    }

    fn mark_in_use(&self, id: ResourceId) {
        if let Some(entry) = self.write_registry().get_mut(&id) {
            entry.in_use = true;
        }
    }

    /// Take back a connection from a handle.
    ///
    /// Called exactly once per handle, before the handle's permit is released.
    pub(crate) fn release(&self, mut resource: PooledResource, discard: bool) {
        if discard {
            self.dispose(resource, "discarded by owner");
            return;
        }
        if !resource.connection.is_open() {
            self.dispose(resource, "connection closed");
            return;
        }

        let now = Instant::now();
        resource.last_used = now;
        if let Some(entry) = self.write_registry().get_mut(&resource.id) {
            entry.in_use = false;
            entry.last_used = now;
        }

        let rejected = {
            let mut available = self.lock_available();
            // Checked under the queue lock so close() cannot drain before this push
            if self.is_closed() {
                Some(resource)
            } else {
                debug!(resource_id = %resource.id, "Connection returned to pool");
                available.push_back(resource);
                None
            }
        };
        if let Some(resource) = rejected {
            self.dispose(resource, "pool closed");
        }
    }

    /// Remove a connection from the pool and close it in the background.
    fn dispose(&self, resource: PooledResource, reason: &str) {
        let PooledResource { id, connection, .. } = resource;
        self.write_registry().remove(&id);
        self.stats.record_closed();
        debug!(resource_id = %id, reason, "Disposing pooled connection");

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = connection.close().await {
                        debug!(resource_id = %id, error = %e, "Error closing connection");
                    }
                });
            }
            Err(_) => drop(connection),
        }
    }

    /// Dispose idle connections past `idle_timeout`, keeping at least `min_size`
    /// live connections. Checked-out connections are never touched.
    ///
    /// Returns the number of connections evicted.
    pub fn evict_idle(&self) -> usize {
        let victims: Vec<PooledResource> = {
            let mut available = self.lock_available();
            let mut removable = self.size().saturating_sub(self.config.min_size);
            let mut kept = VecDeque::with_capacity(available.len());
            let mut victims = Vec::new();
            while let Some(resource) = available.pop_front() {
                if removable > 0 && resource.last_used.elapsed() >= self.config.idle_timeout {
                    removable -= 1;
                    victims.push(resource);
                } else {
                    kept.push_back(resource);
                }
            }
            *available = kept;
            victims
        };

        let evicted = victims.len();
        for resource in victims {
            self.dispose(resource, "idle timeout");
        }
        if evicted > 0 {
            info!(evicted, remaining = self.size(), "Evicted idle connections");
        }
        evicted
    }

    fn start_eviction_task(self: &Arc<Self>) {
        let every = self.config.eviction_interval;
        if every.is_zero() {
            return;
        }
        let handle = tokio::spawn(Self::eviction_task(Arc::downgrade(self), every));
        *self
            .eviction_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Background eviction loop.
    ///
    /// Uses a Weak reference to the pool to avoid a reference cycle; the task
    /// exits when the pool is dropped or closed.
    async fn eviction_task(weak_pool: Weak<Self>, every: Duration) {
        let mut interval = tokio::time::interval(every);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;

            let Some(pool) = weak_pool.upgrade() else {
                debug!("Connection pool dropped, eviction task exiting");
                return;
            };
            if pool.is_closed() {
                return;
            }
            pool.evict_idle();
        }
    }

    /// Close the pool.
    ///
    /// Pending and future checkouts fail with `PoolClosed`. Idle connections are
    /// closed now; checked-out connections are closed when their handles return.
    pub async fn close(&self) {
        let drained: Vec<PooledResource> = {
            let mut available = self.lock_available();
            if self.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            available.drain(..).collect()
        };

        self.semaphore.close();
        if let Some(handle) = self
            .eviction_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }

        let count = drained.len();
        for resource in drained {
            self.write_registry().remove(&resource.id);
            self.stats.record_closed();
            if let Err(e) = resource.connection.close().await {
                debug!(resource_id = %resource.id, error = %e, "Error closing connection");
            }
        }

        info!(closed = count, outstanding = self.in_use(), "Connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn database_type(&self) -> DatabaseType {
        self.factory.database_type()
    }

    /// Number of live connections, idle or checked out.
    pub fn size(&self) -> usize {
        self.read_registry().len()
    }

    /// Number of idle connections.
    pub fn available(&self) -> usize {
        self.lock_available().len()
    }

    /// Number of checked-out connections.
    pub fn in_use(&self) -> usize {
        self.read_registry().values().filter(|e| e.in_use).count()
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.snapshot()
    }

    /// List live connections ordered by id.
    pub fn resources(&self) -> Vec<ResourceInfo> {
        let mut resources: Vec<ResourceInfo> = self
            .read_registry()
            .iter()
            .map(|(id, entry)| {
                // Convert Instant to DateTime by calculating offset from pool start
                let offset_from_start = entry
                    .created_at
                    .duration_since(self.system_start_instant);
                ResourceInfo {
                    id: *id,
                    created_at: self.system_start_datetime + offset_from_start,
                    idle_secs: if entry.in_use {
                        0
                    } else {
                        entry.last_used.elapsed().as_secs()
                    },
                    in_use: entry.in_use,
                }
            })
            .collect();
        resources.sort_by_key(|r| r.id);
        resources
    }

    fn lock_available(&self) -> MutexGuard<'_, VecDeque<PooledResource>> {
        self.available
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn read_registry(&self) -> std::sync::RwLockReadGuard<'_, HashMap<ResourceId, ResourceEntry>> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_registry(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<ResourceId, ResourceEntry>> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.config)
            .field("size", &self.size())
            .field("available", &self.available())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        if let Some(handle) = self
            .eviction_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}
