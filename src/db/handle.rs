//! Pooled connection handles.
//!
//! `PooledHandle` is the RAII guard for a checked-out connection. The connection
//! goes back to the pool exactly once: on [`PooledHandle::release`] or, as a
//! fallback, when the handle is dropped.

use crate::db::connection::Connection;
use crate::db::pool::{ConnectionPool, PooledResource, ResourceId};
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, QueryParam, Row};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::debug;

/// A connection checked out from a [`ConnectionPool`].
///
/// Implements [`Connection`] itself, so code written against the trait can use a
/// pooled connection directly.
pub struct PooledHandle {
    id: ResourceId,
    database_type: DatabaseType,
    resource: Option<PooledResource>,
    pool: Arc<ConnectionPool>,
    discard: bool,
    // Declared last so the slot frees only after the resource is back in the pool
    _permit: OwnedSemaphorePermit,
}

impl PooledHandle {
    pub(crate) fn new(
        resource: PooledResource,
        pool: Arc<ConnectionPool>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            id: resource.id,
            database_type: resource.connection.database_type(),
            resource: Some(resource),
            pool,
            discard: false,
            _permit: permit,
        }
    }

    /// Identifier of the pooled connection.
    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// The pool this handle was checked out from.
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Mark the connection as unusable; it is closed instead of being reused.
    pub fn discard(&mut self) {
        self.discard = true;
    }

    pub fn is_discarded(&self) -> bool {
        self.discard
    }

    /// Reopen the underlying connection if it was closed.
    pub async fn ensure_open(&mut self) -> DbResult<()> {
        let conn = self.connection()?;
        if !conn.is_open() {
            conn.reopen().await?;
            debug!(resource_id = %self.id, "Reopened connection on handle");
        }
        Ok(())
    }

    /// Return the connection to the pool.
    pub fn release(mut self) {
        self.return_to_pool();
    }

    fn return_to_pool(&mut self) {
        // take() makes this one-shot; the Drop after release() finds nothing
        if let Some(resource) = self.resource.take() {
            self.pool.release(resource, self.discard);
        }
    }

    fn connection(&mut self) -> DbResult<&mut Box<dyn Connection>> {
        match self.resource.as_mut() {
            Some(resource) => Ok(&mut resource.connection),
            None => Err(DbError::internal(format!(
                "Connection {} was already returned to the pool",
                self.id
            ))),
        }
    }
}

impl Drop for PooledHandle {
    fn drop(&mut self) {
        self.return_to_pool();
    }
}

impl std::fmt::Debug for PooledHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledHandle")
            .field("id", &self.id)
            .field("database_type", &self.database_type)
            .field("discard", &self.discard)
            .finish()
    }
}

#[async_trait]
impl Connection for PooledHandle {
    fn database_type(&self) -> DatabaseType {
        self.database_type
    }

    fn is_open(&self) -> bool {
        self.resource
            .as_ref()
            .is_some_and(|r| r.connection.is_open())
    }

    async fn ping(&mut self) -> DbResult<()> {
        self.connection()?.ping().await
    }

    async fn reopen(&mut self) -> DbResult<()> {
        self.connection()?.reopen().await
    }

    async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        self.connection()?.execute(sql, params).await
    }

    async fn query(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        self.connection()?.query(sql, params).await
    }

    /// Closing a pooled connection discards it; the pool closes it on return.
    async fn close(mut self: Box<Self>) -> DbResult<()> {
        self.discard();
        self.return_to_pool();
        Ok(())
    }
}
