//! Physical transactions and savepoints.
//!
//! A [`Transaction`] owns one [`PooledHandle`] from `begin` until it ends. Clones
//! share the same underlying transaction, which lets nested scopes hand it down
//! the call chain. The handle returns to the pool as soon as the transaction
//! commits or rolls back.
//!
//! Savepoints nest LIFO. Only the innermost open savepoint can be released or
//! rolled back to, and a transaction with open savepoints refuses to commit.

use crate::db::connection::Connection;
use crate::db::handle::PooledHandle;
use crate::db::pool::{ConnectionPool, ResourceId};
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, QueryParam, Row, TransactionStatus};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Generate a unique transaction ID.
fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}

/// Check that `name` is a plain SQL identifier safe to splice into a statement.
pub(crate) fn validate_identifier(name: &str) -> DbResult<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(DbError::invalid_input(format!(
            "'{}' is not a valid identifier",
            name
        )))
    }
}

struct TransactionInner {
    id: String,
    resource_id: ResourceId,
    pool: Arc<ConnectionPool>,
    database_type: DatabaseType,
    handle: tokio::sync::Mutex<Option<PooledHandle>>,
    status: Mutex<TransactionStatus>,
    /// Open savepoints, innermost last
    savepoints: Mutex<Vec<String>>,
    next_savepoint: AtomicU64,
    started_at: DateTime<Utc>,
}

impl Drop for TransactionInner {
    fn drop(&mut self) {
        let status = *self.status.get_mut().unwrap_or_else(PoisonError::into_inner);
        if status.is_ended() {
            return;
        }
        let Some(mut handle) = self.handle.get_mut().take() else {
            return;
        };

        warn!(
            transaction_id = %self.id,
            resource_id = %self.resource_id,
            "Transaction dropped while active, rolling back"
        );
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if handle.execute("ROLLBACK", &[]).await.is_err() {
                        handle.discard();
                    }
                });
            }
            // No runtime to roll back on; closing the connection aborts the transaction
            Err(_) => handle.discard(),
        }
    }
}

/// One physical database transaction on a pooled connection.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

impl Transaction {
    /// Begin a transaction on a checked-out connection.
    pub async fn begin(mut handle: PooledHandle) -> DbResult<Self> {
        handle.ensure_open().await?;
        let database_type = handle.database_type();
        handle.execute(database_type.begin_statement(), &[]).await?;

        let id = generate_transaction_id();
        let resource_id = handle.id();
        info!(
            transaction_id = %id,
            resource_id = %resource_id,
            db_type = %database_type,
            "Transaction started"
        );

        Ok(Self {
            inner: Arc::new(TransactionInner {
                id,
                resource_id,
                pool: Arc::clone(handle.pool()),
                database_type,
                handle: tokio::sync::Mutex::new(Some(handle)),
                status: Mutex::new(TransactionStatus::Active),
                savepoints: Mutex::new(Vec::new()),
                next_savepoint: AtomicU64::new(0),
                started_at: Utc::now(),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// The pooled connection this transaction runs on.
    pub fn resource_id(&self) -> ResourceId {
        self.inner.resource_id
    }

    pub fn database_type(&self) -> DatabaseType {
        self.inner.database_type
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    pub fn status(&self) -> TransactionStatus {
        *self.lock_status()
    }

    pub fn is_active(&self) -> bool {
        self.status().is_active()
    }

    /// Number of open savepoints.
    pub fn savepoint_depth(&self) -> usize {
        self.lock_savepoints().len()
    }

    /// Whether both transactions run on the same pooled connection.
    pub fn same_connection(&self, other: &Transaction) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
            || (Arc::ptr_eq(&self.inner.pool, &other.inner.pool)
                && self.inner.resource_id == other.inner.resource_id)
    }

    /// Whether both values refer to the same transaction.
    pub fn ptr_eq(&self, other: &Transaction) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Execute a statement inside the transaction.
    pub async fn execute(&self, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        let mut guard = self.inner.handle.lock().await;
        let handle = self.active_handle(&mut guard)?;
        handle.execute(sql, params).await
    }

    /// Run a query inside the transaction.
    pub async fn query(&self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        let mut guard = self.inner.handle.lock().await;
        let handle = self.active_handle(&mut guard)?;
        handle.query(sql, params).await
    }

    /// Run a query inside the transaction and return the first row.
    pub async fn query_one(&self, sql: &str, params: &[QueryParam]) -> DbResult<Option<Row>> {
        let rows = self.query(sql, params).await?;
        Ok(rows.into_iter().next())
    }

    /// Commit the transaction.
    ///
    /// Fails with a savepoint error (leaving the transaction active) while any
    /// savepoint is still open. If the COMMIT itself fails the transaction is
    /// rolled back and the connection discarded.
    pub async fn commit(&self) -> DbResult<()> {
        let mut guard = self.inner.handle.lock().await;
        self.active_handle(&mut guard)?;
        {
            let savepoints = self.lock_savepoints();
            if let Some(innermost) = savepoints.last() {
                return Err(DbError::savepoint(
                    format!(
                        "Cannot commit transaction {} with {} open savepoint(s)",
                        self.inner.id,
                        savepoints.len()
                    ),
                    innermost.clone(),
                ));
            }
        }

        let Some(mut handle) = guard.take() else {
            return Err(self.state_error("Transaction has no connection"));
        };
        match handle.execute("COMMIT", &[]).await {
            Ok(_) => {
                self.set_status(TransactionStatus::Committed);
                info!(transaction_id = %self.inner.id, "Transaction committed");
                handle.release();
                Ok(())
            }
            Err(err) => {
                warn!(
                    transaction_id = %self.inner.id,
                    error = %err,
                    "Commit failed, rolling back"
                );
                if let Err(e) = handle.execute("ROLLBACK", &[]).await {
                    debug!(transaction_id = %self.inner.id, error = %e, "Rollback after failed commit failed");
                }
                handle.discard();
                self.set_status(TransactionStatus::RolledBack);
                Err(err)
            }
        }
    }

    /// Roll back the transaction, discarding any open savepoints.
    pub async fn rollback(&self) -> DbResult<()> {
        let mut guard = self.inner.handle.lock().await;
        self.active_handle(&mut guard)?;
        self.lock_savepoints().clear();
        self.set_status(TransactionStatus::RolledBack);

        let Some(mut handle) = guard.take() else {
            return Err(self.state_error("Transaction has no connection"));
        };
        match handle.execute("ROLLBACK", &[]).await {
            Ok(_) => {
                info!(transaction_id = %self.inner.id, "Transaction rolled back");
                handle.release();
                Ok(())
            }
            Err(err) => {
                // The session state is unknown; never hand this connection out again
                handle.discard();
                Err(err)
            }
        }
    }

    // =========================================================================
    // Savepoints
    // =========================================================================

    /// Open a savepoint.
    ///
    /// Without a name a unique `sp_<n>` name is generated.
    pub async fn create_savepoint(&self, name: Option<&str>) -> DbResult<Savepoint> {
        let mut guard = self.inner.handle.lock().await;
        let handle = self.active_handle(&mut guard)?;

        let name = match name {
            Some(name) => {
                validate_identifier(name)?;
                if self.lock_savepoints().iter().any(|open| open == name) {
                    return Err(DbError::savepoint("Savepoint name is already open", name));
                }
                name.to_string()
            }
            None => {
                let savepoints = self.lock_savepoints();
                loop {
                    let n = self.inner.next_savepoint.fetch_add(1, Ordering::Relaxed) + 1;
                    let candidate = format!("sp_{}", n);
                    if !savepoints.contains(&candidate) {
                        break candidate;
                    }
                }
            }
        };

        handle.execute(&format!("SAVEPOINT {}", name), &[]).await?;
        self.lock_savepoints().push(name.clone());
        debug!(transaction_id = %self.inner.id, savepoint = %name, "Savepoint created");

        Ok(Savepoint {
            name,
            transaction: self.clone(),
            finished: false,
        })
    }

    /// Release the savepoint `name`, keeping its work.
    pub async fn release_savepoint(&self, name: &str) -> DbResult<()> {
        let mut guard = self.inner.handle.lock().await;
        let handle = self.active_handle(&mut guard)?;
        self.check_innermost(name)?;

        handle
            .execute(&format!("RELEASE SAVEPOINT {}", name), &[])
            .await?;
        self.lock_savepoints().pop();
        debug!(transaction_id = %self.inner.id, savepoint = %name, "Savepoint released");
        Ok(())
    }

    /// Undo the work done since savepoint `name` and close it.
    pub async fn rollback_to_savepoint(&self, name: &str) -> DbResult<()> {
        let mut guard = self.inner.handle.lock().await;
        let handle = self.active_handle(&mut guard)?;
        self.check_innermost(name)?;

        handle
            .execute(&format!("ROLLBACK TO SAVEPOINT {}", name), &[])
            .await?;
        handle
            .execute(&format!("RELEASE SAVEPOINT {}", name), &[])
            .await?;
        self.lock_savepoints().pop();
        debug!(transaction_id = %self.inner.id, savepoint = %name, "Rolled back to savepoint");
        Ok(())
    }

    /// Run `action` inside a savepoint.
    ///
    /// On success the savepoint is released. On failure the work since the
    /// savepoint is undone and the action's error is returned; the transaction
    /// stays active and usable.
    pub async fn with_savepoint<F, Fut, T>(&self, action: F) -> DbResult<T>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let savepoint = self.create_savepoint(None).await?;
        match action(self.clone()).await {
            Ok(value) => {
                savepoint.release().await?;
                Ok(value)
            }
            Err(err) => {
                let name = savepoint.name().to_string();
                if let Err(rollback_err) = savepoint.rollback().await {
                    warn!(
                        transaction_id = %self.inner.id,
                        savepoint = %name,
                        error = %rollback_err,
                        "Rollback to savepoint failed"
                    );
                }
                Err(err)
            }
        }
    }

    fn check_innermost(&self, name: &str) -> DbResult<()> {
        let savepoints = self.lock_savepoints();
        match savepoints.last() {
            Some(innermost) if innermost == name => Ok(()),
            Some(innermost) if savepoints.iter().any(|open| open == name) => {
                Err(DbError::savepoint(
                    format!("Savepoint '{}' is still open inside it", innermost),
                    name,
                ))
            }
            _ => Err(DbError::savepoint("Savepoint is not open", name)),
        }
    }

    /// Return the connection if the transaction is still active.
    fn active_handle<'g>(
        &self,
        guard: &'g mut Option<PooledHandle>,
    ) -> DbResult<&'g mut PooledHandle> {
        let status = self.status();
        if status.is_ended() {
            return Err(self.state_error(format!("Transaction is already {}", status)));
        }
        guard
            .as_mut()
            .ok_or_else(|| self.state_error("Transaction has no connection"))
    }

    fn state_error(&self, message: impl Into<String>) -> DbError {
        DbError::transaction_state(message, self.inner.id.clone())
    }

    fn set_status(&self, status: TransactionStatus) {
        *self.lock_status() = status;
    }

    fn lock_status(&self) -> MutexGuard<'_, TransactionStatus> {
        self.inner
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_savepoints(&self) -> MutexGuard<'_, Vec<String>> {
        self.inner
            .savepoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .field("resource_id", &self.inner.resource_id)
            .field("status", &self.status())
            .field("savepoints", &self.savepoint_depth())
            .finish()
    }
}

/// A named restore point inside a transaction.
///
/// Finish it with [`release`](Self::release) or [`rollback`](Self::rollback). A
/// savepoint dropped unfinished stays open, and the transaction will refuse to
/// commit until it is closed through the transaction.
pub struct Savepoint {
    name: String,
    transaction: Transaction,
    finished: bool,
}

impl Savepoint {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    /// Keep the work done since the savepoint.
    pub async fn release(mut self) -> DbResult<()> {
        self.finished = true;
        self.transaction.release_savepoint(&self.name).await
    }

    /// Undo the work done since the savepoint.
    pub async fn rollback(mut self) -> DbResult<()> {
        self.finished = true;
        self.transaction.rollback_to_savepoint(&self.name).await
    }
}

impl Drop for Savepoint {
    fn drop(&mut self) {
        if !self.finished && self.transaction.is_active() {
            warn!(
                transaction_id = %self.transaction.id(),
                savepoint = %self.name,
                "Savepoint dropped without release or rollback"
            );
        }
    }
}

impl std::fmt::Debug for Savepoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Savepoint")
            .field("name", &self.name)
            .field("transaction_id", &self.transaction.id())
            .finish()
    }
}
