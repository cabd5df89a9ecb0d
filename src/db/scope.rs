//! Ambient, nestable transaction scopes.
//!
//! A [`ScopeContext`] holds the current ("ambient") scope of one logical flow.
//! Callers thread it through their call chain; clones share the same ambient
//! pointer, while [`ScopeContext::fork`] gives a concurrent child flow its own
//! pointer that starts at the parent's current scope.
//!
//! Scopes form a parent chain. Opening a scope on the ambient transaction's
//! connection joins that transaction instead of starting a second one. Only
//! the owning scope commits or rolls back; joined scopes are no-ops on both.
//!
//! ```ignore
//! let ctx = ScopeContext::new();
//! let mut scope = TransactionScope::begin(&ctx, &pool).await?;
//! create_person(&ctx, "x").await?; // joins the ambient transaction
//! scope.complete().await?;
//! scope.dispose().await;
//! ```

use crate::db::pool::ConnectionPool;
use crate::db::transaction::Transaction;
use crate::error::{DbError, DbResult};
use async_trait::async_trait;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Something that can begin a fresh transaction.
#[async_trait]
pub trait TransactionSource: Send + Sync {
    async fn begin_transaction(&self) -> DbResult<Transaction>;
}

#[async_trait]
impl TransactionSource for Arc<ConnectionPool> {
    async fn begin_transaction(&self) -> DbResult<Transaction> {
        let handle = self.get().await?;
        Transaction::begin(handle).await
    }
}

fn generate_scope_id() -> String {
    format!("scope_{}", uuid::Uuid::new_v4().simple())
}

struct ScopeFrame {
    id: String,
    transaction: Transaction,
    owner: bool,
    parent: Option<Arc<ScopeFrame>>,
}

/// The ambient scope pointer for one logical flow.
#[derive(Clone, Default)]
pub struct ScopeContext {
    current: Arc<Mutex<Option<Arc<ScopeFrame>>>>,
}

impl ScopeContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// The ambient scope, if any.
    pub fn current(&self) -> Option<AmbientScope> {
        self.lock().clone().map(AmbientScope)
    }

    /// The ambient scope's transaction, if any.
    pub fn current_transaction(&self) -> Option<Transaction> {
        self.lock().as_ref().map(|frame| frame.transaction.clone())
    }

    /// Number of nested scopes in this flow.
    pub fn depth(&self) -> usize {
        self.current().map_or(0, |scope| scope.depth())
    }

    /// Context for a concurrent child flow.
    ///
    /// The child starts with this flow's ambient scope; scopes it opens are not
    /// visible here.
    pub fn fork(&self) -> Self {
        Self {
            current: Arc::new(Mutex::new(self.lock().clone())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<ScopeFrame>>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ScopeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeContext")
            .field("current", &self.current().map(|s| s.id().to_string()))
            .field("depth", &self.depth())
            .finish()
    }
}

/// Read-only view of a scope on the ambient chain.
#[derive(Clone)]
pub struct AmbientScope(Arc<ScopeFrame>);

impl AmbientScope {
    pub fn id(&self) -> &str {
        &self.0.id
    }

    pub fn transaction(&self) -> &Transaction {
        &self.0.transaction
    }

    /// Whether this scope commits or rolls back its transaction.
    pub fn is_owner(&self) -> bool {
        self.0.owner
    }

    pub fn parent(&self) -> Option<AmbientScope> {
        self.0.parent.clone().map(AmbientScope)
    }

    /// Position in the chain, 1 for an outermost scope.
    pub fn depth(&self) -> usize {
        let mut depth = 1;
        let mut frame = &self.0;
        while let Some(parent) = &frame.parent {
            depth += 1;
            frame = parent;
        }
        depth
    }
}

impl std::fmt::Debug for AmbientScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmbientScope")
            .field("id", &self.0.id)
            .field("transaction_id", &self.0.transaction.id())
            .field("owner", &self.0.owner)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeState {
    Open,
    Completed,
    Disposed,
}

/// A unit of work on an ambient transaction.
///
/// Call [`complete`](Self::complete) when the work succeeded, then
/// [`dispose`](Self::dispose). An owning scope disposed without completion rolls
/// back. Dropping a scope is the fallback: it restores the ambient scope and
/// schedules the rollback on the runtime.
pub struct TransactionScope {
    frame: Arc<ScopeFrame>,
    context: ScopeContext,
    state: ScopeState,
}

impl TransactionScope {
    /// Open a scope for `transaction`.
    ///
    /// If the ambient scope's transaction is still active and runs on the same
    /// connection, the new scope joins the ambient transaction and does not own it. Otherwise the new
    /// scope owns `transaction`. Either way it becomes the ambient scope.
    pub fn create(context: &ScopeContext, transaction: Transaction) -> DbResult<Self> {
        if !transaction.is_active() {
            return Err(DbError::transaction_state(
                format!("Cannot open a scope on a {} transaction", transaction.status()),
                transaction.id(),
            ));
        }

        let mut current = context.lock();
        let joined = current
            .as_ref()
            .filter(|ambient| {
                // An ended ambient transaction may have handed its connection back
                ambient.transaction.is_active() && ambient.transaction.same_connection(&transaction)
            })
            .map(|ambient| ambient.transaction.clone());

        let owner = joined.is_none();
        let frame = Arc::new(ScopeFrame {
            id: generate_scope_id(),
            transaction: joined.unwrap_or(transaction),
            owner,
            parent: current.clone(),
        });
        *current = Some(Arc::clone(&frame));
        drop(current);

        debug!(
            scope_id = %frame.id,
            transaction_id = %frame.transaction.id(),
            owner,
            "Transaction scope opened"
        );

        Ok(Self {
            frame,
            context: context.clone(),
            state: ScopeState::Open,
        })
    }

    /// Begin a fresh transaction from `source` and open an owning scope on it.
    pub async fn begin<S>(context: &ScopeContext, source: &S) -> DbResult<Self>
    where
        S: TransactionSource + ?Sized,
    {
        let transaction = source.begin_transaction().await?;
        Self::create(context, transaction)
    }

    /// Run `action` in the ambient transaction, or in a new one from `source`
    /// when there is none.
    ///
    /// The scope completes when the action succeeds and is disposed either way,
    /// so a failing action rolls back a transaction this call began. The action's
    /// error is returned unchanged.
    pub async fn within<S, F, Fut, T>(context: &ScopeContext, source: &S, action: F) -> DbResult<T>
    where
        S: TransactionSource + ?Sized,
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let mut scope = match context.current_transaction() {
            Some(ambient) if ambient.is_active() => Self::create(context, ambient)?,
            _ => Self::begin(context, source).await?,
        };

        match action(scope.transaction().clone()).await {
            Ok(value) => {
                let completed = scope.complete().await;
                scope.dispose().await;
                completed.map(|_| value)
            }
            Err(err) => {
                scope.dispose().await;
                Err(err)
            }
        }
    }

    pub fn id(&self) -> &str {
        &self.frame.id
    }

    pub fn transaction(&self) -> &Transaction {
        &self.frame.transaction
    }

    /// Whether this scope commits or rolls back its transaction.
    pub fn is_owner(&self) -> bool {
        self.frame.owner
    }

    pub fn is_completed(&self) -> bool {
        self.state == ScopeState::Completed
    }

    /// Mark the unit of work as successful. An owning scope commits.
    ///
    /// Completing twice, or after disposal, is an error. If the commit fails the
    /// scope stays open and its disposal rolls back.
    pub async fn complete(&mut self) -> DbResult<()> {
        match self.state {
            ScopeState::Open => {}
            ScopeState::Completed => {
                return Err(self.state_error("Transaction scope was already completed"));
            }
            ScopeState::Disposed => {
                return Err(self.state_error("Transaction scope was already disposed"));
            }
        }

        // A failed commit leaves the scope open so dispose still rolls back
        if self.frame.owner {
            self.frame.transaction.commit().await?;
        }
        self.state = ScopeState::Completed;
        debug!(scope_id = %self.frame.id, owner = self.frame.owner, "Transaction scope completed");
        Ok(())
    }

    /// End the scope.
    ///
    /// The parent becomes ambient again before anything else happens. An owning
    /// scope that was not completed then rolls back; a rollback failure is logged
    /// and swallowed.
    pub async fn dispose(mut self) {
        self.restore_parent();
        let rollback = self.frame.owner && self.state == ScopeState::Open;
        self.state = ScopeState::Disposed;

        if rollback && self.frame.transaction.is_active() {
            if let Err(e) = self.frame.transaction.rollback().await {
                warn!(
                    scope_id = %self.frame.id,
                    transaction_id = %self.frame.transaction.id(),
                    error = %e,
                    "Rollback during scope disposal failed"
                );
            }
        }
        debug!(scope_id = %self.frame.id, rolled_back = rollback, "Transaction scope disposed");
    }

    /// Make the parent scope ambient again.
    fn restore_parent(&self) {
        let mut current = self.context.lock();
        match current.as_ref() {
            Some(ambient) if Arc::ptr_eq(ambient, &self.frame) => {
                *current = self.frame.parent.clone();
            }
            _ => warn!(
                scope_id = %self.frame.id,
                "Transaction scope disposed out of order, ambient scope left unchanged"
            ),
        }
    }

    fn state_error(&self, message: &str) -> DbError {
        DbError::transaction_state(message, self.frame.transaction.id())
    }
}

impl Drop for TransactionScope {
    fn drop(&mut self) {
        if self.state == ScopeState::Disposed {
            return;
        }
        self.restore_parent();
        if !self.frame.owner || self.state != ScopeState::Open {
            return;
        }

        let transaction = self.frame.transaction.clone();
        if !transaction.is_active() {
            return;
        }
        warn!(
            scope_id = %self.frame.id,
            transaction_id = %transaction.id(),
            "Transaction scope dropped without dispose, rolling back in background"
        );
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = transaction.rollback().await {
                        warn!(
                            transaction_id = %transaction.id(),
                            error = %e,
                            "Background rollback failed"
                        );
                    }
                });
            }
            // The transaction rolls back when its last reference drops
            Err(_) => drop(transaction),
        }
    }
}

impl std::fmt::Debug for TransactionScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionScope")
            .field("id", &self.frame.id)
            .field("transaction_id", &self.frame.transaction.id())
            .field("owner", &self.frame.owner)
            .field("state", &self.state)
            .finish()
    }
}
