//! Database access layer.
//!
//! This module provides:
//! - Connection traits and the sqlx-backed driver
//! - The connection pool and pooled handles
//! - Transactions, savepoints and ambient transaction scopes
//! - Optimistic concurrency through version columns
//! - Parameter binding, row decoding and database dispatch macros

pub mod concurrency;
pub mod connection;
pub mod driver;
pub mod handle;
#[macro_use]
pub mod macros;
pub mod params;
pub mod pool;
pub mod scope;
pub mod transaction;
pub mod types;

pub use concurrency::{
    ConcurrencyConflict, ConflictResolver, ConflictStrategy, IntegerWidth, Resolution,
    UpdateOutcome, VersionColumn, VersionKind, VersionValue, VersionedUpdate,
};
pub use connection::{Connection, ConnectionFactory};
pub use driver::{DbConnection, SqlxConnection, SqlxConnectionFactory};
pub use handle::PooledHandle;
pub use pool::{ConnectionPool, PoolStats, ResourceId, ResourceInfo};
pub use scope::{AmbientScope, ScopeContext, TransactionScope, TransactionSource};
pub use transaction::{Savepoint, Transaction};
