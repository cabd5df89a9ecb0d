//! dbscope
//!
//! Pooled database connections with ambient, nestable transaction scopes for
//! SQLite, PostgreSQL and MySQL:
//! - a bounded connection pool with validation, idle eviction and diagnostics
//! - transactions with LIFO savepoints
//! - flow-scoped ambient transactions shared by nested call sites
//! - optimistic concurrency through version columns

pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod models;

pub use config::{DatabaseConfig, PoolConfig, PoolOptions};
pub use db::{
    ConnectionPool, PooledHandle, ScopeContext, Transaction, TransactionScope, TransactionSource,
};
pub use error::{DbError, DbResult};
