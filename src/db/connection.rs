//! Connection traits.
//!
//! The pool and the transaction layer only talk to connections through these
//! traits. [`SqlxConnection`](super::driver::SqlxConnection) is the production
//! implementation; tests plug in their own.

use crate::error::DbResult;
use crate::models::{DatabaseType, QueryParam, Row};
use async_trait::async_trait;

/// A single native database connection.
#[async_trait]
pub trait Connection: Send + 'static {
    /// SQL dialect spoken by this connection.
    fn database_type(&self) -> DatabaseType;

    /// Cheap, local check that the connection has not been closed.
    fn is_open(&self) -> bool;

    /// Round-trip to the server to check the connection is usable.
    async fn ping(&mut self) -> DbResult<()>;

    /// Re-establish a closed connection in place.
    async fn reopen(&mut self) -> DbResult<()>;

    /// Execute a statement, returning the affected row count.
    async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<u64>;

    /// Execute a query that returns rows.
    async fn query(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>>;

    /// Execute a query and return the first row.
    async fn query_one(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Option<Row>> {
        let rows = self.query(sql, params).await?;
        Ok(rows.into_iter().next())
    }

    /// Close the connection.
    async fn close(self: Box<Self>) -> DbResult<()>;
}

/// Factory for creating connections.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Open a new connection.
    async fn connect(&self) -> DbResult<Box<dyn Connection>>;

    /// Get the database type
    fn database_type(&self) -> DatabaseType;
}
