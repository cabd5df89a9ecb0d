//! Error types for dbscope.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Variants separate recoverable conditions (pool exhaustion, version conflicts) from
//! broken unit-of-work boundaries (transaction state and savepoint misuse).

use crate::db::concurrency::ConcurrencyConflict;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection pool exhausted: no connection available after {waited_ms}ms")]
    PoolExhausted { waited_ms: u64 },

    #[error("Connection pool is closed")]
    PoolClosed,

    /// Raised internally when a pooled connection fails validation. Never returned
    /// from a checkout; the resource is discarded and replaced.
    #[error("Pooled connection {resource_id} is invalid: {reason}")]
    ResourceInvalid { resource_id: u64, reason: String },

    #[error("Transaction error: {message} (transaction: {transaction_id})")]
    TransactionState {
        message: String,
        transaction_id: String,
    },

    #[error("Savepoint error: {message} (savepoint: {savepoint})")]
    Savepoint { message: String, savepoint: String },

    #[error("{0}")]
    ConcurrencyConflict(Box<ConcurrencyConflict>),

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a pool exhaustion error for a checkout that waited `waited`.
    pub fn pool_exhausted(waited: Duration) -> Self {
        Self::PoolExhausted {
            waited_ms: waited.as_millis() as u64,
        }
    }

    /// Create a resource validation error.
    pub fn resource_invalid(resource_id: u64, reason: impl Into<String>) -> Self {
        Self::ResourceInvalid {
            resource_id,
            reason: reason.into(),
        }
    }

    /// Create a transaction state error.
    pub fn transaction_state(message: impl Into<String>, transaction_id: impl Into<String>) -> Self {
        Self::TransactionState {
            message: message.into(),
            transaction_id: transaction_id.into(),
        }
    }

    /// Create a savepoint misuse error.
    pub fn savepoint(message: impl Into<String>, savepoint: impl Into<String>) -> Self {
        Self::Savepoint {
            message: message.into(),
            savepoint: savepoint.into(),
        }
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            Self::PoolExhausted { .. } => {
                Some("Retry later, return connections sooner, or raise max_pool_size")
            }
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. } | Self::Connection { .. })
    }

    /// The conflict details if this is an optimistic-concurrency failure.
    pub fn as_conflict(&self) -> Option<&ConcurrencyConflict> {
        match self {
            Self::ConcurrencyConflict(conflict) => Some(conflict),
            _ => None,
        }
    }
}

impl From<ConcurrencyConflict> for DbError {
    fn from(conflict: ConcurrencyConflict) -> Self {
        DbError::ConcurrencyConflict(Box::new(conflict))
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::database(
                    db_err.message(),
                    code,
                    "Check the SQL syntax and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => DbError::database(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::ColumnNotFound(col) => DbError::database(
                format!("Column not found: {}", col),
                None,
                "Check the selected column names",
            ),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::connection(
                "Database worker crashed",
                "Reopen the connection",
            ),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
