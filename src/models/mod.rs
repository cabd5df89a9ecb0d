//! Data models for dbscope.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;

// Re-export commonly used types
pub use connection::{ConnectionConfig, ConnectionConfigError, DatabaseType, TransactionStatus};
pub use query::{QueryParam, Row};
