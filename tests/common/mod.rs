//! Shared test helpers: an in-memory mock driver and SQLite pool setup.

#![allow(dead_code)]

use async_trait::async_trait;
use dbscope::config::PoolConfig;
use dbscope::db::{Connection, ConnectionFactory, ConnectionPool};
use dbscope::error::{DbError, DbResult};
use dbscope::models::{DatabaseType, QueryParam, Row};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempPath;

/// Shared state behind every connection a [`MockFactory`] opens.
#[derive(Default)]
pub struct MockState {
    statements: Mutex<Vec<String>>,
    fail_prefix: Mutex<Option<String>>,
    closed_flags: Mutex<Vec<Arc<AtomicBool>>>,
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
    pub pings: AtomicUsize,
    pub reopens: AtomicUsize,
    pub fail_connect: AtomicBool,
    pub fail_ping: AtomicBool,
}

impl MockState {
    /// Every statement executed so far, in order.
    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }

    pub fn clear_statements(&self) {
        self.statements.lock().unwrap().clear();
    }

    /// Make statements starting with `prefix` fail.
    pub fn fail_on(&self, prefix: &str) {
        *self.fail_prefix.lock().unwrap() = Some(prefix.to_string());
    }

    pub fn clear_failure(&self) {
        *self.fail_prefix.lock().unwrap() = None;
    }

    /// Simulate the server closing every connection opened so far.
    pub fn close_all(&self) {
        for flag in self.closed_flags.lock().unwrap().iter() {
            flag.store(true, Ordering::SeqCst);
        }
    }
}

pub struct MockConnection {
    state: Arc<MockState>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Connection for MockConnection {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::SQLite
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn ping(&mut self) -> DbResult<()> {
        self.state.pings.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_ping.load(Ordering::SeqCst) {
            return Err(DbError::connection("ping failed", "check the server"));
        }
        Ok(())
    }

    async fn reopen(&mut self) -> DbResult<()> {
        self.state.reopens.fetch_add(1, Ordering::SeqCst);
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn execute(&mut self, sql: &str, _params: &[QueryParam]) -> DbResult<u64> {
        if !self.is_open() {
            return Err(DbError::connection("connection closed", "reopen"));
        }
        self.state.statements.lock().unwrap().push(sql.to_string());
        let fail = self
            .state
            .fail_prefix
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|prefix| sql.starts_with(prefix.as_str()));
        if fail {
            return Err(DbError::database(format!("{} failed", sql), None, "mock failure"));
        }
        Ok(1)
    }

    async fn query(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        self.execute(sql, params).await?;
        Ok(Vec::new())
    }

    async fn close(self: Box<Self>) -> DbResult<()> {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MockFactory {
    pub state: Arc<MockState>,
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    async fn connect(&self) -> DbResult<Box<dyn Connection>> {
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(DbError::connection("connection refused", "start the server"));
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        let closed = Arc::new(AtomicBool::new(false));
        self.state.closed_flags.lock().unwrap().push(Arc::clone(&closed));
        Ok(Box::new(MockConnection {
            state: Arc::clone(&self.state),
            closed,
        }))
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::SQLite
    }
}

/// Pool config for tests: no background eviction, short checkout timeout.
pub fn test_config(min_size: usize, max_size: usize) -> PoolConfig {
    PoolConfig::default()
        .with_min_size(min_size)
        .with_max_size(max_size)
        .with_checkout_timeout(Duration::from_secs(5))
        .with_eviction_interval(Duration::ZERO)
}

pub async fn mock_pool(min_size: usize, max_size: usize) -> (Arc<ConnectionPool>, MockFactory) {
    let factory = MockFactory::default();
    let pool = ConnectionPool::new(test_config(min_size, max_size), Arc::new(factory.clone()))
        .await
        .unwrap();
    (pool, factory)
}

/// A pool over a temporary SQLite file with a `person` table.
///
/// Keep the returned path alive for the duration of the test.
pub async fn sqlite_pool(max_size: usize) -> (Arc<ConnectionPool>, TempPath) {
    let path = tempfile::NamedTempFile::new().unwrap().into_temp_path();
    let url = format!(
        "sqlite:{}?min_pool_size=1&max_pool_size={}&checkout_timeout=5",
        path.display(),
        max_size
    );
    let pool = ConnectionPool::connect(&url).await.unwrap();

    let mut handle = pool.get().await.unwrap();
    handle
        .execute(
            "CREATE TABLE person (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
            &[],
        )
        .await
        .unwrap();
    handle.release();

    (pool, path)
}

pub async fn insert_person(tx: &dbscope::Transaction, name: &str) -> DbResult<u64> {
    tx.execute("INSERT INTO person (name) VALUES (?)", &[QueryParam::from(name)])
        .await
}

/// Committed person names, in insertion order.
pub async fn person_names(pool: &Arc<ConnectionPool>) -> Vec<String> {
    let mut handle = pool.get().await.unwrap();
    let rows = handle
        .query("SELECT name FROM person ORDER BY id", &[])
        .await
        .unwrap();
    rows.iter()
        .filter_map(|row| row.get("name").and_then(|v| v.as_str()).map(String::from))
        .collect()
}
