//! In-memory backends: connection, history store and lock over one
//! shared state.
//!
//! Useful for tests and for exercising the engine without a database.
//! Transactions are snapshot-based: `begin` snapshots the state,
//! `rollback` restores it, so history writes and executed SQL commit or
//! roll back together exactly like the real transactional contract.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::connect::{Connection, ConnectionProvider};
use crate::error::{MigrateError, MigrateResult};
use crate::history::{AppliedMigration, HistoryEntry, SchemaHistory};
use crate::lock::{LockProvider, RetryPolicy};

#[derive(Default)]
struct State {
    table_created: bool,
    history: Vec<AppliedMigration>,
    sql: Vec<String>,
    snapshot: Option<(Vec<AppliedMigration>, Vec<String>)>,
    fail_on: Option<String>,
    locked: bool,
}

/// Shared state behind the in-memory backends. Cheap to clone.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<State>>,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.lock().expect("memory backend poisoned")
    }

    /// Make `execute` fail for any statement containing `fragment`.
    pub fn fail_on(&self, fragment: impl Into<String>) {
        self.state().fail_on = Some(fragment.into());
    }

    /// All SQL statements executed so far (outside rolled-back
    /// transactions).
    pub fn committed_sql(&self) -> Vec<String> {
        self.state().sql.clone()
    }

    /// Current history rows.
    pub fn history_rows(&self) -> Vec<AppliedMigration> {
        self.state().history.clone()
    }
}

/// In-memory [`Connection`].
pub struct MemoryConnection {
    backend: MemoryBackend,
}

impl MemoryConnection {
    /// Create a connection over the shared backend.
    pub fn new(backend: &MemoryBackend) -> Self {
        Self {
            backend: backend.clone(),
        }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn execute(&mut self, sql: &str) -> MigrateResult<()> {
        let mut state = self.backend.state();
        if let Some(fragment) = &state.fail_on {
            if sql.contains(fragment.as_str()) {
                return Err(MigrateError::database(format!(
                    "statement rejected (matches '{fragment}')"
                )));
            }
        }
        state.sql.push(sql.to_string());
        Ok(())
    }

    async fn begin(&mut self) -> MigrateResult<()> {
        let mut state = self.backend.state();
        if state.snapshot.is_some() {
            return Err(MigrateError::database("transaction already open"));
        }
        state.snapshot = Some((state.history.clone(), state.sql.clone()));
        Ok(())
    }

    async fn commit(&mut self) -> MigrateResult<()> {
        let mut state = self.backend.state();
        if state.snapshot.take().is_none() {
            return Err(MigrateError::database("no transaction to commit"));
        }
        Ok(())
    }

    async fn rollback(&mut self) -> MigrateResult<()> {
        let mut state = self.backend.state();
        match state.snapshot.take() {
            Some((history, sql)) => {
                state.history = history;
                state.sql = sql;
                Ok(())
            }
            None => Err(MigrateError::database("no transaction to roll back")),
        }
    }
}

/// Provider handing out [`MemoryConnection`]s.
pub struct MemoryConnectionProvider {
    backend: MemoryBackend,
}

impl MemoryConnectionProvider {
    /// Create a provider over the shared backend.
    pub fn new(backend: &MemoryBackend) -> Self {
        Self {
            backend: backend.clone(),
        }
    }
}

#[async_trait]
impl ConnectionProvider for MemoryConnectionProvider {
    async fn connect(&self) -> MigrateResult<Box<dyn Connection>> {
        Ok(Box::new(MemoryConnection::new(&self.backend)))
    }
}

/// In-memory [`SchemaHistory`], transactional with [`MemoryConnection`].
pub struct MemoryHistory {
    backend: MemoryBackend,
}

impl MemoryHistory {
    /// Create a history store over the shared backend.
    pub fn new(backend: &MemoryBackend) -> Self {
        Self {
            backend: backend.clone(),
        }
    }
}

#[async_trait]
impl SchemaHistory for MemoryHistory {
    async fn table_exists(&self) -> MigrateResult<bool> {
        Ok(self.backend.state().table_created)
    }

    async fn ensure_table(&self) -> MigrateResult<()> {
        self.backend.state().table_created = true;
        Ok(())
    }

    async fn load(&self) -> MigrateResult<Vec<AppliedMigration>> {
        Ok(self.backend.state().history.clone())
    }

    async fn record(&self, entry: &HistoryEntry) -> MigrateResult<i32> {
        let mut state = self.backend.state();
        let rank = state
            .history
            .iter()
            .map(|row| row.installed_rank)
            .max()
            .map_or(0, |max| max + 1);
        state.history.push(AppliedMigration {
            installed_rank: rank,
            version: entry.version.clone(),
            description: entry.description.clone(),
            kind: entry.kind,
            script: entry.script.clone(),
            checksum: entry.checksum,
            installed_by: entry.installed_by.clone(),
            installed_on: Utc::now(),
            execution_time_ms: entry.execution_time_ms,
            success: entry.success,
        });
        Ok(rank)
    }

    async fn update_checksum(
        &self,
        installed_rank: i32,
        checksum: Option<i32>,
    ) -> MigrateResult<()> {
        let mut state = self.backend.state();
        let row = state
            .history
            .iter_mut()
            .find(|row| row.installed_rank == installed_rank)
            .ok_or_else(|| {
                MigrateError::database(format!("no history row with rank {installed_rank}"))
            })?;
        row.checksum = checksum;
        Ok(())
    }

    async fn delete(&self, installed_rank: i32) -> MigrateResult<()> {
        let mut state = self.backend.state();
        let before = state.history.len();
        state.history.retain(|row| row.installed_rank != installed_rank);
        if state.history.len() == before {
            return Err(MigrateError::database(format!(
                "no history row with rank {installed_rank}"
            )));
        }
        Ok(())
    }
}

/// In-memory [`LockProvider`] with a short retry interval.
pub struct MemoryLock {
    backend: MemoryBackend,
}

impl MemoryLock {
    /// Create a lock over the shared backend.
    pub fn new(backend: &MemoryBackend) -> Self {
        Self {
            backend: backend.clone(),
        }
    }
}

#[async_trait]
impl LockProvider for MemoryLock {
    async fn try_acquire(&self) -> MigrateResult<bool> {
        let mut state = self.backend.state();
        if state.locked {
            return Ok(false);
        }
        state.locked = true;
        Ok(true)
    }

    async fn release(&self) -> MigrateResult<()> {
        self.backend.state().locked = false;
        Ok(())
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::Fixed(Duration::from_millis(5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::MigrationKind;

    fn entry(description: &str) -> HistoryEntry {
        HistoryEntry {
            version: None,
            description: description.to_string(),
            kind: MigrationKind::Repeatable,
            script: format!("R__{description}.sql"),
            checksum: Some(7),
            installed_by: "test".to_string(),
            execution_time_ms: 1,
            success: true,
        }
    }

    #[tokio::test]
    async fn test_ranks_are_gap_free() {
        let backend = MemoryBackend::new();
        let history = MemoryHistory::new(&backend);

        assert_eq!(history.record(&entry("a")).await.unwrap(), 0);
        assert_eq!(history.record(&entry("b")).await.unwrap(), 1);
        history.delete(1).await.unwrap();
        assert_eq!(history.record(&entry("c")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rollback_restores_history_and_sql() {
        let backend = MemoryBackend::new();
        let history = MemoryHistory::new(&backend);
        let mut conn = MemoryConnection::new(&backend);

        conn.begin().await.unwrap();
        conn.execute("CREATE TABLE t (id INT);").await.unwrap();
        history.record(&entry("a")).await.unwrap();
        conn.rollback().await.unwrap();

        assert!(backend.committed_sql().is_empty());
        assert!(history.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let backend = MemoryBackend::new();
        let lock = MemoryLock::new(&backend);

        assert!(lock.try_acquire().await.unwrap());
        assert!(!lock.try_acquire().await.unwrap());
        lock.release().await.unwrap();
        assert!(lock.try_acquire().await.unwrap());
    }
}
