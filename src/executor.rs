//! Plan execution against a live connection.
//!
//! Each migration runs in its own transaction (or one shared
//! transaction when grouping is enabled and the dialect supports
//! transactional DDL), with its history row written inside the same
//! transaction. Per migration the state machine is
//! pending -> running -> success | failed; a failed migration is
//! terminal and stops the run.

use std::time::Instant;

use tracing::{debug, info, warn};

use crate::callback::{CallbackSet, Event, EventContext};
use crate::config::MigrationConfig;
use crate::connect::Connection;
use crate::dialect::Dialect;
use crate::error::{MigrateError, MigrateResult};
use crate::history::{HistoryEntry, SchemaHistory};
use crate::info::MigrationInfo;
use crate::resolver::ResolvedMigration;

/// What a run actually did.
#[derive(Debug, Default)]
pub struct ExecutionSummary {
    /// Scripts executed, in order.
    pub executed: Vec<String>,
    /// Non-fatal observations.
    pub warnings: Vec<String>,
}

/// Applies an execution plan.
pub struct Executor<'a> {
    config: &'a MigrationConfig,
    dialect: &'a dyn Dialect,
    callbacks: &'a CallbackSet,
}

impl<'a> Executor<'a> {
    /// Create an executor for one run.
    pub fn new(
        config: &'a MigrationConfig,
        dialect: &'a dyn Dialect,
        callbacks: &'a CallbackSet,
    ) -> Self {
        Self {
            config,
            dialect,
            callbacks,
        }
    }

    /// Apply the plan in order, recording each outcome in the history
    /// store. Stops at the first failure; already-committed migrations
    /// stay committed.
    pub async fn apply(
        &self,
        plan: &[MigrationInfo],
        conn: &mut dyn Connection,
        history: &dyn SchemaHistory,
    ) -> MigrateResult<ExecutionSummary> {
        let mut summary = ExecutionSummary::default();

        let mut group = self.config.group;
        if group && !self.dialect.supports_ddl_transactions() {
            summary.warnings.push(format!(
                "dialect '{}' does not support transactional DDL; executing per migration",
                self.dialect.name()
            ));
            warn!(dialect = self.dialect.name(), "grouped execution not supported");
            group = false;
        }

        if group {
            self.apply_grouped(plan, conn, history, &mut summary).await?;
        } else {
            self.apply_each(plan, conn, history, &mut summary).await?;
        }

        Ok(summary)
    }

    async fn apply_each(
        &self,
        plan: &[MigrationInfo],
        conn: &mut dyn Connection,
        history: &dyn SchemaHistory,
        summary: &mut ExecutionSummary,
    ) -> MigrateResult<()> {
        for info in plan {
            let Some(resolved) = info.resolved.as_ref() else {
                continue;
            };

            if resolved.no_transaction && !self.config.mixed {
                return Err(MigrateError::execution(
                    &resolved.script,
                    "script declares no-transaction; enable 'mixed' to run it",
                ));
            }
            let use_transaction = !resolved.no_transaction;

            self.callbacks
                .emit(Event::BeforeEachMigrate, &EventContext::migration(info))
                .await;

            let started = Instant::now();
            if use_transaction {
                conn.begin().await?;
            }

            let run_result = if self.config.skip_executing_migrations {
                debug!(script = %resolved.script, "skipping execution, recording only");
                Ok(())
            } else {
                conn.execute(&resolved.sql).await
            };
            let elapsed_ms = started.elapsed().as_millis() as i64;

            match run_result {
                Ok(()) => {
                    let entry = self.entry_for(resolved, elapsed_ms, true);
                    let outcome = async {
                        let rank = history.record(&entry).await?;
                        if use_transaction {
                            conn.commit().await?;
                        }
                        Ok::<i32, MigrateError>(rank)
                    }
                    .await;

                    match outcome {
                        Ok(rank) => {
                            info!(
                                script = %resolved.script,
                                rank,
                                elapsed_ms,
                                "migration applied"
                            );
                            summary.executed.push(resolved.script.clone());
                            self.callbacks
                                .emit(Event::AfterEachMigrate, &EventContext::migration(info))
                                .await;
                        }
                        Err(err) => {
                            if use_transaction && conn.rollback().await.is_err() {
                                warn!(script = %resolved.script, "rollback after record failure also failed");
                            }
                            return Err(err);
                        }
                    }
                }
                Err(err) => {
                    if use_transaction {
                        conn.rollback().await?;
                    }
                    // The failure must stay visible to future runs, so
                    // the failed row gets its own micro-transaction.
                    self.record_failure(resolved, elapsed_ms, conn, history)
                        .await;
                    self.callbacks
                        .emit(Event::AfterEachMigrateError, &EventContext::migration(info))
                        .await;
                    return Err(MigrateError::execution(&resolved.script, err.to_string()));
                }
            }
        }

        Ok(())
    }

    async fn apply_grouped(
        &self,
        plan: &[MigrationInfo],
        conn: &mut dyn Connection,
        history: &dyn SchemaHistory,
        summary: &mut ExecutionSummary,
    ) -> MigrateResult<()> {
        conn.begin().await?;

        for info in plan {
            let Some(resolved) = info.resolved.as_ref() else {
                continue;
            };

            if resolved.no_transaction {
                conn.rollback().await?;
                return Err(MigrateError::execution(
                    &resolved.script,
                    "no-transaction scripts cannot be part of a grouped run",
                ));
            }

            self.callbacks
                .emit(Event::BeforeEachMigrate, &EventContext::migration(info))
                .await;

            let started = Instant::now();
            let run_result = if self.config.skip_executing_migrations {
                Ok(())
            } else {
                conn.execute(&resolved.sql).await
            };
            let elapsed_ms = started.elapsed().as_millis() as i64;

            match run_result {
                Ok(()) => {
                    let entry = self.entry_for(resolved, elapsed_ms, true);
                    if let Err(err) = history.record(&entry).await {
                        conn.rollback().await?;
                        return Err(err);
                    }
                    summary.executed.push(resolved.script.clone());
                    self.callbacks
                        .emit(Event::AfterEachMigrate, &EventContext::migration(info))
                        .await;
                }
                Err(err) => {
                    // Grouped runs roll back as one unit; no failed row
                    // survives because nothing from the run survives.
                    conn.rollback().await?;
                    summary.executed.clear();
                    self.callbacks
                        .emit(Event::AfterEachMigrateError, &EventContext::migration(info))
                        .await;
                    return Err(MigrateError::execution(&resolved.script, err.to_string()));
                }
            }
        }

        conn.commit().await?;
        info!(count = summary.executed.len(), "grouped migration run committed");
        Ok(())
    }

    async fn record_failure(
        &self,
        resolved: &ResolvedMigration,
        elapsed_ms: i64,
        conn: &mut dyn Connection,
        history: &dyn SchemaHistory,
    ) {
        let entry = self.entry_for(resolved, elapsed_ms, false);
        let outcome = async {
            conn.begin().await?;
            history.record(&entry).await?;
            conn.commit().await
        }
        .await;
        if let Err(err) = outcome {
            warn!(script = %resolved.script, %err, "could not record failed migration");
        }
    }

    fn entry_for(
        &self,
        resolved: &ResolvedMigration,
        elapsed_ms: i64,
        success: bool,
    ) -> HistoryEntry {
        HistoryEntry {
            version: resolved.version.clone(),
            description: resolved.description.clone(),
            kind: resolved.kind,
            script: resolved.script.clone(),
            checksum: Some(resolved.checksum),
            installed_by: self
                .config
                .installed_by
                .clone()
                .unwrap_or_else(|| "waymark".to_string()),
            execution_time_ms: elapsed_ms,
            success,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::SchemaHistory;
    use crate::info::MigrationState;
    use crate::memory::{MemoryBackend, MemoryConnection, MemoryHistory};
    use crate::resolver::{MigrationKind, checksum_of};
    use crate::version::Version;

    fn pending(version: &str, description: &str, sql: &str) -> MigrationInfo {
        MigrationInfo {
            resolved: Some(ResolvedMigration {
                kind: MigrationKind::Versioned,
                version: Some(Version::parse(version).unwrap()),
                description: description.to_string(),
                script: format!("V{version}__{description}.sql"),
                checksum: checksum_of(sql),
                sql: sql.to_string(),
                no_transaction: false,
            }),
            applied: None,
            state: MigrationState::Pending,
        }
    }

    struct Harness {
        backend: MemoryBackend,
        config: MigrationConfig,
        callbacks: CallbackSet,
    }

    impl Harness {
        fn new(config: MigrationConfig) -> Self {
            Self {
                backend: MemoryBackend::new(),
                config,
                callbacks: CallbackSet::new(),
            }
        }

        async fn run(&self, plan: &[MigrationInfo]) -> MigrateResult<ExecutionSummary> {
            let executor =
                Executor::new(&self.config, &crate::dialect::AnsiDialect, &self.callbacks);
            let mut conn = MemoryConnection::new(&self.backend);
            let history = MemoryHistory::new(&self.backend);
            executor.apply(plan, &mut conn, &history).await
        }
    }

    #[tokio::test]
    async fn test_applies_in_order_and_records_history() {
        let harness = Harness::new(MigrationConfig::default());
        let plan = vec![
            pending("1", "init", "CREATE TABLE t (id INT);"),
            pending("2", "add_col", "ALTER TABLE t ADD c INT;"),
        ];

        let summary = harness.run(&plan).await.unwrap();
        assert_eq!(summary.executed.len(), 2);

        let rows = MemoryHistory::new(&harness.backend).load().await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].installed_rank, 0);
        assert_eq!(rows[1].installed_rank, 1);
        assert!(rows.iter().all(|r| r.success));
        assert_eq!(harness.backend.committed_sql().len(), 2);
    }

    #[tokio::test]
    async fn test_failure_records_failed_row_and_stops() {
        let harness = Harness::new(MigrationConfig::default());
        harness.backend.fail_on("ADD c");
        let plan = vec![
            pending("1", "init", "CREATE TABLE t (id INT);"),
            pending("2", "add_col", "ALTER TABLE t ADD c INT;"),
            pending("3", "never", "SELECT 1;"),
        ];

        let err = harness.run(&plan).await.unwrap_err();
        assert!(matches!(err, MigrateError::Execution { .. }));

        let rows = MemoryHistory::new(&harness.backend).load().await.unwrap();
        // One committed success, one failed marker, nothing for V3.
        assert_eq!(rows.len(), 2);
        assert!(rows[0].success);
        assert!(!rows[1].success);
        assert_eq!(rows[1].version, Some(Version::parse("2").unwrap()));
        // The failed migration's own SQL was rolled back.
        assert_eq!(harness.backend.committed_sql().len(), 1);
    }

    #[tokio::test]
    async fn test_grouped_failure_rolls_back_everything() {
        let harness = Harness::new(MigrationConfig::default().group(true));
        harness.backend.fail_on("ADD c");
        let plan = vec![
            pending("1", "init", "CREATE TABLE t (id INT);"),
            pending("2", "add_col", "ALTER TABLE t ADD c INT;"),
        ];

        let err = harness.run(&plan).await.unwrap_err();
        assert!(matches!(err, MigrateError::Execution { .. }));

        let rows = MemoryHistory::new(&harness.backend).load().await.unwrap();
        assert!(rows.is_empty());
        assert!(harness.backend.committed_sql().is_empty());
    }

    #[tokio::test]
    async fn test_skip_executing_writes_history_only() {
        let harness = Harness::new(MigrationConfig::default().skip_executing_migrations(true));
        let plan = vec![pending("1", "init", "CREATE TABLE t (id INT);")];

        let summary = harness.run(&plan).await.unwrap();
        assert_eq!(summary.executed.len(), 1);

        let rows = MemoryHistory::new(&harness.backend).load().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].success);
        assert!(harness.backend.committed_sql().is_empty());
    }

    #[tokio::test]
    async fn test_no_transaction_requires_mixed() {
        let mut info = pending("1", "idx", "CREATE INDEX CONCURRENTLY i ON t (id);");
        info.resolved.as_mut().unwrap().no_transaction = true;

        let strict = Harness::new(MigrationConfig::default());
        assert!(strict.run(std::slice::from_ref(&info)).await.is_err());

        let mixed = Harness::new(MigrationConfig::default().mixed(true));
        let summary = mixed.run(&[info]).await.unwrap();
        assert_eq!(summary.executed.len(), 1);
    }

    #[tokio::test]
    async fn test_installed_by_comes_from_config() {
        let harness = Harness::new(MigrationConfig::default().installed_by("deployer"));
        harness
            .run(&[pending("1", "init", "CREATE TABLE t (id INT);")])
            .await
            .unwrap();

        let rows = MemoryHistory::new(&harness.backend).load().await.unwrap();
        assert_eq!(rows[0].installed_by, "deployer");
    }
}
