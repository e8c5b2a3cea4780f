//! The top-level migration engine.

use std::fmt;
use std::sync::Arc;

use tracing::{info, warn};

use crate::callback::{Callback, CallbackSet, Event, EventContext};
use crate::config::MigrationConfig;
use crate::connect::{Connection, ConnectionProvider, connect_with_retries};
use crate::dialect::{AnsiDialect, Dialect};
use crate::error::{MigrateError, MigrateResult};
use crate::executor::Executor;
use crate::history::{HistoryEntry, SchemaHistory};
use crate::lock::{LockCoordinator, LockProvider};
use crate::reconcile::Reconciler;
use crate::report::{BaselineReport, InfoReport, MigrateReport, RepairReport, ValidateReport};
use crate::resolver::{MigrationKind, ResolvedMigration, Resolver};
use crate::version::Version;

/// Orchestrates resolution, reconciliation, locking and execution.
///
/// One `Migrator` holds an immutable configuration snapshot; nothing
/// mutates it once built.
pub struct Migrator {
    config: MigrationConfig,
    dialect: Arc<dyn Dialect>,
    connections: Arc<dyn ConnectionProvider>,
    history: Arc<dyn SchemaHistory>,
    lock: Arc<dyn LockProvider>,
    callbacks: CallbackSet,
}

impl Migrator {
    /// Start building a migrator for the given configuration.
    pub fn builder(config: MigrationConfig) -> MigratorBuilder {
        MigratorBuilder {
            config,
            dialect: None,
            connections: None,
            history: None,
            lock: None,
            callbacks: CallbackSet::new(),
        }
    }

    /// The configuration snapshot.
    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Apply all pending migrations.
    ///
    /// Validates first (unless `validate_on_migrate` is off), then runs
    /// the plan under the schema-history lock. Failed runs leave their
    /// committed prefix in place plus one failed history row.
    pub async fn migrate(&self) -> MigrateResult<MigrateReport> {
        self.callbacks
            .emit(Event::BeforeMigrate, &EventContext::run())
            .await;

        let resolved = Resolver::new(&self.config).resolve().await?;
        let mut conn = connect_with_retries(
            self.connections.as_ref(),
            self.config.connect_retries,
            self.config.connect_retries_interval,
        )
        .await?;

        let guard =
            LockCoordinator::acquire(Arc::clone(&self.lock), self.config.lock_retry_count).await?;
        let result = self.migrate_locked(&resolved, conn.as_mut()).await;
        let released = guard.release().await;

        let report = result?;
        released?;

        self.callbacks
            .emit(Event::AfterMigrate, &EventContext::run())
            .await;
        info!("{}", report.summary());
        Ok(report)
    }

    async fn migrate_locked(
        &self,
        resolved: &[ResolvedMigration],
        conn: &mut dyn Connection,
    ) -> MigrateResult<MigrateReport> {
        self.history.ensure_table().await?;
        let mut applied = self.history.load().await?;

        if self.config.baseline_on_migrate && applied.is_empty() {
            info!(version = %self.config.baseline_version, "baselining empty history");
            self.record_baseline(self.config.baseline_version.clone())
                .await?;
            applied = self.history.load().await?;
        }

        let outcome = Reconciler::reconcile(resolved, &applied, &self.config);
        if self.config.validate_on_migrate && outcome.has_errors() {
            return Err(MigrateError::Validation(outcome.errors));
        }

        let plan = outcome.execution_plan();
        if plan.is_empty() {
            return Ok(MigrateReport {
                migrations_executed: 0,
                executed: Vec::new(),
                target_schema_version: outcome.current_version(),
                warnings: Vec::new(),
            });
        }

        let executor = Executor::new(&self.config, self.dialect.as_ref(), &self.callbacks);
        let summary = executor
            .apply(&plan, conn, self.history.as_ref())
            .await?;

        let rows = self.history.load().await?;
        let target_schema_version = rows
            .iter()
            .filter(|row| row.success)
            .filter_map(|row| row.version.clone())
            .max();

        Ok(MigrateReport {
            migrations_executed: summary.executed.len(),
            executed: summary.executed,
            target_schema_version,
            warnings: summary.warnings,
        })
    }

    /// Check resolved migrations against the history without touching
    /// anything: no lock, no writes, no table creation.
    pub async fn validate(&self) -> MigrateResult<ValidateReport> {
        self.callbacks
            .emit(Event::BeforeValidate, &EventContext::run())
            .await;

        let resolved = Resolver::new(&self.config).resolve().await?;
        let applied = if self.history.table_exists().await? {
            self.history.load().await?
        } else {
            Vec::new()
        };

        let outcome = Reconciler::reconcile(&resolved, &applied, &self.config);
        self.callbacks
            .emit(Event::AfterValidate, &EventContext::run())
            .await;

        Ok(ValidateReport {
            validated_count: outcome.infos.len(),
            errors: outcome.errors,
        })
    }

    /// The full reconciled view of every known migration.
    pub async fn info(&self) -> MigrateResult<InfoReport> {
        let resolved = Resolver::new(&self.config).resolve().await?;
        let applied = if self.history.table_exists().await? {
            self.history.load().await?
        } else {
            Vec::new()
        };

        let outcome = Reconciler::reconcile(&resolved, &applied, &self.config);
        Ok(InfoReport {
            current_version: outcome.current_version(),
            migrations: outcome.infos,
        })
    }

    /// Repair the history table: drop failed rows and realign checksums
    /// with the currently resolved scripts.
    pub async fn repair(&self) -> MigrateResult<RepairReport> {
        self.callbacks
            .emit(Event::BeforeRepair, &EventContext::run())
            .await;

        let resolved = Resolver::new(&self.config).resolve().await?;
        let guard =
            LockCoordinator::acquire(Arc::clone(&self.lock), self.config.lock_retry_count).await?;
        let result = self.repair_locked(&resolved).await;
        let released = guard.release().await;

        let report = result?;
        released?;

        self.callbacks
            .emit(Event::AfterRepair, &EventContext::run())
            .await;
        Ok(report)
    }

    async fn repair_locked(&self, resolved: &[ResolvedMigration]) -> MigrateResult<RepairReport> {
        self.history.ensure_table().await?;
        let rows = self.history.load().await?;

        let mut report = RepairReport {
            removed_failed_ranks: Vec::new(),
            aligned_checksums: Vec::new(),
        };

        for row in &rows {
            if !row.success {
                self.history.delete(row.installed_rank).await?;
                warn!(script = %row.script, rank = row.installed_rank, "removed failed history row");
                report.removed_failed_ranks.push(row.installed_rank);
                continue;
            }

            // Checksum realignment applies to versioned kinds only;
            // repeatable drift is the reapply signal, not corruption.
            if row.kind == MigrationKind::Repeatable {
                continue;
            }
            let matched = resolved.iter().find(|r| {
                r.kind == row.kind && r.version.is_some() && r.version == row.version
            });
            if let Some(current) = matched {
                if row.checksum != Some(current.checksum) {
                    self.history
                        .update_checksum(row.installed_rank, Some(current.checksum))
                        .await?;
                    info!(script = %current.script, "realigned history checksum");
                    report.aligned_checksums.push(current.script.clone());
                }
            }
        }

        Ok(report)
    }

    /// Record a baseline marker: the schema is assumed to already match
    /// `version`, and migrations at or below it will be skipped.
    pub async fn baseline(&self, version: Version) -> MigrateResult<BaselineReport> {
        self.callbacks
            .emit(Event::BeforeBaseline, &EventContext::run())
            .await;

        let guard =
            LockCoordinator::acquire(Arc::clone(&self.lock), self.config.lock_retry_count).await?;
        let result = self.baseline_locked(version).await;
        let released = guard.release().await;

        let report = result?;
        released?;

        self.callbacks
            .emit(Event::AfterBaseline, &EventContext::run())
            .await;
        Ok(report)
    }

    async fn baseline_locked(&self, version: Version) -> MigrateResult<BaselineReport> {
        self.history.ensure_table().await?;
        let rows = self.history.load().await?;

        if rows.iter().any(|row| row.kind != MigrationKind::Baseline) {
            return Err(MigrateError::configuration(
                "cannot baseline: history already contains applied migrations",
            ));
        }
        if let Some(existing) = rows
            .iter()
            .find(|row| row.kind == MigrationKind::Baseline)
        {
            if existing.version.as_ref() == Some(&version) {
                // Already baselined at this version.
                return Ok(BaselineReport {
                    version,
                    description: existing.description.clone(),
                });
            }
            return Err(MigrateError::configuration(format!(
                "already baselined at version {}",
                existing
                    .version
                    .as_ref()
                    .map_or_else(|| "?".to_string(), ToString::to_string)
            )));
        }

        self.record_baseline(version.clone()).await?;
        info!(%version, "schema baselined");
        Ok(BaselineReport {
            version,
            description: self.config.baseline_description.clone(),
        })
    }

    async fn record_baseline(&self, version: Version) -> MigrateResult<()> {
        let entry = HistoryEntry {
            version: Some(version),
            description: self.config.baseline_description.clone(),
            kind: MigrationKind::Baseline,
            script: self.config.baseline_description.clone(),
            checksum: None,
            installed_by: self
                .config
                .installed_by
                .clone()
                .unwrap_or_else(|| "waymark".to_string()),
            execution_time_ms: 0,
            success: true,
        };
        self.history.record(&entry).await?;
        Ok(())
    }
}

impl fmt::Debug for Migrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migrator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Migrator`].
pub struct MigratorBuilder {
    config: MigrationConfig,
    dialect: Option<Arc<dyn Dialect>>,
    connections: Option<Arc<dyn ConnectionProvider>>,
    history: Option<Arc<dyn SchemaHistory>>,
    lock: Option<Arc<dyn LockProvider>>,
    callbacks: CallbackSet,
}

impl MigratorBuilder {
    /// Set the dialect. Defaults to [`AnsiDialect`].
    pub fn dialect(mut self, dialect: Arc<dyn Dialect>) -> Self {
        self.dialect = Some(dialect);
        self
    }

    /// Set the connection provider (required).
    pub fn connections(mut self, provider: Arc<dyn ConnectionProvider>) -> Self {
        self.connections = Some(provider);
        self
    }

    /// Set the schema history store (required).
    pub fn history(mut self, history: Arc<dyn SchemaHistory>) -> Self {
        self.history = Some(history);
        self
    }

    /// Set the lock provider (required).
    pub fn lock(mut self, lock: Arc<dyn LockProvider>) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Register a lifecycle callback.
    pub fn callback(mut self, callback: Arc<dyn Callback>) -> Self {
        self.callbacks.add(callback);
        self
    }

    /// Validate the configuration and build the migrator.
    pub fn build(self) -> MigrateResult<Migrator> {
        self.config.validate()?;

        Ok(Migrator {
            config: self.config,
            dialect: self.dialect.unwrap_or_else(|| Arc::new(AnsiDialect)),
            connections: self
                .connections
                .ok_or_else(|| MigrateError::configuration("a connection provider is required"))?,
            history: self
                .history
                .ok_or_else(|| MigrateError::configuration("a schema history store is required"))?,
            lock: self
                .lock
                .ok_or_else(|| MigrateError::configuration("a lock provider is required"))?,
            callbacks: self.callbacks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBackend, MemoryConnectionProvider, MemoryHistory, MemoryLock};
    use std::path::Path;

    async fn write(dir: &Path, name: &str, content: &str) {
        tokio::fs::write(dir.join(name), content).await.unwrap();
    }

    fn migrator(backend: &MemoryBackend, dir: &Path, config: MigrationConfig) -> Migrator {
        Migrator::builder(config.locations([dir.to_path_buf()]))
            .connections(Arc::new(MemoryConnectionProvider::new(backend)))
            .history(Arc::new(MemoryHistory::new(backend)))
            .lock(Arc::new(MemoryLock::new(backend)))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "V1__init.sql", "CREATE TABLE t (id INT);").await;
        write(dir.path(), "V2__add_col.sql", "ALTER TABLE t ADD c INT;").await;

        let backend = MemoryBackend::new();
        let engine = migrator(&backend, dir.path(), MigrationConfig::default());
        assert!(format!("{engine:?}").contains("Migrator"));

        let first = engine.migrate().await.unwrap();
        assert_eq!(first.migrations_executed, 2);
        assert_eq!(
            first.target_schema_version,
            Some(Version::parse("2").unwrap())
        );

        let second = engine.migrate().await.unwrap();
        assert_eq!(second.migrations_executed, 0);
        assert_eq!(backend.history_rows().len(), 2);
    }

    #[tokio::test]
    async fn test_corrupt_script_then_repair() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "V1__init.sql", "CREATE TABLE t (id INT);").await;
        write(dir.path(), "V2__add_col.sql", "ALTER TABLE t ADD c INT;").await;

        let backend = MemoryBackend::new();
        let engine = migrator(&backend, dir.path(), MigrationConfig::default());
        engine.migrate().await.unwrap();

        // Modify an already-applied script.
        write(dir.path(), "V1__init.sql", "CREATE TABLE t (id BIGINT);").await;

        let report = engine.validate().await.unwrap();
        assert_eq!(report.errors.len(), 1);
        assert_eq!(
            report.errors[0].version,
            Some(Version::parse("1").unwrap())
        );

        let repair = engine.repair().await.unwrap();
        assert_eq!(repair.aligned_checksums, vec!["V1__init.sql".to_string()]);

        assert!(engine.validate().await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_failed_migration_blocks_until_repaired() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "V1__init.sql", "CREATE TABLE t (id INT);").await;
        write(dir.path(), "V2__boom.sql", "ALTER TABLE t ADD broken;").await;
        write(dir.path(), "V3__later.sql", "SELECT 1;").await;

        let backend = MemoryBackend::new();
        backend.fail_on("broken");
        let engine = migrator(&backend, dir.path(), MigrationConfig::default());

        let err = engine.migrate().await.unwrap_err();
        assert!(matches!(err, MigrateError::Execution { .. }));

        let rows = backend.history_rows();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].success);
        assert!(!rows[1].success);

        // The failed row blocks the next run.
        let err = engine.migrate().await.unwrap_err();
        assert!(matches!(err, MigrateError::Validation(_)));

        backend.fail_on("nothing-matches-this");
        let repair = engine.repair().await.unwrap();
        assert_eq!(repair.removed_failed_ranks, vec![1]);

        let report = engine.migrate().await.unwrap();
        assert_eq!(report.migrations_executed, 2);
        assert_eq!(
            report.target_schema_version,
            Some(Version::parse("3").unwrap())
        );
    }

    #[tokio::test]
    async fn test_concurrent_migrations_serialize() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "V1__init.sql", "CREATE TABLE t (id INT);").await;
        write(dir.path(), "V2__add_col.sql", "ALTER TABLE t ADD c INT;").await;

        let backend = MemoryBackend::new();
        let a = migrator(&backend, dir.path(), MigrationConfig::default());
        let b = migrator(&backend, dir.path(), MigrationConfig::default());

        let (ra, rb) = tokio::join!(a.migrate(), b.migrate());
        let (ra, rb) = (ra.unwrap(), rb.unwrap());

        // Exactly one run applied both migrations; the other found an
        // up-to-date schema.
        assert_eq!(ra.migrations_executed + rb.migrations_executed, 2);
        assert_eq!(backend.history_rows().len(), 2);
    }

    #[tokio::test]
    async fn test_validate_does_not_create_the_table() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "V1__init.sql", "CREATE TABLE t (id INT);").await;

        let backend = MemoryBackend::new();
        let engine = migrator(&backend, dir.path(), MigrationConfig::default());

        let report = engine.validate().await.unwrap();
        assert!(report.is_ok());
        assert_eq!(report.validated_count, 1);

        let history = MemoryHistory::new(&backend);
        assert!(!history.table_exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_baseline_then_migrate_skips_old_versions() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "V1__init.sql", "CREATE TABLE t (id INT);").await;
        write(dir.path(), "V2__add_col.sql", "ALTER TABLE t ADD c INT;").await;
        write(dir.path(), "V3__index.sql", "CREATE INDEX i ON t (c);").await;

        let backend = MemoryBackend::new();
        let engine = migrator(&backend, dir.path(), MigrationConfig::default());

        let report = engine.baseline(Version::parse("2").unwrap()).await.unwrap();
        assert_eq!(report.version, Version::parse("2").unwrap());

        let outcome = engine.migrate().await.unwrap();
        assert_eq!(outcome.migrations_executed, 1);
        assert_eq!(outcome.executed, vec!["V3__index.sql".to_string()]);

        // Baselining over real history is refused.
        let err = engine
            .baseline(Version::parse("5").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_baseline_on_migrate() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "V1__init.sql", "CREATE TABLE t (id INT);").await;
        write(dir.path(), "V2__add_col.sql", "ALTER TABLE t ADD c INT;").await;

        let backend = MemoryBackend::new();
        let config = MigrationConfig::default()
            .baseline_on_migrate(true)
            .baseline_version(Version::parse("1").unwrap());
        let engine = migrator(&backend, dir.path(), config);

        let report = engine.migrate().await.unwrap();
        assert_eq!(report.migrations_executed, 1);
        assert_eq!(report.executed, vec!["V2__add_col.sql".to_string()]);

        let rows = backend.history_rows();
        assert_eq!(rows[0].kind, MigrationKind::Baseline);
    }

    #[tokio::test]
    async fn test_info_reports_mixed_states() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "V1__init.sql", "CREATE TABLE t (id INT);").await;

        let backend = MemoryBackend::new();
        let engine = migrator(&backend, dir.path(), MigrationConfig::default());
        engine.migrate().await.unwrap();

        write(dir.path(), "V2__add_col.sql", "ALTER TABLE t ADD c INT;").await;
        let report = engine.info().await.unwrap();
        assert_eq!(report.migrations.len(), 2);
        assert_eq!(
            report.current_version,
            Some(Version::parse("1").unwrap())
        );
    }

    #[tokio::test]
    async fn test_builder_requires_collaborators() {
        let err = Migrator::builder(MigrationConfig::default())
            .build()
            .unwrap_err();
        assert!(matches!(err, MigrateError::Configuration(_)));
    }
}
