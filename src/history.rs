//! Schema history: the persisted log of applied migrations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MigrateResult;
use crate::resolver::MigrationKind;
use crate::version::Version;

/// One row of persisted migration history.
///
/// Append-only: rows are written once by the executor inside the
/// migration's transaction and never change afterwards, except through
/// `repair` or `baseline`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedMigration {
    /// Monotonic sequence number assigned by the store at insert time.
    pub installed_rank: i32,
    /// Version, `None` for repeatable migrations.
    pub version: Option<Version>,
    /// Human-readable description.
    pub description: String,
    /// Migration kind.
    pub kind: MigrationKind,
    /// Script identity.
    pub script: String,
    /// Checksum at the time of application, `None` for synthetic rows.
    pub checksum: Option<i32>,
    /// Who ran the migration.
    pub installed_by: String,
    /// When the migration was recorded.
    pub installed_on: DateTime<Utc>,
    /// Execution time in milliseconds.
    pub execution_time_ms: i64,
    /// Whether the migration completed successfully.
    pub success: bool,
}

/// Input for appending a history row.
///
/// The store assigns `installed_rank` and `installed_on` itself.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    /// Version, `None` for repeatable migrations.
    pub version: Option<Version>,
    /// Human-readable description.
    pub description: String,
    /// Migration kind.
    pub kind: MigrationKind,
    /// Script identity.
    pub script: String,
    /// Checksum of the script content.
    pub checksum: Option<i32>,
    /// Who ran the migration.
    pub installed_by: String,
    /// Execution time in milliseconds.
    pub execution_time_ms: i64,
    /// Whether the migration completed successfully.
    pub success: bool,
}

/// Persistent store for the schema history table.
///
/// `record` must take effect within the caller's active transaction so
/// that a migration and its history row commit or roll back together.
#[async_trait]
pub trait SchemaHistory: Send + Sync {
    /// Whether the history table already exists.
    async fn table_exists(&self) -> MigrateResult<bool>;

    /// Create the history table if it is absent. Idempotent; callers
    /// invoke this under the migration lock.
    async fn ensure_table(&self) -> MigrateResult<()>;

    /// Load all rows ordered by `installed_rank` ascending.
    async fn load(&self) -> MigrateResult<Vec<AppliedMigration>>;

    /// Append one row and return its assigned `installed_rank`
    /// (`max(existing) + 1`, or 0 for the first row).
    async fn record(&self, entry: &HistoryEntry) -> MigrateResult<i32>;

    /// Overwrite the checksum of an existing row. Administrative, used
    /// by `repair`.
    async fn update_checksum(&self, installed_rank: i32, checksum: Option<i32>)
    -> MigrateResult<()>;

    /// Delete a row. Administrative, used by `repair` to drop failed
    /// rows.
    async fn delete(&self, installed_rank: i32) -> MigrateResult<()>;
}
