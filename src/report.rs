//! Structured operation results.
//!
//! These are the objects handed to output layers (console, JSON); they
//! all serialize.

use serde::Serialize;

use crate::info::MigrationInfo;
use crate::reconcile::ValidationError;
use crate::version::Version;

/// Result of a `migrate` run.
#[derive(Debug, Serialize)]
pub struct MigrateReport {
    /// Number of migrations executed in this run.
    pub migrations_executed: usize,
    /// Scripts executed, in application order.
    pub executed: Vec<String>,
    /// Schema version after the run.
    pub target_schema_version: Option<Version>,
    /// Non-fatal observations.
    pub warnings: Vec<String>,
}

impl MigrateReport {
    /// One-line human summary.
    pub fn summary(&self) -> String {
        match (&self.migrations_executed, &self.target_schema_version) {
            (0, Some(version)) => format!("schema up to date at version {version}"),
            (0, None) => "no migrations to apply".to_string(),
            (n, Some(version)) => format!("applied {n} migration(s), now at version {version}"),
            (n, None) => format!("applied {n} migration(s)"),
        }
    }
}

/// Result of `validate`.
#[derive(Debug, Serialize)]
pub struct ValidateReport {
    /// Number of migrations checked.
    pub validated_count: usize,
    /// Findings; empty means the schema history and locations agree.
    pub errors: Vec<ValidationError>,
}

impl ValidateReport {
    /// Whether validation passed.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Result of `info`: the full reconciled view.
#[derive(Debug, Serialize)]
pub struct InfoReport {
    /// All migrations, version-ordered.
    pub migrations: Vec<MigrationInfo>,
    /// Highest successfully applied version.
    pub current_version: Option<Version>,
}

/// Result of `repair`.
#[derive(Debug, Serialize)]
pub struct RepairReport {
    /// `installed_rank`s of deleted failed rows.
    pub removed_failed_ranks: Vec<i32>,
    /// Scripts whose history checksum was realigned.
    pub aligned_checksums: Vec<String>,
}

impl RepairReport {
    /// Whether repair changed anything.
    pub fn changed(&self) -> bool {
        !self.removed_failed_ranks.is_empty() || !self.aligned_checksums.is_empty()
    }
}

/// Result of `baseline`.
#[derive(Debug, Serialize)]
pub struct BaselineReport {
    /// The recorded baseline version.
    pub version: Version,
    /// The recorded description.
    pub description: String,
}
