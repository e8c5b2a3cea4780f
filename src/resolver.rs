//! Migration discovery and filename resolution.
//!
//! The resolver scans the configured locations, parses filenames against
//! the prefix/separator/suffix rules and produces a deterministic catalog
//! of [`ResolvedMigration`]s with content checksums. It never touches the
//! database.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::MigrationConfig;
use crate::error::{MigrateError, MigrateResult};
use crate::version::Version;

/// Script directive that opts a migration out of its wrapping transaction.
const NO_TRANSACTION_DIRECTIVE: &str = "-- waymark:no-transaction";

/// The kind of a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationKind {
    /// Applied at most once, in ascending version order.
    Versioned,
    /// Keyed by description, reapplied whenever its checksum changes.
    Repeatable,
    /// Marks the schema as already matching a version.
    Baseline,
    /// Reverses a versioned migration of the same version.
    Undo,
}

impl MigrationKind {
    /// Whether migrations of this kind carry a version.
    pub fn has_version(self) -> bool {
        !matches!(self, Self::Repeatable)
    }
}

impl fmt::Display for MigrationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Versioned => "versioned",
            Self::Repeatable => "repeatable",
            Self::Baseline => "baseline",
            Self::Undo => "undo",
        };
        f.write_str(name)
    }
}

/// A discovered, not-yet-applied migration.
///
/// Identity is `(kind, version)` for versioned kinds and
/// `(kind, description)` for repeatable migrations. Recreated fresh on
/// every resolution pass.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedMigration {
    /// Migration kind.
    pub kind: MigrationKind,
    /// Version, `None` for repeatable migrations.
    pub version: Option<Version>,
    /// Human-readable description extracted from the filename.
    pub description: String,
    /// Script identity (the filename).
    pub script: String,
    /// Checksum over the (placeholder-substituted) script content.
    pub checksum: i32,
    /// The SQL to execute.
    #[serde(skip)]
    pub sql: String,
    /// Whether the script asked to run outside a transaction.
    #[serde(skip)]
    pub no_transaction: bool,
}

/// Compute the checksum of migration content.
///
/// The first four bytes of the SHA-256 digest, big-endian.
pub fn checksum_of(content: &str) -> i32 {
    let digest = Sha256::digest(content.as_bytes());
    i32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Substitute `${key}` placeholders in script content.
pub fn apply_placeholders(sql: &str, placeholders: &std::collections::BTreeMap<String, String>) -> String {
    let mut out = sql.to_string();
    for (key, value) in placeholders {
        out = out.replace(&format!("${{{key}}}"), value);
    }
    out
}

struct ParsedName {
    kind: MigrationKind,
    version: Option<Version>,
    description: String,
}

/// Scans migration locations and produces the resolved catalog.
pub struct Resolver {
    config: MigrationConfig,
}

impl Resolver {
    /// Create a resolver over a configuration snapshot.
    pub fn new(config: &MigrationConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Resolve all configured locations.
    ///
    /// Deterministic for a fixed filesystem state: versioned migrations
    /// sort by version, repeatable migrations by description.
    pub async fn resolve(&self) -> MigrateResult<Vec<ResolvedMigration>> {
        let mut migrations = Vec::new();

        for location in &self.config.locations {
            if !location.exists() {
                if self.config.fail_on_missing_locations {
                    return Err(MigrateError::resolution(format!(
                        "migration location does not exist: {}",
                        location.display()
                    )));
                }
                warn!(location = %location.display(), "skipping missing migration location");
                continue;
            }
            self.scan_location(location, &mut migrations).await?;
        }

        self.check_duplicates(&migrations)?;

        migrations.sort_by(|a, b| match (&a.version, &b.version) {
            (Some(av), Some(bv)) => av.cmp(bv),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.description.cmp(&b.description),
        });

        info!(count = migrations.len(), "resolved migrations");
        Ok(migrations)
    }

    async fn scan_location(
        &self,
        location: &Path,
        out: &mut Vec<ResolvedMigration>,
    ) -> MigrateResult<()> {
        let mut entries = tokio::fs::read_dir(location).await?;
        let mut files = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.is_file() {
                files.push(path);
            }
        }
        files.sort();

        for path in files {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            if !self.has_known_suffix(name) {
                debug!(file = name, "ignoring non-migration file");
                continue;
            }

            let parsed = match self.parse_file_name(name) {
                Ok(parsed) => parsed,
                Err(err) => {
                    if self.config.validate_migration_naming {
                        return Err(err);
                    }
                    warn!(file = name, %err, "skipping file with unrecognized name");
                    continue;
                }
            };

            let raw_sql = tokio::fs::read_to_string(&path).await?;
            let sql = if self.config.placeholder_replacement {
                apply_placeholders(&raw_sql, &self.config.placeholders)
            } else {
                raw_sql
            };
            let no_transaction = sql
                .lines()
                .take(10)
                .any(|line| line.trim() == NO_TRANSACTION_DIRECTIVE);

            out.push(ResolvedMigration {
                kind: parsed.kind,
                version: parsed.version,
                description: parsed.description,
                script: name.to_string(),
                checksum: checksum_of(&sql),
                sql,
                no_transaction,
            });
        }

        Ok(())
    }

    fn has_known_suffix(&self, name: &str) -> bool {
        self.config
            .migration_suffixes
            .iter()
            .any(|suffix| name.ends_with(suffix.as_str()))
    }

    fn parse_file_name(&self, name: &str) -> MigrateResult<ParsedName> {
        let stem = self
            .config
            .migration_suffixes
            .iter()
            .find_map(|suffix| name.strip_suffix(suffix.as_str()))
            .ok_or_else(|| {
                MigrateError::resolution(format!("'{name}' has no recognized suffix"))
            })?;

        let prefixes = [
            (self.config.sql_migration_prefix.as_str(), MigrationKind::Versioned),
            (self.config.repeatable_migration_prefix.as_str(), MigrationKind::Repeatable),
            (self.config.baseline_migration_prefix.as_str(), MigrationKind::Baseline),
            (self.config.undo_migration_prefix.as_str(), MigrationKind::Undo),
        ];

        let (rest, kind) = prefixes
            .iter()
            .find_map(|(prefix, kind)| stem.strip_prefix(prefix).map(|rest| (rest, *kind)))
            .ok_or_else(|| {
                MigrateError::resolution(format!(
                    "'{name}' does not start with a known migration prefix"
                ))
            })?;

        let separator = self.config.migration_separator.as_str();
        let (version_part, description_part) = match rest.split_once(separator) {
            Some((version, description)) => (version, description),
            None => (rest, ""),
        };

        if kind.has_version() {
            if version_part.is_empty() {
                return Err(MigrateError::resolution(format!(
                    "'{name}' is missing a version"
                )));
            }
            let version = Version::parse(version_part)
                .map_err(|e| MigrateError::resolution(format!("'{name}': {e}")))?;
            Ok(ParsedName {
                kind,
                version: Some(version),
                description: humanize(description_part),
            })
        } else {
            if !version_part.is_empty() {
                return Err(MigrateError::resolution(format!(
                    "'{name}' is repeatable and must not carry a version"
                )));
            }
            if description_part.is_empty() {
                return Err(MigrateError::resolution(format!(
                    "'{name}' is missing a description"
                )));
            }
            Ok(ParsedName {
                kind,
                version: None,
                description: humanize(description_part),
            })
        }
    }

    fn check_duplicates(&self, migrations: &[ResolvedMigration]) -> MigrateResult<()> {
        let mut seen: HashMap<(MigrationKind, Option<Version>, Option<String>), &str> =
            HashMap::new();

        for migration in migrations {
            // Identity uses the normalized version, so V1 and V1.0 collide.
            let key = match &migration.version {
                Some(version) => (migration.kind, Some(version.clone()), None),
                None => (migration.kind, None, Some(migration.description.clone())),
            };
            if let Some(existing) = seen.insert(key, &migration.script) {
                return Err(MigrateError::resolution(format!(
                    "duplicate {} migration: '{}' and '{}'",
                    migration.kind, existing, migration.script
                )));
            }
        }

        Ok(())
    }
}

fn humanize(raw: &str) -> String {
    raw.replace('_', " ")
}
