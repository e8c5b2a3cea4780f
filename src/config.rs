//! Immutable configuration snapshot for a migration run.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{MigrateError, MigrateResult};
use crate::pattern::{CherryPick, MigrationPattern};
use crate::version::{TargetVersion, Version};

/// Configuration consumed by the resolver, reconciler and executor.
///
/// Built once, validated eagerly, then passed by reference; nothing
/// mutates it after a run begins.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Name of the schema history table.
    pub table: String,
    /// Directories scanned for migration scripts.
    pub locations: Vec<PathBuf>,
    /// Filename prefix for versioned migrations.
    pub sql_migration_prefix: String,
    /// Filename prefix for repeatable migrations.
    pub repeatable_migration_prefix: String,
    /// Filename prefix for baseline migrations.
    pub baseline_migration_prefix: String,
    /// Filename prefix for undo migrations.
    pub undo_migration_prefix: String,
    /// Separator between version and description in filenames.
    pub migration_separator: String,
    /// Recognized script suffixes.
    pub migration_suffixes: Vec<String>,
    /// Version up to which migrations are applied.
    pub target: TargetVersion,
    /// Allow applying resolved migrations below the highest applied
    /// version.
    pub out_of_order: bool,
    /// Run the whole plan in one transaction (dialect permitting).
    pub group: bool,
    /// Allow scripts that opt out of their wrapping transaction.
    pub mixed: bool,
    /// Write history rows without executing any SQL.
    pub skip_executing_migrations: bool,
    /// Run validation before migrating.
    pub validate_on_migrate: bool,
    /// Treat unparseable filenames in a location as errors.
    pub validate_migration_naming: bool,
    /// Treat missing locations as errors instead of skipping them.
    pub fail_on_missing_locations: bool,
    /// Tolerate applied migrations with no resolved counterpart.
    pub ignore_missing_migrations: bool,
    /// Tolerate applied migrations above the highest resolved version.
    pub ignore_future_migrations: bool,
    /// Validation findings matching these patterns are suppressed.
    pub ignore_patterns: Vec<MigrationPattern>,
    /// When non-empty, only matching migrations are considered pending.
    pub cherry_pick: Vec<CherryPick>,
    /// Baseline an empty history automatically during `migrate`.
    pub baseline_on_migrate: bool,
    /// Version recorded by `baseline`.
    pub baseline_version: Version,
    /// Description recorded by `baseline`.
    pub baseline_description: String,
    /// Recorded as `installed_by`; defaults to the crate name.
    pub installed_by: Option<String>,
    /// `${key}` placeholders substituted into script content.
    pub placeholders: BTreeMap<String, String>,
    /// Whether placeholder substitution is performed at all.
    pub placeholder_replacement: bool,
    /// Lock acquisition retries; `-1` retries indefinitely.
    pub lock_retry_count: i32,
    /// Connection attempts beyond the first.
    pub connect_retries: u32,
    /// Base interval between connection attempts.
    pub connect_retries_interval: Duration,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            table: "waymark_schema_history".to_string(),
            locations: vec![PathBuf::from("migrations")],
            sql_migration_prefix: "V".to_string(),
            repeatable_migration_prefix: "R".to_string(),
            baseline_migration_prefix: "B".to_string(),
            undo_migration_prefix: "U".to_string(),
            migration_separator: "__".to_string(),
            migration_suffixes: vec![".sql".to_string()],
            target: TargetVersion::Latest,
            out_of_order: false,
            group: false,
            mixed: false,
            skip_executing_migrations: false,
            validate_on_migrate: true,
            validate_migration_naming: false,
            fail_on_missing_locations: false,
            ignore_missing_migrations: false,
            ignore_future_migrations: true,
            ignore_patterns: Vec::new(),
            cherry_pick: Vec::new(),
            baseline_on_migrate: false,
            baseline_version: Version::parse("1").expect("static version"),
            baseline_description: "<< baseline >>".to_string(),
            installed_by: None,
            placeholders: BTreeMap::new(),
            placeholder_replacement: true,
            lock_retry_count: 50,
            connect_retries: 0,
            connect_retries_interval: Duration::from_secs(120),
        }
    }
}

impl MigrationConfig {
    /// Create a configuration with the default behavior set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the history table name.
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Set the migration locations.
    pub fn locations<I, P>(mut self, locations: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.locations = locations.into_iter().map(Into::into).collect();
        self
    }

    /// Set the target version.
    pub fn target(mut self, target: TargetVersion) -> Self {
        self.target = target;
        self
    }

    /// Allow out-of-order application.
    pub fn out_of_order(mut self, enabled: bool) -> Self {
        self.out_of_order = enabled;
        self
    }

    /// Run the whole plan in a single transaction.
    pub fn group(mut self, enabled: bool) -> Self {
        self.group = enabled;
        self
    }

    /// Allow scripts with the no-transaction directive.
    pub fn mixed(mut self, enabled: bool) -> Self {
        self.mixed = enabled;
        self
    }

    /// Write history rows without executing migration SQL.
    pub fn skip_executing_migrations(mut self, enabled: bool) -> Self {
        self.skip_executing_migrations = enabled;
        self
    }

    /// Toggle validation before migration.
    pub fn validate_on_migrate(mut self, enabled: bool) -> Self {
        self.validate_on_migrate = enabled;
        self
    }

    /// Treat unparseable filenames as errors.
    pub fn validate_migration_naming(mut self, enabled: bool) -> Self {
        self.validate_migration_naming = enabled;
        self
    }

    /// Treat missing locations as errors.
    pub fn fail_on_missing_locations(mut self, enabled: bool) -> Self {
        self.fail_on_missing_locations = enabled;
        self
    }

    /// Tolerate applied migrations that no location resolves anymore.
    pub fn ignore_missing_migrations(mut self, enabled: bool) -> Self {
        self.ignore_missing_migrations = enabled;
        self
    }

    /// Tolerate applied migrations above the highest resolved version.
    pub fn ignore_future_migrations(mut self, enabled: bool) -> Self {
        self.ignore_future_migrations = enabled;
        self
    }

    /// Add an ignore pattern.
    pub fn ignore_pattern(mut self, pattern: MigrationPattern) -> Self {
        self.ignore_patterns.push(pattern);
        self
    }

    /// Add a cherry-pick selector.
    pub fn cherry_pick(mut self, selector: CherryPick) -> Self {
        self.cherry_pick.push(selector);
        self
    }

    /// Baseline an empty history automatically during `migrate`.
    pub fn baseline_on_migrate(mut self, enabled: bool) -> Self {
        self.baseline_on_migrate = enabled;
        self
    }

    /// Set the baseline version.
    pub fn baseline_version(mut self, version: Version) -> Self {
        self.baseline_version = version;
        self
    }

    /// Set who is recorded as having run migrations.
    pub fn installed_by(mut self, user: impl Into<String>) -> Self {
        self.installed_by = Some(user.into());
        self
    }

    /// Add a `${key}` placeholder.
    pub fn placeholder(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.placeholders.insert(key.into(), value.into());
        self
    }

    /// Set the lock retry count (`-1` = retry indefinitely).
    pub fn lock_retry_count(mut self, count: i32) -> Self {
        self.lock_retry_count = count;
        self
    }

    /// Set connection retry behavior.
    pub fn connect_retries(mut self, retries: u32, interval: Duration) -> Self {
        self.connect_retries = retries;
        self.connect_retries_interval = interval;
        self
    }

    /// Check the configuration for invalid values.
    ///
    /// Runs eagerly when an engine is built, before any database
    /// interaction.
    pub fn validate(&self) -> MigrateResult<()> {
        if self.table.trim().is_empty() {
            return Err(MigrateError::configuration(
                "history table name must not be empty",
            ));
        }
        if self.locations.is_empty() {
            return Err(MigrateError::configuration(
                "at least one migration location is required",
            ));
        }
        if self.migration_separator.is_empty() {
            return Err(MigrateError::configuration(
                "migration separator must not be empty",
            ));
        }
        if self.migration_suffixes.is_empty()
            || self.migration_suffixes.iter().any(|s| s.is_empty())
        {
            return Err(MigrateError::configuration(
                "migration suffixes must be non-empty",
            ));
        }

        let prefixes = [
            &self.sql_migration_prefix,
            &self.repeatable_migration_prefix,
            &self.baseline_migration_prefix,
            &self.undo_migration_prefix,
        ];
        if prefixes.iter().any(|p| p.is_empty()) {
            return Err(MigrateError::configuration(
                "migration prefixes must not be empty",
            ));
        }
        for (i, a) in prefixes.iter().enumerate() {
            for b in prefixes.iter().skip(i + 1) {
                if a == b {
                    return Err(MigrateError::configuration(format!(
                        "migration prefixes must be distinct: '{a}' is used twice"
                    )));
                }
            }
        }

        if self.lock_retry_count < -1 {
            return Err(MigrateError::configuration(
                "lock retry count must be -1 (indefinite) or non-negative",
            ));
        }
        if self.connect_retries > 0 && self.connect_retries_interval.is_zero() {
            return Err(MigrateError::configuration(
                "connect retry interval must be positive when retries are enabled",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = MigrationConfig::default();
        config.validate().unwrap();
        assert_eq!(config.table, "waymark_schema_history");
        assert!(config.validate_on_migrate);
        assert!(!config.ignore_missing_migrations);
        assert!(config.ignore_future_migrations);
        assert_eq!(config.lock_retry_count, 50);
    }

    #[test]
    fn test_builder_chain() {
        let config = MigrationConfig::new()
            .table("app_history")
            .locations(["db/migrations"])
            .out_of_order(true)
            .group(true)
            .installed_by("deployer")
            .placeholder("schema", "app")
            .lock_retry_count(-1);

        config.validate().unwrap();
        assert_eq!(config.table, "app_history");
        assert_eq!(config.locations, vec![PathBuf::from("db/migrations")]);
        assert!(config.out_of_order);
        assert_eq!(config.installed_by.as_deref(), Some("deployer"));
        assert_eq!(config.placeholders.get("schema").unwrap(), "app");
    }

    #[test]
    fn test_validate_rejects_empty_separator() {
        let mut config = MigrationConfig::new();
        config.migration_separator = String::new();
        assert!(matches!(
            config.validate(),
            Err(MigrateError::Configuration(_))
        ));
    }

    #[test]
    fn test_validate_rejects_duplicate_prefixes() {
        let mut config = MigrationConfig::new();
        config.undo_migration_prefix = "V".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_retry_values() {
        let mut config = MigrationConfig::new();
        config.lock_retry_count = -2;
        assert!(config.validate().is_err());

        let config = MigrationConfig::new().connect_retries(3, Duration::ZERO);
        assert!(config.validate().is_err());
    }
}
