//! Reconciliation of resolved migrations against the schema history.
//!
//! Merges the resolver's catalog and the history store's rows into one
//! version-ordered view, derives a [`MigrationState`] per logical
//! migration and collects validation findings. Pure: no I/O, no
//! database writes.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::config::MigrationConfig;
use crate::history::AppliedMigration;
use crate::info::{MigrationInfo, MigrationState};
use crate::resolver::{MigrationKind, ResolvedMigration};
use crate::version::{TargetVersion, Version};

/// Classification of a validation finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationErrorKind {
    /// A resolved migration's checksum differs from its history row.
    ChecksumMismatch,
    /// A history row has no resolved counterpart.
    Missing,
    /// A history row's version exceeds the highest resolved version.
    Future,
    /// A history row is marked as failed and needs `repair`.
    Failed,
}

impl ValidationErrorKind {
    /// The migration state this finding corresponds to, for ignore
    /// pattern matching. Checksum mismatches have no state and can
    /// never be suppressed by pattern.
    fn state(self) -> Option<MigrationState> {
        match self {
            Self::ChecksumMismatch => None,
            Self::Missing => Some(MigrationState::Missing),
            Self::Future => Some(MigrationState::Future),
            Self::Failed => Some(MigrationState::Failed),
        }
    }
}

/// One validation finding.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationError {
    /// Finding classification.
    pub kind: ValidationErrorKind,
    /// Kind of the migration the finding is about.
    pub migration_kind: MigrationKind,
    /// Version of the migration, if it has one.
    pub version: Option<Version>,
    /// Description of the migration.
    pub description: String,
    /// Human-readable explanation.
    pub message: String,
}

impl ValidationError {
    /// Create a finding.
    pub fn new(
        kind: ValidationErrorKind,
        version: Option<Version>,
        description: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            migration_kind: if version.is_some() {
                MigrationKind::Versioned
            } else {
                MigrationKind::Repeatable
            },
            version,
            description: description.into(),
            message: message.into(),
        }
    }

    fn for_migration(
        kind: ValidationErrorKind,
        migration_kind: MigrationKind,
        version: Option<&Version>,
        description: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            migration_kind,
            version: version.cloned(),
            description: description.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "version {version}: {}", self.message),
            None => write!(f, "'{}': {}", self.description, self.message),
        }
    }
}

/// Result of reconciliation: the full merged view plus findings.
#[derive(Debug)]
pub struct ReconcileOutcome {
    /// All logical migrations, version-ordered (repeatables last).
    pub infos: Vec<MigrationInfo>,
    /// Validation findings not suppressed by ignore patterns.
    pub errors: Vec<ValidationError>,
}

impl ReconcileOutcome {
    /// Whether any validation finding survived.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// The migrations to execute, in application order: pending
    /// versioned migrations by ascending version, then repeatable
    /// migrations by description.
    pub fn execution_plan(&self) -> Vec<MigrationInfo> {
        self.infos
            .iter()
            .filter(|info| info.state.is_pending())
            .cloned()
            .collect()
    }

    /// The highest successfully applied (or baselined) version.
    pub fn current_version(&self) -> Option<Version> {
        self.infos
            .iter()
            .filter(|info| {
                matches!(
                    info.state,
                    MigrationState::Success | MigrationState::Baseline | MigrationState::OutOfOrder
                ) && info.applied.is_some()
            })
            .filter_map(|info| info.version().cloned())
            .max()
    }
}

/// Effective upper bound on versions considered for execution.
enum TargetBound {
    Unbounded,
    UpTo(Version),
    Nothing,
}

impl TargetBound {
    fn excludes(&self, version: &Version) -> bool {
        match self {
            Self::Unbounded => false,
            Self::UpTo(bound) => version > bound,
            Self::Nothing => true,
        }
    }
}

/// Merges resolved and applied migrations into an execution plan.
pub struct Reconciler;

impl Reconciler {
    /// Reconcile the resolver's catalog against the history rows.
    pub fn reconcile(
        resolved: &[ResolvedMigration],
        applied: &[AppliedMigration],
        config: &MigrationConfig,
    ) -> ReconcileOutcome {
        let mut infos = Vec::new();
        let mut errors = Vec::new();

        // Undo migrations pair with versioned ones and only run through
        // explicit undo tooling; they never enter the forward plan.
        let resolved_versioned: BTreeMap<&Version, &ResolvedMigration> = resolved
            .iter()
            .filter(|r| r.kind == MigrationKind::Versioned)
            .filter_map(|r| r.version.as_ref().map(|v| (v, r)))
            .collect();
        let resolved_baseline: BTreeMap<&Version, &ResolvedMigration> = resolved
            .iter()
            .filter(|r| r.kind == MigrationKind::Baseline)
            .filter_map(|r| r.version.as_ref().map(|v| (v, r)))
            .collect();
        let resolved_repeatable: BTreeMap<&str, &ResolvedMigration> = resolved
            .iter()
            .filter(|r| r.kind == MigrationKind::Repeatable)
            .map(|r| (r.description.as_str(), r))
            .collect();

        let max_resolved_version = resolved_versioned.keys().next_back().map(|v| (*v).clone());

        let applied_versions: BTreeMap<&Version, &AppliedMigration> = applied
            .iter()
            .filter(|a| a.kind == MigrationKind::Versioned)
            .filter_map(|a| a.version.as_ref().map(|v| (v, a)))
            .collect();
        let max_applied_version = applied_versions.keys().next_back().map(|v| (*v).clone());

        // Highest baseline marker, whether synthetic or from a baseline
        // script; resolved versioned migrations at or below it are
        // ignored.
        let baseline_version = applied
            .iter()
            .filter(|a| a.kind == MigrationKind::Baseline && a.success)
            .filter_map(|a| a.version.clone())
            .max();

        // Latest history row per repeatable description.
        let latest_repeatable: BTreeMap<&str, i32> = applied
            .iter()
            .filter(|a| a.kind == MigrationKind::Repeatable)
            .map(|a| (a.description.as_str(), a.installed_rank))
            .collect();

        let target = Self::target_bound(config, &applied_versions, &resolved_versioned);

        // Applied side.
        for row in applied {
            let info = match row.kind {
                MigrationKind::Baseline => {
                    Self::applied_baseline(row, &resolved_baseline, &mut errors)
                }
                MigrationKind::Repeatable => Self::applied_repeatable(
                    row,
                    &resolved_repeatable,
                    &latest_repeatable,
                    config,
                    &mut errors,
                ),
                _ => Self::applied_versioned(
                    row,
                    &resolved_versioned,
                    max_resolved_version.as_ref(),
                    config,
                    &mut errors,
                ),
            };
            infos.push(info);
        }

        // Baseline scripts are only candidates while no versioned
        // migration has been applied yet; the highest one within target
        // becomes the plan's starting point.
        let selected_baseline_script = if applied_versions.is_empty() {
            resolved_baseline
                .iter()
                .rev()
                .find(|(version, _)| !target.excludes(version))
                .map(|(version, _)| (*version).clone())
        } else {
            None
        };

        let effective_baseline = match (&baseline_version, &selected_baseline_script) {
            (Some(a), Some(b)) => Some(a.clone().max(b.clone())),
            (Some(a), None) => Some(a.clone()),
            (None, Some(b)) => Some(b.clone()),
            (None, None) => None,
        };

        // Resolved side: versioned and baseline scripts without a row.
        for migration in resolved {
            if migration.kind == MigrationKind::Undo || migration.kind == MigrationKind::Repeatable
            {
                continue;
            }
            let Some(version) = migration.version.as_ref() else {
                continue;
            };

            let already_applied = match migration.kind {
                MigrationKind::Baseline => applied.iter().any(|a| {
                    a.kind == MigrationKind::Baseline && a.version.as_ref() == Some(version)
                }),
                _ => applied_versions.contains_key(version),
            };
            if already_applied {
                continue;
            }

            let state = if migration.kind == MigrationKind::Baseline {
                match &selected_baseline_script {
                    Some(selected) if selected == version => MigrationState::Pending,
                    _ => MigrationState::Ignored,
                }
            } else if target.excludes(version) {
                // Above target: excluded from the run entirely.
                continue;
            } else if effective_baseline
                .as_ref()
                .is_some_and(|baseline| version <= baseline)
            {
                MigrationState::Ignored
            } else if max_applied_version
                .as_ref()
                .is_some_and(|max| version < max)
            {
                if config.out_of_order {
                    MigrationState::OutOfOrder
                } else {
                    MigrationState::Ignored
                }
            } else {
                MigrationState::Pending
            };

            let state = Self::apply_cherry_pick(state, migration, config);

            infos.push(MigrationInfo {
                resolved: Some(migration.clone()),
                applied: None,
                state,
            });
        }

        // Resolved repeatables without any history row.
        for migration in resolved_repeatable.values() {
            if latest_repeatable.contains_key(migration.description.as_str()) {
                continue;
            }
            let state = Self::apply_cherry_pick(MigrationState::Pending, migration, config);
            infos.push(MigrationInfo {
                resolved: Some((*migration).clone()),
                applied: None,
                state,
            });
        }

        Self::attach_resolved_sides(
            &mut infos,
            &resolved_versioned,
            &resolved_baseline,
            &resolved_repeatable,
        );

        errors.retain(|error| {
            let Some(state) = error.kind.state() else {
                return true;
            };
            !config
                .ignore_patterns
                .iter()
                .any(|pattern| pattern.matches(error.migration_kind, state))
        });

        infos.sort_by(|a, b| Self::plan_order(a, b));

        ReconcileOutcome { infos, errors }
    }

    fn target_bound(
        config: &MigrationConfig,
        applied_versions: &BTreeMap<&Version, &AppliedMigration>,
        resolved_versioned: &BTreeMap<&Version, &ResolvedMigration>,
    ) -> TargetBound {
        match &config.target {
            TargetVersion::Latest => TargetBound::Unbounded,
            TargetVersion::Specific(version) => TargetBound::UpTo(version.clone()),
            TargetVersion::Current => match applied_versions.keys().next_back() {
                Some(version) => TargetBound::UpTo((*version).clone()),
                None => TargetBound::Nothing,
            },
            TargetVersion::Next => {
                let next = resolved_versioned
                    .keys()
                    .find(|version| !applied_versions.contains_key(*version));
                match next {
                    Some(version) => TargetBound::UpTo((*version).clone()),
                    None => TargetBound::Nothing,
                }
            }
        }
    }

    fn applied_versioned(
        row: &AppliedMigration,
        resolved_versioned: &BTreeMap<&Version, &ResolvedMigration>,
        max_resolved_version: Option<&Version>,
        config: &MigrationConfig,
        errors: &mut Vec<ValidationError>,
    ) -> MigrationInfo {
        let version = row.version.as_ref();
        let matched = version.and_then(|v| resolved_versioned.get(v).copied());

        let state = if !row.success {
            errors.push(ValidationError::for_migration(
                ValidationErrorKind::Failed,
                row.kind,
                version,
                &row.description,
                format!(
                    "migration '{}' previously failed; run repair before retrying",
                    row.script
                ),
            ));
            MigrationState::Failed
        } else if let Some(resolved) = matched {
            if row.checksum != Some(resolved.checksum) {
                errors.push(ValidationError::for_migration(
                    ValidationErrorKind::ChecksumMismatch,
                    row.kind,
                    version,
                    &row.description,
                    format!(
                        "checksum mismatch for '{}': applied {:?}, resolved {}",
                        resolved.script, row.checksum, resolved.checksum
                    ),
                ));
            }
            MigrationState::Success
        } else if version.is_some_and(|v| max_resolved_version.is_some_and(|max| v > max)) {
            if !config.ignore_future_migrations {
                errors.push(ValidationError::for_migration(
                    ValidationErrorKind::Future,
                    row.kind,
                    version,
                    &row.description,
                    format!(
                        "applied migration '{}' is above the highest resolved version",
                        row.script
                    ),
                ));
            }
            MigrationState::Future
        } else {
            if !config.ignore_missing_migrations {
                errors.push(ValidationError::for_migration(
                    ValidationErrorKind::Missing,
                    row.kind,
                    version,
                    &row.description,
                    format!("applied migration '{}' is no longer resolved", row.script),
                ));
            }
            MigrationState::Missing
        };

        MigrationInfo {
            resolved: matched.cloned(),
            applied: Some(row.clone()),
            state,
        }
    }

    fn applied_baseline(
        row: &AppliedMigration,
        resolved_baseline: &BTreeMap<&Version, &ResolvedMigration>,
        errors: &mut Vec<ValidationError>,
    ) -> MigrationInfo {
        let matched = row
            .version
            .as_ref()
            .and_then(|v| resolved_baseline.get(v).copied());

        let state = if row.success {
            MigrationState::Baseline
        } else {
            errors.push(ValidationError::for_migration(
                ValidationErrorKind::Failed,
                row.kind,
                row.version.as_ref(),
                &row.description,
                format!(
                    "baseline '{}' previously failed; run repair before retrying",
                    row.script
                ),
            ));
            MigrationState::Failed
        };

        MigrationInfo {
            resolved: matched.cloned(),
            applied: Some(row.clone()),
            state,
        }
    }

    fn applied_repeatable(
        row: &AppliedMigration,
        resolved_repeatable: &BTreeMap<&str, &ResolvedMigration>,
        latest_repeatable: &BTreeMap<&str, i32>,
        config: &MigrationConfig,
        errors: &mut Vec<ValidationError>,
    ) -> MigrationInfo {
        let matched = resolved_repeatable.get(row.description.as_str()).copied();
        let is_latest = latest_repeatable
            .get(row.description.as_str())
            .is_some_and(|rank| *rank == row.installed_rank);

        let state = if !is_latest {
            MigrationState::Superseded
        } else if !row.success {
            errors.push(ValidationError::for_migration(
                ValidationErrorKind::Failed,
                row.kind,
                None,
                &row.description,
                format!(
                    "repeatable migration '{}' previously failed; run repair before retrying",
                    row.script
                ),
            ));
            MigrationState::Failed
        } else if let Some(resolved) = matched {
            if row.checksum != Some(resolved.checksum) {
                // The one legitimate reapply path: content changed, so
                // the migration is queued again, subject to cherry-pick.
                Self::apply_cherry_pick(MigrationState::Outdated, resolved, config)
            } else {
                MigrationState::Success
            }
        } else {
            if !config.ignore_missing_migrations {
                errors.push(ValidationError::for_migration(
                    ValidationErrorKind::Missing,
                    row.kind,
                    None,
                    &row.description,
                    format!(
                        "applied repeatable migration '{}' is no longer resolved",
                        row.script
                    ),
                ));
            }
            MigrationState::Missing
        };

        MigrationInfo {
            resolved: matched.cloned(),
            applied: Some(row.clone()),
            state,
        }
    }

    fn apply_cherry_pick(
        state: MigrationState,
        migration: &ResolvedMigration,
        config: &MigrationConfig,
    ) -> MigrationState {
        if !state.is_pending() || config.cherry_pick.is_empty() {
            return state;
        }
        if config
            .cherry_pick
            .iter()
            .any(|selector| selector.matches(migration))
        {
            state
        } else {
            MigrationState::Ignored
        }
    }

    /// Give applied-only infos their resolved side where one exists, so
    /// reports show both halves.
    fn attach_resolved_sides(
        infos: &mut [MigrationInfo],
        resolved_versioned: &BTreeMap<&Version, &ResolvedMigration>,
        resolved_baseline: &BTreeMap<&Version, &ResolvedMigration>,
        resolved_repeatable: &BTreeMap<&str, &ResolvedMigration>,
    ) {
        for info in infos {
            if info.resolved.is_some() {
                continue;
            }
            let Some(applied) = info.applied.as_ref() else {
                continue;
            };
            let matched = match applied.kind {
                MigrationKind::Repeatable => {
                    resolved_repeatable.get(applied.description.as_str()).copied()
                }
                MigrationKind::Baseline => applied
                    .version
                    .as_ref()
                    .and_then(|v| resolved_baseline.get(v).copied()),
                _ => applied
                    .version
                    .as_ref()
                    .and_then(|v| resolved_versioned.get(v).copied()),
            };
            info.resolved = matched.cloned();
        }
    }

    fn plan_order(a: &MigrationInfo, b: &MigrationInfo) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        match (a.version(), b.version()) {
            (Some(av), Some(bv)) => av.cmp(bv).then_with(|| Self::rank(a).cmp(&Self::rank(b))),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => a
                .description()
                .cmp(b.description())
                .then_with(|| Self::rank(a).cmp(&Self::rank(b))),
        }
    }

    fn rank(info: &MigrationInfo) -> i32 {
        info.applied.as_ref().map_or(i32::MAX, |a| a.installed_rank)
    }
}
