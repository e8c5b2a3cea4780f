//! Migration patterns: ignore filters and cherry-pick selectors.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::{MigrateError, MigrateResult};
use crate::info::{MigrationInfo, MigrationState};
use crate::resolver::{MigrationKind, ResolvedMigration};
use crate::version::Version;

/// An ignore pattern in `<type>:<state>` syntax, e.g. `repeatable:missing`
/// or `*:future`. Matching validation findings are suppressed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationPattern {
    kind: KindSelector,
    state: StateSelector,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum KindSelector {
    Any,
    Versioned,
    Repeatable,
    Baseline,
    Undo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum StateSelector {
    Any,
    State(MigrationState),
}

impl MigrationPattern {
    /// Parse a `<type>:<state>` pattern.
    pub fn parse(text: &str) -> MigrateResult<Self> {
        let (kind_part, state_part) = text.split_once(':').ok_or_else(|| {
            MigrateError::configuration(format!(
                "invalid ignore pattern '{text}': expected <type>:<state>"
            ))
        })?;

        let kind = match kind_part.trim().to_ascii_lowercase().as_str() {
            "*" => KindSelector::Any,
            "versioned" => KindSelector::Versioned,
            "repeatable" => KindSelector::Repeatable,
            "baseline" => KindSelector::Baseline,
            "undo" => KindSelector::Undo,
            other => {
                return Err(MigrateError::configuration(format!(
                    "invalid ignore pattern '{text}': unknown type '{other}'"
                )));
            }
        };

        let state_part = state_part.trim();
        let state = if state_part == "*" {
            StateSelector::Any
        } else {
            StateSelector::State(MigrationState::parse(state_part).ok_or_else(|| {
                MigrateError::configuration(format!(
                    "invalid ignore pattern '{text}': unknown state '{state_part}'"
                ))
            })?)
        };

        Ok(Self { kind, state })
    }

    /// Whether this pattern matches the given kind/state pair.
    pub fn matches(&self, kind: MigrationKind, state: MigrationState) -> bool {
        let kind_matches = match self.kind {
            KindSelector::Any => true,
            KindSelector::Versioned => kind == MigrationKind::Versioned,
            KindSelector::Repeatable => kind == MigrationKind::Repeatable,
            KindSelector::Baseline => kind == MigrationKind::Baseline,
            KindSelector::Undo => kind == MigrationKind::Undo,
        };
        let state_matches = match self.state {
            StateSelector::Any => true,
            StateSelector::State(s) => s == state,
        };
        kind_matches && state_matches
    }

    /// Whether this pattern matches a reconciled migration.
    pub fn matches_info(&self, info: &MigrationInfo) -> bool {
        self.matches(info.kind(), info.state)
    }
}

impl fmt::Display for MigrationPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            KindSelector::Any => write!(f, "*")?,
            KindSelector::Versioned => write!(f, "versioned")?,
            KindSelector::Repeatable => write!(f, "repeatable")?,
            KindSelector::Baseline => write!(f, "baseline")?,
            KindSelector::Undo => write!(f, "undo")?,
        }
        match self.state {
            StateSelector::Any => write!(f, ":*"),
            StateSelector::State(s) => write!(f, ":{s}"),
        }
    }
}

impl FromStr for MigrationPattern {
    type Err = MigrateError;

    fn from_str(s: &str) -> MigrateResult<Self> {
        Self::parse(s)
    }
}

/// A cherry-pick selector: an explicit allow-list entry restricting which
/// migrations a run considers. Matches a version (for versioned kinds) or
/// a description (for repeatable migrations).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CherryPick {
    /// Match a versioned/baseline/undo migration by version.
    Version(Version),
    /// Match a repeatable migration by description.
    Description(String),
}

impl CherryPick {
    /// Parse a selector; numeric text is a version, anything else a
    /// description.
    pub fn parse(text: &str) -> MigrateResult<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Err(MigrateError::configuration(
                "cherry-pick selector must not be empty",
            ));
        }
        match Version::parse(text) {
            Ok(version) => Ok(Self::Version(version)),
            Err(_) => Ok(Self::Description(text.to_string())),
        }
    }

    /// Whether this selector matches a resolved migration.
    pub fn matches(&self, migration: &ResolvedMigration) -> bool {
        match self {
            Self::Version(version) => migration.version.as_ref() == Some(version),
            Self::Description(description) => {
                migration.version.is_none() && migration.description == *description
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_typed_pattern() {
        let pattern = MigrationPattern::parse("repeatable:missing").unwrap();
        assert!(pattern.matches(MigrationKind::Repeatable, MigrationState::Missing));
        assert!(!pattern.matches(MigrationKind::Versioned, MigrationState::Missing));
        assert!(!pattern.matches(MigrationKind::Repeatable, MigrationState::Future));
    }

    #[test]
    fn test_parse_wildcards() {
        let any_future = MigrationPattern::parse("*:future").unwrap();
        assert!(any_future.matches(MigrationKind::Versioned, MigrationState::Future));
        assert!(any_future.matches(MigrationKind::Repeatable, MigrationState::Future));

        let versioned_any = MigrationPattern::parse("versioned:*").unwrap();
        assert!(versioned_any.matches(MigrationKind::Versioned, MigrationState::Missing));
        assert!(!versioned_any.matches(MigrationKind::Repeatable, MigrationState::Missing));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(MigrationPattern::parse("missing").is_err());
        assert!(MigrationPattern::parse("table:missing").is_err());
        assert!(MigrationPattern::parse("versioned:gone").is_err());
    }

    #[test]
    fn test_display_round_trip() {
        for text in ["*:future", "repeatable:missing", "versioned:*"] {
            let pattern = MigrationPattern::parse(text).unwrap();
            assert_eq!(pattern.to_string(), text);
        }
    }

    #[test]
    fn test_cherry_pick_version_and_description() {
        let by_version = CherryPick::parse("2.1").unwrap();
        let by_description = CherryPick::parse("refresh views").unwrap();

        let versioned = ResolvedMigration {
            kind: MigrationKind::Versioned,
            version: Some(Version::parse("2.1").unwrap()),
            description: "add col".to_string(),
            script: "V2.1__add_col.sql".to_string(),
            checksum: 1,
            sql: String::new(),
            no_transaction: false,
        };
        let repeatable = ResolvedMigration {
            kind: MigrationKind::Repeatable,
            version: None,
            description: "refresh views".to_string(),
            script: "R__refresh_views.sql".to_string(),
            checksum: 2,
            sql: String::new(),
            no_transaction: false,
        };

        assert!(by_version.matches(&versioned));
        assert!(!by_version.matches(&repeatable));
        assert!(by_description.matches(&repeatable));
        assert!(!by_description.matches(&versioned));
    }
}
