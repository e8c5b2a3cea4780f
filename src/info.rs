//! Reconciled per-migration state.

use std::fmt;

use serde::Serialize;

use crate::history::AppliedMigration;
use crate::resolver::{MigrationKind, ResolvedMigration};
use crate::version::Version;

/// Derived state of one logical migration after reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    /// Resolved, not yet applied, eligible to run.
    Pending,
    /// Applied successfully.
    Success,
    /// Applied, but no longer present in any location.
    Missing,
    /// Resolved but excluded from execution (below baseline, out of
    /// order without `out_of_order`, or filtered by cherry-pick).
    Ignored,
    /// Applied with a version above the highest resolved version.
    Future,
    /// Resolved below the highest applied version and eligible to run
    /// because `out_of_order` is enabled.
    OutOfOrder,
    /// Synthetic marker: schema assumed to match this version.
    Baseline,
    /// Applied and recorded as failed; requires `repair`.
    Failed,
    /// Most recent application of a repeatable migration whose content
    /// has since changed; will be reapplied.
    Outdated,
    /// Older application of a repeatable migration, replaced by a later
    /// run.
    Superseded,
}

impl MigrationState {
    /// Whether this state puts the migration into the execution plan.
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Pending | Self::OutOfOrder | Self::Outdated)
    }

    /// Whether a history row exists for this state.
    pub fn is_applied(self) -> bool {
        matches!(
            self,
            Self::Success
                | Self::Missing
                | Self::Future
                | Self::Baseline
                | Self::Failed
                | Self::Outdated
                | Self::Superseded
        )
    }

    /// Parse a state name as used in ignore patterns.
    pub fn parse(text: &str) -> Option<Self> {
        match text.to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "success" => Some(Self::Success),
            "missing" => Some(Self::Missing),
            "ignored" => Some(Self::Ignored),
            "future" => Some(Self::Future),
            "out_of_order" | "outoforder" => Some(Self::OutOfOrder),
            "baseline" => Some(Self::Baseline),
            "failed" => Some(Self::Failed),
            "outdated" => Some(Self::Outdated),
            "superseded" => Some(Self::Superseded),
            _ => None,
        }
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Missing => "missing",
            Self::Ignored => "ignored",
            Self::Future => "future",
            Self::OutOfOrder => "out_of_order",
            Self::Baseline => "baseline",
            Self::Failed => "failed",
            Self::Outdated => "outdated",
            Self::Superseded => "superseded",
        };
        f.write_str(name)
    }
}

/// Union of a resolved and/or applied migration plus its derived state.
///
/// Computed by the reconciler, never stored.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationInfo {
    /// The resolved side, if the migration exists on disk.
    pub resolved: Option<ResolvedMigration>,
    /// The applied side, if a history row exists.
    pub applied: Option<AppliedMigration>,
    /// Derived state.
    pub state: MigrationState,
}

impl MigrationInfo {
    /// The migration's version, from whichever side is present.
    pub fn version(&self) -> Option<&Version> {
        self.resolved
            .as_ref()
            .and_then(|r| r.version.as_ref())
            .or_else(|| self.applied.as_ref().and_then(|a| a.version.as_ref()))
    }

    /// The migration's description.
    pub fn description(&self) -> &str {
        self.resolved
            .as_ref()
            .map(|r| r.description.as_str())
            .or_else(|| self.applied.as_ref().map(|a| a.description.as_str()))
            .unwrap_or("")
    }

    /// The migration's kind.
    pub fn kind(&self) -> MigrationKind {
        self.resolved
            .as_ref()
            .map(|r| r.kind)
            .or_else(|| self.applied.as_ref().map(|a| a.kind))
            .unwrap_or(MigrationKind::Versioned)
    }

    /// The script identity.
    pub fn script(&self) -> &str {
        self.resolved
            .as_ref()
            .map(|r| r.script.as_str())
            .or_else(|| self.applied.as_ref().map(|a| a.script.as_str()))
            .unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_classification() {
        assert!(MigrationState::Pending.is_pending());
        assert!(MigrationState::OutOfOrder.is_pending());
        assert!(MigrationState::Outdated.is_pending());
        assert!(!MigrationState::Success.is_pending());

        assert!(MigrationState::Failed.is_applied());
        assert!(!MigrationState::Pending.is_applied());
        assert!(!MigrationState::Ignored.is_applied());
    }

    #[test]
    fn test_state_parse_round_trip() {
        for state in [
            MigrationState::Pending,
            MigrationState::Missing,
            MigrationState::OutOfOrder,
            MigrationState::Superseded,
        ] {
            assert_eq!(MigrationState::parse(&state.to_string()), Some(state));
        }
        assert_eq!(MigrationState::parse("unknown"), None);
    }
}
