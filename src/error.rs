//! Error types for the migration engine.

use thiserror::Error;

use crate::reconcile::ValidationError;

/// Result type alias for migration operations.
pub type MigrateResult<T> = Result<T, MigrateError>;

/// Errors that can occur during migration operations.
///
/// Each variant corresponds to one failure class, so callers can map
/// them to distinct exit codes or user messages without string matching.
#[derive(Debug, Error)]
pub enum MigrateError {
    /// Invalid configuration value, detected before any database interaction.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Bad migration filenames, duplicate versions, or unreadable locations.
    #[error("Resolution error: {0}")]
    Resolution(String),

    /// One or more validation findings blocked the operation.
    #[error("Validation failed with {} error(s): {}", .0.len(), format_validation_errors(.0))]
    Validation(Vec<ValidationError>),

    /// The schema-history lock could not be obtained within the retry budget.
    #[error("Failed to acquire migration lock: {0}")]
    LockAcquisition(String),

    /// A migration's statements failed while executing.
    #[error("Migration '{script}' failed: {message}")]
    Execution {
        /// Script identity of the failed migration.
        script: String,
        /// Backend error message.
        message: String,
    },

    /// Database operation error outside of migration execution.
    #[error("Database error: {0}")]
    Database(String),

    /// File system error while scanning migration locations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MigrateError {
    /// Create a configuration error.
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a resolution error.
    pub fn resolution(msg: impl Into<String>) -> Self {
        Self::Resolution(msg.into())
    }

    /// Create a lock acquisition error.
    pub fn lock_acquisition(msg: impl Into<String>) -> Self {
        Self::LockAcquisition(msg.into())
    }

    /// Create an execution error for the given script.
    pub fn execution(script: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Execution {
            script: script.into(),
            message: message.into(),
        }
    }

    /// Create a database error.
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Check whether retrying the whole operation may succeed without
    /// changing anything (lock contention, transient connectivity).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::LockAcquisition(_) | Self::Database(_))
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::ValidationErrorKind;

    #[test]
    fn test_error_display() {
        let err = MigrateError::execution("V1__init.sql", "relation exists");
        let msg = err.to_string();
        assert!(msg.contains("V1__init.sql"));
        assert!(msg.contains("relation exists"));
    }

    #[test]
    fn test_validation_display_lists_findings() {
        let err = MigrateError::Validation(vec![ValidationError::new(
            ValidationErrorKind::ChecksumMismatch,
            None,
            "init",
            "checksum mismatch",
        )]);
        let msg = err.to_string();
        assert!(msg.contains("1 error(s)"));
        assert!(msg.contains("checksum mismatch"));
    }

    #[test]
    fn test_is_transient() {
        assert!(MigrateError::lock_acquisition("timeout").is_transient());
        assert!(MigrateError::database("connection reset").is_transient());
        assert!(!MigrateError::configuration("empty separator").is_transient());
    }
}
