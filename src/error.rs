//! Error types for trialstore.
//!
//! Provides structured error handling with:
//! - Machine-readable error codes (`ErrorCode`)
//! - Category-based exit codes (2=db, 3=not_found, 4=validation, etc.)
//! - Retryability flags so callers can decide whether to try again
//! - Context-aware recovery hints
//! - Structured JSON output for the maintenance binary

use crate::model::TrialState;
use thiserror::Error;

/// Result type alias for trialstore operations.
pub type Result<T> = std::result::Result<T, Error>;

// ── Error Code ────────────────────────────────────────────────

/// Machine-readable error codes grouped by category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Connection / schema (exit 2)
    ConnectionError,
    SchemaIncompatible,
    MigrationFailed,
    DatabaseError,

    // Not Found (exit 3)
    StudyNotFound,
    TrialNotFound,
    ParamNotFound,

    // Validation (exit 4)
    InvalidArgument,
    InvalidStateTransition,
    IncompatibleDistribution,

    // Conflict (exit 5)
    DuplicateName,
    UniqueConstraintViolation,

    // Config (exit 7)
    ConfigError,

    // I/O (exit 8)
    IoError,
    JsonError,

    // Internal (exit 1)
    InternalError,
}

impl ErrorCode {
    /// Machine-readable SCREAMING_SNAKE code string.
    #[must_use]
    pub const fn as_str(&self) -> &str {
        match self {
            Self::ConnectionError => "CONNECTION_ERROR",
            Self::SchemaIncompatible => "SCHEMA_INCOMPATIBLE",
            Self::MigrationFailed => "MIGRATION_FAILED",
            Self::DatabaseError => "DATABASE_ERROR",
            Self::StudyNotFound => "STUDY_NOT_FOUND",
            Self::TrialNotFound => "TRIAL_NOT_FOUND",
            Self::ParamNotFound => "PARAM_NOT_FOUND",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::InvalidStateTransition => "INVALID_STATE_TRANSITION",
            Self::IncompatibleDistribution => "INCOMPATIBLE_DISTRIBUTION",
            Self::DuplicateName => "DUPLICATE_NAME",
            Self::UniqueConstraintViolation => "UNIQUE_CONSTRAINT_VIOLATION",
            Self::ConfigError => "CONFIG_ERROR",
            Self::IoError => "IO_ERROR",
            Self::JsonError => "JSON_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Category-based exit code (1-8).
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::InternalError => 1,
            Self::ConnectionError
            | Self::SchemaIncompatible
            | Self::MigrationFailed
            | Self::DatabaseError => 2,
            Self::StudyNotFound | Self::TrialNotFound | Self::ParamNotFound => 3,
            Self::InvalidArgument | Self::InvalidStateTransition | Self::IncompatibleDistribution => 4,
            Self::DuplicateName | Self::UniqueConstraintViolation => 5,
            Self::ConfigError => 7,
            Self::IoError | Self::JsonError => 8,
        }
    }

    /// Whether every error of this code may succeed if simply issued again.
    ///
    /// Only unique-constraint races qualify. A duplicate study name is a
    /// caller decision, not a race, and `DATABASE_ERROR` depends on the
    /// underlying failure (see [`Error::is_retryable`]).
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::UniqueConstraintViolation)
    }
}

// ── Error Enum ────────────────────────────────────────────────

/// Errors that can occur in trialstore operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error(
        "Schema incompatible: store is at {current} but this library expects {head}; \
         run the upgrade first"
    )]
    SchemaIncompatible { current: String, head: String },

    #[error("Unknown schema version in store: {version}")]
    UnknownSchemaVersion { version: String },

    #[error("Migration {version} failed: {message}")]
    Migration { version: String, message: String },

    #[error("Study name already exists: {name}")]
    DuplicateStudyName { name: String },

    #[error("Unique constraint violated: {0}")]
    UniqueConstraintViolation(String),

    #[error("Study not found: {id}")]
    StudyNotFound { id: String },

    #[error("Trial not found: {id}")]
    TrialNotFound { id: String },

    #[error("Param not found: trial {trial_id} has no param '{name}'")]
    ParamNotFound { trial_id: i64, name: String },

    #[error("Trial {trial_id} is already {state} and cannot be updated")]
    InvalidStateTransition { trial_id: i64, state: TrialState },

    #[error("Incompatible distribution for param '{name}': {message}")]
    IncompatibleDistribution { name: String, message: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Map this error to its structured `ErrorCode`.
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::Connection(_) => ErrorCode::ConnectionError,
            Self::SchemaIncompatible { .. } | Self::UnknownSchemaVersion { .. } => {
                ErrorCode::SchemaIncompatible
            }
            Self::Migration { .. } => ErrorCode::MigrationFailed,
            Self::Database(_) => ErrorCode::DatabaseError,
            Self::DuplicateStudyName { .. } => ErrorCode::DuplicateName,
            Self::UniqueConstraintViolation(_) => ErrorCode::UniqueConstraintViolation,
            Self::StudyNotFound { .. } => ErrorCode::StudyNotFound,
            Self::TrialNotFound { .. } => ErrorCode::TrialNotFound,
            Self::ParamNotFound { .. } => ErrorCode::ParamNotFound,
            Self::InvalidStateTransition { .. } => ErrorCode::InvalidStateTransition,
            Self::IncompatibleDistribution { .. } => ErrorCode::IncompatibleDistribution,
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::Config(_) => ErrorCode::ConfigError,
            Self::Io(_) => ErrorCode::IoError,
            Self::Json(_) => ErrorCode::JsonError,
            Self::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Category-based exit code, delegating to the `ErrorCode`.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        self.error_code().exit_code()
    }

    /// Whether this error came from a unique/primary-key constraint.
    #[must_use]
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::UniqueConstraintViolation(_) => true,
            Self::Database(e) => is_unique_violation(e),
            _ => false,
        }
    }

    /// Whether the same call may succeed if simply issued again.
    ///
    /// Database errors are retryable only when the store was busy or locked.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            other => other.error_code().is_retryable(),
        }
    }

    /// Context-aware recovery hint.
    ///
    /// Returns `None` if no actionable suggestion exists.
    #[must_use]
    pub fn hint(&self) -> Option<String> {
        match self {
            Self::Connection(_) => Some(
                "Storage locators look like sqlite:///relative.db, sqlite:////abs/path.db \
                 or sqlite:///:memory:"
                    .to_string(),
            ),
            Self::SchemaIncompatible { .. } => {
                Some("Run `trialstore upgrade` against this storage".to_string())
            }
            Self::UnknownSchemaVersion { .. } => Some(
                "The store was written by a newer trialstore; upgrade the library".to_string(),
            ),
            Self::Migration { .. } => Some(
                "The store is still at the last successful version; fix the cause and re-run \
                 the upgrade"
                    .to_string(),
            ),
            Self::DuplicateStudyName { name } => Some(format!(
                "Load the existing study '{name}' instead, or pick another name"
            )),
            Self::UniqueConstraintViolation(_) => {
                Some("Another writer raced this insert; retry the operation".to_string())
            }
            Self::StudyNotFound { .. } => {
                Some("Use `trialstore studies` to list stored studies".to_string())
            }
            Self::InvalidStateTransition { .. } => Some(
                "Finished trials (COMPLETE, PRUNED, FAIL) are immutable; create a new trial"
                    .to_string(),
            ),
            Self::InvalidArgument(msg) => {
                if msg.contains("state") {
                    Some("Valid states: waiting, running, complete, pruned, fail".to_string())
                } else if msg.contains("direction") {
                    Some("Valid directions: minimize, maximize".to_string())
                } else {
                    None
                }
            }
            Self::TrialNotFound { .. }
            | Self::ParamNotFound { .. }
            | Self::IncompatibleDistribution { .. }
            | Self::Database(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Config(_)
            | Self::Other(_) => None,
        }
    }

    /// Structured JSON representation for machine consumption.
    #[must_use]
    pub fn to_structured_json(&self) -> serde_json::Value {
        let code = self.error_code();
        let mut obj = serde_json::json!({
            "error": {
                "code": code.as_str(),
                "message": self.to_string(),
                "retryable": self.is_retryable(),
                "exit_code": code.exit_code(),
            }
        });

        if let Some(hint) = self.hint() {
            obj["error"]["hint"] = serde_json::Value::String(hint);
        }

        obj
    }
}

/// Check a raw rusqlite error for a UNIQUE or PRIMARY KEY violation.
#[must_use]
pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            e.code == rusqlite::ErrorCode::ConstraintViolation
                && matches!(
                    e.extended_code,
                    rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                        | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                )
        }
        _ => false,
    }
}
