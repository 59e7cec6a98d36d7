//! Result and error types for the core library

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broad classification of a driver failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverErrorKind {
    /// A primary key or unique constraint was violated
    UniqueViolation,
    /// The connection could not be opened or was lost
    Connection,
    /// A deadline passed before the operation could start
    Timeout,
    Other,
}

/// Engine-agnostic error reported by a database adapter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct DriverError {
    pub kind: DriverErrorKind,
    pub message: String,
}

impl DriverError {
    pub fn new(kind: DriverErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unique_violation(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::UniqueViolation, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Connection, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Timeout, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Other, message)
    }

    pub fn is_unique_violation(&self) -> bool {
        self.kind == DriverErrorKind::UniqueViolation
    }
}

/// Core library error type
///
/// Each variant maps to one entry of the failure taxonomy reported by the
/// CLI (see [`Error::kind_name`]) and to a distinct process exit code.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("no dialect registered for engine '{0}'")]
    UnsupportedEngine(String),

    #[error("could not connect: {0}")]
    Connection(#[source] DriverError),

    #[error("statement {statement_index} (line {line}) of {identifier} failed: {source}")]
    MigrationExecution {
        identifier: String,
        statement_index: usize,
        line: usize,
        #[source]
        source: DriverError,
    },

    #[error(
        "statement {statement_index} of {identifier} failed after {committed} statement(s) \
         were committed without a transaction; manual inspection required: {source}"
    )]
    PartialMigration {
        identifier: String,
        statement_index: usize,
        committed: usize,
        #[source]
        source: DriverError,
    },

    #[error("could not record {identifier} in the tracking table: {source}")]
    LedgerWrite {
        identifier: String,
        #[source]
        source: DriverError,
    },

    #[error("tracking table error: {0}")]
    Ledger(#[source] DriverError),

    #[error("another migration run holds the lock (waited {waited_ms}ms)")]
    LockTimeout { waited_ms: u64 },

    #[error("deadline exceeded{}", .identifier.as_ref().map(|id| format!(" at {}", id)).unwrap_or_default())]
    Cancelled { identifier: Option<String> },

    #[error("invalid migration {identifier}: {message}")]
    InvalidMigration { identifier: String, message: String },

    #[error("duplicate migration identifier: {0}")]
    DuplicateMigration(String),

    #[error("migration discovery failed: {0}")]
    Discovery(String),

    #[error("checksum of {identifier} changed since it was applied")]
    ChecksumMismatch { identifier: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid migration error
    pub fn invalid_migration(identifier: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidMigration {
            identifier: identifier.into(),
            message: msg.into(),
        }
    }

    /// Taxonomy name shown to operators
    pub fn kind_name(&self) -> &'static str {
        match self {
            Error::Config(_) => "ConfigError",
            Error::UnsupportedEngine(_) => "UnsupportedEngineError",
            Error::Connection(_) => "ConnectionError",
            Error::MigrationExecution { .. } => "MigrationExecutionError",
            Error::PartialMigration { .. } => "PartialMigrationError",
            Error::LedgerWrite { .. } => "LedgerWriteError",
            Error::Ledger(_) => "LedgerError",
            Error::LockTimeout { .. } => "LockTimeoutError",
            Error::Cancelled { .. } => "CancelledError",
            Error::InvalidMigration { .. }
            | Error::DuplicateMigration(_)
            | Error::Discovery(_)
            | Error::ChecksumMismatch { .. } => "MigrationSourceError",
            Error::Io(_) | Error::Json(_) => "IoError",
        }
    }

    /// Migration identifier the error refers to, if any
    pub fn identifier(&self) -> Option<&str> {
        match self {
            Error::MigrationExecution { identifier, .. }
            | Error::PartialMigration { identifier, .. }
            | Error::LedgerWrite { identifier, .. }
            | Error::InvalidMigration { identifier, .. }
            | Error::ChecksumMismatch { identifier } => Some(identifier.as_str()),
            Error::DuplicateMigration(identifier) => Some(identifier.as_str()),
            Error::Cancelled { identifier } => identifier.as_deref(),
            _ => None,
        }
    }

    /// Process exit code; configuration problems and execution problems
    /// never share a code.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Io(_) | Error::Json(_) => 1,
            Error::Config(_) => 2,
            Error::UnsupportedEngine(_) => 3,
            Error::Connection(_) => 4,
            Error::MigrationExecution { .. } => 5,
            Error::PartialMigration { .. } => 6,
            Error::LedgerWrite { .. } | Error::Ledger(_) => 7,
            Error::LockTimeout { .. } => 8,
            Error::Cancelled { .. } => 9,
            Error::InvalidMigration { .. }
            | Error::DuplicateMigration(_)
            | Error::Discovery(_)
            | Error::ChecksumMismatch { .. } => 10,
        }
    }
}

/// Core library result type
pub type Result<T> = std::result::Result<T, Error>;

/// Operation result with optional context (JSON output envelope)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub context: Option<HashMap<String, serde_json::Value>>,
}

impl<T> OperationResult<T> {
    /// Create a successful result
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            context: None,
        }
    }

    /// Create a failed result
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            context: None,
        }
    }

    /// Create a failed result with context
    pub fn fail_with_context(
        error: impl Into<String>,
        context: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            context: Some(context),
        }
    }
}

impl<T> From<Result<T>> for OperationResult<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => {
                let mut context = HashMap::new();
                context.insert("kind".to_string(), serde_json::json!(e.kind_name()));
                context.insert("exit_code".to_string(), serde_json::json!(e.exit_code()));
                if let Some(id) = e.identifier() {
                    context.insert("identifier".to_string(), serde_json::json!(id));
                }
                Self::fail_with_context(e.to_string(), context)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_result_ok() {
        let result: OperationResult<i32> = OperationResult::ok(42);
        assert!(result.success);
        assert_eq!(result.data, Some(42));
        assert!(result.error.is_none());
    }

    #[test]
    fn test_operation_result_fail() {
        let result: OperationResult<i32> = OperationResult::fail("Something went wrong");
        assert!(!result.success);
        assert!(result.data.is_none());
        assert_eq!(result.error, Some("Something went wrong".to_string()));
    }

    #[test]
    fn test_from_result_carries_taxonomy() {
        let ok: Result<i32> = Ok(42);
        let result: OperationResult<i32> = ok.into();
        assert!(result.success);

        let err: Result<i32> = Err(Error::UnsupportedEngine("notadb".into()));
        let result: OperationResult<i32> = err.into();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("notadb"));
        let context = result.context.unwrap();
        assert_eq!(context["kind"], "UnsupportedEngineError");
        assert_eq!(context["exit_code"], 3);
    }

    #[test]
    fn test_exit_codes_separate_config_from_execution() {
        let config = Error::config("missing engine");
        let unsupported = Error::UnsupportedEngine("x".into());
        let connection = Error::Connection(DriverError::connection("refused"));
        let execution = Error::MigrationExecution {
            identifier: "0001_a".into(),
            statement_index: 0,
            line: 1,
            source: DriverError::other("syntax error"),
        };

        let codes = [
            config.exit_code(),
            unsupported.exit_code(),
            connection.exit_code(),
            execution.exit_code(),
        ];
        for (i, a) in codes.iter().enumerate() {
            assert_ne!(*a, 0);
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_identifier_and_kind() {
        let err = Error::LedgerWrite {
            identifier: "0002_b".into(),
            source: DriverError::unique_violation("duplicate key"),
        };
        assert_eq!(err.kind_name(), "LedgerWriteError");
        assert_eq!(err.identifier(), Some("0002_b"));
        assert!(err.to_string().contains("duplicate key"));

        let cancelled = Error::Cancelled { identifier: None };
        assert_eq!(cancelled.to_string(), "deadline exceeded");
    }
}
