//! Error types for lazydb.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Driver errors are mapped into this taxonomy without being interpreted or retried;
//! connection and statement failures carry a suggestion where one is useful.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Engine is already initialized. Call reset_engine() before configuring it again.")]
    AlreadyConfigured,

    #[error("Engine is not initialized. Call create_engine() first.")]
    NotConfigured,

    #[error("Execution context has no active connection")]
    NotInitialized,

    #[error("Lazy connection has no physical connection to {operation}")]
    NotConnected { operation: String },

    #[error("Physical connection was closed and cannot be reopened")]
    ConnectionClosed,

    #[error(
        "No execution unit is active on this task. Use with_connection, with_transaction or unit()."
    )]
    OutsideExecutionUnit,

    #[error("Expected only one column, got {columns}")]
    MultiColumn { columns: usize },

    #[error("Query returned no rows")]
    NoResult,

    #[error("Expected {expected} value, found {found}")]
    UnexpectedType { expected: String, found: String },

    /// The outermost transaction succeeded but a nested one failed or was cancelled,
    /// so the whole transaction was rolled back.
    #[error("Transaction rolled back because a nested transaction failed")]
    RolledBack,

    #[error("Commit failed: {source}")]
    CommitFailed {
        #[source]
        source: Box<DbError>,
        /// Failure of the rollback attempted after the commit failure, if any.
        rollback_error: Option<Box<DbError>>,
    },

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u32,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Create a not-connected error for the given physical operation.
    pub fn not_connected(operation: impl Into<String>) -> Self {
        Self::NotConnected {
            operation: operation.into(),
        }
    }

    /// Create an unexpected-type error.
    pub fn unexpected_type(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::UnexpectedType {
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// Wrap a commit failure together with the outcome of the rollback that followed it.
    pub fn commit_failed(source: DbError, rollback_error: Option<DbError>) -> Self {
        Self::CommitFailed {
            source: Box::new(source),
            rollback_error: rollback_error.map(Box::new),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u32) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            Self::CommitFailed { source, .. } => source.suggestion(),
            _ => None,
        }
    }

    /// True for errors caused by using the scope API incorrectly rather than by the database.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::AlreadyConfigured
                | Self::NotConfigured
                | Self::NotInitialized
                | Self::NotConnected { .. }
                | Self::OutsideExecutionUnit
        )
    }
}

/// Suggestion for a database error, chosen by its SQLSTATE class.
fn sql_state_suggestion(code: Option<&str>) -> &'static str {
    match code {
        Some(c) if c.starts_with("23") => {
            "The statement violates a constraint; check keys and NOT NULL columns"
        }
        Some(c) if c.starts_with("42") => {
            "Check the SQL syntax and the referenced tables and columns"
        }
        Some("40001") | Some("40P01") => {
            "The transaction conflicted with another one; run the whole transaction again"
        }
        Some(c) if c.starts_with("08") => "The connection to the server was lost",
        _ => "Check the SQL statement and its parameters",
    }
}

/// Driver errors are passed through without retry; only their shape is normalised.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.into_owned());
                let suggestion = sql_state_suggestion(code.as_deref());
                DbError::database(db_err.message(), code, suggestion)
            }
            sqlx::Error::RowNotFound => DbError::NoResult,
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the engine configuration and credentials",
            ),
            sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::Protocol(_) => {
                DbError::connection(
                    format!("Physical connection failed: {}", err),
                    "Check that the database server is reachable; \
                     uncommitted work on this connection is lost",
                )
            }
            sqlx::Error::ColumnNotFound(col) => {
                DbError::invalid_input(format!("Column not found: {}", col))
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                DbError::internal(format!("Failed to decode a result value: {}", err))
            }
            other => DbError::internal(format!("Database driver error: {}", other)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
