//! Error types for sqlscope.
//!
//! All errors are defined with `thiserror`. Driver failures are normalized into
//! a small, stable taxonomy: the "no rows" sentinel keeps its own variant so
//! callers can always tell absence apart from failure, everything else that
//! goes wrong while running a statement is an [`DbError::Execution`] carrying
//! the original `sqlx::Error`.

use std::error::Error as StdError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    /// The statement produced no row where exactly one was required.
    #[error("sql: no rows in result set")]
    NotFound,

    #[error("Error when calling sql {operation}")]
    Execution {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("Error beginning sql transaction")]
    Begin {
        #[source]
        source: sqlx::Error,
    },

    #[error("Error committing sql transaction")]
    Commit {
        #[source]
        source: sqlx::Error,
    },

    #[error("Error rolling back sql transaction")]
    Rollback {
        #[source]
        source: sqlx::Error,
    },

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Timeout: {operation} exceeded {elapsed_ms}ms")]
    Timeout {
        operation: &'static str,
        elapsed_ms: u64,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Transaction error: {message} (transaction: {transaction_id})")]
    Transaction {
        message: String,
        transaction_id: String,
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

    /// Create a timeout error.
    pub fn timeout(operation: &'static str, elapsed_ms: u64) -> Self {
        Self::Timeout {
            operation,
            elapsed_ms,
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create a transaction error.
    pub fn transaction(message: impl Into<String>, transaction_id: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            transaction_id: transaction_id.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True for the "no rows" sentinel.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    /// The driver error behind this classification, if any.
    pub fn cause(&self) -> Option<&sqlx::Error> {
        match self {
            Self::Execution { source, .. }
            | Self::Begin { source }
            | Self::Commit { source }
            | Self::Rollback { source } => Some(source),
            _ => None,
        }
    }

    /// SQLSTATE (or vendor code) reported by the database, if any.
    pub fn sql_state(&self) -> Option<String> {
        match self.cause() {
            Some(sqlx::Error::Database(db_err)) => db_err.code().map(|c| c.to_string()),
            _ => None,
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Begin { .. } => Some("Check database connectivity and pool capacity"),
            Self::Timeout { .. } => {
                Some("Consider increasing the timeout or optimizing the operation")
            }
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } | Self::Timeout { .. } | Self::Begin { .. } => true,
            Self::Execution { source, .. } => matches!(
                source,
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }
}

/// Normalize a driver error produced by `operation`.
///
/// `sqlx::Error::RowNotFound` maps to the [`DbError::NotFound`] sentinel and
/// nothing else does.
pub fn classify(operation: &'static str, err: sqlx::Error) -> DbError {
    match err {
        sqlx::Error::RowNotFound => DbError::NotFound,
        source => DbError::Execution { operation, source },
    }
}

/// Walk an error's source chain looking for the "no rows" sentinel.
///
/// Works for any wrapper that exposes the original [`DbError`] (or the raw
/// `sqlx::Error::RowNotFound`) through `Error::source`.
pub fn is_not_found(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(db_err) = err.downcast_ref::<DbError>() {
            if db_err.is_not_found() {
                return true;
            }
        }
        if let Some(sqlx::Error::RowNotFound) = err.downcast_ref::<sqlx::Error>() {
            return true;
        }
        current = err.source();
    }
    false
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// Errors surfaced at the repository boundary.
///
/// Repositories translate the layer's [`DbError`] into a typed absence or a
/// typed conflict; anything else is a generic failure that keeps the cause.
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("{resource} {id} not found")]
    NotFound { resource: String, id: String },

    #[error("Duplicate {resource} {id}: {message}")]
    Duplicate {
        resource: String,
        id: String,
        message: String,
    },

    #[error(transparent)]
    Failed(#[from] DbError),
}

impl RecordError {
    /// Create a not found error for a resource.
    pub fn not_found(resource: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.to_string(),
        }
    }

    /// Create a duplicate record error.
    pub fn duplicate(
        resource: impl Into<String>,
        id: impl ToString,
        message: impl Into<String>,
    ) -> Self {
        Self::Duplicate {
            resource: resource.into(),
            id: id.to_string(),
            message: message.into(),
        }
    }

    /// Translate a layer error, turning the sentinel into a typed absence.
    pub fn from_db(err: DbError, resource: impl Into<String>, id: impl ToString) -> Self {
        match err {
            DbError::NotFound => Self::not_found(resource, id),
            other => Self::Failed(other),
        }
    }
}
