//! Error types for entigraph

use thiserror::Error;

/// Result type alias for entigraph operations
pub type OrmResult<T> = Result<T, OrmError>;

/// Error types for persistence operations
#[derive(Debug, Error)]
pub enum OrmError {
    /// Database connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Query execution error
    #[error("Query error: {0}")]
    Query(#[from] tokio_postgres::Error),

    /// Row not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Unique constraint violation
    #[error("Unique constraint violation: {0}")]
    UniqueViolation(String),

    /// Foreign key constraint violation
    #[error("Foreign key violation: {0}")]
    ForeignKeyViolation(String),

    /// Check constraint violation
    #[error("Check constraint violation: {0}")]
    CheckViolation(String),

    /// Row decode/mapping error
    #[error("Decode error on column '{column}': {message}")]
    Decode { column: String, message: String },

    /// No metadata registered under the given entity name
    #[error("No metadata found for entity '{0}'")]
    MetadataNotFound(String),

    /// Metadata failed validation while building the registry
    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),

    /// The object graph cannot be turned into a persist plan.
    ///
    /// Raised before any SQL runs. Not retryable.
    #[error("Planning error: {0}")]
    Planning(String),

    /// An id needed by a junction insert or foreign key fix-up was not available at execution time
    #[error("Unresolved id: {0}")]
    UnresolvedId(String),

    /// Optimistic lock failure: the row no longer holds the expected version
    #[error("Stale record in table '{table}': expected version {expected_version}")]
    StaleRecord { table: String, expected_version: i64 },

    /// The query runner was used after it had been released
    #[error("Query runner was already released and cannot be used anymore")]
    RunnerReleased,

    /// `begin_transaction` called while a transaction is open
    #[error("Transaction already started on this query runner")]
    TransactionAlreadyStarted,

    /// `commit_transaction` / `rollback_transaction` called without an open transaction
    #[error("Transaction is not started on this query runner")]
    TransactionNotStarted,

    /// Pool error
    #[cfg(feature = "pool")]
    #[error("Pool error: {0}")]
    Pool(String),

    /// Query timeout error
    #[error("Query timeout after {0:?}")]
    Timeout(std::time::Duration),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl OrmError {
    /// Create a decode error for a specific column
    pub fn decode(column: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decode {
            column: column.into(),
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Create an invalid metadata error
    pub fn invalid_metadata(message: impl Into<String>) -> Self {
        Self::InvalidMetadata(message.into())
    }

    /// Create a planning error
    pub fn planning(message: impl Into<String>) -> Self {
        Self::Planning(message.into())
    }

    /// Create an unresolved id error
    pub fn unresolved_id(message: impl Into<String>) -> Self {
        Self::UnresolvedId(message.into())
    }

    /// Check if this is a unique violation error
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Self::UniqueViolation(_))
    }

    /// Check if this is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if this is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Check if this is a planning error
    pub fn is_planning(&self) -> bool {
        matches!(self, Self::Planning(_))
    }

    /// Check if this is an optimistic lock failure
    pub fn is_stale_record(&self) -> bool {
        matches!(self, Self::StaleRecord { .. })
    }

    /// Check if this error comes from using a released runner
    pub fn is_runner_released(&self) -> bool {
        matches!(self, Self::RunnerReleased)
    }

    /// Parse a tokio_postgres error into a more specific OrmError
    pub fn from_db_error(err: tokio_postgres::Error) -> Self {
        if let Some(db_err) = err.as_db_error() {
            let constraint = db_err.constraint().unwrap_or("unknown");
            let message = db_err.message();

            match db_err.code().code() {
                "23505" => return Self::UniqueViolation(format!("{}: {}", constraint, message)),
                "23503" => {
                    return Self::ForeignKeyViolation(format!("{}: {}", constraint, message));
                }
                "23514" => return Self::CheckViolation(format!("{}: {}", constraint, message)),
                _ => {}
            }
        }
        Self::Query(err)
    }
}

#[cfg(feature = "pool")]
impl From<deadpool_postgres::PoolError> for OrmError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        Self::Pool(err.to_string())
    }
}
