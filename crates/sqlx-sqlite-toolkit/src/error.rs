use std::time::Duration;

use crate::statement::StatementKind;

/// Result type alias for toolkit operations.
pub type Result<T> = std::result::Result<T, Error>;

// SQLite primary result codes. Extended codes carry these in their low byte.
const SQLITE_ERROR: i32 = 1;
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;
const SQLITE_CONSTRAINT: i32 = 19;
const SQLITE_RANGE: i32 = 25;

/// Error types for data access operations.
///
/// SQLite failures are classified when they cross into this type (see the
/// `From<sqlx::Error>` impl) so callers can tell transient lock contention from
/// caller mistakes without inspecting driver errors themselves.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// SQLx error that does not fall into one of the classified variants.
   #[error(transparent)]
   Sqlx(sqlx::Error),

   /// No pooled connection became available within the acquire timeout.
   #[error("connection pool exhausted: no connection available within {timeout:?} (max {max_connections})")]
   PoolExhausted {
      timeout: Duration,
      max_connections: u32,
   },

   /// Operation attempted after the pool was closed.
   #[error("connection pool has been closed")]
   PoolClosed,

   /// SQLite reported SQLITE_BUSY or SQLITE_LOCKED.
   #[error("database is busy or locked: {0}")]
   TransientLockFailure(#[source] sqlx::Error),

   /// Transient failures persisted through every allowed attempt.
   #[error("operation still failing after {attempts} attempts: {last_error}")]
   RetriesExhausted {
      attempts: u32,
      #[source]
      last_error: Box<Error>,
   },

   /// UNIQUE, NOT NULL, CHECK or FOREIGN KEY constraint failed.
   #[error("constraint violation: {0}")]
   ConstraintViolation(#[source] sqlx::Error),

   /// SQL that SQLite refused to prepare or bind (syntax, unknown table, bad parameter index).
   #[error("malformed statement: {0}")]
   MalformedStatement(#[source] sqlx::Error),

   /// SQLite type that cannot be mapped to JSON.
   #[error("unsupported datatype: {0}")]
   UnsupportedDatatype(String),

   /// Multiple rows returned from fetch_one query.
   #[error("fetch_one() query returned {0} rows, expected 0 or 1")]
   MultipleRowsReturned(usize),

   /// Transaction failed and rollback also failed. The connection is closed
   /// instead of being pooled, which makes SQLite discard the transaction.
   #[error("transaction failed: {transaction_error}; rollback also failed: {rollback_error}")]
   TransactionRollbackFailed {
      #[source]
      transaction_error: Box<Error>,
      rollback_error: Box<Error>,
   },

   /// Table or column name contains characters outside `[a-zA-Z_][a-zA-Z0-9_]*`.
   #[error("invalid identifier '{name}': must match [a-zA-Z_][a-zA-Z0-9_]*")]
   InvalidIdentifier { name: String },

   /// A bulk insert record has no columns.
   #[error("bulk insert record {index} has no columns")]
   EmptyRecord { index: usize },

   /// A bulk insert record does not carry the same columns as the first one.
   #[error("bulk insert record {index} has columns that differ from record 0")]
   RecordColumnsMismatch { index: usize },

   /// A statement was sent where another kind of statement is required.
   #[error("expected {expected} statement, found {}", .found.map_or("no statement", |kind| kind.as_str()))]
   UnexpectedStatementKind {
      expected: StatementKind,
      found: Option<StatementKind>,
   },

   /// Retry policy failed validation.
   #[error("invalid retry policy: {0}")]
   InvalidRetryPolicy(String),

   /// Pool configuration failed validation.
   #[error("invalid pool configuration: {0}")]
   InvalidConfig(String),

   /// I/O error when accessing database files.
   #[error("io error: {0}")]
   Io(#[from] std::io::Error),
}

impl Error {
   /// Whether the failure is lock contention worth retrying after a backoff.
   pub fn is_transient(&self) -> bool {
      match self {
         Error::TransientLockFailure(_) => true,
         Error::TransactionRollbackFailed {
            transaction_error, ..
         } => transaction_error.is_transient(),
         _ => false,
      }
   }

   /// Extract a structured error code from the error type.
   ///
   /// This provides machine-readable error codes for error handling.
   pub fn error_code(&self) -> String {
      match self {
         Error::Sqlx(e) => {
            if let Some(code) = e.as_database_error().and_then(|db_err| db_err.code()) {
               return format!("SQLITE_{}", code);
            }
            "SQLX_ERROR".to_string()
         }
         Error::PoolExhausted { .. } => "POOL_EXHAUSTED".to_string(),
         Error::PoolClosed => "POOL_CLOSED".to_string(),
         Error::TransientLockFailure(_) => "DATABASE_BUSY".to_string(),
         Error::RetriesExhausted { .. } => "RETRIES_EXHAUSTED".to_string(),
         Error::ConstraintViolation(_) => "CONSTRAINT_VIOLATION".to_string(),
         Error::MalformedStatement(_) => "MALFORMED_STATEMENT".to_string(),
         Error::UnsupportedDatatype(_) => "UNSUPPORTED_DATATYPE".to_string(),
         Error::MultipleRowsReturned(_) => "MULTIPLE_ROWS_RETURNED".to_string(),
         Error::TransactionRollbackFailed { .. } => "TRANSACTION_ROLLBACK_FAILED".to_string(),
         Error::InvalidIdentifier { .. } => "INVALID_IDENTIFIER".to_string(),
         Error::EmptyRecord { .. } => "EMPTY_RECORD".to_string(),
         Error::RecordColumnsMismatch { .. } => "RECORD_COLUMNS_MISMATCH".to_string(),
         Error::UnexpectedStatementKind { .. } => "UNEXPECTED_STATEMENT_KIND".to_string(),
         Error::InvalidRetryPolicy(_) => "INVALID_RETRY_POLICY".to_string(),
         Error::InvalidConfig(_) => "INVALID_CONFIG".to_string(),
         Error::Io(_) => "IO_ERROR".to_string(),
      }
   }
}

/// Primary SQLite result code of a database error, if any.
fn sqlite_primary_code(err: &sqlx::Error) -> Option<i32> {
   let code = err.as_database_error()?.code()?;
   code.parse::<i32>().ok().map(|extended| extended & 0xff)
}

impl From<sqlx::Error> for Error {
   fn from(err: sqlx::Error) -> Self {
      match sqlite_primary_code(&err) {
         Some(SQLITE_BUSY | SQLITE_LOCKED) => Error::TransientLockFailure(err),
         Some(SQLITE_CONSTRAINT) => Error::ConstraintViolation(err),
         Some(SQLITE_ERROR | SQLITE_RANGE) => Error::MalformedStatement(err),
         _ => Error::Sqlx(err),
      }
   }
}

impl From<sqlx_sqlite_pool::Error> for Error {
   fn from(err: sqlx_sqlite_pool::Error) -> Self {
      match err {
         sqlx_sqlite_pool::Error::Sqlx(e) => Error::from(e),
         sqlx_sqlite_pool::Error::Io(e) => Error::Io(e),
         sqlx_sqlite_pool::Error::PoolExhausted {
            timeout,
            max_connections,
         } => Error::PoolExhausted {
            timeout,
            max_connections,
         },
         sqlx_sqlite_pool::Error::PoolClosed => Error::PoolClosed,
         sqlx_sqlite_pool::Error::InvalidConfig(msg) => Error::InvalidConfig(msg),
      }
   }
}
