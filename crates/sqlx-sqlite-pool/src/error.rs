//! Error types for sqlx-sqlite-pool

use std::time::Duration;

use thiserror::Error;

/// Errors that may occur when working with sqlx-sqlite-pool
#[derive(Error, Debug)]
pub enum Error {
   /// IO error when accessing database files. Standard library IO errors
   /// are converted to this variant.
   #[error("IO error: {0}")]
   Io(#[from] std::io::Error),

   /// Error from the sqlx library. Standard sqlx errors are converted to this variant
   #[error("Sqlx error: {0}")]
   Sqlx(#[from] sqlx::Error),

   /// No connection became available within the acquire timeout
   #[error("connection pool exhausted: no connection available within {timeout:?} (max {max_connections})")]
   PoolExhausted {
      timeout: Duration,
      max_connections: u32,
   },

   /// Pool has been closed and cannot hand out connections
   #[error("connection pool has been closed")]
   PoolClosed,

   /// Pool configuration failed validation
   #[error("invalid pool configuration: {0}")]
   InvalidConfig(String),
}

/// A type alias for Results with our Error type
pub type Result<T> = std::result::Result<T, Error>;
