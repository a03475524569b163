//! # sqlx-sqlite-toolkit
//!
//! Data access on top of [`sqlx_sqlite_pool`]: JSON-bound statements,
//! transactions and bulk inserts, retried with exponential backoff while
//! SQLite reports lock contention.
//!
//! ## Core Types
//!
//! - **[`DataAccess`]**: Façade handlers call (`execute`, `query`, `fetch_one`,
//!   `transact`, `bulk_insert`, `stats`)
//! - **[`RetryExecutor`]**: Runs an [`Operation`] on a pooled connection under a [`RetryPolicy`]
//! - **[`Operation`]**: Immutable unit of work ([`Execute`], [`Query`], [`Transact`], [`BulkInsert`])
//! - **[`Error`]**: Classified failures (transient, constraint, malformed, pool)
//!
//! ## Example
//!
//! ```no_run
//! use serde_json::json;
//! use sqlx_sqlite_toolkit::{DataAccess, PoolConfig, RetryPolicy};
//!
//! # async fn run() -> sqlx_sqlite_toolkit::Result<()> {
//! let db = DataAccess::open("app.db", PoolConfig::default(), RetryPolicy::default()).await?;
//! db.execute("CREATE TABLE IF NOT EXISTS notes (body TEXT)", vec![]).await?;
//! db.execute("INSERT INTO notes (body) VALUES (?)", vec![json!("hello")]).await?;
//! let rows = db.query("SELECT body FROM notes", vec![]).await?;
//! assert_eq!(rows[0]["body"], "hello");
//! db.close().await;
//! # Ok(())
//! # }
//! ```

mod access;
mod decode;
mod error;
mod operation;
mod retry;
mod statement;

pub use access::{AccessStats, DataAccess};
pub use decode::{JsonRow, to_json};
pub use error::{Error, Result};
pub use operation::{BulkInsert, Execute, Operation, OperationFuture, Query, Transact};
pub use retry::{
   DEFAULT_SLOW_QUERY_THRESHOLD, RequestState, RetryExecutor, RetryOutcome, RetryPolicy,
};
pub use statement::{Statement, StatementKind, WriteQueryResult};

// Pool types callers need to configure and observe the façade
pub use sqlx_sqlite_pool::{ConnectionPool, JournalMode, PoolConfig, PoolStats, PooledConnection};
