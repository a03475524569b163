//! # sqlx-sqlite-pool
//!
//! A bounded connection pool for a single SQLite database file, built on SQLx.
//!
//! ## Core Types
//!
//! - **[`ConnectionPool`]**: Owns up to `max_connections` connections and hands them out
//! - **[`PooledConnection`]**: RAII guard for a checked-out connection
//! - **[`PoolConfig`]**: Pool size, acquire timeout, busy timeout and journal mode
//! - **[`Error`]**: Error type for pool operations
//!
//! ## Guarantees
//!
//! - **Bounded**: never more than `max_connections` connections exist at once
//! - **Fair**: blocked acquirers are served in arrival order
//! - **Timed**: `acquire` gives up with [`Error::PoolExhausted`] after the acquire timeout
//! - **Cancel-safe**: dropping an `acquire` future never leaks a connection
//! - **Configured once**: journal mode and busy timeout are applied when a
//!   connection is opened and never changed afterwards

mod config;
mod connection;
mod error;
mod pool;

// Re-export public types
pub use config::{JournalMode, PoolConfig, Synchronous};
pub use error::{Error, Result};
pub use pool::{ConnectionPool, PoolStats, PooledConnection};
