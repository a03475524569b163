//! # sqlite-gateway
//!
//! HTTP access to a single SQLite database: user CRUD, ad-hoc queries and
//! transactions, served by axum on top of [`sqlx_sqlite_toolkit::DataAccess`].
//!
//! Writes are retried with exponential backoff while SQLite reports lock
//! contention; a pool that stays exhausted or locked answers `503`.

pub mod config;
pub mod error;
pub mod routes;
pub mod server;
pub mod users;

pub use config::ServerArgs;
pub use error::{ApiError, ApiResult};
pub use server::{AppState, create_router, run_server};
pub use users::{NewUser, User, UserStats, UserStore, UserUpdate};
