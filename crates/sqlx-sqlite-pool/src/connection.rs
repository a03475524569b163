//! A single SQLite connection and the policy applied when it is opened

use std::path::Path;
use std::time::{Duration, Instant};

use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{ConnectOptions, Connection as _};
use tracing::{debug, warn};

use crate::Result;
use crate::config::PoolConfig;

/// Build the connect options every pooled connection is opened with.
///
/// Journal mode and busy timeout are part of the options, so sqlx applies them
/// while establishing the connection and before it is ever handed out. Nothing
/// in this crate issues those pragmas afterwards.
pub(crate) fn connect_options(path: &Path, config: &PoolConfig) -> SqliteConnectOptions {
   SqliteConnectOptions::new()
      .filename(path)
      .create_if_missing(true)
      .journal_mode(config.journal_mode.into())
      .busy_timeout(config.busy_timeout)
      .synchronous(config.synchronous.into())
      .foreign_keys(true)
      .pragma("temp_store", "memory")
      // Negative cache_size is in KiB: ~2MB per connection
      .pragma("cache_size", "-2000")
      .disable_statement_logging()
}

/// A handle to the embedded store owned by exactly one of the pool's idle set
/// or a single caller.
#[derive(Debug)]
pub struct Connection {
   id: u64,
   raw: SqliteConnection,
   last_used: Instant,
   /// Set between `BEGIN` and `COMMIT`/`ROLLBACK`. A connection released with
   /// this still set is closed rather than pooled.
   open_transaction: bool,
}

impl Connection {
   pub(crate) async fn open(id: u64, options: &SqliteConnectOptions) -> Result<Self> {
      let raw = options.connect().await?;
      debug!(conn_id = id, "Opened SQLite connection");

      Ok(Self {
         id,
         raw,
         last_used: Instant::now(),
         open_transaction: false,
      })
   }

   /// Identifier unique within the owning pool
   pub fn id(&self) -> u64 {
      self.id
   }

   pub fn idle_for(&self) -> Duration {
      self.last_used.elapsed()
   }

   pub fn has_open_transaction(&self) -> bool {
      self.open_transaction
   }

   pub(crate) fn set_open_transaction(&mut self, open: bool) {
      self.open_transaction = open;
   }

   pub(crate) fn touch(&mut self) {
      self.last_used = Instant::now();
   }

   pub(crate) fn raw(&self) -> &SqliteConnection {
      &self.raw
   }

   pub(crate) fn raw_mut(&mut self) -> &mut SqliteConnection {
      &mut self.raw
   }

   /// Close the underlying handle, logging rather than failing on error.
   pub(crate) async fn close(self) {
      let id = self.id;
      if let Err(e) = self.raw.close().await {
         warn!(conn_id = id, error = %e, "Failed to close SQLite connection cleanly");
      } else {
         debug!(conn_id = id, "Closed SQLite connection");
      }
   }
}
