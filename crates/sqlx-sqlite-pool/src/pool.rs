//! Bounded connection pool with FIFO-fair checkout

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, trace, warn};

use crate::config::PoolConfig;
use crate::connection::{Connection, connect_options};
use crate::{Error, Result};

/// A pool of SQLite connections to a single database file.
///
/// ## Architecture
///
/// - **`checkout`**: semaphore with `max_connections` permits. A caller holds a
///   permit for as long as it holds a connection. Tokio queues semaphore
///   waiters in arrival order, so blocked acquirers are served first come,
///   first served.
/// - **`state`**: idle set and connection count behind a single mutex. The
///   count includes connections still being opened, so the pool never exceeds
///   `max_connections` even while a connect is in flight.
///
/// ## Usage Pattern
///
/// ```text
/// 1. Open the pool (one connection is opened eagerly to settle the journal mode)
/// 2. acquire() a PooledConnection, use it like a SqliteConnection
/// 3. Drop (or release()) the guard to return it; the next waiter wakes
/// 4. close() when done; later acquires fail with PoolClosed
/// ```
///
/// Cloning is cheap and every clone refers to the same pool.
#[derive(Debug, Clone)]
pub struct ConnectionPool {
   inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
   path: PathBuf,
   config: PoolConfig,
   options: SqliteConnectOptions,
   checkout: Arc<Semaphore>,
   state: Mutex<PoolState>,
   /// Only flipped while `state` is locked, so a release can never slip a
   /// connection into the idle set after `close` drained it.
   closed: AtomicBool,
   next_id: AtomicU64,
}

#[derive(Debug, Default)]
struct PoolState {
   idle: VecDeque<Connection>,
   /// Open connections (idle or checked out) plus connects in flight
   size: u32,
}

/// Point-in-time view of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
   pub max_connections: u32,
   /// Connections currently open, idle or checked out
   pub size: u32,
   pub idle: u32,
   /// Callers currently holding (or opening) a connection
   pub in_use: u32,
   pub closed: bool,
}

enum Checkout {
   Idle(Connection),
   Create,
}

impl ConnectionPool {
   /// Open a pool for the database at `path`, creating the file and its parent
   /// directory if needed.
   pub async fn open(path: impl AsRef<Path>, config: PoolConfig) -> Result<Self> {
      config.validate()?;

      let path = path.as_ref().to_path_buf();
      if let Some(parent) = path.parent()
         && !parent.as_os_str().is_empty()
      {
         std::fs::create_dir_all(parent)?;
      }

      let options = connect_options(&path, &config);
      let permits = config.max_connections as usize;

      let pool = Self {
         inner: Arc::new(PoolInner {
            path,
            config,
            options,
            checkout: Arc::new(Semaphore::new(permits)),
            state: Mutex::new(PoolState::default()),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
         }),
      };

      // The first connection switches the file into the configured journal
      // mode before any concurrent caller shows up.
      pool.acquire().await?.release();

      info!(
         path = %pool.inner.path.display(),
         max_connections = pool.inner.config.max_connections,
         journal_mode = ?pool.inner.config.journal_mode,
         "Opened connection pool"
      );

      Ok(pool)
   }

   /// Acquire a connection, waiting up to the configured `acquire_timeout`.
   pub async fn acquire(&self) -> Result<PooledConnection> {
      self.acquire_timeout(self.inner.config.acquire_timeout).await
   }

   /// Acquire a connection, waiting up to `timeout`.
   ///
   /// Waiters are served in the order they started waiting. Dropping the
   /// returned future at any point never leaks a connection or a permit.
   pub async fn acquire_timeout(&self, timeout: Duration) -> Result<PooledConnection> {
      if self.is_closed() {
         return Err(Error::PoolClosed);
      }

      let attempt = async {
         let permit = Arc::clone(&self.inner.checkout)
            .acquire_owned()
            .await
            .map_err(|_| Error::PoolClosed)?;

         let conn = self.inner.checkout_connection().await?;
         trace!(conn_id = conn.id(), "Checked out connection");

         Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            _permit: permit,
         })
      };

      match tokio::time::timeout(timeout, attempt).await {
         Ok(result) => result,
         Err(_) => {
            warn!(
               ?timeout,
               max_connections = self.inner.config.max_connections,
               "Timed out waiting for a pooled connection"
            );
            Err(Error::PoolExhausted {
               timeout,
               max_connections: self.inner.config.max_connections,
            })
         }
      }
   }

   /// Close the pool.
   ///
   /// Wakes every waiting acquirer with [`Error::PoolClosed`], closes idle
   /// connections, and arranges for checked-out connections to be closed when
   /// they are released. Calling this more than once is harmless.
   pub async fn close(&self) {
      let drained: Vec<Connection> = {
         let mut state = self.inner.state.lock();
         if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
         }
         self.inner.checkout.close();
         let drained: Vec<Connection> = state.idle.drain(..).collect();
         state.size -= drained.len() as u32;
         drained
      };

      debug!(idle = drained.len(), "Closing idle connections");
      for conn in drained {
         conn.close().await;
      }

      info!(path = %self.inner.path.display(), "Closed connection pool");
   }

   pub fn is_closed(&self) -> bool {
      self.inner.closed.load(Ordering::Acquire)
   }

   pub fn config(&self) -> &PoolConfig {
      &self.inner.config
   }

   pub fn path(&self) -> &Path {
      &self.inner.path
   }

   pub fn stats(&self) -> PoolStats {
      let max_connections = self.inner.config.max_connections;
      let state = self.inner.state.lock();
      let available = self.inner.checkout.available_permits() as u32;

      PoolStats {
         max_connections,
         size: state.size,
         idle: state.idle.len() as u32,
         in_use: max_connections.saturating_sub(available),
         closed: self.is_closed(),
      }
   }
}

impl PoolInner {
   /// Hand out an idle connection or open a new one. The caller already holds
   /// a checkout permit.
   async fn checkout_connection(&self) -> Result<Connection> {
      let (checkout, stale) = self.take_idle_or_reserve();

      // Dropping a SqliteConnection shuts down its worker and closes the
      // handle, so stale connections need no await here.
      if !stale.is_empty() {
         debug!(count = stale.len(), "Discarding connections past idle timeout");
         drop(stale);
      }

      match checkout {
         Checkout::Idle(conn) => Ok(conn),
         Checkout::Create => {
            let reservation = SizeReservation {
               state: &self.state,
               armed: true,
            };
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let conn = Connection::open(id, &self.options).await?;
            reservation.keep();
            Ok(conn)
         }
      }
   }

   fn take_idle_or_reserve(&self) -> (Checkout, Vec<Connection>) {
      let mut state = self.state.lock();

      let mut stale = Vec::new();
      if let Some(idle_timeout) = self.config.idle_timeout {
         // Oldest connections sit at the front
         while state
            .idle
            .front()
            .is_some_and(|conn| conn.idle_for() > idle_timeout)
         {
            if let Some(conn) = state.idle.pop_front() {
               stale.push(conn);
            }
         }
         state.size -= stale.len() as u32;
      }

      let checkout = match state.idle.pop_back() {
         Some(conn) => Checkout::Idle(conn),
         None => {
            state.size += 1;
            debug_assert!(state.size <= self.config.max_connections);
            Checkout::Create
         }
      };

      (checkout, stale)
   }

   fn release(&self, mut conn: Connection) {
      let discarded = {
         let mut state = self.state.lock();
         if conn.has_open_transaction() || self.closed.load(Ordering::Acquire) {
            state.size -= 1;
            Some(conn)
         } else {
            conn.touch();
            trace!(conn_id = conn.id(), "Returned connection to idle set");
            state.idle.push_back(conn);
            None
         }
      };

      if let Some(conn) = discarded {
         if conn.has_open_transaction() {
            warn!(
               conn_id = conn.id(),
               "Connection released inside an unfinished transaction; closing it so the transaction rolls back"
            );
         }
         drop(conn);
      }
   }

   fn forget(&self, conn: Connection) {
      self.state.lock().size -= 1;
      debug!(conn_id = conn.id(), "Discarded connection");
      drop(conn);
   }
}

/// Undoes a size reservation if opening the connection fails or the acquiring
/// future is dropped mid-connect.
struct SizeReservation<'a> {
   state: &'a Mutex<PoolState>,
   armed: bool,
}

impl SizeReservation<'_> {
   fn keep(mut self) {
      self.armed = false;
   }
}

impl Drop for SizeReservation<'_> {
   fn drop(&mut self) {
      if self.armed {
         self.state.lock().size -= 1;
      }
   }
}

/// RAII guard for a checked-out connection.
///
/// Dereferences to `SqliteConnection`, so it can be passed anywhere sqlx
/// expects an executor (`&mut *conn`). Dropping the guard returns the
/// connection to the pool.
#[must_use = "if unused, the connection is immediately returned to the pool"]
#[derive(Debug)]
pub struct PooledConnection {
   conn: Option<Connection>,
   pool: Arc<PoolInner>,
   // Declared after `conn`: `Drop::drop` puts the connection back before this
   // permit is released and the next waiter wakes.
   _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
   fn connection(&self) -> &Connection {
      self.conn.as_ref().expect("connection already returned")
   }

   fn connection_mut(&mut self) -> &mut Connection {
      self.conn.as_mut().expect("connection already returned")
   }

   pub fn id(&self) -> u64 {
      self.connection().id()
   }

   pub fn has_open_transaction(&self) -> bool {
      self.connection().has_open_transaction()
   }

   /// Return the connection to the pool. Equivalent to dropping the guard.
   pub fn release(self) {
      drop(self);
   }

   /// Close the connection instead of returning it to the pool, freeing its
   /// slot for a fresh one.
   pub fn discard(mut self) {
      if let Some(conn) = self.conn.take() {
         self.pool.forget(conn);
      }
   }

   /// Start a write transaction, taking the database write lock up front.
   pub async fn begin_immediate(&mut self) -> Result<()> {
      // Marked before issuing BEGIN so a cancelled BEGIN still gets the
      // connection discarded rather than pooled.
      self.connection_mut().set_open_transaction(true);
      match sqlx::query("BEGIN IMMEDIATE").execute(&mut **self).await {
         Ok(_) => Ok(()),
         Err(e) => {
            self.connection_mut().set_open_transaction(false);
            Err(e.into())
         }
      }
   }

   /// Ask SQLite whether the connection is in autocommit mode.
   ///
   /// A transaction left open by raw SQL (`BEGIN` without `COMMIT`) is not
   /// visible to [`begin_immediate`](Self::begin_immediate) bookkeeping. When
   /// SQLite reports one, the connection is marked so that releasing it closes
   /// it instead of handing the open transaction to the next caller.
   pub async fn sync_transaction_state(&mut self) -> Result<bool> {
      let autocommit = {
         let mut handle = self.connection_mut().raw_mut().lock_handle().await?;
         let db = handle.as_raw_handle().as_ptr();
         // SAFETY: the handle stays locked for the duration of the call, so
         // no other statement runs on this sqlite3 pointer concurrently.
         unsafe { libsqlite3_sys::sqlite3_get_autocommit(db) != 0 }
      };

      if !autocommit {
         self.connection_mut().set_open_transaction(true);
      }
      Ok(autocommit)
   }

   pub async fn commit(&mut self) -> Result<()> {
      sqlx::query("COMMIT").execute(&mut **self).await?;
      self.connection_mut().set_open_transaction(false);
      Ok(())
   }

   pub async fn rollback(&mut self) -> Result<()> {
      sqlx::query("ROLLBACK").execute(&mut **self).await?;
      self.connection_mut().set_open_transaction(false);
      Ok(())
   }
}

impl Deref for PooledConnection {
   type Target = SqliteConnection;

   fn deref(&self) -> &Self::Target {
      self.connection().raw()
   }
}

impl DerefMut for PooledConnection {
   fn deref_mut(&mut self) -> &mut Self::Target {
      self.connection_mut().raw_mut()
   }
}

impl Drop for PooledConnection {
   fn drop(&mut self) {
      if let Some(conn) = self.conn.take() {
         self.pool.release(conn);
      }
   }
}
