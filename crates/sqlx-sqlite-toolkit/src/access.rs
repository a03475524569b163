//! Data access façade: the entry point request handlers talk to.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx_sqlite_pool::{ConnectionPool, PoolConfig, PoolStats};
use tracing::{debug, info};

use crate::decode::JsonRow;
use crate::operation::{BulkInsert, Execute, Operation, Query, Transact};
use crate::retry::{RetryExecutor, RetryOutcome, RetryPolicy};
use crate::statement::{Statement, WriteQueryResult};
use crate::{Error, Result};

/// Pool occupancy plus request counters since the façade was created.
#[derive(Debug, Clone, Serialize)]
pub struct AccessStats {
   #[serde(flatten)]
   pub pool: PoolStats,
   pub total_requests: u64,
   pub total_errors: u64,
   /// Extra attempts made after transient failures
   pub total_retries: u64,
   /// Attempts that ran longer than the slow query threshold
   pub total_slow_queries: u64,
   /// Percentage of requests that failed, 0 to 100
   pub error_rate: f64,
   pub requests_per_second: f64,
   pub uptime_seconds: f64,
}

#[derive(Debug)]
struct Counters {
   started: Instant,
   requests: AtomicU64,
   errors: AtomicU64,
   retries: AtomicU64,
   slow_queries: AtomicU64,
}

/// Cheap to clone; clones share the pool and the counters.
///
/// Writes go through the [`RetryExecutor`]. Reads skip the retry loop when the
/// pool runs in WAL mode, where readers never wait on the writer.
#[derive(Debug, Clone)]
pub struct DataAccess {
   executor: RetryExecutor,
   counters: Arc<Counters>,
}

impl DataAccess {
   /// Open a pool at `path` and wrap it.
   pub async fn open(
      path: impl AsRef<Path>,
      config: PoolConfig,
      policy: RetryPolicy,
   ) -> Result<Self> {
      policy.validate()?;
      let pool = ConnectionPool::open(path, config).await?;
      Self::new(pool, policy)
   }

   pub fn new(pool: ConnectionPool, policy: RetryPolicy) -> Result<Self> {
      policy.validate()?;
      Ok(Self {
         executor: RetryExecutor::new(pool, policy),
         counters: Arc::new(Counters {
            started: Instant::now(),
            requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            slow_queries: AtomicU64::new(0),
         }),
      })
   }

   /// Log and count statements slower than `threshold` instead of the
   /// one second default.
   pub fn with_slow_query_threshold(self, threshold: Duration) -> Self {
      Self {
         executor: self.executor.with_slow_query_threshold(threshold),
         counters: self.counters,
      }
   }

   pub fn pool(&self) -> &ConnectionPool {
      self.executor.pool()
   }

   pub fn executor(&self) -> &RetryExecutor {
      &self.executor
   }

   /// Execute a write query (INSERT/UPDATE/DELETE)
   pub async fn execute(
      &self,
      query: impl Into<String>,
      values: Vec<JsonValue>,
   ) -> Result<WriteQueryResult> {
      self.write(&Execute(Statement::new(query, values))).await
   }

   /// Execute a SELECT query, possibly returning multiple rows
   pub async fn query(&self, query: impl Into<String>, values: Vec<JsonValue>) -> Result<Vec<JsonRow>> {
      self.read(&Query(Statement::new(query, values))).await
   }

   /// Execute a SELECT query expecting zero or one result
   pub async fn fetch_one(
      &self,
      query: impl Into<String>,
      values: Vec<JsonValue>,
   ) -> Result<Option<JsonRow>> {
      let query = query.into();
      // Two rows are enough to tell "one" from "more than one"
      let limited = format!("{} LIMIT 2", query.trim_end().trim_end_matches(';'));

      let mut rows = self.read(&Query(Statement::new(limited, values))).await?;
      match rows.len() {
         0 => Ok(None),
         1 => Ok(rows.pop()),
         count => {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            Err(Error::MultipleRowsReturned(count))
         }
      }
   }

   /// Run `statements` atomically. Returns the result of each statement.
   pub async fn transact(&self, statements: Vec<Statement>) -> Result<Vec<WriteQueryResult>> {
      if statements.is_empty() {
         return Ok(Vec::new());
      }
      self.write(&Transact(statements)).await
   }

   /// Insert `records` into `table` in one transaction and return their row ids.
   pub async fn bulk_insert(
      &self,
      table: impl Into<String>,
      records: Vec<JsonRow>,
   ) -> Result<Vec<i64>> {
      let op = match BulkInsert::new(table, records) {
         Ok(op) => op,
         Err(e) => {
            self.record(1, 0, false);
            return Err(e);
         }
      };
      if op.is_empty() {
         return Ok(Vec::new());
      }

      debug!(table = op.table(), records = op.len(), "Bulk insert");
      self.write(&op).await
   }

   pub fn stats(&self) -> AccessStats {
      let total_requests = self.counters.requests.load(Ordering::Relaxed);
      let total_errors = self.counters.errors.load(Ordering::Relaxed);
      let uptime_seconds = self.counters.started.elapsed().as_secs_f64();

      AccessStats {
         pool: self.pool().stats(),
         total_requests,
         total_errors,
         total_retries: self.counters.retries.load(Ordering::Relaxed),
         total_slow_queries: self.counters.slow_queries.load(Ordering::Relaxed),
         error_rate: ratio(total_errors as f64, total_requests as f64) * 100.0,
         requests_per_second: ratio(total_requests as f64, uptime_seconds),
         uptime_seconds,
      }
   }

   /// Close the underlying pool. Later calls fail with [`Error::PoolClosed`].
   pub async fn close(&self) {
      self.pool().close().await;
      info!(path = %self.pool().path().display(), "Data access closed");
   }

   async fn write<O>(&self, op: &O) -> Result<O::Output>
   where
      O: Operation + ?Sized,
   {
      let outcome = self.executor.run_recorded(op).await;
      self.count(&outcome);
      outcome.result
   }

   async fn read<O>(&self, op: &O) -> Result<O::Output>
   where
      O: Operation + ?Sized,
   {
      if self.pool().config().journal_mode.allows_lock_free_reads() {
         let outcome = self.executor.run_once_recorded(op).await;
         self.count(&outcome);
         outcome.result
      } else {
         self.write(op).await
      }
   }

   fn count<T>(&self, outcome: &RetryOutcome<T>) {
      self.record(outcome.attempts, outcome.slow_attempts, outcome.result.is_ok());
   }

   fn record(&self, attempts: u32, slow_attempts: u32, succeeded: bool) {
      self.counters.requests.fetch_add(1, Ordering::Relaxed);
      if slow_attempts > 0 {
         self
            .counters
            .slow_queries
            .fetch_add(u64::from(slow_attempts), Ordering::Relaxed);
      }
      if attempts > 1 {
         self
            .counters
            .retries
            .fetch_add(u64::from(attempts - 1), Ordering::Relaxed);
      }
      if !succeeded {
         self.counters.errors.fetch_add(1, Ordering::Relaxed);
      }
   }
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
   if denominator > 0.0 {
      numerator / denominator
   } else {
      0.0
   }
}
