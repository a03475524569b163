//! Retry executor: runs an [`Operation`] on a pooled connection and retries it
//! with exponential backoff while SQLite reports lock contention.

use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx_sqlite_pool::ConnectionPool;
use tracing::{debug, trace, warn};

use crate::operation::Operation;
use crate::{Error, Result};

/// How often and how patiently to retry transient lock failures.
///
/// The delay before attempt `n + 1` is `min(base_delay * 2^(n-1), max_delay)`,
/// scaled by a random factor in `[1 - jitter, 1 + jitter]` so that callers
/// that collided once do not collide again in lockstep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
   /// Total attempts including the first one. At least 1.
   pub max_attempts: u32,
   pub base_delay: Duration,
   pub max_delay: Duration,
   /// Fraction in `[0, 1)`.
   pub jitter: f64,
}

impl Default for RetryPolicy {
   fn default() -> Self {
      Self {
         max_attempts: 5,
         base_delay: Duration::from_millis(50),
         max_delay: Duration::from_secs(2),
         jitter: 0.2,
      }
   }
}

impl RetryPolicy {
   /// Build a validated policy.
   pub fn new(
      max_attempts: u32,
      base_delay: Duration,
      max_delay: Duration,
      jitter: f64,
   ) -> Result<Self> {
      let policy = Self {
         max_attempts,
         base_delay,
         max_delay,
         jitter,
      };
      policy.validate()?;
      Ok(policy)
   }

   /// A policy that makes exactly one attempt.
   pub fn no_retry() -> Self {
      Self {
         max_attempts: 1,
         ..Default::default()
      }
   }

   pub fn validate(&self) -> Result<()> {
      if self.max_attempts == 0 {
         return Err(Error::InvalidRetryPolicy(
            "max_attempts must be at least 1".into(),
         ));
      }
      if !(0.0..1.0).contains(&self.jitter) {
         return Err(Error::InvalidRetryPolicy(format!(
            "jitter must be in [0, 1), got {}",
            self.jitter
         )));
      }
      if self.max_delay < self.base_delay {
         return Err(Error::InvalidRetryPolicy(
            "max_delay must not be smaller than base_delay".into(),
         ));
      }
      Ok(())
   }

   /// Backoff after failed attempt `attempt` (1-based), before jitter.
   pub fn backoff(&self, attempt: u32) -> Duration {
      let exponent = attempt.saturating_sub(1).min(31);
      self
         .base_delay
         .saturating_mul(1u32 << exponent)
         .min(self.max_delay)
   }

   /// Backoff after failed attempt `attempt` with jitter applied.
   pub fn jittered_backoff<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
      let delay = self.backoff(attempt);
      if self.jitter == 0.0 || delay.is_zero() {
         return delay;
      }
      let factor = rng.gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
      delay.mul_f64(factor)
   }
}

/// Lifecycle of one logical request inside the executor.
///
/// ```text
/// Pending → AcquiringConnection → Executing → Committed
///                  ↑                   ↓
///               Backoff ← FailedTransient → RetriesExhausted
///                                      ↓
///                              FailedPermanent
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
   Pending,
   AcquiringConnection { attempt: u32 },
   Executing { attempt: u32 },
   FailedTransient { attempt: u32 },
   Backoff { attempt: u32, delay: Duration },
   Committed { attempts: u32 },
   FailedPermanent { attempts: u32 },
   RetriesExhausted { attempts: u32 },
}

impl RequestState {
   pub fn is_terminal(&self) -> bool {
      matches!(
         self,
         RequestState::Committed { .. }
            | RequestState::FailedPermanent { .. }
            | RequestState::RetriesExhausted { .. }
      )
   }
}

/// Everything the executor observed while running one operation.
#[derive(Debug)]
pub struct RetryOutcome<T> {
   pub result: Result<T>,
   /// Attempts made, counting the first.
   pub attempts: u32,
   /// Backoff delays slept between attempts, in order.
   pub delays: Vec<Duration>,
   /// Terminal state the request ended in.
   pub final_state: RequestState,
   /// Attempts whose statements ran longer than the slow query threshold.
   pub slow_attempts: u32,
}

/// Statements running longer than this are logged as slow unless the executor
/// is given another threshold.
pub const DEFAULT_SLOW_QUERY_THRESHOLD: Duration = Duration::from_secs(1);

/// Runs operations against a [`ConnectionPool`] under a [`RetryPolicy`].
///
/// Every attempt checks out a fresh connection and returns it before
/// sleeping, so a connection that hit a lock is never held across the backoff
/// window.
///
/// Before a connection goes back to the pool the executor asks SQLite whether
/// it is still in autocommit mode. One that is not gets closed.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
   pool: ConnectionPool,
   policy: RetryPolicy,
   slow_query_threshold: Duration,
}

impl RetryExecutor {
   pub fn new(pool: ConnectionPool, policy: RetryPolicy) -> Self {
      Self {
         pool,
         policy,
         slow_query_threshold: DEFAULT_SLOW_QUERY_THRESHOLD,
      }
   }

   pub fn with_slow_query_threshold(mut self, threshold: Duration) -> Self {
      self.slow_query_threshold = threshold;
      self
   }

   pub fn slow_query_threshold(&self) -> Duration {
      self.slow_query_threshold
   }

   pub fn pool(&self) -> &ConnectionPool {
      &self.pool
   }

   pub fn policy(&self) -> &RetryPolicy {
      &self.policy
   }

   /// Run `op`, retrying transient failures.
   pub async fn run<O>(&self, op: &O) -> Result<O::Output>
   where
      O: Operation + ?Sized,
   {
      self.run_recorded(op).await.result
   }

   /// Run `op` once with no retry. The connection lifecycle is the same.
   pub async fn run_once<O>(&self, op: &O) -> Result<O::Output>
   where
      O: Operation + ?Sized,
   {
      self.run_once_recorded(op).await.result
   }

   pub async fn run_once_recorded<O>(&self, op: &O) -> RetryOutcome<O::Output>
   where
      O: Operation + ?Sized,
   {
      self.drive(op, &RetryPolicy::no_retry()).await
   }

   /// Run `op`, retrying transient failures, and report attempts and delays.
   pub async fn run_recorded<O>(&self, op: &O) -> RetryOutcome<O::Output>
   where
      O: Operation + ?Sized,
   {
      self.drive(op, &self.policy).await
   }

   async fn drive<O>(&self, op: &O, policy: &RetryPolicy) -> RetryOutcome<O::Output>
   where
      O: Operation + ?Sized,
   {
      let mut state = RequestState::Pending;
      let mut delays = Vec::new();
      let mut attempt = 1;
      let mut slow_attempts = 0;

      loop {
         transition(&mut state, RequestState::AcquiringConnection { attempt }, op);
         let result = match self.pool.acquire().await {
            Ok(mut conn) => {
               transition(&mut state, RequestState::Executing { attempt }, op);
               let started = Instant::now();
               let result = op.apply(&mut conn).await;
               let elapsed = started.elapsed();
               if elapsed > self.slow_query_threshold {
                  slow_attempts += 1;
                  warn!(operation = op.name(), attempt, ?elapsed, "Slow query detected");
               }

               match conn.sync_transaction_state().await {
                  Ok(_) => conn.release(),
                  Err(e) => {
                     warn!(
                        operation = op.name(),
                        conn_id = conn.id(),
                        error = %e,
                        "Could not read transaction state, discarding connection"
                     );
                     conn.discard();
                  }
               }
               result
            }
            Err(e) => Err(Error::from(e)),
         };

         let err = match result {
            Ok(output) => {
               transition(&mut state, RequestState::Committed { attempts: attempt }, op);
               return RetryOutcome {
                  result: Ok(output),
                  attempts: attempt,
                  delays,
                  final_state: state,
                  slow_attempts,
               };
            }
            Err(err) => err,
         };

         if !err.is_transient() {
            transition(&mut state, RequestState::FailedPermanent { attempts: attempt }, op);
            debug!(operation = op.name(), attempt, error = %err, "Operation failed permanently");
            return RetryOutcome {
               result: Err(err),
               attempts: attempt,
               delays,
               final_state: state,
               slow_attempts,
            };
         }

         transition(&mut state, RequestState::FailedTransient { attempt }, op);

         if attempt >= policy.max_attempts {
            transition(&mut state, RequestState::RetriesExhausted { attempts: attempt }, op);
            warn!(
               operation = op.name(),
               attempts = attempt,
               error = %err,
               "Giving up on operation after repeated lock contention"
            );
            // A single-attempt policy reports the lock failure itself
            let result = if policy.max_attempts == 1 {
               Err(err)
            } else {
               Err(Error::RetriesExhausted {
                  attempts: attempt,
                  last_error: Box::new(err),
               })
            };
            return RetryOutcome {
               result,
               attempts: attempt,
               delays,
               final_state: state,
               slow_attempts,
            };
         }

         let delay = policy.jittered_backoff(attempt, &mut rand::thread_rng());
         transition(&mut state, RequestState::Backoff { attempt, delay }, op);
         debug!(
            operation = op.name(),
            attempt,
            max_attempts = policy.max_attempts,
            ?delay,
            "Database busy, retrying after backoff"
         );

         tokio::time::sleep(delay).await;
         delays.push(delay);
         attempt += 1;
      }
   }
}

fn transition<O: Operation + ?Sized>(state: &mut RequestState, next: RequestState, op: &O) {
   trace!(operation = op.name(), from = ?state, to = ?next, "Request state transition");
   *state = next;
}
