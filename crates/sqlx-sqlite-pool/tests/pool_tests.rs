//! Concurrency behavior of the connection pool: bounds, timeouts, fairness,
//! cancellation and shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use sqlx_sqlite_pool::{ConnectionPool, Error, PoolConfig};
use tempfile::TempDir;
use tokio::sync::Mutex;

async fn open_pool(max_connections: u32) -> (ConnectionPool, TempDir) {
   let temp_dir = TempDir::new().expect("Failed to create temp directory");
   let config = PoolConfig {
      max_connections,
      acquire_timeout: Duration::from_secs(5),
      ..Default::default()
   };
   let pool = ConnectionPool::open(temp_dir.path().join("pool.db"), config)
      .await
      .expect("Failed to open pool");
   (pool, temp_dir)
}

// ─── Bounds ───

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn never_exceeds_max_connections_under_contention() {
   let (pool, _temp) = open_pool(3).await;
   let current = Arc::new(AtomicU32::new(0));
   let peak = Arc::new(AtomicU32::new(0));

   let mut handles = Vec::new();
   for _ in 0..30 {
      let pool = pool.clone();
      let current = Arc::clone(&current);
      let peak = Arc::clone(&peak);
      handles.push(tokio::spawn(async move {
         let conn = pool.acquire().await.expect("acquire should succeed");
         let now = current.fetch_add(1, Ordering::SeqCst) + 1;
         peak.fetch_max(now, Ordering::SeqCst);
         assert!(pool.stats().size <= 3);

         tokio::time::sleep(Duration::from_millis(5)).await;

         current.fetch_sub(1, Ordering::SeqCst);
         drop(conn);
      }));
   }

   for handle in handles {
      handle.await.unwrap();
   }

   assert!(peak.load(Ordering::SeqCst) <= 3);
   assert!(peak.load(Ordering::SeqCst) >= 1);

   let stats = pool.stats();
   assert!(stats.size <= 3);
   assert_eq!(stats.in_use, 0);
}

#[tokio::test]
async fn single_connection_pool_serializes_callers() {
   let (pool, _temp) = open_pool(1).await;
   {
      let mut conn = pool.acquire().await.unwrap();
      sqlx::query("CREATE TABLE counter (n INTEGER NOT NULL)")
         .execute(&mut *conn)
         .await
         .unwrap();
      sqlx::query("INSERT INTO counter (n) VALUES (0)")
         .execute(&mut *conn)
         .await
         .unwrap();
   }

   let mut handles = Vec::new();
   for _ in 0..10 {
      let pool = pool.clone();
      handles.push(tokio::spawn(async move {
         let mut conn = pool.acquire().await.unwrap();
         let (n,): (i64,) = sqlx::query_as("SELECT n FROM counter")
            .fetch_one(&mut *conn)
            .await
            .unwrap();
         tokio::task::yield_now().await;
         sqlx::query("UPDATE counter SET n = $1")
            .bind(n + 1)
            .execute(&mut *conn)
            .await
            .unwrap();
      }));
   }

   tokio::time::timeout(Duration::from_secs(5), async {
      for handle in handles {
         handle.await.unwrap();
      }
   })
   .await
   .expect("single-connection pool deadlocked");

   let mut conn = pool.acquire().await.unwrap();
   let (n,): (i64,) = sqlx::query_as("SELECT n FROM counter")
      .fetch_one(&mut *conn)
      .await
      .unwrap();
   // Read-modify-write without lost updates proves exclusive checkout
   assert_eq!(n, 10);
}

// ─── Timeouts ───

#[tokio::test]
async fn acquire_times_out_with_pool_exhausted() {
   let (pool, _temp) = open_pool(1).await;
   let _held = pool.acquire().await.unwrap();

   let started = Instant::now();
   let err = pool
      .acquire_timeout(Duration::from_millis(100))
      .await
      .unwrap_err();
   let waited = started.elapsed();

   match err {
      Error::PoolExhausted {
         timeout,
         max_connections,
      } => {
         assert_eq!(timeout, Duration::from_millis(100));
         assert_eq!(max_connections, 1);
      }
      other => panic!("expected PoolExhausted, got {other:?}"),
   }
   assert!(waited >= Duration::from_millis(100));
   assert!(waited < Duration::from_secs(2));
}

#[tokio::test]
async fn waiter_receives_connection_freed_before_timeout() {
   let (pool, _temp) = open_pool(1).await;
   let held = pool.acquire().await.unwrap();
   let held_id = held.id();

   let waiter = {
      let pool = pool.clone();
      tokio::spawn(async move { pool.acquire_timeout(Duration::from_secs(2)).await })
   };

   tokio::time::sleep(Duration::from_millis(50)).await;
   drop(held);

   let conn = waiter.await.unwrap().expect("waiter should get the connection");
   assert_eq!(conn.id(), held_id);
}

// ─── Fairness ───

#[tokio::test]
async fn waiters_are_served_in_arrival_order() {
   let (pool, _temp) = open_pool(1).await;
   let held = pool.acquire().await.unwrap();
   let order = Arc::new(Mutex::new(Vec::new()));

   let mut handles = Vec::new();
   for name in ["A", "B", "C"] {
      let pool = pool.clone();
      let order = Arc::clone(&order);
      handles.push(tokio::spawn(async move {
         let conn = pool.acquire().await.unwrap();
         order.lock().await.push(name);
         tokio::time::sleep(Duration::from_millis(10)).await;
         drop(conn);
      }));
      // Give each waiter time to enqueue before the next one arrives
      tokio::time::sleep(Duration::from_millis(30)).await;
   }

   drop(held);
   for handle in handles {
      handle.await.unwrap();
   }

   assert_eq!(*order.lock().await, vec!["A", "B", "C"]);
}

// ─── Cancellation ───

#[tokio::test]
async fn cancelled_acquire_does_not_leak_connection() {
   let (pool, _temp) = open_pool(1).await;
   let held = pool.acquire().await.unwrap();

   let waiter = {
      let pool = pool.clone();
      tokio::spawn(async move {
         let conn = pool.acquire().await;
         // Hold forever if we got it, so only cancellation can release it
         std::future::pending::<()>().await;
         drop(conn);
      })
   };

   tokio::time::sleep(Duration::from_millis(50)).await;

   // Free the connection and cancel the waiter right at the handoff
   drop(held);
   waiter.abort();
   let _ = waiter.await;

   let conn = pool
      .acquire_timeout(Duration::from_millis(500))
      .await
      .expect("connection should be back in the pool after cancellation");
   drop(conn);

   let stats = pool.stats();
   assert_eq!(stats.in_use, 0);
   assert_eq!(stats.size, 1);
   assert_eq!(stats.idle, 1);
}

#[tokio::test]
async fn timed_out_waiter_leaves_queue() {
   let (pool, _temp) = open_pool(1).await;
   let held = pool.acquire().await.unwrap();

   assert!(
      pool
         .acquire_timeout(Duration::from_millis(20))
         .await
         .is_err()
   );
   drop(held);

   // The timed-out waiter must not swallow the freed permit
   pool
      .acquire_timeout(Duration::from_millis(200))
      .await
      .expect("freed connection should be available");
}

// ─── Shutdown ───

#[tokio::test]
async fn close_wakes_blocked_acquirers() {
   let (pool, _temp) = open_pool(1).await;
   let held = pool.acquire().await.unwrap();

   let waiter = {
      let pool = pool.clone();
      tokio::spawn(async move { pool.acquire_timeout(Duration::from_secs(10)).await })
   };
   tokio::time::sleep(Duration::from_millis(30)).await;

   pool.close().await;

   let result = tokio::time::timeout(Duration::from_secs(1), waiter)
      .await
      .expect("waiter should wake on close")
      .unwrap();
   assert!(matches!(result, Err(Error::PoolClosed)));

   drop(held);
   assert_eq!(pool.stats().size, 0);
}

#[tokio::test]
async fn acquire_after_close_fails() {
   let (pool, _temp) = open_pool(2).await;
   pool.close().await;

   assert!(matches!(pool.acquire().await, Err(Error::PoolClosed)));
}
