//! Command-line and environment configuration

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use sqlx_sqlite_pool::{JournalMode, PoolConfig};
use sqlx_sqlite_toolkit::RetryPolicy;

/// Server command-line arguments. Every flag can also be set from the
/// environment.
#[derive(Parser, Debug, Clone)]
#[command(name = "sqlite-gateway", version, about)]
pub struct ServerArgs {
   /// Database file path
   #[arg(long, env = "GATEWAY_DB_PATH", default_value = "data/gateway.db")]
   pub db_path: PathBuf,

   /// Bind address
   #[arg(short, long, env = "GATEWAY_BIND", default_value = "0.0.0.0")]
   pub bind: String,

   /// Port to listen on
   #[arg(short, long, env = "GATEWAY_PORT", default_value_t = 5000)]
   pub port: u16,

   /// Request timeout in seconds
   #[arg(long, env = "GATEWAY_REQUEST_TIMEOUT", default_value_t = 30)]
   pub request_timeout: u64,

   /// Maximum pooled connections
   #[arg(long, env = "GATEWAY_MAX_CONNECTIONS", default_value_t = 25)]
   pub max_connections: u32,

   /// Seconds to wait for a free connection before answering 503
   #[arg(long, env = "GATEWAY_ACQUIRE_TIMEOUT", default_value_t = 60)]
   pub acquire_timeout: u64,

   /// SQLite busy timeout in milliseconds
   #[arg(long, env = "GATEWAY_BUSY_TIMEOUT_MS", default_value_t = 5000)]
   pub busy_timeout_ms: u64,

   /// Journal mode (wal, delete, truncate, persist, memory, off)
   #[arg(long, env = "GATEWAY_JOURNAL_MODE", default_value = "wal")]
   pub journal_mode: JournalMode,

   /// Seconds an idle connection is kept; 0 keeps them forever
   #[arg(long, env = "GATEWAY_IDLE_TIMEOUT", default_value_t = 600)]
   pub idle_timeout: u64,

   /// Attempts per write, counting the first
   #[arg(long, env = "GATEWAY_MAX_ATTEMPTS", default_value_t = 5)]
   pub max_attempts: u32,

   /// First backoff delay in milliseconds
   #[arg(long, env = "GATEWAY_RETRY_BASE_MS", default_value_t = 50)]
   pub retry_base_ms: u64,

   /// Backoff cap in milliseconds
   #[arg(long, env = "GATEWAY_RETRY_MAX_MS", default_value_t = 2000)]
   pub retry_max_ms: u64,

   /// Backoff jitter fraction in [0, 1)
   #[arg(long, env = "GATEWAY_RETRY_JITTER", default_value_t = 0.2)]
   pub retry_jitter: f64,

   /// Statements slower than this many milliseconds are logged as slow
   #[arg(long, env = "GATEWAY_SLOW_QUERY_MS", default_value_t = 1000)]
   pub slow_query_ms: u64,
}

impl Default for ServerArgs {
   fn default() -> Self {
      Self {
         db_path: PathBuf::from("data/gateway.db"),
         bind: "0.0.0.0".to_string(),
         port: 5000,
         request_timeout: 30,
         max_connections: 25,
         acquire_timeout: 60,
         busy_timeout_ms: 5000,
         journal_mode: JournalMode::Wal,
         idle_timeout: 600,
         max_attempts: 5,
         retry_base_ms: 50,
         retry_max_ms: 2000,
         retry_jitter: 0.2,
         slow_query_ms: 1000,
      }
   }
}

impl ServerArgs {
   pub fn pool_config(&self) -> PoolConfig {
      PoolConfig {
         max_connections: self.max_connections,
         acquire_timeout: Duration::from_secs(self.acquire_timeout),
         busy_timeout: Duration::from_millis(self.busy_timeout_ms),
         journal_mode: self.journal_mode,
         idle_timeout: (self.idle_timeout > 0).then(|| Duration::from_secs(self.idle_timeout)),
         ..Default::default()
      }
   }

   pub fn retry_policy(&self) -> sqlx_sqlite_toolkit::Result<RetryPolicy> {
      RetryPolicy::new(
         self.max_attempts,
         Duration::from_millis(self.retry_base_ms),
         Duration::from_millis(self.retry_max_ms),
         self.retry_jitter,
      )
   }

   pub fn slow_query_threshold(&self) -> Duration {
      Duration::from_millis(self.slow_query_ms)
   }

   pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
      let addr = format!("{}:{}", self.bind, self.port).parse()?;
      Ok(addr)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_defaults_match_parsed_defaults() {
      let parsed = ServerArgs::try_parse_from(["sqlite-gateway"]).unwrap();
      let defaults = ServerArgs::default();

      assert_eq!(parsed.pool_config(), defaults.pool_config());
      assert_eq!(
         parsed.retry_policy().unwrap(),
         defaults.retry_policy().unwrap()
      );
      assert_eq!(parsed.port, 5000);
      assert_eq!(parsed.slow_query_threshold(), Duration::from_secs(1));
      assert_eq!(parsed.slow_query_threshold(), defaults.slow_query_threshold());
   }

   #[test]
   fn test_pool_config_from_flags() {
      let args = ServerArgs::try_parse_from([
         "sqlite-gateway",
         "--max-connections",
         "4",
         "--journal-mode",
         "delete",
         "--idle-timeout",
         "0",
         "--busy-timeout-ms",
         "250",
      ])
      .unwrap();

      let config = args.pool_config();
      assert_eq!(config.max_connections, 4);
      assert_eq!(config.journal_mode, JournalMode::Delete);
      assert_eq!(config.idle_timeout, None);
      assert_eq!(config.busy_timeout, Duration::from_millis(250));
   }

   #[test]
   fn test_unknown_journal_mode_rejected() {
      assert!(ServerArgs::try_parse_from(["sqlite-gateway", "--journal-mode", "sideways"]).is_err());
   }

   #[test]
   fn test_bad_jitter_rejected() {
      let args = ServerArgs {
         retry_jitter: 1.5,
         ..Default::default()
      };
      assert!(args.retry_policy().is_err());
   }

   #[test]
   fn test_socket_addr() {
      let args = ServerArgs {
         bind: "127.0.0.1".into(),
         port: 8080,
         ..Default::default()
      };
      assert_eq!(args.socket_addr().unwrap().to_string(), "127.0.0.1:8080");
   }
}
