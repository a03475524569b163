//! Configuration for SQLite connection pools

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteJournalMode, SqliteSynchronous};

use crate::{Error, Result};

/// SQLite journal mode applied to every connection when it is opened.
///
/// Values map 1:1 to the `journal_mode` pragma.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalMode {
   /// Write-ahead log: readers never block the single writer and vice versa.
   #[default]
   Wal,
   Delete,
   Truncate,
   Persist,
   Memory,
   Off,
}

impl JournalMode {
   /// Whether readers can proceed without taking locks that writers contend on.
   pub fn allows_lock_free_reads(self) -> bool {
      matches!(self, JournalMode::Wal)
   }

   /// The lowercase value SQLite reports from `PRAGMA journal_mode`.
   pub fn pragma_value(self) -> &'static str {
      match self {
         JournalMode::Wal => "wal",
         JournalMode::Delete => "delete",
         JournalMode::Truncate => "truncate",
         JournalMode::Persist => "persist",
         JournalMode::Memory => "memory",
         JournalMode::Off => "off",
      }
   }
}

impl From<JournalMode> for SqliteJournalMode {
   fn from(mode: JournalMode) -> Self {
      match mode {
         JournalMode::Wal => SqliteJournalMode::Wal,
         JournalMode::Delete => SqliteJournalMode::Delete,
         JournalMode::Truncate => SqliteJournalMode::Truncate,
         JournalMode::Persist => SqliteJournalMode::Persist,
         JournalMode::Memory => SqliteJournalMode::Memory,
         JournalMode::Off => SqliteJournalMode::Off,
      }
   }
}

impl std::str::FromStr for JournalMode {
   type Err = Error;

   fn from_str(s: &str) -> Result<Self> {
      match s.to_ascii_lowercase().as_str() {
         "wal" => Ok(JournalMode::Wal),
         "delete" => Ok(JournalMode::Delete),
         "truncate" => Ok(JournalMode::Truncate),
         "persist" => Ok(JournalMode::Persist),
         "memory" => Ok(JournalMode::Memory),
         "off" => Ok(JournalMode::Off),
         other => Err(Error::InvalidConfig(format!("unknown journal mode '{other}'"))),
      }
   }
}

/// SQLite `synchronous` pragma setting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Synchronous {
   Off,
   /// Safe under WAL and noticeably faster than `Full`.
   #[default]
   Normal,
   Full,
   Extra,
}

impl From<Synchronous> for SqliteSynchronous {
   fn from(value: Synchronous) -> Self {
      match value {
         Synchronous::Off => SqliteSynchronous::Off,
         Synchronous::Normal => SqliteSynchronous::Normal,
         Synchronous::Full => SqliteSynchronous::Full,
         Synchronous::Extra => SqliteSynchronous::Extra,
      }
   }
}

/// Configuration for [`ConnectionPool`](crate::ConnectionPool)
///
/// # Examples
///
/// ```
/// use sqlx_sqlite_pool::{JournalMode, PoolConfig};
/// use std::time::Duration;
///
/// // Use defaults
/// let config = PoolConfig::default();
///
/// // Override just a few fields
/// let config = PoolConfig {
///    max_connections: 2,
///    acquire_timeout: Duration::from_millis(500),
///    journal_mode: JournalMode::Wal,
///    ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
   /// Maximum number of connections that may exist at once, idle or checked out.
   ///
   /// Default: 25
   pub max_connections: u32,

   /// How long `acquire` waits for a connection before giving up with
   /// [`Error::PoolExhausted`].
   ///
   /// Default: 60 seconds
   pub acquire_timeout: Duration,

   /// SQLite busy handler timeout, applied to each connection when opened.
   ///
   /// Default: 5 seconds
   pub busy_timeout: Duration,

   /// Journal mode, applied to each connection when opened.
   ///
   /// Default: WAL
   pub journal_mode: JournalMode,

   /// Default: NORMAL
   pub synchronous: Synchronous,

   /// Idle connections older than this are closed instead of being handed out.
   /// `None` keeps idle connections forever.
   ///
   /// Default: 10 minutes
   pub idle_timeout: Option<Duration>,
}

impl Default for PoolConfig {
   fn default() -> Self {
      Self {
         max_connections: 25,
         acquire_timeout: Duration::from_secs(60),
         busy_timeout: Duration::from_secs(5),
         journal_mode: JournalMode::Wal,
         synchronous: Synchronous::Normal,
         idle_timeout: Some(Duration::from_secs(600)),
      }
   }
}

impl PoolConfig {
   /// Reject configurations the pool cannot honor.
   pub fn validate(&self) -> Result<()> {
      if self.max_connections == 0 {
         return Err(Error::InvalidConfig(
            "max_connections must be greater than zero".into(),
         ));
      }
      if let Some(idle) = self.idle_timeout
         && idle.is_zero()
      {
         return Err(Error::InvalidConfig(
            "idle_timeout must be greater than zero when set".into(),
         ));
      }
      Ok(())
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_defaults_are_valid() {
      let config = PoolConfig::default();
      assert!(config.validate().is_ok());
      assert_eq!(config.journal_mode, JournalMode::Wal);
      assert_eq!(config.max_connections, 25);
   }

   #[test]
   fn test_zero_connections_rejected() {
      let config = PoolConfig {
         max_connections: 0,
         ..Default::default()
      };
      let err = config.validate().unwrap_err();
      assert!(err.to_string().contains("max_connections"));
   }

   #[test]
   fn test_zero_idle_timeout_rejected() {
      let config = PoolConfig {
         idle_timeout: Some(Duration::ZERO),
         ..Default::default()
      };
      assert!(config.validate().is_err());
   }

   #[test]
   fn test_journal_mode_parsing() {
      assert_eq!("WAL".parse::<JournalMode>().unwrap(), JournalMode::Wal);
      assert_eq!("delete".parse::<JournalMode>().unwrap(), JournalMode::Delete);
      assert!("sideways".parse::<JournalMode>().is_err());
      assert!(JournalMode::Wal.allows_lock_free_reads());
      assert!(!JournalMode::Delete.allows_lock_free_reads());
   }
}
