//! Statements and write results exchanged with the data access layer

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::Sqlite;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteQueryResult};

use crate::decode::bind_value;
use crate::{Error, Result};

/// Pragmas the pool applies when it opens a connection. Assigning them later
/// would change the connection for every caller after this one.
const CONNECTION_PRAGMAS: [&str; 8] = [
   "JOURNAL_MODE",
   "BUSY_TIMEOUT",
   "SYNCHRONOUS",
   "FOREIGN_KEYS",
   "TEMP_STORE",
   "CACHE_SIZE",
   "LOCKING_MODE",
   "QUERY_ONLY",
];

/// What a SQL statement does, judged by its leading keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
   /// `SELECT`, `VALUES`, or a `WITH` clause feeding a `SELECT`
   Select,
   /// `INSERT` or `REPLACE`
   Insert,
   /// `UPDATE` or `DELETE`
   Update,
   /// `BEGIN`, `COMMIT`, `END`, `ROLLBACK`, `SAVEPOINT`, `RELEASE`
   TransactionControl,
   Pragma,
   /// `ATTACH` or `DETACH`
   Attachment,
   /// Schema changes and everything else
   Other,
}

impl StatementKind {
   pub fn as_str(&self) -> &'static str {
      match self {
         StatementKind::Select => "SELECT",
         StatementKind::Insert => "INSERT",
         StatementKind::Update => "UPDATE/DELETE",
         StatementKind::TransactionControl => "transaction control",
         StatementKind::Pragma => "PRAGMA",
         StatementKind::Attachment => "ATTACH/DETACH",
         StatementKind::Other => "other",
      }
   }

   fn of(tokens: &[String]) -> Self {
      let Some(first) = tokens.first() else {
         return StatementKind::Other;
      };
      match first.as_str() {
         "SELECT" | "VALUES" => StatementKind::Select,
         "INSERT" | "REPLACE" => StatementKind::Insert,
         "UPDATE" | "DELETE" => StatementKind::Update,
         "BEGIN" | "COMMIT" | "END" | "ROLLBACK" | "SAVEPOINT" | "RELEASE" => {
            StatementKind::TransactionControl
         }
         "PRAGMA" => StatementKind::Pragma,
         "ATTACH" | "DETACH" => StatementKind::Attachment,
         // The statement after a CTE is the first DML keyword, or a SELECT
         "WITH" => tokens
            .iter()
            .find_map(|token| match token.as_str() {
               "INSERT" | "REPLACE" => Some(StatementKind::Insert),
               "UPDATE" | "DELETE" => Some(StatementKind::Update),
               _ => None,
            })
            .unwrap_or(StatementKind::Select),
         _ => StatementKind::Other,
      }
   }
}

impl fmt::Display for StatementKind {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(self.as_str())
   }
}

/// A parameterized SQL statement with its bind values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
   pub query: String,
   #[serde(default, alias = "params")]
   pub values: Vec<JsonValue>,
}

impl Statement {
   pub fn new(query: impl Into<String>, values: Vec<JsonValue>) -> Self {
      Self {
         query: query.into(),
         values,
      }
   }

   /// Kind of each `;`-separated statement in the query text, in order.
   pub fn kinds(&self) -> Vec<StatementKind> {
      tokenize(&self.query)
         .iter()
         .map(|tokens| StatementKind::of(tokens))
         .collect()
   }

   /// Require every statement in the query text to be of kind `expected`.
   pub fn expect_kind(&self, expected: StatementKind) -> Result<()> {
      let kinds = self.kinds();
      match kinds.iter().find(|kind| **kind != expected) {
         None if !kinds.is_empty() => Ok(()),
         found => Err(Error::UnexpectedStatementKind {
            expected,
            found: found.copied(),
         }),
      }
   }

   /// Reject statements that would change the connection for later callers:
   /// transaction control, `ATTACH`/`DETACH`, and assignments to the pragmas
   /// set when the connection was opened.
   ///
   /// Transactions belong to [`Transact`](crate::Transact), which tracks them
   /// on the pooled connection.
   pub(crate) fn check_connection_state(&self) -> Result<()> {
      for tokens in tokenize(&self.query) {
         match StatementKind::of(&tokens) {
            StatementKind::TransactionControl => {
               return Err(refused(format!(
                  "{} is not allowed here; send the statements as one transaction",
                  tokens[0]
               )));
            }
            StatementKind::Attachment => {
               return Err(refused(format!("{} is not allowed", tokens[0])));
            }
            StatementKind::Pragma => {
               let name = tokens.get(1).map(|name| pragma_name(name)).unwrap_or_default();
               let assigns = tokens
                  .get(2)
                  .is_some_and(|token| token == "=" || token == "(");
               if assigns && CONNECTION_PRAGMAS.iter().any(|pragma| *pragma == name) {
                  return Err(refused(format!(
                     "PRAGMA {} is fixed by the connection pool",
                     name.to_ascii_lowercase()
                  )));
               }
            }
            _ => {}
         }
      }
      Ok(())
   }

   /// Build a SQLx query with every value bound in order.
   pub(crate) fn to_query(&self) -> Query<'_, Sqlite, SqliteArguments<'_>> {
      self
         .values
         .iter()
         .cloned()
         .fold(sqlx::query(&self.query), bind_value)
   }
}

/// Result returned from write operations (e.g. INSERT, UPDATE, DELETE).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteQueryResult {
   /// The number of rows affected by the write operation.
   pub rows_affected: u64,
   /// The last inserted row ID (SQLite ROWID).
   ///
   /// Only meaningful for INSERT operations on tables with a ROWID.
   pub last_insert_id: i64,
}

impl From<SqliteQueryResult> for WriteQueryResult {
   fn from(result: SqliteQueryResult) -> Self {
      Self {
         rows_affected: result.rows_affected(),
         last_insert_id: result.last_insert_rowid(),
      }
   }
}

fn refused(message: String) -> Error {
   Error::MalformedStatement(sqlx::Error::InvalidArgument(message))
}

/// `main.journal_mode` names the same pragma as `journal_mode`.
fn pragma_name(token: &str) -> &str {
   token.rsplit('.').next().unwrap_or(token)
}

/// Split `sql` into statements and each statement into upper-cased words plus
/// the `=` and `(` symbols. Comments are dropped and string literals collapse
/// to a single `'` token, so keywords inside them are never seen.
fn tokenize(sql: &str) -> Vec<Vec<String>> {
   let mut statements = Vec::new();
   let mut current: Vec<String> = Vec::new();
   let mut chars = sql.chars().peekable();

   while let Some(c) = chars.next() {
      match c {
         ';' => {
            if !current.is_empty() {
               statements.push(std::mem::take(&mut current));
            }
         }
         '-' if chars.peek() == Some(&'-') => {
            for c in chars.by_ref() {
               if c == '\n' {
                  break;
               }
            }
         }
         '/' if chars.peek() == Some(&'*') => {
            chars.next();
            let mut prev = '\0';
            for c in chars.by_ref() {
               if prev == '*' && c == '/' {
                  break;
               }
               prev = c;
            }
         }
         '\'' => {
            take_quoted(&mut chars, '\'');
            current.push("'".to_string());
         }
         '"' | '`' | '[' => {
            let close = if c == '[' { ']' } else { c };
            current.push(take_quoted(&mut chars, close).to_ascii_uppercase());
         }
         '=' | '(' => current.push(c.to_string()),
         c if c.is_alphanumeric() || c == '_' => {
            let mut word = String::from(c);
            while let Some(&next) = chars.peek() {
               if next.is_alphanumeric() || next == '_' || next == '.' {
                  word.push(next);
                  chars.next();
               } else {
                  break;
               }
            }
            current.push(word.to_ascii_uppercase());
         }
         _ => {}
      }
   }

   if !current.is_empty() {
      statements.push(current);
   }
   statements
}

/// Consume up to the closing `close`, where a doubled `close` is an escaped one.
fn take_quoted(chars: &mut std::iter::Peekable<std::str::Chars<'_>>, close: char) -> String {
   let mut text = String::new();
   while let Some(c) = chars.next() {
      if c == close {
         if close != ']' && chars.peek() == Some(&close) {
            chars.next();
            text.push(c);
            continue;
         }
         break;
      }
      text.push(c);
   }
   text
}

#[cfg(test)]
mod tests {
   use super::*;

   fn kinds(sql: &str) -> Vec<StatementKind> {
      Statement::new(sql, vec![]).kinds()
   }

   fn check(sql: &str) -> Result<()> {
      Statement::new(sql, vec![]).check_connection_state()
   }

   #[test]
   fn test_statement_kinds() {
      use StatementKind::*;

      assert_eq!(kinds("  select * from users"), vec![Select]);
      assert_eq!(kinds("INSERT INTO t VALUES (1)"), vec![Insert]);
      assert_eq!(kinds("replace into t values (1)"), vec![Insert]);
      assert_eq!(kinds("DELETE FROM t"), vec![Update]);
      assert_eq!(kinds("WITH x AS (SELECT 1) UPDATE t SET a = 1"), vec![Update]);
      assert_eq!(kinds("WITH x AS (SELECT 1) SELECT * FROM x"), vec![Select]);
      assert_eq!(kinds("CREATE TABLE t (id INTEGER)"), vec![Other]);
      assert_eq!(kinds("-- note\nBEGIN; SELECT 1;"), vec![TransactionControl, Select]);
      assert!(kinds("  ;  ").is_empty());
   }

   #[test]
   fn test_keywords_inside_literals_are_ignored() {
      use StatementKind::*;

      assert_eq!(
         kinds("SELECT 'x; DELETE FROM users' AS s, \"begin\" FROM t"),
         vec![Select]
      );
      assert_eq!(kinds("SELECT 'it''s; BEGIN' /* ; COMMIT */"), vec![Select]);
      assert!(check("INSERT INTO notes (body) VALUES ('BEGIN; PRAGMA journal_mode=delete')").is_ok());
   }

   #[test]
   fn test_expect_kind() {
      let select = Statement::new("SELECT 1", vec![]);
      assert!(select.expect_kind(StatementKind::Select).is_ok());

      let err = select.expect_kind(StatementKind::Insert).unwrap_err();
      assert!(matches!(
         err,
         Error::UnexpectedStatementKind {
            expected: StatementKind::Insert,
            found: Some(StatementKind::Select),
         }
      ));

      // Every statement has to match, not just the first
      let mixed = Statement::new("INSERT INTO t VALUES (1); DROP TABLE t", vec![]);
      assert!(mixed.expect_kind(StatementKind::Insert).is_err());

      let empty = Statement::new("  ", vec![]);
      assert!(matches!(
         empty.expect_kind(StatementKind::Select),
         Err(Error::UnexpectedStatementKind { found: None, .. })
      ));
   }

   #[test]
   fn test_transaction_control_is_refused() {
      for sql in [
         "BEGIN",
         "begin immediate",
         "COMMIT",
         "END TRANSACTION",
         "ROLLBACK",
         "SAVEPOINT sp",
         "RELEASE sp",
         "SELECT 1; BEGIN",
      ] {
         assert!(
            matches!(check(sql), Err(Error::MalformedStatement(_))),
            "{sql:?} should be refused"
         );
      }
   }

   #[test]
   fn test_connection_pragmas_are_refused() {
      for sql in [
         "PRAGMA journal_mode=DELETE",
         "PRAGMA main.journal_mode = delete",
         "pragma busy_timeout(0)",
         "PRAGMA foreign_keys = OFF",
         "ATTACH DATABASE 'other.db' AS other",
         "DETACH other",
      ] {
         assert!(
            matches!(check(sql), Err(Error::MalformedStatement(_))),
            "{sql:?} should be refused"
         );
      }

      // Reading a pragma, or setting one that is not per-connection, is fine
      assert!(check("PRAGMA journal_mode").is_ok());
      assert!(check("PRAGMA table_info(users)").is_ok());
      assert!(check("PRAGMA user_version = 3").is_ok());
      assert!(check("UPDATE t SET released = 1").is_ok());
   }
}
