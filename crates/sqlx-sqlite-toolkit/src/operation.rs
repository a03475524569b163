//! Units of work the [`RetryExecutor`](crate::RetryExecutor) can run.
//!
//! An operation is an immutable value. Running it again after a transient
//! failure replays exactly the same statements on a fresh connection.

use std::future::Future;
use std::pin::Pin;

use serde_json::Value as JsonValue;
use sqlx_sqlite_pool::PooledConnection;
use tracing::warn;

use crate::decode::{JsonRow, bind_value, decode_rows};
use crate::statement::{Statement, WriteQueryResult};
use crate::{Error, Result};

/// Boxed future returned by [`Operation::apply`].
pub type OperationFuture<'c, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'c>>;

/// Something that can be applied to a checked-out connection.
pub trait Operation: Send + Sync {
   type Output: Send;

   /// Short name used in log events.
   fn name(&self) -> &'static str;

   /// Apply the operation. Called once per attempt.
   fn apply<'c>(&'c self, conn: &'c mut PooledConnection) -> OperationFuture<'c, Self::Output>;
}

/// A single write statement.
///
/// Statements that would change the connection for later callers are refused
/// with [`Error::MalformedStatement`] before anything runs. The same holds for
/// [`Query`] and [`Transact`].
#[derive(Debug, Clone)]
pub struct Execute(pub Statement);

impl Operation for Execute {
   type Output = WriteQueryResult;

   fn name(&self) -> &'static str {
      "execute"
   }

   fn apply<'c>(&'c self, conn: &'c mut PooledConnection) -> OperationFuture<'c, WriteQueryResult> {
      Box::pin(async move {
         self.0.check_connection_state()?;
         let result = self.0.to_query().execute(&mut **conn).await?;
         Ok(result.into())
      })
   }
}

/// A read statement whose rows are fully decoded before the connection is
/// returned.
#[derive(Debug, Clone)]
pub struct Query(pub Statement);

impl Operation for Query {
   type Output = Vec<JsonRow>;

   fn name(&self) -> &'static str {
      "query"
   }

   fn apply<'c>(&'c self, conn: &'c mut PooledConnection) -> OperationFuture<'c, Vec<JsonRow>> {
      Box::pin(async move {
         self.0.check_connection_state()?;
         let rows = self.0.to_query().fetch_all(&mut **conn).await?;
         decode_rows(rows)
      })
   }
}

/// Statements run in order inside one `BEGIN IMMEDIATE` transaction.
#[derive(Debug, Clone)]
pub struct Transact(pub Vec<Statement>);

impl Operation for Transact {
   type Output = Vec<WriteQueryResult>;

   fn name(&self) -> &'static str {
      "transact"
   }

   fn apply<'c>(
      &'c self,
      conn: &'c mut PooledConnection,
   ) -> OperationFuture<'c, Vec<WriteQueryResult>> {
      Box::pin(async move {
         for statement in &self.0 {
            statement.check_connection_state()?;
         }
         conn.begin_immediate().await?;

         let result = async {
            let mut results = Vec::with_capacity(self.0.len());
            for statement in &self.0 {
               let exec_result = statement.to_query().execute(&mut **conn).await?;
               results.push(WriteQueryResult::from(exec_result));
            }
            Ok::<_, Error>(results)
         }
         .await;

         finish_transaction(conn, result).await
      })
   }
}

/// Rows of identical shape inserted into one table inside one transaction.
///
/// Built with [`BulkInsert::new`], which validates the table and column names
/// and that every record carries the same columns.
#[derive(Debug, Clone)]
pub struct BulkInsert {
   table: String,
   columns: Vec<String>,
   rows: Vec<Vec<JsonValue>>,
   sql: String,
}

impl BulkInsert {
   pub fn new(table: impl Into<String>, records: Vec<JsonRow>) -> Result<Self> {
      let table = table.into();
      validate_identifier(&table)?;

      let columns: Vec<String> = match records.first() {
         Some(first) => first.keys().cloned().collect(),
         None => Vec::new(),
      };
      if !records.is_empty() && columns.is_empty() {
         return Err(Error::EmptyRecord { index: 0 });
      }
      for column in &columns {
         validate_identifier(column)?;
      }

      let mut rows = Vec::with_capacity(records.len());
      for (index, mut record) in records.into_iter().enumerate() {
         if record.len() != columns.len() {
            return Err(Error::RecordColumnsMismatch { index });
         }
         let mut row = Vec::with_capacity(columns.len());
         for column in &columns {
            match record.swap_remove(column) {
               Some(value) => row.push(value),
               None => return Err(Error::RecordColumnsMismatch { index }),
            }
         }
         rows.push(row);
      }

      let column_list = columns
         .iter()
         .map(|c| quote_identifier(c))
         .collect::<Vec<_>>()
         .join(", ");
      let placeholders = vec!["?"; columns.len()].join(", ");
      let sql = format!(
         "INSERT INTO {} ({column_list}) VALUES ({placeholders})",
         quote_identifier(&table)
      );

      Ok(Self {
         table,
         columns,
         rows,
         sql,
      })
   }

   pub fn table(&self) -> &str {
      &self.table
   }

   pub fn columns(&self) -> &[String] {
      &self.columns
   }

   pub fn len(&self) -> usize {
      self.rows.len()
   }

   pub fn is_empty(&self) -> bool {
      self.rows.is_empty()
   }

   pub fn sql(&self) -> &str {
      &self.sql
   }
}

impl Operation for BulkInsert {
   /// Row ids of the inserted records, in input order.
   type Output = Vec<i64>;

   fn name(&self) -> &'static str {
      "bulk_insert"
   }

   fn apply<'c>(&'c self, conn: &'c mut PooledConnection) -> OperationFuture<'c, Vec<i64>> {
      Box::pin(async move {
         conn.begin_immediate().await?;

         let result = async {
            let mut ids = Vec::with_capacity(self.rows.len());
            for row in &self.rows {
               let exec_result = row
                  .iter()
                  .cloned()
                  .fold(sqlx::query(&self.sql), bind_value)
                  .execute(&mut **conn)
                  .await?;
               ids.push(exec_result.last_insert_rowid());
            }
            Ok::<_, Error>(ids)
         }
         .await;

         finish_transaction(conn, result).await
      })
   }
}

/// Commit on success, roll back on failure.
///
/// The first error is the one reported. If ROLLBACK also fails the connection
/// keeps its open-transaction mark and is closed by the pool on release.
async fn finish_transaction<T>(conn: &mut PooledConnection, result: Result<T>) -> Result<T> {
   let error = match result {
      Ok(value) => match conn.commit().await {
         Ok(()) => return Ok(value),
         Err(e) => Error::from(e),
      },
      Err(e) => e,
   };

   match conn.rollback().await {
      Ok(()) => Err(error),
      Err(rollback_err) => {
         warn!(
            connection = conn.id(),
            error = %error,
            rollback_error = %rollback_err,
            "Rollback failed, connection will be closed"
         );
         Err(Error::TransactionRollbackFailed {
            transaction_error: Box::new(error),
            rollback_error: Box::new(Error::from(rollback_err)),
         })
      }
   }
}

/// Accept `[a-zA-Z_][a-zA-Z0-9_]*`.
pub(crate) fn validate_identifier(name: &str) -> Result<()> {
   let mut chars = name.chars();
   let valid = match chars.next() {
      Some(first) if first.is_ascii_alphabetic() || first == '_' => {
         chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
      }
      _ => false,
   };

   if valid {
      Ok(())
   } else {
      Err(Error::InvalidIdentifier {
         name: name.to_string(),
      })
   }
}

fn quote_identifier(name: &str) -> String {
   format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
   use super::*;
   use serde_json::json;

   fn record(pairs: &[(&str, JsonValue)]) -> JsonRow {
      pairs
         .iter()
         .map(|(k, v)| (k.to_string(), v.clone()))
         .collect()
   }

   #[test]
   fn test_validate_identifier() {
      assert!(validate_identifier("users").is_ok());
      assert!(validate_identifier("_private").is_ok());
      assert!(validate_identifier("t2_col").is_ok());

      for bad in ["", "2fast", "users;", "a b", "name\"", "drop--", "é"] {
         assert!(
            matches!(validate_identifier(bad), Err(Error::InvalidIdentifier { .. })),
            "{bad:?} should be rejected"
         );
      }
   }

   #[test]
   fn test_bulk_insert_builds_quoted_sql() {
      let op = BulkInsert::new(
         "users",
         vec![
            record(&[("name", json!("Ada")), ("email", json!("ada@example.com"))]),
            record(&[("email", json!("bob@example.com")), ("name", json!("Bob"))]),
         ],
      )
      .unwrap();

      assert_eq!(
         op.sql(),
         "INSERT INTO \"users\" (\"name\", \"email\") VALUES (?, ?)"
      );
      assert_eq!(op.columns(), ["name", "email"]);
      // Values follow the first record's column order
      assert_eq!(op.rows[1], vec![json!("Bob"), json!("bob@example.com")]);
   }

   #[test]
   fn test_bulk_insert_rejects_bad_table() {
      let err = BulkInsert::new("users; DROP TABLE users", vec![]).unwrap_err();
      assert!(matches!(err, Error::InvalidIdentifier { .. }));
   }

   #[test]
   fn test_bulk_insert_rejects_bad_column() {
      let err = BulkInsert::new("users", vec![record(&[("na me", json!("x"))])]).unwrap_err();
      assert!(matches!(err, Error::InvalidIdentifier { name } if name == "na me"));
   }

   #[test]
   fn test_bulk_insert_rejects_mismatched_records() {
      let extra = BulkInsert::new(
         "users",
         vec![
            record(&[("name", json!("Ada"))]),
            record(&[("name", json!("Bob")), ("email", json!("b@x.io"))]),
         ],
      )
      .unwrap_err();
      assert!(matches!(extra, Error::RecordColumnsMismatch { index: 1 }));

      let different = BulkInsert::new(
         "users",
         vec![
            record(&[("name", json!("Ada"))]),
            record(&[("name", json!("Bob"))]),
            record(&[("email", json!("c@x.io"))]),
         ],
      )
      .unwrap_err();
      assert!(matches!(different, Error::RecordColumnsMismatch { index: 2 }));
   }

   #[test]
   fn test_bulk_insert_rejects_empty_record() {
      let err = BulkInsert::new("users", vec![JsonRow::new()]).unwrap_err();
      assert!(matches!(err, Error::EmptyRecord { index: 0 }));
   }

   #[test]
   fn test_bulk_insert_without_records_is_empty() {
      let op = BulkInsert::new("users", vec![]).unwrap();
      assert!(op.is_empty());
      assert_eq!(op.len(), 0);
   }
}
