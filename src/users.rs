//! The `users` table and the queries the HTTP routes run against it

use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use sqlx_sqlite_toolkit::{DataAccess, JsonRow, Statement};
use tracing::info;

use crate::error::{ApiError, ApiResult};

const SCHEMA: [&str; 3] = [
   "CREATE TABLE IF NOT EXISTS users (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      name TEXT NOT NULL,
      email TEXT UNIQUE NOT NULL,
      created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
   )",
   "CREATE INDEX IF NOT EXISTS idx_users_email ON users(email)",
   "CREATE INDEX IF NOT EXISTS idx_users_created_at ON users(created_at)",
];

const USER_COLUMNS: &str = "id, name, email, created_at";

/// Largest page `list` will return.
pub const MAX_PAGE_SIZE: i64 = 1000;
pub const DEFAULT_PAGE_SIZE: i64 = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
   pub id: i64,
   pub name: String,
   pub email: String,
   pub created_at: String,
}

impl TryFrom<JsonRow> for User {
   type Error = serde_json::Error;

   fn try_from(row: JsonRow) -> Result<Self, Self::Error> {
      serde_json::from_value(JsonValue::Object(row.into_iter().collect()))
   }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewUser {
   pub name: String,
   pub email: String,
}

/// Fields to change; absent fields are left as they are.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserUpdate {
   pub name: Option<String>,
   pub email: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStats {
   pub total_users: i64,
   pub users_today: i64,
}

#[derive(Debug, Clone)]
pub struct UserStore {
   db: DataAccess,
}

impl UserStore {
   /// Create the table and indexes if they are missing.
   pub async fn init(db: DataAccess) -> ApiResult<Self> {
      let statements = SCHEMA
         .iter()
         .map(|sql| Statement::new(*sql, vec![]))
         .collect();
      db.transact(statements).await?;
      info!("Users schema ready");
      Ok(Self { db })
   }

   pub async fn create(&self, user: &NewUser) -> ApiResult<i64> {
      let result = self
         .db
         .execute(
            "INSERT INTO users (name, email) VALUES (?, ?)",
            vec![json!(user.name), json!(user.email)],
         )
         .await?;
      Ok(result.last_insert_id)
   }

   pub async fn get(&self, id: i64) -> ApiResult<Option<User>> {
      let row = self
         .db
         .fetch_one(
            format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?"),
            vec![json!(id)],
         )
         .await?;
      Ok(row.map(User::try_from).transpose()?)
   }

   /// Page through users in id order. `limit` is clamped to
   /// `0..=MAX_PAGE_SIZE` and `offset` to zero or more.
   pub async fn list(&self, limit: i64, offset: i64) -> ApiResult<Vec<User>> {
      let rows = self
         .db
         .query(
            format!("SELECT {USER_COLUMNS} FROM users ORDER BY id LIMIT ? OFFSET ?"),
            vec![json!(limit.clamp(0, MAX_PAGE_SIZE)), json!(offset.max(0))],
         )
         .await?;
      rows
         .into_iter()
         .map(|row| User::try_from(row).map_err(ApiError::from))
         .collect()
   }

   /// Returns `false` when no user has this id.
   pub async fn update(&self, id: i64, update: &UserUpdate) -> ApiResult<bool> {
      let mut fields = Vec::new();
      let mut values = Vec::new();
      if let Some(name) = &update.name {
         fields.push("name = ?");
         values.push(json!(name));
      }
      if let Some(email) = &update.email {
         fields.push("email = ?");
         values.push(json!(email));
      }
      if fields.is_empty() {
         return Err(ApiError::BadRequest("No valid fields to update".into()));
      }
      values.push(json!(id));

      let result = self
         .db
         .execute(
            format!("UPDATE users SET {} WHERE id = ?", fields.join(", ")),
            values,
         )
         .await?;
      Ok(result.rows_affected > 0)
   }

   /// Returns `false` when no user has this id.
   pub async fn delete(&self, id: i64) -> ApiResult<bool> {
      let result = self
         .db
         .execute("DELETE FROM users WHERE id = ?", vec![json!(id)])
         .await?;
      Ok(result.rows_affected > 0)
   }

   /// Insert every user or none of them.
   pub async fn bulk_create(&self, users: Vec<NewUser>) -> ApiResult<Vec<i64>> {
      let records = users
         .into_iter()
         .map(|user| {
            JsonRow::from_iter([
               ("name".to_string(), json!(user.name)),
               ("email".to_string(), json!(user.email)),
            ])
         })
         .collect();
      Ok(self.db.bulk_insert("users", records).await?)
   }

   pub async fn stats(&self) -> ApiResult<UserStats> {
      let row = self
         .db
         .fetch_one(
            "SELECT COUNT(*) AS total_users, \
             COALESCE(SUM(DATE(created_at) = DATE('now')), 0) AS users_today \
             FROM users",
            vec![],
         )
         .await?;

      match row {
         Some(row) => Ok(serde_json::from_value(JsonValue::Object(
            row.into_iter().collect(),
         ))?),
         None => Ok(UserStats {
            total_users: 0,
            users_today: 0,
         }),
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use sqlx_sqlite_toolkit::{PoolConfig, RetryPolicy};
   use tempfile::TempDir;

   async fn store() -> (UserStore, TempDir) {
      let temp_dir = TempDir::new().unwrap();
      let db = DataAccess::open(
         temp_dir.path().join("users.db"),
         PoolConfig::default(),
         RetryPolicy::default(),
      )
      .await
      .unwrap();
      (UserStore::init(db).await.unwrap(), temp_dir)
   }

   fn new_user(name: &str) -> NewUser {
      NewUser {
         name: name.to_string(),
         email: format!("{}@example.com", name.to_lowercase()),
      }
   }

   #[tokio::test]
   async fn test_create_get_update_delete() {
      let (store, _temp) = store().await;

      let id = store.create(&new_user("Ada")).await.unwrap();
      let user = store.get(id).await.unwrap().unwrap();
      assert_eq!(user.name, "Ada");
      assert_eq!(user.email, "ada@example.com");
      assert!(!user.created_at.is_empty());

      let changed = store
         .update(
            id,
            &UserUpdate {
               name: Some("Ada L".into()),
               email: None,
            },
         )
         .await
         .unwrap();
      assert!(changed);
      assert_eq!(store.get(id).await.unwrap().unwrap().name, "Ada L");

      assert!(store.delete(id).await.unwrap());
      assert!(store.get(id).await.unwrap().is_none());
      assert!(!store.delete(id).await.unwrap());
   }

   #[tokio::test]
   async fn test_update_requires_fields() {
      let (store, _temp) = store().await;
      let err = store.update(1, &UserUpdate::default()).await.unwrap_err();
      assert!(matches!(err, ApiError::BadRequest(_)));
   }

   #[tokio::test]
   async fn test_init_is_idempotent() {
      let (store, _temp) = store().await;
      store.create(&new_user("Ada")).await.unwrap();

      let again = UserStore::init(store.db.clone()).await.unwrap();
      assert_eq!(again.stats().await.unwrap().total_users, 1);
   }

   #[tokio::test]
   async fn test_list_pages_in_id_order() {
      let (store, _temp) = store().await;
      let ids = store
         .bulk_create(vec![new_user("A"), new_user("B"), new_user("C")])
         .await
         .unwrap();
      assert_eq!(ids.len(), 3);

      let page = store.list(2, 1).await.unwrap();
      let names: Vec<&str> = page.iter().map(|u| u.name.as_str()).collect();
      assert_eq!(names, vec!["B", "C"]);

      // Negative paging values are clamped instead of reaching SQLite
      assert_eq!(store.list(-5, -5).await.unwrap().len(), 0);
      assert_eq!(store.list(MAX_PAGE_SIZE + 1, 0).await.unwrap().len(), 3);
   }

   #[tokio::test]
   async fn test_stats_counts_todays_users() {
      let (store, _temp) = store().await;
      assert_eq!(
         store.stats().await.unwrap(),
         UserStats {
            total_users: 0,
            users_today: 0
         }
      );

      store.create(&new_user("Ada")).await.unwrap();
      store.create(&new_user("Bob")).await.unwrap();
      let stats = store.stats().await.unwrap();
      assert_eq!(stats.total_users, 2);
      assert_eq!(stats.users_today, 2);
   }
}
