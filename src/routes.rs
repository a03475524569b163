//! HTTP handlers

use std::time::Instant;

use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use sqlx_sqlite_toolkit::{AccessStats, Statement, StatementKind, WriteQueryResult};

use crate::error::{ApiError, ApiResult};
use crate::server::AppState;
use crate::users::{DEFAULT_PAGE_SIZE, NewUser, User, UserStats, UserUpdate};

/// Keywords that make `/query` require `allow_write`.
const WRITE_KEYWORDS: [&str; 10] = [
   "DROP", "DELETE", "TRUNCATE", "ALTER", "CREATE", "INSERT", "UPDATE", "REPLACE", "ATTACH",
   "DETACH",
];

// ─── Health and stats ───

#[derive(Debug, Serialize)]
pub struct HealthResponse {
   status: &'static str,
   timestamp: f64,
}

pub async fn health_check() -> Json<HealthResponse> {
   let now = Utc::now();
   Json(HealthResponse {
      status: "healthy",
      timestamp: now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1e6,
   })
}

pub async fn pool_stats(State(state): State<AppState>) -> Json<AccessStats> {
   Json(state.db.stats())
}

pub async fn user_stats(State(state): State<AppState>) -> ApiResult<Json<UserStats>> {
   Ok(Json(state.users.stats().await?))
}

// ─── Users ───

#[derive(Debug, Deserialize)]
pub struct ListParams {
   limit: Option<i64>,
   offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct UserList {
   data: Vec<User>,
   rowcount: usize,
}

pub async fn list_users(
   State(state): State<AppState>,
   params: Result<Query<ListParams>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
   let Query(params) = params?;
   let limit = params.limit.unwrap_or(DEFAULT_PAGE_SIZE);
   let offset = params.offset.unwrap_or(0);

   let users = state.users.list(limit, offset).await?;
   let etag = format!("\"users-{limit}-{offset}\"");

   Ok((
      [
         (header::CACHE_CONTROL, "public, max-age=30".to_string()),
         (header::ETAG, etag),
      ],
      Json(UserList {
         rowcount: users.len(),
         data: users,
      }),
   ))
}

pub async fn get_user(
   State(state): State<AppState>,
   Path(id): Path<i64>,
) -> ApiResult<Json<JsonValue>> {
   let user = state
      .users
      .get(id)
      .await?
      .ok_or(ApiError::NotFound {
         resource: "user",
         id,
      })?;
   Ok(Json(json!({ "data": user })))
}

pub async fn create_user(
   State(state): State<AppState>,
   payload: Result<Json<NewUser>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<JsonValue>)> {
   let Json(user) = payload?;
   let user_id = state.users.create(&user).await?;
   Ok((
      StatusCode::CREATED,
      Json(json!({
         "message": "User created successfully",
         "user_id": user_id,
      })),
   ))
}

pub async fn update_user(
   State(state): State<AppState>,
   Path(id): Path<i64>,
   payload: Result<Json<UserUpdate>, JsonRejection>,
) -> ApiResult<Json<JsonValue>> {
   let Json(update) = payload?;
   if !state.users.update(id, &update).await? {
      return Err(ApiError::NotFound {
         resource: "user",
         id,
      });
   }
   Ok(Json(json!({ "message": "User updated successfully" })))
}

pub async fn delete_user(
   State(state): State<AppState>,
   Path(id): Path<i64>,
) -> ApiResult<Json<JsonValue>> {
   if !state.users.delete(id).await? {
      return Err(ApiError::NotFound {
         resource: "user",
         id,
      });
   }
   Ok(Json(json!({ "message": "User deleted successfully" })))
}

#[derive(Debug, Deserialize)]
pub struct BulkUsers {
   users: Vec<NewUser>,
}

pub async fn bulk_create_users(
   State(state): State<AppState>,
   payload: Result<Json<BulkUsers>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<JsonValue>)> {
   let Json(BulkUsers { users }) = payload?;
   let user_ids = state.users.bulk_create(users).await?;
   Ok((
      StatusCode::CREATED,
      Json(json!({
         "message": format!("Created {} users successfully", user_ids.len()),
         "user_ids": user_ids,
      })),
   ))
}

// ─── Ad-hoc SQL ───

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
   query: String,
   #[serde(default, alias = "values")]
   params: Vec<JsonValue>,
   #[serde(default)]
   allow_write: bool,
}

/// Run a caller-supplied statement. Reads return rows; statements containing
/// a write keyword are refused unless `allow_write` is set.
pub async fn run_query(
   State(state): State<AppState>,
   payload: Result<Json<QueryRequest>, JsonRejection>,
) -> ApiResult<Json<JsonValue>> {
   let Json(request) = payload?;
   let query = request.query.trim();
   if query.is_empty() {
      return Err(ApiError::BadRequest("Query is required".into()));
   }

   let started = Instant::now();
   if is_write(query) {
      if !request.allow_write {
         return Err(ApiError::Forbidden(
            "Write operations require allow_write=true".into(),
         ));
      }
      let result = state.db.execute(query, request.params).await?;
      return Ok(Json(json!({
         "data": JsonValue::Null,
         "rowcount": result.rows_affected,
         "lastrowid": result.last_insert_id,
         "execution_time": started.elapsed().as_secs_f64(),
      })));
   }

   let rows = state.db.query(query, request.params).await?;
   Ok(Json(json!({
      "rowcount": rows.len(),
      "data": rows,
      "execution_time": started.elapsed().as_secs_f64(),
   })))
}

pub async fn execute_statement(
   State(state): State<AppState>,
   payload: Result<Json<Statement>, JsonRejection>,
) -> ApiResult<Json<WriteQueryResult>> {
   let Json(statement) = payload?;
   reject_reads(&statement)?;
   Ok(Json(
      state.db.execute(statement.query, statement.values).await?,
   ))
}

#[derive(Debug, Deserialize)]
pub struct TransactionRequest {
   statements: Vec<Statement>,
}

pub async fn run_transaction(
   State(state): State<AppState>,
   payload: Result<Json<TransactionRequest>, JsonRejection>,
) -> ApiResult<Json<JsonValue>> {
   let Json(request) = payload?;
   for statement in &request.statements {
      reject_reads(statement)?;
   }
   let results = state.db.transact(request.statements).await?;
   Ok(Json(json!({ "results": results })))
}

// ─── Typed statements ───

/// SELECT only. Anything else is a 400.
pub async fn run_select(
   State(state): State<AppState>,
   payload: Result<Json<Statement>, JsonRejection>,
) -> ApiResult<Json<JsonValue>> {
   let Json(statement) = payload?;
   statement.expect_kind(StatementKind::Select)?;

   let started = Instant::now();
   let rows = state.db.query(statement.query, statement.values).await?;
   Ok(Json(json!({
      "rowcount": rows.len(),
      "data": rows,
      "execution_time": started.elapsed().as_secs_f64(),
      "operation": "SELECT",
   })))
}

pub async fn run_insert(
   State(state): State<AppState>,
   payload: Result<Json<Statement>, JsonRejection>,
) -> ApiResult<Json<JsonValue>> {
   let Json(statement) = payload?;
   typed_write(&state, statement, StatementKind::Insert, "INSERT").await
}

/// UPDATE or DELETE.
pub async fn run_update(
   State(state): State<AppState>,
   payload: Result<Json<Statement>, JsonRejection>,
) -> ApiResult<Json<JsonValue>> {
   let Json(statement) = payload?;
   typed_write(&state, statement, StatementKind::Update, "UPDATE").await
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
   queries: Vec<Statement>,
}

pub async fn batch_insert(
   State(state): State<AppState>,
   payload: Result<Json<BatchRequest>, JsonRejection>,
) -> ApiResult<Json<JsonValue>> {
   let Json(request) = payload?;
   typed_batch(&state, request.queries, StatementKind::Insert, "BATCH_INSERT").await
}

pub async fn batch_update(
   State(state): State<AppState>,
   payload: Result<Json<BatchRequest>, JsonRejection>,
) -> ApiResult<Json<JsonValue>> {
   let Json(request) = payload?;
   typed_batch(&state, request.queries, StatementKind::Update, "BATCH_UPDATE").await
}

async fn typed_write(
   state: &AppState,
   statement: Statement,
   kind: StatementKind,
   operation: &str,
) -> ApiResult<Json<JsonValue>> {
   statement.expect_kind(kind)?;

   let started = Instant::now();
   let result = state.db.execute(statement.query, statement.values).await?;
   Ok(Json(json!({
      "rowcount": result.rows_affected,
      "lastrowid": result.last_insert_id,
      "execution_time": started.elapsed().as_secs_f64(),
      "operation": operation,
   })))
}

/// Every statement must be of `kind`; they run in one transaction.
async fn typed_batch(
   state: &AppState,
   statements: Vec<Statement>,
   kind: StatementKind,
   operation: &str,
) -> ApiResult<Json<JsonValue>> {
   if statements.is_empty() {
      return Err(ApiError::BadRequest("At least one query is required".into()));
   }
   for (index, statement) in statements.iter().enumerate() {
      statement
         .expect_kind(kind)
         .map_err(|e| ApiError::BadRequest(format!("Invalid query at index {index}: {e}")))?;
   }

   let count = statements.len();
   let started = Instant::now();
   let results = state.db.transact(statements).await?;
   Ok(Json(json!({
      "message": format!("Executed {count} {kind} queries successfully"),
      "results": results,
      "execution_time": started.elapsed().as_secs_f64(),
      "operation": operation,
   })))
}

/// Reads have their own endpoints; the write endpoints refuse them.
fn reject_reads(statement: &Statement) -> ApiResult<()> {
   let kinds = statement.kinds();
   if !kinds.is_empty() && kinds.iter().all(|kind| *kind == StatementKind::Select) {
      return Err(ApiError::BadRequest(
         "SELECT statements go to /query or /select".into(),
      ));
   }
   Ok(())
}

/// Whether any word of `query` is a write keyword. Matching whole words keeps
/// column names such as `created_at` from tripping the check.
fn is_write(query: &str) -> bool {
   query
      .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
      .any(|word| {
         WRITE_KEYWORDS
            .iter()
            .any(|keyword| word.eq_ignore_ascii_case(keyword))
      })
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_is_write() {
      assert!(is_write("INSERT INTO users VALUES (1)"));
      assert!(is_write("  delete from users"));
      assert!(is_write("WITH x AS (SELECT 1) UPDATE users SET name = 'a'"));
      assert!(!is_write("SELECT created_at, updated FROM users"));
      assert!(!is_write("SELECT * FROM users WHERE name = ?"));
   }
}
