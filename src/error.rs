//! API errors and their HTTP mapping
//!
//! Every error becomes a JSON body `{"error": CODE, "message": ...}`.

use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use sqlx_sqlite_toolkit::Error as DataError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
   /// Caller sent something unusable (400)
   #[error("{0}")]
   BadRequest(String),

   /// Write statement sent to the read endpoint without `allow_write` (403)
   #[error("{0}")]
   Forbidden(String),

   #[error("{resource} {id} not found")]
   NotFound { resource: &'static str, id: i64 },

   #[error(transparent)]
   Data(#[from] DataError),

   /// A stored row did not have the expected shape (500)
   #[error("unexpected row shape: {0}")]
   Decode(#[from] serde_json::Error),
}

impl ApiError {
   pub fn status(&self) -> StatusCode {
      match self {
         ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
         ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
         ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
         ApiError::Decode(_) => StatusCode::INTERNAL_SERVER_ERROR,
         ApiError::Data(err) => match err {
            DataError::MalformedStatement(_)
            | DataError::InvalidIdentifier { .. }
            | DataError::EmptyRecord { .. }
            | DataError::RecordColumnsMismatch { .. }
            | DataError::MultipleRowsReturned(_)
            | DataError::UnexpectedStatementKind { .. } => StatusCode::BAD_REQUEST,
            DataError::ConstraintViolation(_) => StatusCode::CONFLICT,
            DataError::PoolExhausted { .. }
            | DataError::PoolClosed
            | DataError::RetriesExhausted { .. }
            | DataError::TransientLockFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
         },
      }
   }

   pub fn code(&self) -> String {
      match self {
         ApiError::BadRequest(_) => "BAD_REQUEST".to_string(),
         ApiError::Forbidden(_) => "FORBIDDEN".to_string(),
         ApiError::NotFound { .. } => "NOT_FOUND".to_string(),
         ApiError::Decode(_) => "DECODE_ERROR".to_string(),
         ApiError::Data(err) => err.error_code(),
      }
   }
}

impl IntoResponse for ApiError {
   fn into_response(self) -> Response {
      let status = self.status();
      if status.is_server_error() {
         tracing::warn!(status = status.as_u16(), error = %self, "Request failed");
      } else {
         tracing::debug!(status = status.as_u16(), error = %self, "Request rejected");
      }

      let body = Json(json!({
         "error": self.code(),
         "message": self.to_string(),
      }));

      (status, body).into_response()
   }
}

impl From<JsonRejection> for ApiError {
   fn from(rejection: JsonRejection) -> Self {
      ApiError::BadRequest(rejection.body_text())
   }
}

impl From<QueryRejection> for ApiError {
   fn from(rejection: QueryRejection) -> Self {
      ApiError::BadRequest(rejection.body_text())
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use axum::body::to_bytes;
   use sqlx_sqlite_toolkit::StatementKind;
   use std::time::Duration;

   async fn body_json(response: Response) -> serde_json::Value {
      let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
      serde_json::from_slice(&bytes).unwrap()
   }

   #[tokio::test]
   async fn not_found_is_404() {
      let response = ApiError::NotFound {
         resource: "user",
         id: 7,
      }
      .into_response();
      assert_eq!(response.status(), StatusCode::NOT_FOUND);

      let body = body_json(response).await;
      assert_eq!(body["error"], "NOT_FOUND");
      assert_eq!(body["message"], "user 7 not found");
   }

   #[tokio::test]
   async fn pool_exhausted_is_503() {
      let err = ApiError::from(DataError::PoolExhausted {
         timeout: Duration::from_secs(1),
         max_connections: 2,
      });
      let response = err.into_response();
      assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
      assert_eq!(body_json(response).await["error"], "POOL_EXHAUSTED");
   }

   #[test]
   fn retries_exhausted_is_503() {
      let err = ApiError::from(DataError::RetriesExhausted {
         attempts: 5,
         last_error: Box::new(DataError::PoolClosed),
      });
      assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
   }

   #[test]
   fn validation_errors_are_400() {
      let err = ApiError::from(DataError::InvalidIdentifier {
         name: "x y".into(),
      });
      assert_eq!(err.status(), StatusCode::BAD_REQUEST);
      assert_eq!(ApiError::BadRequest("no".into()).status(), StatusCode::BAD_REQUEST);
   }

   #[test]
   fn unexpected_statement_kind_is_400() {
      let err = ApiError::from(DataError::UnexpectedStatementKind {
         expected: StatementKind::Select,
         found: Some(StatementKind::Update),
      });
      assert_eq!(err.status(), StatusCode::BAD_REQUEST);
      assert_eq!(err.code(), "UNEXPECTED_STATEMENT_KIND");
   }

   #[test]
   fn forbidden_is_403() {
      let err = ApiError::Forbidden("write operations require allow_write=true".into());
      assert_eq!(err.status(), StatusCode::FORBIDDEN);
   }
}
