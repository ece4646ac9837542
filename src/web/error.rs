//! API error type.

use crate::db::DbError;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rusqlite::ErrorCode;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// A rejected row of a bulk upload. `row` is 1-based.
    #[error("Row {row}: {message}")]
    BadRow { row: usize, message: String },

    #[error("Not found")]
    NotFound,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(DbError),
}

impl From<DbError> for ApiError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::NotFound => ApiError::NotFound,
            DbError::Sqlite(rusqlite::Error::SqliteFailure(err, msg))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                ApiError::Conflict(msg.unwrap_or_else(|| "constraint violation".to_string()))
            }
            other => ApiError::Database(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
            ApiError::BadRow { row, message } => (
                StatusCode::BAD_REQUEST,
                json!({ "error": format!("row {}: {}", row, message), "row": row }),
            ),
            ApiError::NotFound => (StatusCode::NOT_FOUND, json!({ "error": "Not found" })),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, json!({ "error": msg })),
            ApiError::Database(e) => {
                tracing::error!("Request failed: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": "Database error" }))
            }
        };

        (status, Json(body)).into_response()
    }
}
