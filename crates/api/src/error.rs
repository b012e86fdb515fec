use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use loki_db::repo::RepoError;
use loki_engine::{EngineError, VerifyError};

/// Error body returned by every failing endpoint.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    pub code: u16,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, error, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "invalid_request", msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "unexpected error".to_string(),
                )
            }
        };

        (
            status,
            Json(ErrorBody {
                error: error.to_string(),
                message,
                code: status.as_u16(),
            }),
        )
            .into_response()
    }
}

impl From<RepoError> for ApiError {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::NotFound => ApiError::NotFound("resource not found".to_string()),
            RepoError::Database(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Validation(msg) => ApiError::BadRequest(msg),
            EngineError::ChainNotFound => ApiError::NotFound("chain not found".to_string()),
            EngineError::ChainInactive => ApiError::BadRequest("chain is not active".to_string()),
            EngineError::Storage(e) => ApiError::from(e),
            EngineError::Serialization(e) => ApiError::Internal(e.to_string()),
            EngineError::Http(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<VerifyError> for ApiError {
    fn from(err: VerifyError) -> Self {
        match err {
            VerifyError::Storage(e) => ApiError::from(e),
            other => ApiError::Unauthorized(other.to_string()),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
