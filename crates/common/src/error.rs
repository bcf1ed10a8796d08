use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// The error-kind taxonomy shared by every core component.
///
/// A `Fatal` error in a creation saga requires the caller to run
/// compensation; every other kind is either a client mistake or a
/// transient backend condition the caller's next tick can retry.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("fatal: {0}")]
    Fatal(#[source] anyhow::Error),
}

impl CoreError {
    pub fn fatal(err: impl Into<anyhow::Error>) -> Self {
        CoreError::Fatal(err.into())
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(err: anyhow::Error) -> Self {
        CoreError::Fatal(err)
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => CoreError::NotFound("row not found".to_string()),
            other => CoreError::Unavailable(other.to_string()),
        }
    }
}

impl From<redis::RedisError> for CoreError {
    fn from(err: redis::RedisError) -> Self {
        CoreError::Unavailable(format!("bus error: {err}"))
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// Maps each error kind to the HTTP status named in the error handling
/// design; causes are logged, never echoed into the body.
impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = match &self {
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::BadRequest(_) => StatusCode::BAD_REQUEST,
            CoreError::LimitExceeded(_) => StatusCode::BAD_REQUEST,
            CoreError::Unauthorized => StatusCode::UNAUTHORIZED,
            CoreError::Conflict(_) => StatusCode::CONFLICT,
            CoreError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            CoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::Fatal(err) => {
                tracing::error!(error = %err, "fatal error reached the http boundary");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let message = match &self {
            CoreError::Fatal(_) => "internal error".to_string(),
            other => other.to_string(),
        };

        (status, axum::Json(ErrorBody { error: message })).into_response()
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
