use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use thiserror::Error;

use crate::blob::BlobError;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Domain-level failure kinds returned by every service operation.
///
/// Variants carry a caller-facing message; the routing layer maps each kind
/// to exactly one HTTP status.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Malformed arguments, policy violations, or an illegal state transition.
    #[error("{0}")]
    InvalidInput(String),
    /// Bucket/object absent, or blob not yet present when it was required.
    #[error("{0}")]
    NotFound(String),
    /// Uniqueness violation or a lost optimistic-concurrency race.
    #[error("{0}")]
    Conflict(String),
    /// Blocked by a disabled or locked bucket.
    #[error("{0}")]
    Forbidden(String),
    /// Redundant state change, e.g. disabling a disabled bucket.
    #[error("{0}")]
    BadRequest(String),
    /// Unexpected collaborator failure.
    #[error("{op}: {message}")]
    Unknown {
        op: &'static str,
        message: String,
        #[source]
        source: Option<BoxError>,
    },
}

pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    /// Wrap an unexpected collaborator failure, logging it with operation context.
    pub fn unknown(op: &'static str, message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        let message = message.into();
        let source = source.into();
        tracing::error!(op, error = %source, "{message}");
        ServiceError::Unknown {
            op,
            message,
            source: Some(source),
        }
    }

    /// Translate a persistence failure. Unique violations become `Conflict`,
    /// missing rows `NotFound`, anything else `Unknown`.
    pub fn database(op: &'static str, err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ServiceError::NotFound("record not found".into()),
            err if crate::db::is_unique_violation(&err) => {
                ServiceError::Conflict("record already exists".into())
            }
            err => ServiceError::unknown(op, "database operation failed", err),
        }
    }

    /// Like [`ServiceError::database`], but names the missing `entity`.
    pub fn lookup(op: &'static str, entity: impl fmt::Display, err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ServiceError::NotFound(format!("{entity} not found")),
            err => ServiceError::database(op, err),
        }
    }

    /// A compare-and-swap on `version` matched no row.
    pub fn stale(entity: impl fmt::Display) -> Self {
        ServiceError::Conflict(format!("{entity} was modified concurrently, retry the request"))
    }

    /// Translate a blob-store failure.
    pub fn blob(op: &'static str, err: BlobError) -> Self {
        match err {
            BlobError::NotFound { bucket, name } => {
                ServiceError::NotFound(format!("object '{name}' not found in storage bucket '{bucket}'"))
            }
            err => ServiceError::unknown(op, "blob store operation failed", err),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::InvalidInput(_) | ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Conflict(_) => StatusCode::CONFLICT,
            ServiceError::Forbidden(_) => StatusCode::FORBIDDEN,
            ServiceError::Unknown { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// HTTP-facing error: a status plus a message rendered as JSON.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    /// Shortcut for 403 Forbidden
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        let status = err.status();
        match err {
            // Internal details stay in the logs.
            ServiceError::Unknown { message, .. } => AppError::new(status, message),
            other => AppError::new(status, other.to_string()),
        }
    }
}

/// Data-plane failures on the signed blob routes.
impl From<BlobError> for AppError {
    fn from(err: BlobError) -> Self {
        match err {
            BlobError::NotFound { .. } => AppError::not_found(err.to_string()),
            BlobError::Expired | BlobError::InvalidSignature => AppError::forbidden(err.to_string()),
            BlobError::InvalidKey(_) | BlobError::SizeMismatch { .. } => {
                AppError::new(StatusCode::BAD_REQUEST, err.to_string())
            }
            BlobError::Unavailable(_) => AppError::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
            BlobError::Io(err) => {
                tracing::error!(error = %err, "blob i/o failed");
                AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "blob i/o failed")
            }
        }
    }
}
