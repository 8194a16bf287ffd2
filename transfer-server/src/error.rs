use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use transfer_core::TransferError;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Unprocessable(String),

    /// Restore stopped part way; the body says what was committed.
    #[error("{message}")]
    ApplyFailed { message: String, details: Value },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<TransferError> for AppError {
    fn from(e: TransferError) -> Self {
        let msg = e.to_string();
        match e {
            TransferError::InvalidFilename(_) | TransferError::InvalidRetention(_) => {
                AppError::BadRequest(msg)
            }
            TransferError::ArchiveNotFound(_) => AppError::NotFound(msg),
            TransferError::ArchiveCorrupt(_)
            | TransferError::ChecksumMismatch { .. }
            | TransferError::SchemaVersionMismatch { .. } => AppError::Unprocessable(msg),
            TransferError::TokenInvalidOrExpired => AppError::Forbidden(msg),
            TransferError::ApplyInProgress => AppError::Conflict(msg),
            TransferError::PartialApplyFailure {
                failed_kind,
                committed,
                warnings,
                ..
            } => AppError::ApplyFailed {
                message: msg,
                details: json!({
                    "failedKind": failed_kind,
                    "committed": committed,
                    "warnings": warnings,
                }),
            },
            other => AppError::Internal(anyhow::Error::new(other)),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, msg) = match &self {
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            AppError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            AppError::Unauthorized(m) => (StatusCode::UNAUTHORIZED, m.clone()),
            AppError::Forbidden(m) => (StatusCode::FORBIDDEN, m.clone()),
            AppError::Conflict(m) => (StatusCode::CONFLICT, m.clone()),
            AppError::Unprocessable(m) => (StatusCode::UNPROCESSABLE_ENTITY, m.clone()),
            AppError::ApplyFailed { message, details } => {
                tracing::error!(details = %details, "Apply failed: {message}");
                let body = json!({ "error": message, "details": details });
                return (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response();
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".into())
            }
        };
        (status, Json(json!({ "error": msg }))).into_response()
    }
}
