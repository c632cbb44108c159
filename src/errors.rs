use crate::services::{
    archive::ArchiveError, backup_pipeline::BackupError, download_token::TokenError,
    object_store::ObjectStoreError, rebuild_pipeline::RebuildError, record_store::StoreError,
};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for general errors that keeps the message local.
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

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, msg)
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

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => AppError::not_found(err.to_string()),
            StoreError::Sqlx(_) => AppError::internal(err.to_string()),
        }
    }
}

impl From<ObjectStoreError> for AppError {
    fn from(err: ObjectStoreError) -> Self {
        match err {
            ObjectStoreError::BucketNotFound(_) | ObjectStoreError::NotFound { .. } => {
                AppError::not_found(err.to_string())
            }
            _ => AppError::internal(err.to_string()),
        }
    }
}

impl From<TokenError> for AppError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Expired | TokenError::Invalid(_) => AppError::unauthorized(err.to_string()),
            _ => AppError::internal(err.to_string()),
        }
    }
}

impl From<ArchiveError> for AppError {
    fn from(err: ArchiveError) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<BackupError> for AppError {
    fn from(err: BackupError) -> Self {
        match err {
            BackupError::NoWallet => AppError::new(StatusCode::PRECONDITION_FAILED, err.to_string()),
            BackupError::Store(inner) => inner.into(),
            BackupError::ObjectStore(inner) => inner.into(),
            BackupError::Deal(_) => AppError::new(StatusCode::BAD_GATEWAY, err.to_string()),
            BackupError::Token(_) => AppError::internal(err.to_string()),
        }
    }
}

impl From<RebuildError> for AppError {
    fn from(err: RebuildError) -> Self {
        match err {
            RebuildError::NotRebuildable { .. } => {
                AppError::new(StatusCode::CONFLICT, err.to_string())
            }
            RebuildError::Store(inner) => inner.into(),
            RebuildError::Deal(_) => AppError::new(StatusCode::BAD_GATEWAY, err.to_string()),
            _ => AppError::internal(err.to_string()),
        }
    }
}
