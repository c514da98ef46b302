//! Error taxonomy for the storage element.
//!
//! Subsystems carry their own `thiserror` enums; everything that reaches a
//! request handler is mapped into [`ApiError`], the closed set of kinds the
//! HTTP contract exposes as `{ "code": ..., "message": ... }`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

/// Closed set of error kinds exposed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ValidationError,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    FileTooLarge,
    ModeNotAllowed,
    SeUnavailable,
    InvalidTransition,
    ConfirmationRequired,
    LeaderUnknown,
    ProxyError,
    InternalError,
}

impl ErrorKind {
    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::ValidationError => StatusCode::BAD_REQUEST,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::FileTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorKind::ModeNotAllowed => StatusCode::CONFLICT,
            ErrorKind::SeUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::InvalidTransition => StatusCode::CONFLICT,
            ErrorKind::ConfirmationRequired => StatusCode::CONFLICT,
            ErrorKind::LeaderUnknown => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::ProxyError => StatusCode::BAD_GATEWAY,
            ErrorKind::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Wire-level error body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorKind,
    pub message: String,
}

/// Error surfaced to HTTP callers.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationError, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn file_too_large(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::FileTooLarge, message)
    }

    pub fn mode_not_allowed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ModeNotAllowed, message)
    }

    pub fn leader_unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::LeaderUnknown, message)
    }

    pub fn proxy(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProxyError, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.kind.status();
        let body = ErrorBody {
            code: self.kind,
            message: self.message,
        };
        (status, Json(body)).into_response()
    }
}

/// Errors from the data-file store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("upload stream failed: {0}")]
    Stream(String),

    #[error("file exceeds the configured maximum of {limit} bytes")]
    MaxSizeExceeded { limit: u64 },
}

/// Errors from the sidecar metadata store.
#[derive(Debug, thiserror::Error)]
pub enum AttrError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sidecar is malformed: {0}")]
    Malformed(String),

    #[error("serialized sidecar is {size} bytes, cap is {cap}")]
    TooLarge { size: usize, cap: usize },
}

/// Errors from the write-ahead log.
#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wal entry is malformed: {0}")]
    Malformed(String),

    #[error("transaction {0} not found")]
    NotFound(uuid::Uuid),

    #[error("transaction {0} is not pending")]
    NotPending(uuid::Uuid),
}

/// Errors from the mode state machine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModeError {
    #[error("transition from {from} to {to} is not allowed")]
    InvalidTransition {
        from: crate::mode::StorageMode,
        to: crate::mode::StorageMode,
    },

    #[error("transition from {from} to {to} requires explicit confirmation")]
    ConfirmationRequired {
        from: crate::mode::StorageMode,
        to: crate::mode::StorageMode,
    },
}

/// Errors from leader election.
#[derive(Debug, thiserror::Error)]
pub enum ElectionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("lock file busy")]
    LockBusy,
}

/// Fatal configuration problems, reported before the service binds.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::MaxSizeExceeded { limit } => ApiError::file_too_large(format!(
                "file exceeds the configured maximum of {limit} bytes"
            )),
            StoreError::Stream(msg) => ApiError::validation(format!("upload stream failed: {msg}")),
            StoreError::Io(e) => ApiError::internal(format!("storage io error: {e}")),
        }
    }
}

impl From<AttrError> for ApiError {
    fn from(err: AttrError) -> Self {
        match err {
            AttrError::TooLarge { size, cap } => ApiError::validation(format!(
                "metadata serializes to {size} bytes, cap is {cap}"
            )),
            AttrError::Malformed(msg) => ApiError::internal(format!("sidecar malformed: {msg}")),
            AttrError::Io(e) => ApiError::internal(format!("sidecar io error: {e}")),
        }
    }
}

impl From<WalError> for ApiError {
    fn from(err: WalError) -> Self {
        ApiError::internal(format!("wal error: {err}"))
    }
}

impl From<ModeError> for ApiError {
    fn from(err: ModeError) -> Self {
        match &err {
            ModeError::InvalidTransition { .. } => {
                ApiError::new(ErrorKind::InvalidTransition, err.to_string())
            }
            ModeError::ConfirmationRequired { .. } => {
                ApiError::new(ErrorKind::ConfirmationRequired, err.to_string())
            }
        }
    }
}
