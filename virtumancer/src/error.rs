//! Error classification: every failure surfaced to a client carries a stable
//! code, an HTTP status and a user-facing message.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use virtumancer_hv::domain_xml::XmlError;
use virtumancer_hv::{HvError, HvErrorKind};

use crate::pool::PoolError;
use crate::store::StoreError;

/// Stable error codes returned in `{"code": ...}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    BadRequest,
    ValidationError,
    NotFound,
    Conflict,
    RateLimit,
    HostNotFound,
    HostDisconnected,
    VmNotFound,
    VmBusy,
    VmStateError,
    LibvirtError,
    DatabaseError,
    Timeout,
    DependencyError,
    InternalError,
    ServiceUnavailable,
}

impl ErrorCode {
    pub fn status(self) -> StatusCode {
        match self {
            ErrorCode::BadRequest | ErrorCode::ValidationError => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound | ErrorCode::HostNotFound | ErrorCode::VmNotFound => {
                StatusCode::NOT_FOUND
            }
            ErrorCode::Conflict | ErrorCode::VmBusy | ErrorCode::VmStateError => {
                StatusCode::CONFLICT
            }
            ErrorCode::RateLimit => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::HostDisconnected
            | ErrorCode::DependencyError
            | ErrorCode::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::LibvirtError | ErrorCode::DatabaseError | ErrorCode::InternalError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::RateLimit => "RATE_LIMIT",
            ErrorCode::HostNotFound => "HOST_NOT_FOUND",
            ErrorCode::HostDisconnected => "HOST_DISCONNECTED",
            ErrorCode::VmNotFound => "VM_NOT_FOUND",
            ErrorCode::VmBusy => "VM_BUSY",
            ErrorCode::VmStateError => "VM_STATE_ERROR",
            ErrorCode::LibvirtError => "LIBVIRT_ERROR",
            ErrorCode::DatabaseError => "DATABASE_ERROR",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::DependencyError => "DEPENDENCY_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by every service operation and HTTP handler.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Validation(String),

    #[error("host {0} not found")]
    HostNotFound(String),

    #[error("host {0} is not connected")]
    HostDisconnected(String),

    #[error("vm {0} not found")]
    VmNotFound(String),

    #[error("vm {0} is busy")]
    VmBusy(String),

    #[error("{0}")]
    VmState(String),

    #[error("{0}")]
    Timeout(String),

    #[error(transparent)]
    Hypervisor(#[from] HvError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Xml(#[from] XmlError),

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Internal(String),
}

impl AppError {
    /// `(code, status, user message)` for this error.
    pub fn classify(&self) -> (ErrorCode, StatusCode, String) {
        let (code, message) = match self {
            AppError::BadRequest(msg) => (ErrorCode::BadRequest, msg.clone()),
            AppError::Validation(msg) => (ErrorCode::ValidationError, msg.clone()),
            AppError::HostNotFound(_) => (ErrorCode::HostNotFound, self.to_string()),
            AppError::HostDisconnected(_) => (ErrorCode::HostDisconnected, self.to_string()),
            AppError::VmNotFound(_) => (ErrorCode::VmNotFound, self.to_string()),
            AppError::VmBusy(_) => (ErrorCode::VmBusy, self.to_string()),
            AppError::VmState(msg) => (ErrorCode::VmStateError, msg.clone()),
            AppError::Timeout(msg) => (ErrorCode::Timeout, msg.clone()),
            AppError::Hypervisor(e) => (classify_hv(e.kind), e.message.clone()),
            AppError::Store(e) => classify_store(e),
            AppError::Pool(e) => match e {
                PoolError::HostNotFound(_) => (ErrorCode::HostNotFound, e.to_string()),
                PoolError::Disconnected(_) => (ErrorCode::HostDisconnected, e.to_string()),
                PoolError::Hypervisor(hv) => (classify_hv(hv.kind), hv.message.clone()),
                PoolError::Store(store) => classify_store(store),
                PoolError::Join(_) => (ErrorCode::InternalError, e.to_string()),
            },
            AppError::Xml(e) => (ErrorCode::LibvirtError, e.to_string()),
            AppError::Unavailable(msg) => (ErrorCode::ServiceUnavailable, msg.clone()),
            AppError::Internal(msg) => (ErrorCode::InternalError, msg.clone()),
        };
        (code, code.status(), message)
    }

    pub fn code(&self) -> ErrorCode {
        self.classify().0
    }
}

fn classify_hv(kind: HvErrorKind) -> ErrorCode {
    match kind {
        HvErrorKind::Unreachable | HvErrorKind::Auth | HvErrorKind::ConnectionLost => {
            ErrorCode::HostDisconnected
        }
        HvErrorKind::NotFound => ErrorCode::VmNotFound,
        HvErrorKind::InvalidOperation => ErrorCode::VmStateError,
        HvErrorKind::Timeout => ErrorCode::Timeout,
        HvErrorKind::UnsupportedUri => ErrorCode::ValidationError,
        HvErrorKind::Unsupported => ErrorCode::DependencyError,
        HvErrorKind::Internal => ErrorCode::LibvirtError,
    }
}

fn classify_store(e: &StoreError) -> (ErrorCode, String) {
    match e {
        StoreError::NotFound(msg) => (ErrorCode::NotFound, format!("not found: {}", msg)),
        StoreError::Conflict(msg) => (ErrorCode::Conflict, msg.clone()),
        StoreError::Busy(msg) => (ErrorCode::VmBusy, msg.clone()),
        StoreError::Database(_) | StoreError::Serialization(_) | StoreError::Corrupt(_) => {
            (ErrorCode::DatabaseError, "database error".to_string())
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    code: ErrorCode,
    error: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (code, status, message) = self.classify();
        if status.is_server_error() {
            tracing::error!(code = %code, error = %self, "request failed");
        } else {
            tracing::debug!(code = %code, error = %self, "request rejected");
        }
        (status, Json(ErrorBody { code, error: message })).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
