//! Error types for hybridstore
//!
//! Three layers of errors live here:
//! - `ErrorKind`: the machine-readable taxonomy every failure is reported as
//! - `BackendError`: what an adapter returns once a raw transport error
//!   (`object_store::Error`, `sqlx::Error`, a timeout) has been classified
//! - `ApiError`: the structured `{kind, backend, message}` body returned to
//!   HTTP callers
//!
//! Operation-specific errors (`SwitchError`, `StoreError`, ...) are defined
//! next to the operations that return them and implement [`Classify`].

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Machine-readable failure category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Network/connectivity to a backend failed
    Unreachable,
    /// Backend reachable but not ready, or failed its probe
    Unhealthy,
    /// Mutual-exclusion violation
    AlreadyInProgress,
    /// Operation refused because a required condition did not hold
    PreconditionFailed,
    /// File does not meet provider constraints
    SizeOrTypeRejected,
    /// Fan-out operation where some targets failed
    PartialFailure,
    NotFound,
    InvalidRequest,
    /// Stopped by an operator
    Cancelled,
    Internal,
}

impl ErrorKind {
    /// HTTP status used when this kind is returned from the API
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorKind::Unreachable | ErrorKind::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::AlreadyInProgress => StatusCode::CONFLICT,
            ErrorKind::PreconditionFailed => StatusCode::PRECONDITION_FAILED,
            ErrorKind::SizeOrTypeRejected => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::PartialFailure => StatusCode::MULTI_STATUS,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorKind::Cancelled => StatusCode::CONFLICT,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Errors that can be reported to an operator as `{kind, backend, message}`
pub trait Classify: std::error::Error {
    fn kind(&self) -> ErrorKind;

    /// Identity of the backend the failure is attributed to, if any
    fn backend(&self) -> Option<String> {
        None
    }
}

/// Failure of a single backend call, classified at the adapter boundary
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("object not found: {path}")]
    NotFound { path: String },

    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("authentication failed: {0}")]
    Unauthorized(String),

    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("not configured")]
    NotConfigured,

    #[error("{0}")]
    Other(String),
}

impl BackendError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackendError::NotFound { .. } => ErrorKind::NotFound,
            BackendError::Unreachable(_) | BackendError::Timeout(_) => ErrorKind::Unreachable,
            BackendError::Unauthorized(_) | BackendError::NotConfigured | BackendError::Other(_) => {
                ErrorKind::Unhealthy
            }
        }
    }

    /// True when the backend as a whole could not be reached
    pub fn is_unreachable(&self) -> bool {
        matches!(self, BackendError::Unreachable(_) | BackendError::Timeout(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound { .. })
    }
}

impl From<object_store::Error> for BackendError {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { path, .. } => BackendError::NotFound { path },
            other => classify_message(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for BackendError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolClosed => {
                BackendError::Unreachable(err.to_string())
            }
            sqlx::Error::PoolTimedOut => {
                BackendError::Unreachable("timed out acquiring a connection".to_string())
            }
            sqlx::Error::Database(db) => match db.code().as_deref() {
                // invalid_authorization_specification / invalid_password
                Some("28000") | Some("28P01") => BackendError::Unauthorized(db.message().to_string()),
                // connection_exception class
                Some(code) if code.starts_with("08") => BackendError::Unreachable(db.message().to_string()),
                _ => BackendError::Other(err.to_string()),
            },
            _ => BackendError::Other(err.to_string()),
        }
    }
}

/// Classify transport errors that only surface as text
fn classify_message(message: String) -> BackendError {
    let lower = message.to_lowercase();
    let auth_markers = ["401", "403", "unauthorized", "unauthenticated", "forbidden", "access denied", "credential"];
    let network_markers = [
        "connect",
        "dns",
        "timed out",
        "timeout",
        "network",
        "broken pipe",
        "error sending request",
    ];

    if auth_markers.iter().any(|marker| lower.contains(marker)) {
        BackendError::Unauthorized(message)
    } else if network_markers.iter().any(|marker| lower.contains(marker)) {
        BackendError::Unreachable(message)
    } else {
        BackendError::Other(message)
    }
}

/// Run a backend call with an upper bound on its duration
///
/// A call that does not finish in time is reported as `BackendError::Timeout`,
/// never as success.
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> std::result::Result<T, BackendError>
where
    F: Future<Output = std::result::Result<T, BackendError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Timeout(limit)),
    }
}

/// Structured error returned by the HTTP API
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiError {
    pub kind: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            backend: None,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl<E: Classify> From<E> for ApiError {
    fn from(err: E) -> Self {
        Self {
            kind: err.kind(),
            backend: err.backend(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.kind.status_code(), Json(self)).into_response()
    }
}

/// Result type alias for HTTP handlers
pub type Result<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_classification() {
        assert!(matches!(
            classify_message("error sending request for url".to_string()),
            BackendError::Unreachable(_)
        ));
        assert!(matches!(
            classify_message("Client error with status 403 Forbidden".to_string()),
            BackendError::Unauthorized(_)
        ));
        assert!(matches!(
            classify_message("checksum mismatch".to_string()),
            BackendError::Other(_)
        ));
    }

    #[test]
    fn test_not_found_maps_from_object_store() {
        let err = object_store::Error::NotFound {
            path: "a/b.txt".to_string(),
            source: "missing".into(),
        };
        assert_eq!(
            BackendError::from(err),
            BackendError::NotFound {
                path: "a/b.txt".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_timeout_is_failure() {
        let result: std::result::Result<(), BackendError> = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert_eq!(result, Err(BackendError::Timeout(Duration::from_millis(10))));
        assert_eq!(BackendError::Timeout(Duration::from_millis(10)).kind(), ErrorKind::Unreachable);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(ErrorKind::AlreadyInProgress.status_code(), StatusCode::CONFLICT);
        assert_eq!(ErrorKind::PreconditionFailed.status_code(), StatusCode::PRECONDITION_FAILED);
        assert_eq!(ErrorKind::Unreachable.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
