//! Error types shared across the cache layers
//!
//! Each layer has its own error enum. Upstream and snapshot failures are
//! recovered inside the orchestrator's fallback chain; only `ResolveError`
//! leaves it, and the service layer turns everything into an `ApiError`
//! payload that a route layer can serialize directly.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::data::CacheKey;

/// Machine-readable error kind carried by every error payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unreachable,
    BadStatus,
    MalformedPayload,
    IoError,
    NotFound,
    Unavailable,
    BadRequest,
}

/// Errors produced by the upstream client
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Network, DNS or connect failure
    #[error("upstream unreachable: {0}")]
    Unreachable(String),

    /// The request did not complete within the configured timeout
    #[error("upstream timed out after {0:?}")]
    Timeout(Duration),

    /// Upstream answered with a non-success status
    #[error("upstream returned status {0}")]
    BadStatus(u16),

    /// Response body could not be parsed
    #[error("malformed upstream payload: {0}")]
    MalformedPayload(String),

    /// Upstream does not know the requested sub-key
    #[error("{0}")]
    NotFound(String),
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::Unreachable(_) | FetchError::Timeout(_) => ErrorKind::Unreachable,
            FetchError::BadStatus(_) => ErrorKind::BadStatus,
            FetchError::MalformedPayload(_) => ErrorKind::MalformedPayload,
            FetchError::NotFound(_) => ErrorKind::NotFound,
        }
    }
}

/// Errors produced by the snapshot store
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem read/write failed
    #[error("snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Record could not be serialized
    #[error("failed to encode snapshot: {0}")]
    Encode(serde_json::Error),

    /// Record on disk could not be parsed
    #[error("failed to decode snapshot: {0}")]
    Decode(serde_json::Error),

    /// The operation did not complete within the configured timeout
    #[error("snapshot operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Terminal outcome of a failed resolve
#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    /// The requested sub-key does not exist upstream
    #[error("{0}")]
    NotFound(String),

    /// No fresh data, no snapshot and no stale memory
    #[error("no data available for {key}: {cause}")]
    Unavailable { key: CacheKey, cause: String },
}

/// Structured error payload returned to collaborators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("{message}")]
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

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// HTTP status a route layer should answer with
    pub fn http_status(&self) -> u16 {
        match self.kind {
            ErrorKind::BadRequest => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Unavailable
            | ErrorKind::Unreachable
            | ErrorKind::BadStatus
            | ErrorKind::MalformedPayload => 503,
            ErrorKind::IoError => 500,
        }
    }
}

impl From<ResolveError> for ApiError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::NotFound(message) => ApiError::not_found(message),
            ResolveError::Unavailable { key, .. } => ApiError::new(
                ErrorKind::Unavailable,
                format!("{} data is currently unavailable", key.category.label()),
            ),
        }
    }
}
