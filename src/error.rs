//! Error taxonomy for the ingestion engine.
//!
//! Fetch failures are split by whether a retry can help. Per-item parse
//! failures are counted by the pipeline and never abort a batch. Gate
//! rejections (`LockBusy`, `RateLimitExceeded`) are returned to the caller
//! as-is so operators can tell "already running" from "too soon".

use std::time::Duration;

use thiserror::Error;

use crate::models::SourceKind;

/// Result alias used across the engine.
pub type Result<T> = std::result::Result<T, IngestError>;

/// Failure of a single network call, after classification.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    /// 5xx or transport failure. Worth retrying.
    #[error("transient fetch error: {0}")]
    Transient(String),

    /// 4xx (other than 429), undecodable body, or missing credentials.
    #[error("permanent fetch error{}: {message}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Permanent {
        status: Option<u16>,
        message: String,
    },

    /// HTTP 429 from upstream, with the server's retry hint if it sent one.
    #[error("throttled by upstream (retry after {retry_after:?})")]
    Throttled { retry_after: Option<Duration> },

    /// The per-request timeout elapsed.
    #[error("request timed out")]
    Timeout,
}

impl FetchError {
    pub fn permanent(message: impl Into<String>) -> Self {
        FetchError::Permanent {
            status: None,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, FetchError::Permanent { .. })
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else if err.is_decode() || err.is_builder() {
            FetchError::permanent(err.to_string())
        } else if let Some(status) = err.status() {
            if status.is_server_error() {
                FetchError::Transient(err.to_string())
            } else {
                FetchError::Permanent {
                    status: Some(status.as_u16()),
                    message: err.to_string(),
                }
            }
        } else {
            FetchError::Transient(err.to_string())
        }
    }
}

/// A raw item that could not be normalized.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{kind} item could not be parsed: {reason}")]
pub struct ParseError {
    pub kind: SourceKind,
    pub reason: String,
}

impl ParseError {
    pub fn new(kind: SourceKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Local manual-trigger gate; not an upstream 429.
    #[error("manual run requested too soon; retry in {}s", .retry_after.as_secs())]
    RateLimitExceeded { retry_after: Duration },

    /// Single-flight conflict: a run for this source is already in progress.
    #[error("a run is already in progress for data source {source_id}")]
    LockBusy { source_id: String },

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("persistence error: {message}")]
    Persistence { message: String, transient: bool },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid: {0}")]
    Invalid(String),

    #[error("conflict: {0}")]
    Conflict(String),
}

impl IngestError {
    pub fn persistence(message: impl Into<String>, transient: bool) -> Self {
        IngestError::Persistence {
            message: message.into(),
            transient,
        }
    }

    pub fn is_transient_persistence(&self) -> bool {
        matches!(
            self,
            IngestError::Persistence {
                transient: true,
                ..
            }
        )
    }
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => {
                IngestError::persistence(err.to_string(), true)
            }
            sqlx::Error::Database(db) => {
                // SQLITE_BUSY (5) and SQLITE_LOCKED (6), including extended codes.
                let busy = db
                    .code()
                    .and_then(|c| c.parse::<i64>().ok())
                    .map(|c| matches!(c & 0xff, 5 | 6))
                    .unwrap_or(false);
                IngestError::persistence(err.to_string(), busy)
            }
            _ => IngestError::persistence(err.to_string(), false),
        }
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(err: serde_json::Error) -> Self {
        IngestError::persistence(format!("serialization: {err}"), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permanent_is_not_retryable() {
        assert!(!FetchError::permanent("bad request").is_retryable());
        assert!(FetchError::Transient("reset".into()).is_retryable());
        assert!(FetchError::Timeout.is_retryable());
        assert!(FetchError::Throttled { retry_after: None }.is_retryable());
    }

    #[test]
    fn test_permanent_display_includes_status() {
        let err = FetchError::Permanent {
            status: Some(404),
            message: "missing".into(),
        };
        assert_eq!(err.to_string(), "permanent fetch error (HTTP 404): missing");
        assert_eq!(
            FetchError::permanent("x").to_string(),
            "permanent fetch error: x"
        );
    }

    #[test]
    fn test_transient_persistence() {
        assert!(IngestError::persistence("locked", true).is_transient_persistence());
        assert!(!IngestError::persistence("constraint", false).is_transient_persistence());
        assert!(!IngestError::NotFound("x".into()).is_transient_persistence());
    }
}
