//! Collaborator seams used by the sync engine.
//!
//! Each collaborator is a single-method trait so hosts can plug in the real
//! backend client, cache and auth session, and tests can plug in doubles.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;

/// Classified reason a remote call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 4xx other than 401/403/408/429; the request itself is wrong.
    Validation,
    /// 401/403; needs re-authentication upstream.
    Auth,
    /// 429.
    RateLimit,
    /// Timeout, 5xx, or a connection failure while the network looked up.
    Transient,
    /// Connectivity lost.
    Offline,
}

impl ErrorKind {
    /// Whether retrying can ever succeed.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        !matches!(self, Self::Validation | Self::Auth)
    }

    /// Stored representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Auth => "auth",
            Self::RateLimit => "rate_limit",
            Self::Transient => "transient",
            Self::Offline => "offline",
        }
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "validation" => Ok(Self::Validation),
            "auth" => Ok(Self::Auth),
            "rate_limit" => Ok(Self::RateLimit),
            "transient" => Ok(Self::Transient),
            "offline" => Ok(Self::Offline),
            other => Err(SyncError::Parse(format!("Unknown error kind: {other}"))),
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Failure returned by a [`RemoteInvoker`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct InvokeError {
    pub kind: ErrorKind,
    pub message: String,
    /// Backend error code, if any.
    pub code: Option<String>,
    pub http_status: Option<u16>,
    /// Server-provided wait hint for rate limits.
    pub retry_after: Option<Duration>,
}

impl InvokeError {
    /// Create an error of the given kind.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
            http_status: None,
            retry_after: None,
        }
    }

    /// Classify an HTTP error response.
    #[must_use]
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            401 | 403 => ErrorKind::Auth,
            408 => ErrorKind::Transient,
            429 => ErrorKind::RateLimit,
            400..=499 => ErrorKind::Validation,
            _ => ErrorKind::Transient,
        };
        Self {
            http_status: Some(status),
            ..Self::new(kind, message)
        }
    }

    /// Connectivity was lost during the call.
    #[must_use]
    pub fn offline(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Offline, message)
    }

    /// The call did not finish within its timeout.
    #[must_use]
    pub fn timeout(after: Duration) -> Self {
        Self::new(
            ErrorKind::Transient,
            format!("Request timed out after {}ms", after.as_millis()),
        )
    }

    /// Attach a backend error code.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Attach a retry-after hint.
    #[must_use]
    pub const fn with_retry_after(mut self, after: Duration) -> Self {
        self.retry_after = Some(after);
        self
    }
}

/// One authenticated remote call.
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeRequest {
    /// Backend function name, e.g. `batch-action`.
    pub action_name: String,
    pub body: Value,
    /// Sent so the backend can recognise retried calls.
    pub idempotency_key: String,
    pub auth_token: String,
}

/// Performs the network call for a mutation.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteInvoker: Send + Sync {
    /// Invoke a backend action, returning its `data` on success.
    async fn invoke(&self, request: &InvokeRequest) -> Result<Value, InvokeError>;
}

/// Local query cache that must forget stale results after a delivery.
#[cfg_attr(test, mockall::automock)]
pub trait CacheInvalidator: Send + Sync {
    /// Drop cached results for the given query keys.
    fn invalidate(&self, query_keys: &[String]);
}

/// Source of the signed-in user's access token.
#[cfg_attr(test, mockall::automock)]
pub trait SessionProvider: Send + Sync {
    /// Current token, or `None` when signed out.
    fn access_token(&self) -> Option<String>;
}

/// Session provider with a fixed token.
#[derive(Debug, Clone)]
pub struct StaticSession(pub String);

impl SessionProvider for StaticSession {
    fn access_token(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Cache invalidator for hosts without a local query cache.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCache;

impl CacheInvalidator for NoopCache {
    fn invalidate(&self, _query_keys: &[String]) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(InvokeError::from_status(400, "bad").kind, ErrorKind::Validation);
        assert_eq!(InvokeError::from_status(422, "bad").kind, ErrorKind::Validation);
        assert_eq!(InvokeError::from_status(401, "no").kind, ErrorKind::Auth);
        assert_eq!(InvokeError::from_status(403, "no").kind, ErrorKind::Auth);
        assert_eq!(InvokeError::from_status(408, "slow").kind, ErrorKind::Transient);
        assert_eq!(InvokeError::from_status(429, "slow down").kind, ErrorKind::RateLimit);
        assert_eq!(InvokeError::from_status(503, "down").kind, ErrorKind::Transient);
        assert_eq!(InvokeError::from_status(503, "down").http_status, Some(503));
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(!ErrorKind::Validation.is_retryable());
        assert!(!ErrorKind::Auth.is_retryable());
        assert!(ErrorKind::RateLimit.is_retryable());
        assert!(ErrorKind::Transient.is_retryable());
        assert!(ErrorKind::Offline.is_retryable());
    }

    #[test]
    fn test_kind_round_trips_through_storage_string() {
        for kind in [
            ErrorKind::Validation,
            ErrorKind::Auth,
            ErrorKind::RateLimit,
            ErrorKind::Transient,
            ErrorKind::Offline,
        ] {
            assert_eq!(kind.as_str().parse::<ErrorKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_error_display() {
        let err = InvokeError::from_status(422, "title is required").with_code("E_TITLE");
        assert_eq!(err.to_string(), "validation: title is required");
        assert_eq!(err.code.as_deref(), Some("E_TITLE"));
    }

    #[test]
    fn test_timeout_is_transient() {
        let err = InvokeError::timeout(Duration::from_secs(30));
        assert_eq!(err.kind, ErrorKind::Transient);
        assert!(err.message.contains("30000ms"));
    }
}
