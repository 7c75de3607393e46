use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::rate_limiter::Dimension;

/// Terminal failures surfaced to the caller of the pipeline.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchError {
    #[error("rejected by policy: {0}")]
    RejectedByPolicy(PolicyRejection),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("all providers failed: {}", summarize(.0))]
    AllProvidersFailed(Vec<ProviderFailure>),
}

impl DispatchError {
    /// Only provider exhaustion means "try again later"; everything else is on the caller.
    pub fn is_retry_later(&self) -> bool {
        matches!(self, DispatchError::AllProvidersFailed(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::RejectedByPolicy(PolicyRejection::RateLimited { .. }) => "rate_limited",
            DispatchError::RejectedByPolicy(PolicyRejection::QueueFull { .. }) => "queue_full",
            DispatchError::Validation(_) => "validation_error",
            DispatchError::AllProvidersFailed(_) => "all_providers_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PolicyRejection {
    RateLimited {
        dimension: Dimension,
        retry_after: Duration,
    },
    QueueFull {
        queued: usize,
    },
}

impl fmt::Display for PolicyRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyRejection::RateLimited {
                dimension,
                retry_after,
            } => write!(
                f,
                "{} rate limit exceeded, retry after {}s",
                dimension,
                retry_after.as_secs_f64().ceil() as u64
            ),
            PolicyRejection::QueueFull { queued } => {
                write!(f, "admission queue full ({} waiting)", queued)
            }
        }
    }
}

/// One provider's reason for giving up, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderFailure {
    pub provider: String,
    pub reason: String,
}

impl ProviderFailure {
    pub fn new(provider: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            reason: reason.into(),
        }
    }
}

fn summarize(failures: &[ProviderFailure]) -> String {
    if failures.is_empty() {
        return "no providers configured".to_string();
    }
    failures
        .iter()
        .map(|f| format!("{}: {}", f.provider, f.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors reported by a provider adapter, already normalized.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    #[error("transient provider error: {0}")]
    Transient(String),
    #[error("quota exhausted: {0}")]
    QuotaExhausted(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl ProviderError {
    /// Quota and auth failures are the key's fault, not the provider's.
    pub fn is_key_failure(&self) -> bool {
        matches!(
            self,
            ProviderError::QuotaExhausted(_) | ProviderError::Unauthorized(_)
        )
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        // Request URLs may carry credentials.
        let err = err.without_url();
        if err.is_timeout() {
            ProviderError::Transient(format!("request timed out: {}", err))
        } else if err.is_decode() {
            ProviderError::Transient(format!("malformed provider response: {}", err))
        } else {
            ProviderError::Transient(err.to_string())
        }
    }
}

/// Outcome of a router run that did not produce a translation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RouterError {
    #[error("input rejected by {provider}: {reason}")]
    Rejected { provider: String, reason: String },
    #[error("all providers failed: {}", summarize(.0))]
    AllProvidersFailed(Vec<ProviderFailure>),
}

impl From<RouterError> for DispatchError {
    fn from(err: RouterError) -> Self {
        match err {
            RouterError::Rejected { provider, reason } => {
                DispatchError::Validation(format!("{} rejected the request: {}", provider, reason))
            }
            RouterError::AllProvidersFailed(failures) => DispatchError::AllProvidersFailed(failures),
        }
    }
}

/// Remote cache failures. Never surfaced to callers; they degrade the cache instead.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("remote cache error: {0}")]
    Remote(String),
    #[error("remote cache timed out after {0:?}")]
    Timeout(Duration),
    #[error("remote cache unreachable")]
    Unreachable,
    #[error("cache entry encoding error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::Remote(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid value for {var}: {reason}")]
    Env { var: String, reason: String },
}

pub type DispatchResult<T> = Result<T, DispatchError>;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<ProviderFailure>,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
            failures: Vec::new(),
        }
    }

    pub fn from_dispatch_error(err: &DispatchError) -> Self {
        let status = status_for(err);
        let mut response = Self::new(err.kind(), &err.to_string(), status.as_u16());
        if let DispatchError::AllProvidersFailed(failures) = err {
            response.failures = failures.clone();
        }
        response
    }
}

fn status_for(err: &DispatchError) -> StatusCode {
    match err {
        DispatchError::RejectedByPolicy(PolicyRejection::RateLimited { .. }) => {
            StatusCode::TOO_MANY_REQUESTS
        }
        DispatchError::RejectedByPolicy(PolicyRejection::QueueFull { .. }) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        DispatchError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        DispatchError::AllProvidersFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn retry_after(err: &DispatchError) -> Option<u64> {
    match err {
        DispatchError::RejectedByPolicy(PolicyRejection::RateLimited { retry_after, .. }) => {
            Some(retry_after.as_secs_f64().ceil().max(1.0) as u64)
        }
        DispatchError::RejectedByPolicy(PolicyRejection::QueueFull { .. }) => Some(1),
        DispatchError::AllProvidersFailed(_) => Some(60),
        DispatchError::Validation(_) => None,
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        let body = ErrorResponse::from_dispatch_error(&self);
        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after(&self) {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
