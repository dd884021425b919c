//! Error types for the Tollgate service.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::ratelimit::StoreError;

/// Main error type for Tollgate operations outside the request path.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for TollgateError {
    fn from(err: config::ConfigError) -> Self {
        TollgateError::Config(err.to_string())
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;

/// Errors produced while evaluating rate limit rules for one request.
#[derive(Error, Debug, Clone)]
pub enum RateLimitError {
    /// The shared counter store could not be reached or timed out.
    #[error("counter store unavailable: {0}")]
    StoreUnavailable(String),

    /// The aggregate remaining quota for the request is exhausted.
    #[error("Too Many Requests")]
    RateLimitExceeded {
        limit: i64,
        reset_at: DateTime<Utc>,
    },

    /// A rule produced a limit that cannot be used.
    #[error("invalid rate limit rule `{rule}`: {reason}")]
    Configuration { rule: String, reason: String },
}

impl From<StoreError> for RateLimitError {
    fn from(err: StoreError) -> Self {
        RateLimitError::StoreUnavailable(err.to_string())
    }
}

impl RateLimitError {
    /// HTTP status code this error is reported with.
    pub fn status_code(&self) -> u16 {
        match self {
            RateLimitError::StoreUnavailable(_) => 503,
            RateLimitError::RateLimitExceeded { .. } => 429,
            RateLimitError::Configuration { .. } => 500,
        }
    }

    /// Short machine-readable error category.
    pub fn kind(&self) -> &'static str {
        match self {
            RateLimitError::StoreUnavailable(_) => "store",
            RateLimitError::RateLimitExceeded { .. } => "rate",
            RateLimitError::Configuration { .. } => "config",
        }
    }

    /// Build the structured error value reported to clients.
    pub fn to_body(&self) -> ErrorBody {
        let status_code = self.status_code();
        let mut params = BTreeMap::new();
        let message = match self {
            RateLimitError::RateLimitExceeded { limit, reset_at } => {
                params.insert("limit".to_string(), serde_json::json!(limit));
                params.insert("reset".to_string(), serde_json::json!(reset_at));
                "Too Many Requests".to_string()
            }
            RateLimitError::StoreUnavailable(_) => "Service Unavailable".to_string(),
            RateLimitError::Configuration { .. } => "Internal Server Error".to_string(),
        };

        ErrorBody {
            message,
            kind: self.kind().to_string(),
            status_code,
            params: if params.is_empty() { None } else { Some(params) },
        }
    }
}

/// A single structured error, as rendered in response bodies.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<BTreeMap<String, serde_json::Value>>,
}

/// Envelope holding every error reported for a request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorEnvelope {
    pub errors: Vec<ErrorBody>,
    pub errors_text: String,
    pub status_code: u16,
}

impl From<ErrorBody> for ErrorEnvelope {
    fn from(body: ErrorBody) -> Self {
        Self {
            errors_text: body.message.clone(),
            status_code: body.status_code,
            errors: vec![body],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_rate_limit_exceeded_body() {
        let reset_at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let err = RateLimitError::RateLimitExceeded { limit: 5, reset_at };

        let body = err.to_body();
        assert_eq!(body.message, "Too Many Requests");
        assert_eq!(body.kind, "rate");
        assert_eq!(body.status_code, 429);

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["type"], "rate");
        assert_eq!(json["params"]["limit"], 5);
        assert_eq!(json["params"]["reset"], "2023-11-14T22:13:20Z");
    }

    #[test]
    fn test_store_unavailable_is_server_error() {
        let err: RateLimitError = StoreError::Timeout.into();
        assert_eq!(err.status_code(), 503);

        let json = serde_json::to_value(err.to_body()).unwrap();
        assert_eq!(json["type"], "store");
        assert!(json.get("params").is_none());
    }

    #[test]
    fn test_envelope_from_body() {
        let err = RateLimitError::Configuration {
            rule: "login".to_string(),
            reason: "limit is not an integer".to_string(),
        };
        let envelope = ErrorEnvelope::from(err.to_body());
        assert_eq!(envelope.status_code, 500);
        assert_eq!(envelope.errors.len(), 1);
        assert_eq!(envelope.errors_text, "Internal Server Error");
    }
}
