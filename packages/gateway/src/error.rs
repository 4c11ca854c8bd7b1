// ABOUTME: Closed error taxonomy surfaced by the gateway pipeline
// ABOUTME: Each variant maps one-to-one onto an outbound ErrorKind

use crate::types::{Confidence, ErrorKind, LimitType};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("Validation failed ({rule_id}): {reason}")]
    ValidationFailed {
        rule_id: String,
        confidence: Confidence,
        reason: String,
    },

    #[error("Rate limit exceeded on {limit_type} window, retry after {retry_after:?}")]
    RateLimited {
        limit_type: LimitType,
        retry_after: Duration,
    },

    #[error("Service unavailable: {reason}")]
    ServiceUnavailable {
        retry_after: Option<Duration>,
        reason: String,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Reject a malformed request before any other stage runs
    pub fn request(rule: &str, reason: impl Into<String>) -> Self {
        Self::ValidationFailed {
            rule_id: format!("request:{}", rule),
            confidence: Confidence::High,
            reason: reason.into(),
        }
    }

    pub fn unavailable(reason: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::ServiceUnavailable {
            retry_after,
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::ValidationFailed { .. } => ErrorKind::ValidationFailed,
            GatewayError::RateLimited { .. } => ErrorKind::RateLimited,
            GatewayError::ServiceUnavailable { .. } => ErrorKind::ServiceUnavailable,
            GatewayError::Internal(_) => ErrorKind::InternalError,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GatewayError::RateLimited { retry_after, .. } => Some(*retry_after),
            GatewayError::ServiceUnavailable { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
