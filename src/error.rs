//! Error types for the Outproxy gateway.

use std::time::Duration;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::ratelimit::StoreError;

/// Main error type for Outproxy operations.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The shared counter store could not serve the request
    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// Malformed or out-of-range input to the reconfiguration endpoint
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The client stayed over its limit for longer than the stall bound
    #[error("Rate limited after stalling for {stalled:?}")]
    RateLimited {
        stalled: Duration,
        retry_after: Duration,
    },

    /// Forwarding to the upstream origin failed
    #[error("Upstream error: {0}")]
    Upstream(#[from] reqwest::Error),

    /// Trust bootstrap errors
    #[error("Trust bootstrap error: {0}")]
    Trust(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// HTTP status reported to the caller for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::StoreUnavailable(_)
            | GatewayError::Config(_)
            | GatewayError::Trust(_)
            | GatewayError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut response = (status, format!("{}\n", self)).into_response();

        if let GatewayError::RateLimited { retry_after, .. } = &self {
            // Retry-After is whole seconds; round up so clients never retry early.
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            if let Ok(value) = HeaderValue::from_str(&secs.max(1).to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}

/// Result type alias for Outproxy operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
