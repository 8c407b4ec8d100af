//! Error types for the gateway.

use crate::counter_store::CounterStoreError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Main error type for the admission path.
///
/// Only [`GatewayError::RateLimitExceeded`] is meant to reach a caller during normal operation.
/// Everything else is either corrected transparently (config fallback), converted into a
/// fail-open decision (counter store), or produced by the delegated handler.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The request URL could not be parsed; configuration falls back to the environment.
    #[error("Config parse error: {0}")]
    ConfigParse(String),

    /// A rate window denied the request. Which window is intentionally not part of this value.
    #[error("Rate limit exceeded (retry after {retry_after_secs}s)")]
    RateLimitExceeded {
        retry_after_secs: u64,
        reset_epoch_secs: u64,
    },

    /// The shared counter store failed or timed out.
    #[error("Counter store unavailable: {0}")]
    CounterStoreUnavailable(#[from] CounterStoreError),

    /// The delegated handler could not service the request.
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// The client's request body stream failed before it was fully read.
    #[error("Request body error: {0}")]
    BodyRead(String),

    /// A handler refused a request body over its size limit.
    #[error("Request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },
}

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        match self {
            Self::RateLimitExceeded {
                retry_after_secs,
                reset_epoch_secs,
            } => crate::mcp::rate_limited_response(retry_after_secs, reset_epoch_secs),
            Self::Upstream(msg) => {
                tracing::warn!(error = %msg, "upstream handler failed");
                (StatusCode::BAD_GATEWAY, "Bad Gateway: upstream MCP server failed").into_response()
            }
            Self::BodyRead(msg) => {
                tracing::debug!(error = %msg, "failed to read request body");
                crate::mcp::jsonrpc_error_response(
                    StatusCode::BAD_REQUEST,
                    crate::mcp::INVALID_REQUEST_ERROR_CODE,
                    "Invalid Request: the request body could not be read",
                )
            }
            Self::BodyTooLarge { limit } => crate::mcp::jsonrpc_error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                crate::mcp::INVALID_REQUEST_ERROR_CODE,
                &format!("Invalid Request: body exceeds {limit} bytes"),
            ),
            Self::ConfigParse(_) | Self::CounterStoreUnavailable(_) => {
                tracing::error!(error = %self, "internal error escaped the admission path");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
            }
        }
    }
}
