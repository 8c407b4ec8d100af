//! JSON-RPC inspection and gateway-synthesized MCP responses.

pub mod upstream;

use axum::Json;
use axum::body::{Body, Bytes};
use axum::http::StatusCode;
use axum::http::header::{CONTENT_TYPE, RETRY_AFTER};
use axum::response::{IntoResponse as _, Response};
use futures::StreamExt as _;
use serde_json::{Value, json};

pub const TOOLS_CALL_METHOD: &str = "tools/call";

/// JSON-RPC "server error" code used for every rate-limit rejection.
pub const RATE_LIMIT_ERROR_CODE: i64 = -32000;
pub const INVALID_REQUEST_ERROR_CODE: i64 = -32600;

pub const RATE_LIMIT_MESSAGE: &str = "You've hit Exa's free MCP rate limit. To continue using \
without limits, create your own Exa API key at https://dashboard.exa.ai/api-keys and add it to \
your MCP URL like this: https://mcp.exa.ai/mcp?exaApiKey=YOUR_EXA_API_KEY";

pub const HEADER_RATE_LIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RATE_LIMIT_RESET: &str = "x-ratelimit-reset";

/// JSON-RPC method names found in a request body.
///
/// Handles single messages and batches. Anything that is not valid JSON yields no methods.
#[must_use]
pub fn request_methods(body: &[u8]) -> Vec<String> {
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        return Vec::new();
    };
    let method = |v: &Value| v.get("method").and_then(Value::as_str).map(str::to_string);
    match value {
        Value::Array(items) => items.iter().filter_map(method).collect(),
        other => method(&other).into_iter().collect(),
    }
}

#[must_use]
pub fn is_tool_call(body: &[u8]) -> bool {
    request_methods(body)
        .iter()
        .any(|m| m == TOOLS_CALL_METHOD)
}

/// A request body read up to a byte limit.
pub enum PeekedBody {
    /// The whole body, no larger than the limit.
    Complete(Bytes),
    /// The body exceeded the limit. Replays the bytes already read, then the rest of the stream.
    Oversized(Body),
}

/// Read `body` up to `limit` bytes without losing any of it.
///
/// # Errors
///
/// Returns an error if the client's body stream fails (e.g. a disconnect mid-upload).
pub async fn peek_body(body: Body, limit: usize) -> Result<PeekedBody, axum::Error> {
    let mut stream = body.into_data_stream();
    let mut buf = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if buf.len() + chunk.len() > limit {
            let head = futures::stream::iter([Ok::<_, axum::Error>(Bytes::from(buf)), Ok(chunk)]);
            return Ok(PeekedBody::Oversized(Body::from_stream(head.chain(stream))));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(PeekedBody::Complete(Bytes::from(buf)))
}

fn error_body(code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "error": {
            "code": code,
            "message": message,
        },
        "id": Value::Null,
    })
}

/// JSON-RPC error envelope with the given HTTP status.
#[must_use]
pub fn jsonrpc_error_response(status: StatusCode, code: i64, message: &str) -> Response {
    (status, Json(error_body(code, message))).into_response()
}

/// HTTP 429 with a JSON-RPC error body.
///
/// The body and the limit headers are identical for every window so callers cannot tell which
/// limit they hit; only the retry hints vary.
#[must_use]
pub fn rate_limited_response(retry_after_secs: u64, reset_epoch_secs: u64) -> Response {
    let body = error_body(RATE_LIMIT_ERROR_CODE, RATE_LIMIT_MESSAGE);
    (
        StatusCode::TOO_MANY_REQUESTS,
        [
            (CONTENT_TYPE.as_str(), "application/json".to_string()),
            (RETRY_AFTER.as_str(), retry_after_secs.to_string()),
            (HEADER_RATE_LIMIT_LIMIT, "0".to_string()),
            (HEADER_RATE_LIMIT_REMAINING, "0".to_string()),
            (HEADER_RATE_LIMIT_RESET, reset_epoch_secs.to_string()),
        ],
        Json(body),
    )
        .into_response()
}
