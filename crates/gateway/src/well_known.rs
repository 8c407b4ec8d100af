//! Discovery document describing the query parameters the gateway accepts.

use crate::config::{QUERY_API_KEY, QUERY_DEBUG, QUERY_TOOLS};
use axum::Json;
use axum::http::StatusCode;
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    CACHE_CONTROL,
};
use axum::response::{IntoResponse as _, Response};
use serde_json::{Value, json};

pub const MCP_CONFIG_PATH: &str = "/.well-known/mcp-config";

/// Tool names clients may list in `tools`.
pub const AVAILABLE_TOOLS: [&str; 9] = [
    "web_search_exa",
    "web_search_advanced_exa",
    "get_code_context_exa",
    "crawling_exa",
    "deep_researcher_start",
    "deep_researcher_check",
    "people_search_exa",
    // deprecated alias of people_search_exa
    "linkedin_search_exa",
    "company_research_exa",
];

const CORS_HEADERS: [(axum::http::HeaderName, &str); 3] = [
    (ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
    (ACCESS_CONTROL_ALLOW_METHODS, "GET, OPTIONS"),
    (ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type"),
];

#[must_use]
pub fn config_schema() -> Value {
    let mut properties = serde_json::Map::new();
    properties.insert(
        QUERY_API_KEY.to_string(),
        json!({
            "type": "string",
            "title": "Exa API Key",
            "description": concat!(
                "Your Exa API key. Optional: requests without one use the shared free tier, ",
                "which is rate limited. Get one at https://dashboard.exa.ai/api-keys",
            ),
        }),
    );
    properties.insert(
        QUERY_TOOLS.to_string(),
        json!({
            "type": "string",
            "title": "Enabled Tools",
            "description":
                "Comma-separated list of tools to enable. Leave empty for the server defaults.",
            "examples": [
                "web_search_exa,crawling_exa",
                "web_search_exa,crawling_exa,company_research_exa",
            ],
            "x-available-values": AVAILABLE_TOOLS,
        }),
    );
    properties.insert(
        QUERY_DEBUG.to_string(),
        json!({
            "type": "boolean",
            "title": "Debug Mode",
            "description": "Enable debug logging for troubleshooting",
            "default": false,
        }),
    );

    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "$id": MCP_CONFIG_PATH,
        "title": "Exa MCP Server Configuration",
        "description": "Configuration for connecting to the Exa MCP server",
        "x-query-style": "dot+bracket",
        "type": "object",
        "properties": properties,
        "additionalProperties": false,
    })
}

pub async fn mcp_config() -> Response {
    let mut resp = (StatusCode::OK, Json(config_schema())).into_response();
    let headers = resp.headers_mut();
    for (name, value) in CORS_HEADERS {
        headers.insert(name, axum::http::HeaderValue::from_static(value));
    }
    headers.insert(
        CACHE_CONTROL,
        axum::http::HeaderValue::from_static("public, max-age=3600"),
    );
    resp
}

pub async fn preflight() -> Response {
    let mut resp = StatusCode::NO_CONTENT.into_response();
    let headers = resp.headers_mut();
    for (name, value) in CORS_HEADERS {
        headers.insert(name, axum::http::HeaderValue::from_static(value));
    }
    resp
}
