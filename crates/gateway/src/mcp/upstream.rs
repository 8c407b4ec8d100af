//! Handler factory that forwards MCP traffic to an upstream MCP server over HTTP.
//!
//! Each handler is bound to one enabled-tool set. The caller's credential is never stored on the
//! handler: it is appended to the upstream URL per call.

use crate::config::{QUERY_API_KEY, QUERY_DEBUG, QUERY_TOOLS, RequestConfig};
use crate::error::GatewayError;
use crate::handler_cache::{HandlerFactory, McpHandler, ToolSignature};
use crate::pipeline::CANONICAL_MCP_PATH;
use super::PeekedBody;
use anyhow::Context as _;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse as _, Response};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Upper bound on a forwarded request body.
///
/// Equal to the admission inspection limit, so a body too large to inspect is never forwarded.
pub const MAX_FORWARD_BODY_BYTES: usize = crate::pipeline::MAX_INSPECT_BODY_BYTES;

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "host"
            | "content-length"
            | "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn forwardable(headers: &HeaderMap) -> impl Iterator<Item = (&HeaderName, &HeaderValue)> {
    headers.iter().filter(|(k, _)| !is_hop_by_hop(k))
}

#[derive(Clone)]
pub struct UpstreamFactory {
    http: reqwest::Client,
    endpoint: Url,
    timeout: Duration,
}

impl UpstreamFactory {
    /// `endpoint` is the upstream's MCP URL, e.g. `https://mcp.exa.ai/mcp`.
    ///
    /// # Errors
    ///
    /// Returns an error if `endpoint` is not an absolute http(s) URL or the HTTP client cannot
    /// be built.
    pub fn new(endpoint: &str, timeout: Duration) -> anyhow::Result<Self> {
        let endpoint =
            Url::parse(endpoint).with_context(|| format!("parse upstream url '{endpoint}'"))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            anyhow::bail!("upstream url must be http(s): {endpoint}");
        }
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("build upstream http client")?;
        Ok(Self {
            http,
            endpoint,
            timeout,
        })
    }
}

impl HandlerFactory for UpstreamFactory {
    fn build(
        &self,
        signature: &ToolSignature,
        enabled_tools: Option<&[String]>,
    ) -> Arc<dyn McpHandler> {
        tracing::debug!(
            signature = %signature,
            endpoint = %self.endpoint,
            "building upstream handler"
        );
        Arc::new(UpstreamHandler {
            http: self.http.clone(),
            endpoint: self.endpoint.clone(),
            tools: enabled_tools.map(|t| t.join(",")),
            timeout: self.timeout,
        })
    }
}

pub struct UpstreamHandler {
    http: reqwest::Client,
    endpoint: Url,
    tools: Option<String>,
    timeout: Duration,
}

impl UpstreamHandler {
    /// Upstream URL for one call: the caller's unrelated query parameters, plus this handler's
    /// tool set and the per-call credential.
    fn target_url(&self, query: Option<&str>, config: &RequestConfig) -> Url {
        let mut url = self.endpoint.clone();
        {
            let mut pairs = url.query_pairs_mut();
            if let Some(q) = query {
                for (k, v) in url::form_urlencoded::parse(q.as_bytes()) {
                    if !matches!(&*k, QUERY_API_KEY | QUERY_TOOLS | QUERY_DEBUG) {
                        pairs.append_pair(&k, &v);
                    }
                }
            }
            if let Some(tools) = &self.tools {
                pairs.append_pair(QUERY_TOOLS, tools);
            }
            if config.debug {
                pairs.append_pair(QUERY_DEBUG, "true");
            }
            if let Some(key) = &config.api_key {
                pairs.append_pair(QUERY_API_KEY, key);
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        url
    }
}

#[async_trait]
impl McpHandler for UpstreamHandler {
    async fn handle(
        &self,
        request: Request<Body>,
        config: RequestConfig,
    ) -> Result<Response, GatewayError> {
        let (parts, body) = request.into_parts();
        if parts.uri.path() != CANONICAL_MCP_PATH {
            return Ok((StatusCode::NOT_FOUND, "Not Found").into_response());
        }

        let body = match super::peek_body(body, MAX_FORWARD_BODY_BYTES)
            .await
            .map_err(|e| GatewayError::BodyRead(e.to_string()))?
        {
            PeekedBody::Complete(bytes) => bytes,
            PeekedBody::Oversized(_) => {
                return Err(GatewayError::BodyTooLarge {
                    limit: MAX_FORWARD_BODY_BYTES,
                });
            }
        };
        let url = self.target_url(parts.uri.query(), &config);

        let mut req = self.http.request(parts.method.clone(), url).body(body);
        for (k, v) in forwardable(&parts.headers) {
            req = req.header(k, v);
        }

        let resp = tokio::time::timeout(self.timeout, req.send())
            .await
            .map_err(|_| GatewayError::Upstream(format!("timed out after {:?}", self.timeout)))?
            .map_err(|e| GatewayError::Upstream(e.without_url().to_string()))?;

        if config.debug {
            tracing::info!(status = %resp.status(), method = %parts.method, "upstream responded");
        }

        let mut builder = Response::builder().status(resp.status());
        for (k, v) in forwardable(resp.headers()) {
            builder = builder.header(k, v);
        }
        builder
            .body(Body::from_stream(resp.bytes_stream()))
            .map_err(|e| GatewayError::Upstream(e.to_string()))
    }
}
