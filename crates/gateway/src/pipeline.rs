//! Request admission pipeline and HTTP routing.
//!
//! Per request: resolve config, apply the bypass, rate limit free-tier `tools/call` POSTs, then
//! delegate to the cached handler for the request's tool signature.

use crate::bypass::BypassAuthority;
use crate::config::{self, Env, GatewaySettings};
use crate::counter_store::LazyStore;
use crate::error::GatewayError;
use crate::handler_cache::{HandlerCache, HandlerFactory, ToolSignature};
use crate::mcp::{self, PeekedBody};
use crate::rate_limit::{self, Clock, Decision, RateLimiter};
use crate::well_known;
use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{HOST, USER_AGENT};
use axum::http::uri::PathAndQuery;
use axum::http::{Method, Uri};
use axum::response::{IntoResponse as _, Response};
use axum::routing::get;
use std::sync::Arc;

/// Public mount point clients connect to.
pub const MOUNT_PATH: &str = "/mcp";
/// Path the delegated handlers route on.
pub const CANONICAL_MCP_PATH: &str = "/api/mcp";
/// Upper bound on a POST body buffered for JSON-RPC inspection.
pub const MAX_INSPECT_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Everything a request needs, constructed once per process and shared by all requests.
pub struct Gateway {
    env: Env,
    bypass: BypassAuthority,
    limiter: RateLimiter,
    handlers: HandlerCache,
    factory: Arc<dyn HandlerFactory>,
}

impl Gateway {
    /// Gateway configured from `env`. The counter store is connected lazily on first use.
    #[must_use]
    pub fn from_env(env: Env, factory: Arc<dyn HandlerFactory>) -> Self {
        let settings = GatewaySettings::from_env(&env);
        let store = Arc::new(LazyStore::from_env(env.clone()));
        Self::new(env, &settings, store, factory)
    }

    #[must_use]
    pub fn new(
        env: Env,
        settings: &GatewaySettings,
        store: Arc<LazyStore>,
        factory: Arc<dyn HandlerFactory>,
    ) -> Self {
        Self {
            bypass: BypassAuthority::new(settings, Arc::clone(&store)),
            limiter: RateLimiter::new(store, settings),
            handlers: HandlerCache::new(),
            env,
            factory,
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.limiter = self.limiter.with_clock(clock);
        self
    }

    #[must_use]
    pub fn handlers(&self) -> &HandlerCache {
        &self.handlers
    }

    #[must_use]
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub async fn handle(&self, request: Request) -> Response {
        match self.admit_and_dispatch(request).await {
            Ok(resp) => resp,
            Err(e) => e.into_response(),
        }
    }

    async fn admit_and_dispatch(&self, request: Request) -> Result<Response, GatewayError> {
        let mut cfg = config::resolve(&absolute_url(request.uri(), request.headers()), &self.env);
        let client_id = rate_limit::client_id(request.headers());
        let user_agent = request
            .headers()
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok());
        self.bypass.apply(&mut cfg, &client_id, user_agent);
        let cfg = cfg;

        if cfg.debug {
            let enabled_tools = cfg
                .enabled_tools
                .as_ref()
                .map_or_else(|| "default".to_string(), |t| t.join(", "));
            tracing::info!(
                method = %request.method(),
                path = request.uri().path(),
                client_id = %client_id,
                enabled_tools = %enabled_tools,
                bypass = cfg.bypass,
                handler_cache_size = self.handlers.len(),
                "mcp request"
            );
        }

        let mut request = normalize_path(request);

        if request.method() == Method::POST && !cfg.is_rate_limit_exempt() {
            let (parts, body) = request.into_parts();
            let body = match mcp::peek_body(body, MAX_INSPECT_BODY_BYTES)
                .await
                .map_err(|e| GatewayError::BodyRead(e.to_string()))?
            {
                PeekedBody::Complete(bytes) => {
                    if mcp::is_tool_call(&bytes)
                        && let Decision::Denied(denial) = self.limiter.limit(&client_id).await
                    {
                        return Err(denial.into());
                    }
                    Body::from(bytes)
                }
                // Handlers apply their own size limits, to exempt and free-tier callers alike.
                PeekedBody::Oversized(body) => {
                    tracing::debug!(
                        limit = MAX_INSPECT_BODY_BYTES,
                        "request body too large to inspect; delegating as is"
                    );
                    body
                }
            };
            request = Request::from_parts(parts, body);
        }

        let signature = ToolSignature::from_tools(cfg.enabled_tools.as_deref());
        let handler = self.handlers.get_or_create(&signature, || {
            if cfg.debug {
                tracing::info!(signature = %signature, "creating handler");
            } else {
                tracing::debug!(signature = %signature, "creating handler");
            }
            self.factory.build(&signature, cfg.enabled_tools.as_deref())
        });

        handler.handle(request, cfg).await
    }
}

/// Absolute form of the request URL for query parsing.
fn absolute_url(uri: &Uri, headers: &axum::http::HeaderMap) -> String {
    if uri.scheme().is_some() {
        return uri.to_string();
    }
    let host = headers
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("localhost");
    format!("http://{host}{uri}")
}

/// Rewrite the bare mount point to the canonical handler path, keeping the query.
fn normalize_path(mut request: Request) -> Request {
    let uri = request.uri();
    if !matches!(uri.path(), MOUNT_PATH | "/mcp/") {
        return request;
    }
    let path_and_query = match uri.query() {
        Some(q) => format!("{CANONICAL_MCP_PATH}?{q}"),
        None => CANONICAL_MCP_PATH.to_string(),
    };
    let mut parts = uri.clone().into_parts();
    let Ok(pq) = path_and_query.parse::<PathAndQuery>() else {
        return request;
    };
    parts.path_and_query = Some(pq);
    if let Ok(uri) = Uri::from_parts(parts) {
        *request.uri_mut() = uri;
    }
    request
}

async fn handle_mcp(State(gateway): State<Arc<Gateway>>, request: Request) -> Response {
    gateway.handle(request).await
}

/// HTTP surface of the gateway.
pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route(
            well_known::MCP_CONFIG_PATH,
            get(well_known::mcp_config).options(well_known::preflight),
        )
        .route(
            MOUNT_PATH,
            get(handle_mcp).post(handle_mcp).delete(handle_mcp),
        )
        .route(
            CANONICAL_MCP_PATH,
            get(handle_mcp).post(handle_mcp).delete(handle_mcp),
        )
        .with_state(gateway)
}
