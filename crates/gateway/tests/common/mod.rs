#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::Request;
use axum::response::{IntoResponse as _, Response};
use exa_mcp_gateway::config::{Env, GatewaySettings, RequestConfig};
use exa_mcp_gateway::counter_store::{
    CounterStore, CounterStoreError, LazyStore, MemoryStore, SlidingHit,
};
use exa_mcp_gateway::error::GatewayError;
use exa_mcp_gateway::handler_cache::{HandlerFactory, McpHandler, ToolSignature};
use exa_mcp_gateway::pipeline::{self, Gateway};
use exa_mcp_gateway::rate_limit::Clock;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

pub use exa_mcp_test_support::serve_router;

pub const TOOLS_CALL: &str = concat!(
    r#"{"jsonrpc":"2.0","method":"tools/call","#,
    r#""params":{"name":"web_search_exa","arguments":{"query":"rust"}},"id":1}"#,
);
pub const TOOLS_LIST: &str = r#"{"jsonrpc":"2.0","method":"tools/list","id":1}"#;
pub const INITIALIZE: &str = concat!(
    r#"{"jsonrpc":"2.0","method":"initialize","params":{"protocolVersion":"2025-03-26","#,
    r#""capabilities":{},"clientInfo":{"name":"gateway-tests","version":"0"}},"id":0}"#,
);

/// What a handler observed for one call.
#[derive(Debug, Clone)]
pub struct SeenCall {
    pub signature: String,
    pub path_and_query: String,
    pub config: RequestConfig,
    pub body: String,
}

/// Handler factory that records builds and calls, and answers every call with a JSON-RPC result
/// naming the handler's signature.
#[derive(Default)]
pub struct RecordingFactory {
    pub builds: AtomicUsize,
    pub calls: Arc<Mutex<Vec<SeenCall>>>,
}

impl RecordingFactory {
    pub fn calls(&self) -> Vec<SeenCall> {
        self.calls.lock().clone()
    }
}

struct RecordingHandler {
    signature: String,
    calls: Arc<Mutex<Vec<SeenCall>>>,
}

#[async_trait]
impl McpHandler for RecordingHandler {
    async fn handle(
        &self,
        request: Request<Body>,
        config: RequestConfig,
    ) -> Result<Response, GatewayError> {
        let (parts, body) = request.into_parts();
        let body = axum::body::to_bytes(body, usize::MAX)
            .await
            .map_err(|e| GatewayError::BodyRead(e.to_string()))?;
        self.calls.lock().push(SeenCall {
            signature: self.signature.clone(),
            path_and_query: parts
                .uri
                .path_and_query()
                .map(ToString::to_string)
                .unwrap_or_default(),
            config,
            body: String::from_utf8_lossy(&body).into_owned(),
        });
        Ok(axum::Json(json!({
            "jsonrpc": "2.0",
            "result": { "handler": self.signature },
            "id": 1
        }))
        .into_response())
    }
}

impl HandlerFactory for RecordingFactory {
    fn build(
        &self,
        signature: &ToolSignature,
        _enabled_tools: Option<&[String]>,
    ) -> Arc<dyn McpHandler> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        Arc::new(RecordingHandler {
            signature: signature.to_string(),
            calls: Arc::clone(&self.calls),
        })
    }
}

pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn at(ms: u64) -> Arc<Self> {
        Arc::new(Self(AtomicU64::new(ms)))
    }

    pub fn advance(&self, ms: u64) {
        self.0.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// [`MemoryStore`] that counts how often each window is consulted.
#[derive(Default)]
pub struct CountingStore {
    pub inner: MemoryStore,
    pub hits: AtomicUsize,
}

impl CountingStore {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CounterStore for CountingStore {
    async fn sliding_hit(
        &self,
        key: &str,
        member: &str,
        now_ms: u64,
        window_ms: u64,
    ) -> Result<SlidingHit, CounterStoreError> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        self.inner.sliding_hit(key, member, now_ms, window_ms).await
    }

    async fn fixed_hit(
        &self,
        key: &str,
        now_ms: u64,
        expire_at_ms: u64,
    ) -> Result<u64, CounterStoreError> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        self.inner.fixed_hit(key, now_ms, expire_at_ms).await
    }

    async fn append_log(
        &self,
        key: &str,
        score_ms: u64,
        entry: &str,
    ) -> Result<(), CounterStoreError> {
        self.inner.append_log(key, score_ms, entry).await
    }
}

pub struct FailingStore;

#[async_trait]
impl CounterStore for FailingStore {
    async fn sliding_hit(
        &self,
        _: &str,
        _: &str,
        _: u64,
        _: u64,
    ) -> Result<SlidingHit, CounterStoreError> {
        Err(CounterStoreError::Protocol("ERR connection reset".to_string()))
    }

    async fn fixed_hit(&self, _: &str, _: u64, _: u64) -> Result<u64, CounterStoreError> {
        Err(CounterStoreError::Protocol("ERR connection reset".to_string()))
    }

    async fn append_log(&self, _: &str, _: u64, _: &str) -> Result<(), CounterStoreError> {
        Err(CounterStoreError::Protocol("ERR connection reset".to_string()))
    }
}

/// A running gateway backed by `store`, served on an ephemeral port.
pub struct TestGateway {
    pub base_url: String,
    pub gateway: Arc<Gateway>,
    pub factory: Arc<RecordingFactory>,
    pub clock: Arc<ManualClock>,
}

impl TestGateway {
    pub async fn start(
        env: Env,
        settings: GatewaySettings,
        store: Option<Arc<dyn CounterStore>>,
    ) -> anyhow::Result<Self> {
        let factory = Arc::new(RecordingFactory::default());
        let clock = ManualClock::at(1_700_000_000_000);
        let gateway = Gateway::new(
            env,
            &settings,
            Arc::new(LazyStore::preset(store)),
            factory.clone(),
        )
        .with_clock(clock.clone());
        let gateway = Arc::new(gateway);
        let base_url = serve_router(pipeline::router(Arc::clone(&gateway))).await?;
        Ok(Self {
            base_url,
            gateway,
            factory,
            clock,
        })
    }

    pub fn url(&self, path_and_query: &str) -> String {
        format!("{}{path_and_query}", self.base_url)
    }
}

/// POST a JSON-RPC body from `client_ip`.
pub async fn post_rpc(
    http: &reqwest::Client,
    url: &str,
    client_ip: &str,
    body: &str,
) -> anyhow::Result<reqwest::Response> {
    Ok(http
        .post(url)
        .header("content-type", "application/json")
        .header("accept", "application/json, text/event-stream")
        .header("x-forwarded-for", client_ip)
        .body(body.to_string())
        .send()
        .await?)
}
