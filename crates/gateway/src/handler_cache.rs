//! Memoized MCP handlers keyed by enabled-tool signature.
//!
//! Building a handler (a full MCP server with its tools registered) is expensive, so the gateway
//! keeps one per distinct tool combination for the lifetime of the process. Handlers only ever
//! see the tool shape at construction time; credentials arrive per call through the
//! [`RequestConfig`] passed to [`McpHandler::handle`], so nothing secret is cached.

use crate::config::RequestConfig;
use crate::error::GatewayError;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::Request;
use axum::response::Response;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

pub const DEFAULT_SIGNATURE: &str = "default";

/// Canonical, order-independent identity of an enabled-tool set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ToolSignature(String);

impl ToolSignature {
    #[must_use]
    pub fn from_tools(enabled_tools: Option<&[String]>) -> Self {
        match enabled_tools {
            Some(tools) if !tools.is_empty() => {
                let set: BTreeSet<&str> = tools.iter().map(String::as_str).collect();
                Self(set.into_iter().collect::<Vec<_>>().join(","))
            }
            _ => Self(DEFAULT_SIGNATURE.to_string()),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_default(&self) -> bool {
        self.0 == DEFAULT_SIGNATURE
    }
}

impl fmt::Display for ToolSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A fully configured MCP endpoint for one tool combination.
#[async_trait]
pub trait McpHandler: Send + Sync {
    /// Service one protocol request. `config` carries this caller's credential and flags.
    async fn handle(
        &self,
        request: Request<Body>,
        config: RequestConfig,
    ) -> Result<Response, GatewayError>;
}

/// Builds [`McpHandler`]s. Opaque to the gateway beyond this call.
pub trait HandlerFactory: Send + Sync {
    fn build(
        &self,
        signature: &ToolSignature,
        enabled_tools: Option<&[String]>,
    ) -> Arc<dyn McpHandler>;
}

/// Process-lifetime handler cache. Entries are never evicted.
#[derive(Clone, Default)]
pub struct HandlerCache {
    inner: Arc<RwLock<HashMap<ToolSignature, Arc<dyn McpHandler>>>>,
}

impl HandlerCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, signature: &ToolSignature) -> Option<Arc<dyn McpHandler>> {
        self.inner.read().get(signature).cloned()
    }

    /// Return the cached handler for `signature`, building it on first use.
    ///
    /// `build` runs outside the lock, so racing first requests may each build a handler; only
    /// the first one stored is kept and every caller gets that same instance back.
    pub fn get_or_create(
        &self,
        signature: &ToolSignature,
        build: impl FnOnce() -> Arc<dyn McpHandler>,
    ) -> Arc<dyn McpHandler> {
        if let Some(handler) = self.get(signature) {
            return handler;
        }
        let built = build();
        self.inner
            .write()
            .entry(signature.clone())
            .or_insert(built)
            .clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse as _;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Noop;

    #[async_trait]
    impl McpHandler for Noop {
        async fn handle(
            &self,
            _request: Request<Body>,
            _config: RequestConfig,
        ) -> Result<Response, GatewayError> {
            Ok("ok".into_response())
        }
    }

    fn tools(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn signature_is_order_independent() {
        let a = tools(&["web_search_exa", "get_code_context_exa", "crawling_exa"]);
        let b = tools(&["crawling_exa", "web_search_exa", "get_code_context_exa"]);
        assert_eq!(
            ToolSignature::from_tools(Some(&a)),
            ToolSignature::from_tools(Some(&b))
        );
        assert_eq!(
            ToolSignature::from_tools(Some(&a)).as_str(),
            "crawling_exa,get_code_context_exa,web_search_exa"
        );
    }

    #[test]
    fn signature_ignores_duplicates() {
        assert_eq!(
            ToolSignature::from_tools(Some(&tools(&["b", "a", "b"]))),
            ToolSignature::from_tools(Some(&tools(&["a", "b"])))
        );
    }

    #[test]
    fn missing_or_empty_tools_use_default_signature() {
        assert!(ToolSignature::from_tools(None).is_default());
        assert!(ToolSignature::from_tools(Some(&[])).is_default());
        assert_eq!(ToolSignature::from_tools(None).to_string(), DEFAULT_SIGNATURE);
    }

    #[test]
    fn get_or_create_builds_once_per_signature() {
        let cache = HandlerCache::new();
        let builds = AtomicUsize::new(0);
        let sig = ToolSignature::from_tools(Some(&tools(&["a"])));

        let build = || {
            builds.fetch_add(1, Ordering::SeqCst);
            Arc::new(Noop) as Arc<dyn McpHandler>
        };
        let first = cache.get_or_create(&sig, build);
        let second = cache.get_or_create(&sig, || panic!("must not rebuild a cached handler"));

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);

        let other = cache.get_or_create(&ToolSignature::from_tools(None), || {
            Arc::new(Noop) as Arc<dyn McpHandler>
        });
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn concurrent_first_use_converges_on_one_handler() {
        const THREADS: usize = 8;
        let cache = HandlerCache::new();
        let barrier = Arc::new(Barrier::new(THREADS));
        let sig = ToolSignature::from_tools(Some(&tools(&["web_search_exa"])));

        let handlers: Vec<Arc<dyn McpHandler>> = std::thread::scope(|s| {
            let joins: Vec<_> = (0..THREADS)
                .map(|_| {
                    let cache = cache.clone();
                    let barrier = Arc::clone(&barrier);
                    let sig = sig.clone();
                    s.spawn(move || {
                        barrier.wait();
                        cache.get_or_create(&sig, || Arc::new(Noop) as Arc<dyn McpHandler>)
                    })
                })
                .collect();
            joins.into_iter().map(|j| j.join().unwrap()).collect()
        });

        assert_eq!(cache.len(), 1);
        let cached = cache.get(&sig).unwrap();
        assert!(handlers.iter().all(|h| Arc::ptr_eq(h, &cached)));
    }
}
