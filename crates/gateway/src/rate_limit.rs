//! Dual-window admission control for free-tier tool calls.
//!
//! Two limiters share one counter store:
//! - QPS: sliding log over the trailing second.
//! - Daily: fixed window aligned to UTC days.
//!
//! Every evaluation consumes one unit of the window it checks, allowed or not. Store errors and
//! timeouts resolve according to the fail-open setting and are only ever logged server-side.

use crate::config::GatewaySettings;
use crate::counter_store::{CounterStore, CounterStoreError, LazyStore};
use crate::error::GatewayError;
use axum::http::HeaderMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub const QPS_WINDOW_MS: u64 = 1_000;
pub const DAILY_WINDOW_MS: u64 = 24 * 60 * 60 * 1_000;
pub const KEY_PREFIX: &str = "exa-mcp:ratelimit";

/// Bucket shared by every request whose client address cannot be determined.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Proxy headers consulted for the client address, in order.
pub const CLIENT_IP_HEADERS: [&str; 3] = ["cf-connecting-ip", "x-real-ip", "x-forwarded-for"];

pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    Qps,
    Daily,
}

impl Window {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Qps => "qps",
            Self::Daily => "daily",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Denial {
    /// Server-side only; never rendered into a response.
    pub window: Window,
    pub retry_after_secs: u64,
    pub reset_epoch_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied(Denial),
}

impl From<Denial> for GatewayError {
    fn from(d: Denial) -> Self {
        Self::RateLimitExceeded {
            retry_after_secs: d.retry_after_secs,
            reset_epoch_secs: d.reset_epoch_secs,
        }
    }
}

pub struct RateLimiter {
    store: Arc<LazyStore>,
    clock: Arc<dyn Clock>,
    qps_limit: u64,
    daily_limit: u64,
    fail_open: bool,
    timeout: Duration,
}

impl RateLimiter {
    #[must_use]
    pub fn new(store: Arc<LazyStore>, settings: &GatewaySettings) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            qps_limit: u64::from(settings.qps_limit),
            daily_limit: u64::from(settings.daily_limit),
            fail_open: settings.fail_open,
            timeout: settings.store_timeout,
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Initialize the backing store (at most once per process). Returns whether limiting is on.
    pub fn initialize(&self) -> bool {
        self.store.get().is_some()
    }

    /// Evaluate QPS, then Daily. A QPS denial short-circuits and leaves the daily counter alone.
    pub async fn limit(&self, client_id: &str) -> Decision {
        let Some(store) = self.store.get() else {
            return Decision::Allowed;
        };
        let now_ms = self.clock.now_ms();

        let qps = self
            .guarded(Window::Qps, client_id, now_ms, self.check_qps(&*store, client_id, now_ms))
            .await;
        if let Decision::Denied(_) = qps {
            return qps;
        }

        self.guarded(
            Window::Daily,
            client_id,
            now_ms,
            self.check_daily(&*store, client_id, now_ms),
        )
        .await
    }

    async fn guarded(
        &self,
        window: Window,
        client_id: &str,
        now_ms: u64,
        check: impl Future<Output = Result<Decision, CounterStoreError>>,
    ) -> Decision {
        let result = match tokio::time::timeout(self.timeout, check).await {
            Ok(r) => r,
            Err(_) => Err(CounterStoreError::Timeout(self.timeout)),
        };
        match result {
            Ok(Decision::Denied(denial)) => {
                tracing::warn!(
                    client_id = %client_id,
                    window = denial.window.as_str(),
                    retry_after_secs = denial.retry_after_secs,
                    "rate limit exceeded"
                );
                Decision::Denied(denial)
            }
            Ok(Decision::Allowed) => Decision::Allowed,
            Err(e) => {
                let err = GatewayError::CounterStoreUnavailable(e);
                if self.fail_open {
                    tracing::warn!(
                        error = %err,
                        window = window.as_str(),
                        "rate limit check failed; allowing request (fail-open)"
                    );
                    Decision::Allowed
                } else {
                    tracing::warn!(
                        error = %err,
                        window = window.as_str(),
                        "rate limit check failed; rejecting request (fail-closed)"
                    );
                    Decision::Denied(Denial {
                        window,
                        retry_after_secs: 1,
                        reset_epoch_secs: now_ms / 1_000 + 1,
                    })
                }
            }
        }
    }

    async fn check_qps(
        &self,
        store: &dyn CounterStore,
        client_id: &str,
        now_ms: u64,
    ) -> Result<Decision, CounterStoreError> {
        let key = format!("{KEY_PREFIX}:qps:{client_id}");
        let member = format!("{now_ms}-{}", uuid::Uuid::new_v4());
        let hit = store
            .sliding_hit(&key, &member, now_ms, QPS_WINDOW_MS)
            .await?;
        if hit.count <= self.qps_limit {
            return Ok(Decision::Allowed);
        }
        let reset_ms = hit.oldest_ms.unwrap_or(now_ms) + QPS_WINDOW_MS;
        Ok(Decision::Denied(Denial {
            window: Window::Qps,
            retry_after_secs: retry_after_secs(now_ms, reset_ms),
            reset_epoch_secs: reset_ms.div_ceil(1_000),
        }))
    }

    async fn check_daily(
        &self,
        store: &dyn CounterStore,
        client_id: &str,
        now_ms: u64,
    ) -> Result<Decision, CounterStoreError> {
        let bucket = now_ms / DAILY_WINDOW_MS;
        let reset_ms = (bucket + 1) * DAILY_WINDOW_MS;
        let key = format!("{KEY_PREFIX}:daily:{client_id}:{bucket}");
        let count = store.fixed_hit(&key, now_ms, reset_ms).await?;
        if count <= self.daily_limit {
            return Ok(Decision::Allowed);
        }
        Ok(Decision::Denied(Denial {
            window: Window::Daily,
            retry_after_secs: retry_after_secs(now_ms, reset_ms),
            reset_epoch_secs: reset_ms / 1_000,
        }))
    }
}

fn retry_after_secs(now_ms: u64, reset_ms: u64) -> u64 {
    reset_ms.saturating_sub(now_ms).div_ceil(1_000).max(1)
}

/// Derive the rate-limit identity of a request from proxy-supplied headers.
#[must_use]
pub fn client_id(headers: &HeaderMap) -> String {
    CLIENT_IP_HEADERS
        .iter()
        .filter_map(|name| headers.get(*name).and_then(|v| v.to_str().ok()))
        .find_map(|v| {
            let first = v.split(',').next().unwrap_or_default().trim();
            (!first.is_empty()).then(|| first.to_string())
        })
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}
