//! Shared atomic counter store backing the rate limiter and the bypass audit log.
//!
//! The production backend speaks the Upstash Redis REST protocol (Vercel KV uses the same wire
//! format). Window updates go through `/multi-exec` so each evaluation is one atomic round trip;
//! correctness across gateway instances relies on that atomicity, not on local locking.

use crate::config::Env;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;

/// Accepted (url, token) variable pairs, in order of preference.
pub const STORE_ENV_SCHEMES: [(&str, &str); 2] = [
    ("KV_REST_API_URL", "KV_REST_API_TOKEN"),
    ("UPSTASH_REDIS_REST_URL", "UPSTASH_REDIS_REST_TOKEN"),
];

#[derive(Error, Debug)]
pub enum CounterStoreError {
    #[error("counter store request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("counter store returned http {status}: {body}")]
    Status { status: u16, body: String },

    #[error("counter store protocol error: {0}")]
    Protocol(String),

    #[error("counter store timed out after {0:?}")]
    Timeout(Duration),
}

pub type Result<T> = std::result::Result<T, CounterStoreError>;

/// Outcome of recording one hit in a sliding log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingHit {
    /// Hits inside the trailing window, including this one.
    pub count: u64,
    /// Timestamp (ms) of the oldest hit still inside the window.
    pub oldest_ms: Option<u64>,
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Record a hit at `now_ms` and count hits in `(now_ms - window_ms, now_ms]`.
    async fn sliding_hit(
        &self,
        key: &str,
        member: &str,
        now_ms: u64,
        window_ms: u64,
    ) -> Result<SlidingHit>;

    /// Increment a fixed-window counter that expires at `expire_at_ms`; returns the new value.
    async fn fixed_hit(&self, key: &str, now_ms: u64, expire_at_ms: u64) -> Result<u64>;

    /// Append `entry` to a time-ordered log under `key`.
    async fn append_log(&self, key: &str, score_ms: u64, entry: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterStoreConfig {
    pub url: String,
    pub token: String,
}

impl CounterStoreConfig {
    /// Read connection parameters, accepting either naming scheme.
    ///
    /// A scheme is used only when both its URL and token are set.
    #[must_use]
    pub fn from_env(env: &Env) -> Option<Self> {
        STORE_ENV_SCHEMES.iter().find_map(|(url_var, token_var)| {
            Some(Self {
                url: env.get(url_var)?.trim_end_matches('/').to_string(),
                token: env.get(token_var)?.to_string(),
            })
        })
    }
}

/// Upstash-compatible REST client.
#[derive(Clone)]
pub struct UpstashStore {
    http: reqwest::Client,
    url: String,
    token: String,
}

impl UpstashStore {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: CounterStoreConfig) -> Result<Self> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            url: config.url,
            token: config.token,
        })
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        let resp = self
            .http
            .post(format!("{}{path}", self.url))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CounterStoreError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp.json().await?)
    }

    /// Run `commands` as one transaction and return each command's result.
    async fn multi_exec(&self, commands: Vec<Vec<String>>) -> Result<Vec<Value>> {
        let expected = commands.len();
        let body = serde_json::to_value(commands)
            .map_err(|e| CounterStoreError::Protocol(e.to_string()))?;
        let Value::Array(items) = self.post("/multi-exec", &body).await? else {
            return Err(CounterStoreError::Protocol(
                "multi-exec response is not an array".to_string(),
            ));
        };
        if items.len() != expected {
            return Err(CounterStoreError::Protocol(format!(
                "multi-exec returned {} results for {expected} commands",
                items.len()
            )));
        }
        items.into_iter().map(take_result).collect()
    }
}

fn take_result(mut item: Value) -> Result<Value> {
    if let Some(err) = item.get("error").and_then(Value::as_str) {
        return Err(CounterStoreError::Protocol(err.to_string()));
    }
    item.get_mut("result")
        .map(Value::take)
        .ok_or_else(|| CounterStoreError::Protocol("missing result".to_string()))
}

fn as_u64(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse::<f64>().ok().map(|f| f as u64),
        _ => None,
    }
}

fn cmd<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| (*s).to_string()).collect()
}

#[async_trait]
impl CounterStore for UpstashStore {
    async fn sliding_hit(
        &self,
        key: &str,
        member: &str,
        now_ms: u64,
        window_ms: u64,
    ) -> Result<SlidingHit> {
        let now = now_ms.to_string();
        // `-1` makes the trim a no-op inside the very first window.
        let cutoff = now_ms
            .checked_sub(window_ms)
            .map_or_else(|| "-1".to_string(), |c| c.to_string());
        let ttl = window_ms.to_string();
        let results = self
            .multi_exec(vec![
                cmd(["ZREMRANGEBYSCORE", key, "0", cutoff.as_str()]),
                cmd(["ZADD", key, now.as_str(), member]),
                cmd(["ZCARD", key]),
                cmd(["ZRANGE", key, "0", "0", "WITHSCORES"]),
                cmd(["PEXPIRE", key, ttl.as_str()]),
            ])
            .await?;

        let count = as_u64(&results[2])
            .ok_or_else(|| CounterStoreError::Protocol("ZCARD result is not a number".into()))?;
        // ZRANGE ... WITHSCORES => [member, score]
        let oldest_ms = results[3]
            .as_array()
            .and_then(|pair| pair.get(1))
            .and_then(as_u64);
        Ok(SlidingHit { count, oldest_ms })
    }

    async fn fixed_hit(&self, key: &str, _now_ms: u64, expire_at_ms: u64) -> Result<u64> {
        let expire_at = expire_at_ms.to_string();
        let results = self
            .multi_exec(vec![
                cmd(["INCR", key]),
                cmd(["PEXPIREAT", key, expire_at.as_str()]),
            ])
            .await?;
        as_u64(&results[0])
            .ok_or_else(|| CounterStoreError::Protocol("INCR result is not a number".into()))
    }

    async fn append_log(&self, key: &str, score_ms: u64, entry: &str) -> Result<()> {
        let score = score_ms.to_string();
        let body = serde_json::json!(["ZADD", key, score, entry]);
        take_result(self.post("", &body).await?)?;
        Ok(())
    }
}

/// How often writes sweep expired keys out of a [`MemoryStore`].
const MEMORY_SWEEP_INTERVAL_MS: u64 = 1_000;

#[derive(Debug)]
enum MemoryEntry {
    Log {
        hits: VecDeque<u64>,
        expire_at_ms: u64,
    },
    Counter {
        value: u64,
        expire_at_ms: u64,
    },
    Audit(Vec<(u64, String)>),
}

impl MemoryEntry {
    fn is_expired(&self, now_ms: u64) -> bool {
        match self {
            Self::Log { expire_at_ms, .. } | Self::Counter { expire_at_ms, .. } => {
                *expire_at_ms <= now_ms
            }
            Self::Audit(_) => false,
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: HashMap<String, MemoryEntry>,
    next_sweep_ms: u64,
}

impl MemoryState {
    /// Drop expired counters and logs, at most once per sweep interval. Audit logs are kept.
    fn sweep(&mut self, now_ms: u64) {
        if now_ms < self.next_sweep_ms {
            return;
        }
        self.entries.retain(|_, entry| !entry.is_expired(now_ms));
        self.next_sweep_ms = now_ms.saturating_add(MEMORY_SWEEP_INTERVAL_MS);
    }
}

/// In-process store with the same semantics as [`UpstashStore`].
///
/// Counters and logs expire like their Redis counterparts and are swept on write. Counts are per
/// process, so this is only suitable for a single gateway instance and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryState>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries appended under `key`, ordered by score.
    #[must_use]
    pub fn log_entries(&self, key: &str) -> Vec<String> {
        match self.inner.lock().entries.get(key) {
            Some(MemoryEntry::Audit(entries)) => entries.iter().map(|(_, e)| e.clone()).collect(),
            _ => Vec::new(),
        }
    }

    /// Number of keys currently held, expired ones included until the next sweep.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.inner.lock().entries.len()
    }
}

fn wrong_type(key: &str) -> CounterStoreError {
    CounterStoreError::Protocol(format!("key '{key}' holds a different type"))
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn sliding_hit(
        &self,
        key: &str,
        _member: &str,
        now_ms: u64,
        window_ms: u64,
    ) -> Result<SlidingHit> {
        let mut state = self.inner.lock();
        state.sweep(now_ms);
        let entry = state
            .entries
            .entry(key.to_string())
            .or_insert_with(|| MemoryEntry::Log {
                hits: VecDeque::new(),
                expire_at_ms: 0,
            });
        let MemoryEntry::Log { hits, expire_at_ms } = entry else {
            return Err(wrong_type(key));
        };
        if let Some(cutoff) = now_ms.checked_sub(window_ms) {
            while hits.front().is_some_and(|t| *t <= cutoff) {
                hits.pop_front();
            }
        }
        hits.push_back(now_ms);
        *expire_at_ms = now_ms.saturating_add(window_ms);
        Ok(SlidingHit {
            count: hits.len() as u64,
            oldest_ms: hits.front().copied(),
        })
    }

    async fn fixed_hit(&self, key: &str, now_ms: u64, expire_at_ms: u64) -> Result<u64> {
        let mut state = self.inner.lock();
        state.sweep(now_ms);
        let entry = state
            .entries
            .entry(key.to_string())
            .or_insert(MemoryEntry::Counter {
                value: 0,
                expire_at_ms,
            });
        let MemoryEntry::Counter {
            value,
            expire_at_ms: expiry,
        } = entry
        else {
            return Err(wrong_type(key));
        };
        if *expiry <= now_ms {
            *value = 0;
        }
        *expiry = expire_at_ms;
        *value += 1;
        Ok(*value)
    }

    async fn append_log(&self, key: &str, score_ms: u64, entry: &str) -> Result<()> {
        let mut state = self.inner.lock();
        let slot = state
            .entries
            .entry(key.to_string())
            .or_insert_with(|| MemoryEntry::Audit(Vec::new()));
        let MemoryEntry::Audit(entries) = slot else {
            return Err(wrong_type(key));
        };
        let at = entries.partition_point(|(s, _)| *s <= score_ms);
        entries.insert(at, (score_ms, entry.to_string()));
        Ok(())
    }
}

/// Lazily initialized, process-wide handle to the counter store.
///
/// Initialization runs at most once; concurrent first callers wait for it and then observe the
/// same outcome. `None` means no store is configured and rate limiting is disabled.
pub struct LazyStore {
    env: Env,
    cell: OnceLock<Option<Arc<dyn CounterStore>>>,
}

impl LazyStore {
    #[must_use]
    pub fn from_env(env: Env) -> Self {
        Self {
            env,
            cell: OnceLock::new(),
        }
    }

    /// Already-initialized handle (embedding and tests).
    #[must_use]
    pub fn preset(store: Option<Arc<dyn CounterStore>>) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(store);
        Self {
            env: Env::default(),
            cell,
        }
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.cell.get().is_some()
    }

    pub fn get(&self) -> Option<Arc<dyn CounterStore>> {
        self.cell.get_or_init(|| init_from_env(&self.env)).clone()
    }
}

fn init_from_env(env: &Env) -> Option<Arc<dyn CounterStore>> {
    let Some(config) = CounterStoreConfig::from_env(env) else {
        tracing::info!("counter store not configured; rate limiting disabled");
        return None;
    };
    match UpstashStore::new(config) {
        Ok(store) => {
            tracing::info!("counter store initialized; rate limiting enabled");
            Some(Arc::new(store))
        }
        Err(e) => {
            tracing::error!(
                error = %e,
                "failed to create counter store client; rate limiting disabled"
            );
            None
        }
    }
}
