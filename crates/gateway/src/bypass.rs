//! Privileged rate-limit bypass.
//!
//! A request qualifies when its `User-Agent` starts with a configured secret prefix *and* a
//! dedicated bypass API key is configured. Qualifying requests are billed under that key and
//! recorded in a best-effort audit log.

use crate::config::{GatewaySettings, RequestConfig};
use crate::counter_store::{CounterStoreError, LazyStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Time-ordered audit log of bypass activations (scored by epoch milliseconds).
pub const AUDIT_LOG_KEY: &str = "exa-mcp:bypass:log";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BypassRecord {
    pub ip: String,
    pub user_agent: String,
    pub timestamp: DateTime<Utc>,
}

/// `true` iff both secrets are configured (non-empty) and `user_agent` starts with the prefix.
#[must_use]
pub fn evaluate(
    user_agent: Option<&str>,
    secret_prefix: Option<&str>,
    bypass_key: Option<&str>,
) -> bool {
    let (Some(prefix), Some(_key)) = (
        secret_prefix.filter(|p| !p.is_empty()),
        bypass_key.filter(|k| !k.is_empty()),
    ) else {
        return false;
    };
    user_agent.is_some_and(|ua| ua.starts_with(prefix))
}

pub struct BypassAuthority {
    prefix: Option<String>,
    api_key: Option<String>,
    store: Arc<LazyStore>,
    timeout: Duration,
}

impl BypassAuthority {
    #[must_use]
    pub fn new(settings: &GatewaySettings, store: Arc<LazyStore>) -> Self {
        let prefix = settings.bypass_user_agent_prefix.clone();
        let api_key = settings.bypass_api_key.clone();
        if prefix.is_some() != api_key.is_some() {
            tracing::warn!(
                prefix_set = prefix.is_some(),
                api_key_set = api_key.is_some(),
                "bypass is inactive: both the user-agent prefix and the bypass API key are required"
            );
        }
        Self {
            prefix,
            api_key,
            store,
            timeout: settings.store_timeout,
        }
    }

    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.prefix.as_deref().is_some_and(|p| !p.is_empty())
            && self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }

    /// Apply the bypass to `config` if the request qualifies.
    ///
    /// On success the bypass key replaces the resolved API key and an audit record is written in
    /// the background. Must be called from within a Tokio runtime.
    pub fn apply(
        &self,
        config: &mut RequestConfig,
        client_ip: &str,
        user_agent: Option<&str>,
    ) -> bool {
        if !evaluate(user_agent, self.prefix.as_deref(), self.api_key.as_deref()) {
            return false;
        }
        let Some(key) = self.api_key.clone() else {
            return false;
        };
        config.api_key = Some(key);
        config.bypass = true;

        tracing::info!(client_ip = %client_ip, "rate limit bypass granted");

        let record = BypassRecord {
            ip: client_ip.to_string(),
            user_agent: user_agent.unwrap_or_default().to_string(),
            timestamp: Utc::now(),
        };
        let store = Arc::clone(&self.store);
        let timeout = self.timeout;
        tokio::spawn(async move {
            if let Err(e) = record_audit(&store, &record, timeout).await {
                tracing::warn!(error = %e, "failed to write bypass audit record");
            }
        });
        true
    }
}

/// Append `record` to the audit log. A missing store is not an error.
///
/// # Errors
///
/// Returns an error if the store rejects the write or does not answer within `timeout`.
pub async fn record_audit(
    store: &LazyStore,
    record: &BypassRecord,
    timeout: Duration,
) -> Result<(), CounterStoreError> {
    let Some(store) = store.get() else {
        return Ok(());
    };
    let entry = serde_json::to_string(record)
        .map_err(|e| CounterStoreError::Protocol(e.to_string()))?;
    let score = u64::try_from(record.timestamp.timestamp_millis()).unwrap_or(0);
    tokio::time::timeout(timeout, store.append_log(AUDIT_LOG_KEY, score, &entry))
        .await
        .map_err(|_| CounterStoreError::Timeout(timeout))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter_store::{CounterStore, MemoryStore};

    const PREFIX: &str = "exa-internal-7f3a";

    fn settings(prefix: Option<&str>, key: Option<&str>) -> GatewaySettings {
        GatewaySettings {
            bypass_user_agent_prefix: prefix.map(str::to_string),
            bypass_api_key: key.map(str::to_string),
            ..GatewaySettings::default()
        }
    }

    #[test]
    fn evaluate_requires_both_secrets() {
        let ua = Some("exa-internal-7f3a/agent 1.0");
        assert!(evaluate(ua, Some(PREFIX), Some("bypass-key")));
        assert!(!evaluate(ua, Some(PREFIX), None));
        assert!(!evaluate(ua, None, Some("bypass-key")));
        assert!(!evaluate(ua, Some(""), Some("bypass-key")));
        assert!(!evaluate(Some("curl/8.0"), Some(PREFIX), Some("bypass-key")));
        assert!(!evaluate(None, Some(PREFIX), Some("bypass-key")));
    }

    #[tokio::test]
    async fn apply_substitutes_key_and_writes_audit_record() {
        let mem = Arc::new(MemoryStore::new());
        let store = Arc::new(LazyStore::preset(Some(mem.clone() as Arc<dyn CounterStore>)));
        let authority = BypassAuthority::new(&settings(Some(PREFIX), Some("bypass-key")), store);
        assert!(authority.is_configured());

        let mut cfg = RequestConfig {
            api_key: Some("shared-free-tier".to_string()),
            ..RequestConfig::default()
        };
        assert!(authority.apply(&mut cfg, "1.2.3.4", Some("exa-internal-7f3a/x")));
        assert_eq!(cfg.api_key.as_deref(), Some("bypass-key"));
        assert!(cfg.bypass);
        assert!(cfg.is_rate_limit_exempt());

        let mut entries = Vec::new();
        for _ in 0..50 {
            entries = mem.log_entries(AUDIT_LOG_KEY);
            if !entries.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(entries.len(), 1);
        let record: BypassRecord = serde_json::from_str(&entries[0]).unwrap();
        assert_eq!(record.ip, "1.2.3.4");
        assert_eq!(record.user_agent, "exa-internal-7f3a/x");
    }

    #[tokio::test]
    async fn half_configured_bypass_is_a_no_op() {
        let store = Arc::new(LazyStore::preset(None));
        let authority = BypassAuthority::new(&settings(Some(PREFIX), None), store);
        assert!(!authority.is_configured());

        let mut cfg = RequestConfig::default();
        assert!(!authority.apply(&mut cfg, "1.2.3.4", Some("exa-internal-7f3a/x")));
        assert_eq!(cfg, RequestConfig::default());
    }

    #[tokio::test]
    async fn audit_without_store_is_silently_skipped() {
        let record = BypassRecord {
            ip: "1.2.3.4".to_string(),
            user_agent: "ua".to_string(),
            timestamp: Utc::now(),
        };
        record_audit(&LazyStore::preset(None), &record, Duration::from_millis(50))
            .await
            .unwrap();
    }
}
