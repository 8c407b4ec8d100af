//! Per-request configuration resolution and process-level settings.
//!
//! Every request resolves its own [`RequestConfig`] from the request URL's query string, falling
//! back to environment variables. Process-level knobs (rate thresholds, bypass secrets, timeouts)
//! live in [`GatewaySettings`] and are read once when the gateway is built.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

pub const QUERY_API_KEY: &str = "exaApiKey";
pub const QUERY_TOOLS: &str = "tools";
pub const QUERY_DEBUG: &str = "debug";

pub const ENV_API_KEY: &str = "EXA_API_KEY";
pub const ENV_ENABLED_TOOLS: &str = "ENABLED_TOOLS";
pub const ENV_DEBUG: &str = "DEBUG";
pub const ENV_QPS_LIMIT: &str = "RATE_LIMIT_QPS";
pub const ENV_DAILY_LIMIT: &str = "RATE_LIMIT_DAILY";
pub const ENV_FAIL_OPEN: &str = "RATE_LIMIT_FAIL_OPEN";
pub const ENV_STORE_TIMEOUT_MS: &str = "RATE_LIMIT_STORE_TIMEOUT_MS";
pub const ENV_BYPASS_USER_AGENT_PREFIX: &str = "RATE_LIMIT_BYPASS_USER_AGENT_PREFIX";
pub const ENV_BYPASS_API_KEY: &str = "RATE_LIMIT_BYPASS_API_KEY";

pub const DEFAULT_QPS_LIMIT: u32 = 2;
pub const DEFAULT_DAILY_LIMIT: u32 = 50;
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 1000;

/// Immutable snapshot of environment variables.
///
/// Empty (or whitespace-only) values are treated as unset.
#[derive(Debug, Clone, Default)]
pub struct Env {
    vars: HashMap<String, String>,
}

impl Env {
    #[must_use]
    pub fn from_process() -> Self {
        Self::from_pairs(std::env::vars())
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// `true` only for `1|true|yes|on` (case-insensitive).
    #[must_use]
    pub fn flag(&self, name: &str) -> bool {
        self.get(name).is_some_and(is_truthy)
    }

    /// Like [`Env::flag`], but returns `default` when the variable is unset or unrecognized.
    #[must_use]
    pub fn flag_or(&self, name: &str, default: bool) -> bool {
        self.get(name).and_then(parse_bool).unwrap_or(default)
    }

    pub fn parse<T: FromStr>(&self, name: &str) -> Option<T> {
        let raw = self.get(name)?;
        match raw.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(var = name, value = raw, "ignoring unparseable environment value");
                None
            }
        }
    }
}

#[must_use]
pub fn is_truthy(raw: &str) -> bool {
    parse_bool(raw).unwrap_or(false)
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Split a comma-separated tool list, trimming entries and dropping empty segments.
///
/// Order is preserved and duplicates are kept.
#[must_use]
pub fn parse_tool_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Effective configuration for a single request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestConfig {
    pub api_key: Option<String>,
    pub enabled_tools: Option<Vec<String>>,
    pub debug: bool,
    /// The API key came from the caller's query string.
    pub user_provided_api_key: bool,
    /// The request qualified for the privileged bypass and carries the bypass key.
    pub bypass: bool,
}

impl RequestConfig {
    /// Caller-supplied keys and bypass traffic are never rate limited.
    #[must_use]
    pub fn is_rate_limit_exempt(&self) -> bool {
        self.user_provided_api_key || self.bypass
    }
}

/// Resolve the effective [`RequestConfig`] for a request.
///
/// A query parameter wins when present and non-empty; otherwise the environment fallback
/// applies. An unparseable URL degrades to environment-only configuration and never fails.
#[must_use]
pub fn resolve(request_url: &str, env: &Env) -> RequestConfig {
    let mut query_api_key: Option<String> = None;
    let mut query_tools: Option<String> = None;
    let mut query_debug: Option<String> = None;

    match Url::parse(request_url) {
        Ok(url) => {
            // First occurrence of each parameter wins.
            for (k, v) in url.query_pairs() {
                let slot = match &*k {
                    QUERY_API_KEY => &mut query_api_key,
                    QUERY_TOOLS => &mut query_tools,
                    QUERY_DEBUG => &mut query_debug,
                    _ => continue,
                };
                if slot.is_none() {
                    *slot = Some(v.into_owned());
                }
            }
        }
        Err(e) => {
            let err = crate::error::GatewayError::ConfigParse(e.to_string());
            if env.flag(ENV_DEBUG) {
                tracing::info!(
                    error = %err,
                    url = request_url,
                    "falling back to environment config"
                );
            } else {
                tracing::debug!(error = %err, "falling back to environment config");
            }
        }
    }

    let query_api_key = query_api_key
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty());
    let user_provided_api_key = query_api_key.is_some();
    let api_key = query_api_key.or_else(|| env.get(ENV_API_KEY).map(str::to_string));

    let enabled_tools = query_tools
        .as_deref()
        .map(parse_tool_list)
        .filter(|t| !t.is_empty())
        .or_else(|| {
            env.get(ENV_ENABLED_TOOLS)
                .map(parse_tool_list)
                .filter(|t| !t.is_empty())
        });

    let debug = match query_debug.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => is_truthy(v),
        _ => env.flag(ENV_DEBUG),
    };

    RequestConfig {
        api_key,
        enabled_tools,
        debug,
        user_provided_api_key,
        bypass: false,
    }
}

/// Process-level gateway settings.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub qps_limit: u32,
    pub daily_limit: u32,
    /// Admit requests when the counter store errors or times out.
    pub fail_open: bool,
    pub store_timeout: Duration,
    pub bypass_user_agent_prefix: Option<String>,
    pub bypass_api_key: Option<String>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            qps_limit: DEFAULT_QPS_LIMIT,
            daily_limit: DEFAULT_DAILY_LIMIT,
            fail_open: true,
            store_timeout: Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS),
            bypass_user_agent_prefix: None,
            bypass_api_key: None,
        }
    }
}

impl GatewaySettings {
    #[must_use]
    pub fn from_env(env: &Env) -> Self {
        Self {
            qps_limit: env.parse(ENV_QPS_LIMIT).unwrap_or(DEFAULT_QPS_LIMIT),
            daily_limit: env.parse(ENV_DAILY_LIMIT).unwrap_or(DEFAULT_DAILY_LIMIT),
            fail_open: env.flag_or(ENV_FAIL_OPEN, true),
            store_timeout: Duration::from_millis(
                env.parse(ENV_STORE_TIMEOUT_MS)
                    .unwrap_or(DEFAULT_STORE_TIMEOUT_MS),
            ),
            bypass_user_agent_prefix: env.get(ENV_BYPASS_USER_AGENT_PREFIX).map(str::to_string),
            bypass_api_key: env.get(ENV_BYPASS_API_KEY).map(str::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Env {
        Env::from_pairs(pairs.iter().map(|(k, v)| (*k, *v)))
    }

    #[test]
    fn query_params_take_precedence_over_env() {
        let env = env(&[
            (ENV_API_KEY, "env-key"),
            (ENV_ENABLED_TOOLS, "crawling_exa"),
            (ENV_DEBUG, "false"),
        ]);
        let cfg = resolve(
            concat!(
                "https://mcp.example/mcp?exaApiKey=url-key",
                "&tools=web_search_exa,%20get_code_context_exa&debug=true",
            ),
            &env,
        );
        assert_eq!(cfg.api_key.as_deref(), Some("url-key"));
        assert!(cfg.user_provided_api_key);
        assert_eq!(
            cfg.enabled_tools,
            Some(vec![
                "web_search_exa".to_string(),
                "get_code_context_exa".to_string()
            ])
        );
        assert!(cfg.debug);
    }

    #[test]
    fn empty_query_values_fall_back_to_env() {
        let env = env(&[
            (ENV_API_KEY, "env-key"),
            (ENV_ENABLED_TOOLS, "a, b ,,a"),
            (ENV_DEBUG, "1"),
        ]);
        let cfg = resolve("https://mcp.example/mcp?exaApiKey=&tools=,,&debug=", &env);
        assert_eq!(cfg.api_key.as_deref(), Some("env-key"));
        assert!(!cfg.user_provided_api_key);
        assert_eq!(
            cfg.enabled_tools,
            Some(vec!["a".to_string(), "b".to_string(), "a".to_string()])
        );
        assert!(cfg.debug);
    }

    #[test]
    fn unparseable_url_uses_env_only() {
        let env = env(&[(ENV_API_KEY, "env-key"), (ENV_DEBUG, "true")]);
        let cfg = resolve("not a url ?exaApiKey=url-key", &env);
        assert_eq!(cfg.api_key.as_deref(), Some("env-key"));
        assert!(!cfg.user_provided_api_key);
        assert!(cfg.debug);
        assert_eq!(cfg.enabled_tools, None);
    }

    #[test]
    fn nothing_configured_yields_defaults() {
        let cfg = resolve("http://localhost/mcp", &Env::default());
        assert_eq!(cfg, RequestConfig::default());
        assert!(!cfg.is_rate_limit_exempt());
    }

    #[test]
    fn explicit_debug_false_overrides_env() {
        let env = env(&[(ENV_DEBUG, "true")]);
        assert!(!resolve("http://localhost/mcp?debug=false", &env).debug);
    }

    #[test]
    fn settings_defaults_and_overrides() {
        let s = GatewaySettings::from_env(&Env::default());
        assert_eq!(s.qps_limit, 2);
        assert_eq!(s.daily_limit, 50);
        assert!(s.fail_open);

        let s = GatewaySettings::from_env(&env(&[
            (ENV_QPS_LIMIT, "5"),
            (ENV_DAILY_LIMIT, "not-a-number"),
            (ENV_FAIL_OPEN, "off"),
            (ENV_STORE_TIMEOUT_MS, "250"),
        ]));
        assert_eq!(s.qps_limit, 5);
        assert_eq!(s.daily_limit, 50);
        assert!(!s.fail_open);
        assert_eq!(s.store_timeout, Duration::from_millis(250));
    }
}
