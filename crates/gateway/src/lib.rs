//! Admission gateway in front of the Exa MCP server.
//!
//! Resolves per-request configuration from the URL, rate limits free-tier tool calls per client
//! address against a shared counter store, and delegates admitted traffic to a handler cached
//! per enabled-tool set.

pub mod bypass;
pub mod config;
pub mod counter_store;
pub mod error;
pub mod handler_cache;
pub mod mcp;
pub mod pipeline;
pub mod rate_limit;
pub mod well_known;
