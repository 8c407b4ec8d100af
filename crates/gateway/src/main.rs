use anyhow::Context as _;
use clap::{Parser, ValueEnum};
use exa_mcp_gateway::config::Env;
use exa_mcp_gateway::mcp::upstream::UpstreamFactory;
use exa_mcp_gateway::pipeline::{self, Gateway};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Exa MCP admission gateway")]
struct Cli {
    /// Address to listen on.
    #[arg(long, env = "EXA_MCP_GATEWAY_BIND", default_value = "0.0.0.0:8080")]
    bind: String,

    /// Upstream MCP endpoint admitted requests are forwarded to.
    #[arg(long, env = "EXA_MCP_UPSTREAM_URL", default_value = "https://mcp.exa.ai/mcp")]
    upstream: String,

    #[arg(long, env = "EXA_MCP_UPSTREAM_TIMEOUT_SECS", default_value_t = 30)]
    upstream_timeout_secs: u64,

    /// Default log filter when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn init_tracing(cli: &Cli) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match cli.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let factory = UpstreamFactory::new(
        &cli.upstream,
        Duration::from_secs(cli.upstream_timeout_secs),
    )?;
    let gateway = Arc::new(Gateway::from_env(Env::from_process(), Arc::new(factory)));
    gateway.limiter().initialize();
    let app = pipeline::router(gateway);

    let listener = TcpListener::bind(&cli.bind)
        .await
        .with_context(|| format!("bind {}", cli.bind))?;
    tracing::info!(
        addr = %listener.local_addr()?,
        upstream = %cli.upstream,
        "exa-mcp-gateway listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve")?;
    Ok(())
}
