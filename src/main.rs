use tracing_subscriber::{EnvFilter, fmt};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Init logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))?;
    fmt().with_env_filter(filter).init();

    let config = taskportal::config::PortalConfig::from_env()?;
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    info!(
        target: "portal",
        "Portal starting: RUST_LOG='{}', http_port={}, backend={}, session_ttl_secs={}, authz_cache_allow_ms={}, authz_cache_deny_ms={}",
        rust_log,
        config.http_port,
        config.backend_url.as_deref().unwrap_or("<in-memory>"),
        config.session_ttl_secs,
        config.authz_cache_allow_ms,
        config.authz_cache_deny_ms
    );

    taskportal::server::run(config).await
}
