use anyhow::Result;
use clap::Parser;

use rondo_server::config::ServerConfig;
use rondo_server::server::Server;

/// Log to stderr, scoped to this crate at info by default (`RUST_LOG`
/// overrides). Collectors get one JSON object per line with RONDO_LOG_JSON=1.
fn init_tracing() -> Result<()> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::from_default_env().add_directive("rondo_server=info".parse()?);
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match std::env::var("RONDO_LOG_JSON").as_deref() {
        Ok("1") => builder.json().init(),
        _ => builder.init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    let config = ServerConfig::parse();
    tracing::info!("Signaling server starting on {}", config.listen_addr);
    if config.admin_secret.is_none() {
        tracing::warn!("No admin secret configured; /admin endpoints are disabled");
    }

    Server::new(config).run().await
}
