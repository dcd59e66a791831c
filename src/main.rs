use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use stream_cache_proxy::config::CacheConfig;
use stream_cache_proxy::engine::streamer::Streamer;
use stream_cache_proxy::server::handler::ProxyServer;
use stream_cache_proxy::source::http_source::HttpSource;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,reqwest=warn"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = CacheConfig::load().context("loading configuration")?;
    info!(
        "cache dir={} budget={} bytes source={}",
        config.cache_dir.display(),
        config.budget_bytes,
        config.source_url_template
    );

    let source = Arc::new(
        HttpSource::new(
            config.source_url_template.clone(),
            config.fallback_content_type.clone(),
        )
        .context("building remote client")?,
    );
    let listen_addr = config.listen_addr;
    let eviction_interval = config.eviction_interval;
    let streamer = Arc::new(Streamer::new(config, source).context("opening cache")?);

    let shutdown = CancellationToken::new();
    let eviction_task =
        Arc::clone(streamer.evictor()).spawn_periodic(eviction_interval, shutdown.clone());

    let server = ProxyServer::start(listen_addr, Arc::clone(&streamer))
        .await
        .with_context(|| format!("binding {}", listen_addr))?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutting down");

    shutdown.cancel();
    streamer.shutdown();
    server.shutdown();
    let _ = eviction_task.await;
    Ok(())
}
