use std::net::SocketAddr;

use anyhow::{Context, Result};
use jsonkeep_service::config::Config;
use jsonkeep_service::metric;

use crate::endpoints;
use crate::service::Service;

/// Starts the keep and the HTTP server based on the loaded config.
pub fn run(config: Config) -> Result<()> {
    // Log this metric before actually starting the server. This allows to see restarts even if
    // service creation fails.
    metric!(counter("server.starting") += 1);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("jsonkeep-web")
        .enable_all()
        .build()?;

    let service = runtime
        .block_on(async { Service::create(&config) })
        .context("failed to create HTTP service state")?;

    let socket = config
        .bind
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid bind address `{}`", config.bind))?;
    let server =
        axum_server::bind(socket).serve(endpoints::create_app(service).into_make_service());
    tracing::info!("Starting HTTP server on {}", socket);
    tracing::info!("Proxying {} with a ttl of {:?}", config.upstream, config.ttl);

    runtime.block_on(server)?;
    tracing::info!("System shutdown complete");

    Ok(())
}
