//! API Gateway
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Request
//!     ───────────────▶ access log ─▶ auth ─▶ rate limit ─▶ idempotency ─▶ forwarder ─▶ Backend
//!                      (global)     (service                              │            Service
//!                                    routes)                              ▼
//!                                                                   /health aggregator
//!
//!     Shared: cache (Redis or in-memory), service registry, pooled upstream client
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clap::Parser;
use tokio::net::TcpListener;

use api_gateway::config::load_config;
use api_gateway::lifecycle::{wait_for_signal, Shutdown};
use api_gateway::net::load_tls_config;
use api_gateway::observability::{logging, metrics};
use api_gateway::{Cache, GatewayServer};

#[derive(Parser)]
#[command(name = "api-gateway", version, about = "Authenticating, rate-limiting API gateway")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "GATEWAY_CONFIG", default_value = "gateway.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(&args.config)?;

    logging::init_tracing(&config.observability.log_level, config.observability.log_format);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "api-gateway starting");
    tracing::info!(
        bind_address = %config.server.bind_address(),
        services = config.services.len(),
        auth = config.auth.enabled,
        rate_limit = config.rate_limit.enabled,
        request_timeout_secs = config.timeouts.request_secs,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse::<SocketAddr>() {
            Ok(addr) => metrics::install_exporter(addr)?,
            Err(e) => {
                tracing::error!(
                    metrics_address = %config.observability.metrics_address,
                    error = %e,
                    "Failed to parse metrics address"
                );
            }
        }
    }

    let cache = Cache::connect(&config.cache).await?;
    if let Err(e) = cache.ping().await {
        tracing::error!(error = %e, "Failed to connect to cache");
        return Err(e.into());
    }
    tracing::info!("Cache connection established");

    let shutdown = Shutdown::new();
    let server_shutdown = shutdown.subscribe();
    let tls = config.server.tls.clone();
    let bind_address = config.server.bind_address();
    let server = GatewayServer::new(config, cache);

    let mut server_task = if tls.enabled {
        let rustls = load_tls_config(Path::new(&tls.cert_path), Path::new(&tls.key_path)).await?;
        let addr = tokio::net::lookup_host(&bind_address)
            .await?
            .next()
            .ok_or_else(|| format!("could not resolve bind address {bind_address}"))?;
        tokio::spawn(server.run_tls(addr, rustls, server_shutdown))
    } else {
        let listener = TcpListener::bind(&bind_address).await?;
        tracing::info!(address = %listener.local_addr()?, "Listening for connections");
        tokio::spawn(server.run(listener, server_shutdown))
    };

    tokio::select! {
        _ = wait_for_signal() => shutdown.trigger(),
        result = &mut server_task => {
            result??;
            return Ok(());
        }
    }

    server_task.await??;
    tracing::info!("Shutdown complete");
    Ok(())
}
