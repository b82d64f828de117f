use anyhow::{Context, Result};
use hyper::body::Incoming;
use hyper::Request;
use registry_core::ServiceRegistry;
use router_proxy::server::{serve, shutdown_signal};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod metrics;
mod sweeper;

use api::RegistryHttpApi;
use config::ServerConfig;
use metrics::RegistryMetrics;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting registry-server...");
    let config = ServerConfig::from_env()?;

    let registry = Arc::new(ServiceRegistry::new());
    let metrics = RegistryMetrics::new()?;
    let api = Arc::new(RegistryHttpApi::new(registry.clone(), metrics.clone()));

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!("Registry listening on {}", config.listen_addr);

    let sweeper = match config.sweep_interval {
        Some(interval) => {
            info!("Sweeping expired leases every {:?}", interval);
            Some(sweeper::spawn_sweeper(registry.clone(), metrics, interval))
        }
        None => {
            info!("Background sweep disabled");
            None
        }
    };

    let handler = move |req: Request<Incoming>| {
        let api = api.clone();
        async move { api.handle(req).await }
    };
    serve(listener, handler, shutdown_signal(), config.shutdown_grace).await;

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    info!("registry-server stopped with {} leases held", registry.lease_count().await);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
