use anyhow::{Context, Result};
use hyper::body::Incoming;
use hyper::Request;
use registry_client::RegistryClient;
use router_proxy::server::{serve, shutdown_signal};
use router_proxy::{Gateway, GatewayConfig};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting router-gateway...");
    let config = GatewayConfig::load().context("failed to load gateway config")?;
    let listen_addr = config.socket_addr()?;

    // Resolution calls share the gateway's resolve deadline
    let registry = RegistryClient::new(&config.registry_url, config.timeouts.resolve_timeout())?;
    info!("Resolving services through registry at {}", registry.base_url());

    let gateway = Arc::new(Gateway::from_config(&config, Arc::new(registry))?);

    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", listen_addr))?;
    info!("Gateway listening on {}", listen_addr);

    let handler = move |req: Request<Incoming>| {
        let gateway = gateway.clone();
        async move { gateway.handle(req).await }
    };
    serve(listener, handler, shutdown_signal(), config.shutdown_grace()).await;

    info!("router-gateway stopped");
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
