use anyhow::{Context, Result};
use hyper::body::Incoming;
use hyper::Request;
use registry_client::{AgentConfig, RegistrationAgent, RegistryClient};
use router_proxy::server::{accept_until, drain, shutdown_signal};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod store;

use store::ItemStore;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let bind_addr: SocketAddr = std::env::var("BIND_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8081".to_string())
        .parse()
        .context("invalid BIND_ADDR")?;
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", bind_addr))?;
    let port = listener.local_addr()?.port();

    let config = AgentConfig::from_env(port)?;
    let resource = std::env::var("RESOURCE_NAME").unwrap_or_else(|_| "items".to_string());
    let grace = shutdown_grace(|key| std::env::var(key).ok())?;
    info!(
        "Starting demo-backend {} on port {} serving /{}",
        config.service_name, port, resource
    );

    let registry = RegistryClient::new(&config.registry_url, config.registry_timeout)?;
    let agent = RegistrationAgent::new(Arc::new(registry), config.lease(), config.heartbeat_interval);
    let agent = agent.start().await;
    info!("Registration agent running ({:?})", agent.state());

    let store = Arc::new(ItemStore::new(&config.service_name, &resource));
    let handler = move |req: Request<Incoming>| {
        let store = store.clone();
        async move { store.handle(req).await }
    };

    // Leave the registry before draining so the router stops picking this instance
    let graceful = accept_until(listener, handler, shutdown_signal()).await;
    agent.shutdown().await;
    drain(graceful, grace).await;

    info!("demo-backend stopped");
    Ok(())
}

/// `SHUTDOWN_GRACE_SECS`, defaulting to ten seconds
fn shutdown_grace<F>(lookup: F) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup("SHUTDOWN_GRACE_SECS") {
        Some(raw) => {
            let secs = raw
                .trim()
                .parse()
                .with_context(|| format!("invalid value for SHUTDOWN_GRACE_SECS: {:?}", raw))?;
            Ok(Duration::from_secs(secs))
        }
        None => Ok(Duration::from_secs(10)),
    }
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
