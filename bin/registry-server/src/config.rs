use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::time::Duration;

/// Registry server settings read from the environment
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// `None` disables the background sweep; lookups still expire lazily
    pub sweep_interval: Option<Duration>,
    pub shutdown_grace: Duration,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_addr = lookup("REGISTRY_LISTEN_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8761".to_string());
        let listen_addr = listen_addr
            .parse()
            .with_context(|| format!("invalid REGISTRY_LISTEN_ADDR {}", listen_addr))?;

        let sweep_secs: u64 = match lookup("REGISTRY_SWEEP_INTERVAL_SECS") {
            Some(v) => v
                .parse()
                .with_context(|| format!("invalid REGISTRY_SWEEP_INTERVAL_SECS {}", v))?,
            None => 60,
        };

        let grace_secs: u64 = match lookup("SHUTDOWN_GRACE_SECS") {
            Some(v) => v
                .parse()
                .with_context(|| format!("invalid SHUTDOWN_GRACE_SECS {}", v))?,
            None => 10,
        };

        Ok(Self {
            listen_addr,
            sweep_interval: (sweep_secs > 0).then(|| Duration::from_secs(sweep_secs)),
            shutdown_grace: Duration::from_secs(grace_secs),
        })
    }
}
