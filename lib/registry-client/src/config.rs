//! Agent configuration loaded from the environment

use anyhow::{bail, Context, Result};
use registry_core::{InstanceAddress, Lease, MAX_TTL_SECONDS};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

/// Default heartbeat interval in seconds
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
/// Default lease TTL in seconds (three missed heartbeats)
pub const DEFAULT_LEASE_TTL_SECS: u64 = 90;
/// Default bound on every registry call in seconds
pub const DEFAULT_REGISTRY_TIMEOUT_SECS: u64 = 5;

/// Everything an instance needs to describe and renew its lease
#[derive(Clone, Debug, PartialEq)]
pub struct AgentConfig {
    pub service_name: String,
    /// Host the router should dial; never a wildcard address
    pub advertise_host: String,
    pub port: u16,
    pub registry_url: String,
    pub heartbeat_interval: Duration,
    pub lease_ttl: Duration,
    pub registry_timeout: Duration,
    pub metadata: BTreeMap<String, String>,
}

impl AgentConfig {
    pub fn new(service_name: &str, advertise_host: &str, port: u16, registry_url: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            advertise_host: advertise_host.to_string(),
            port,
            registry_url: registry_url.to_string(),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            lease_ttl: Duration::from_secs(DEFAULT_LEASE_TTL_SECS),
            registry_timeout: Duration::from_secs(DEFAULT_REGISTRY_TIMEOUT_SECS),
            metadata: BTreeMap::new(),
        }
    }

    /// Read `SERVICE_NAME`, `ADVERTISE_HOST`, `REGISTRY_URL`,
    /// `HEARTBEAT_INTERVAL_SECS`, `LEASE_TTL_SECS`, `REGISTRY_TIMEOUT_SECS` and
    /// `INSTANCE_METADATA` (`key=value,key=value`) for an instance bound on `port`
    pub fn from_env(port: u16) -> Result<Self> {
        Self::from_lookup(port, |key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(port: u16, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let service_name = lookup("SERVICE_NAME").context("SERVICE_NAME is required")?;
        let advertise_host = lookup("ADVERTISE_HOST").unwrap_or_else(|| "127.0.0.1".to_string());
        let registry_url =
            lookup("REGISTRY_URL").unwrap_or_else(|| "http://127.0.0.1:8761".to_string());

        let mut config = Self::new(&service_name, &advertise_host, port, &registry_url);
        config.heartbeat_interval = Duration::from_secs(parse_or(
            &lookup,
            "HEARTBEAT_INTERVAL_SECS",
            DEFAULT_HEARTBEAT_INTERVAL_SECS,
        )?);
        config.lease_ttl =
            Duration::from_secs(parse_or(&lookup, "LEASE_TTL_SECS", DEFAULT_LEASE_TTL_SECS)?);
        config.registry_timeout = Duration::from_secs(parse_or(
            &lookup,
            "REGISTRY_TIMEOUT_SECS",
            DEFAULT_REGISTRY_TIMEOUT_SECS,
        )?);
        if let Some(raw) = lookup("INSTANCE_METADATA") {
            config.metadata = parse_metadata(&raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.service_name.trim().is_empty() {
            bail!("service name must not be empty");
        }
        if matches!(self.advertise_host.as_str(), "0.0.0.0" | "::" | "[::]") {
            bail!("advertise host must be routable, got {}", self.advertise_host);
        }
        if self.heartbeat_interval.is_zero() {
            bail!("heartbeat interval must be positive");
        }
        if self.lease_ttl.as_secs() > MAX_TTL_SECONDS {
            bail!("lease TTL must not exceed {} seconds", MAX_TTL_SECONDS);
        }
        if self.heartbeat_interval >= self.lease_ttl {
            bail!(
                "heartbeat interval ({:?}) must be shorter than the lease TTL ({:?})",
                self.heartbeat_interval,
                self.lease_ttl
            );
        }
        Ok(())
    }

    /// The lease descriptor this instance advertises
    pub fn lease(&self) -> Lease {
        let address = InstanceAddress::new(self.advertise_host.clone(), self.port);
        let mut lease = Lease::new(&self.service_name, address, self.lease_ttl.as_secs().max(1));
        lease.metadata = self.metadata.clone();
        lease
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {}: {:?}", key, raw)),
        None => Ok(default),
    }
}

fn parse_metadata(raw: &str) -> Result<BTreeMap<String, String>> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.trim().to_string())),
            _ => bail!("invalid metadata entry {:?}, expected key=value", pair),
        })
        .collect()
}
