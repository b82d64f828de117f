//! Gateway configuration loaded from YAML with environment overrides

use crate::cors::CorsConfig;
use crate::error::{ProxyError, Result};
use crate::load_balancer::LoadBalancingStrategy;
use crate::policy::{RetryPolicy, TimeoutPolicy};
use crate::rules::{PathRewrite, RouteRule, RouteTable};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

pub const CONFIG_PATH_ENV: &str = "ROUTER_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/gateway.yaml";
pub const LISTEN_ADDR_ENV: &str = "ROUTER_LISTEN_ADDR";
pub const REGISTRY_URL_ENV: &str = "REGISTRY_URL";

/// One routing rule as written in the config file
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub path_pattern: String,
    pub target_service: String,
    /// Written as `{ strip_prefix: 1 }` or a bare `none`
    #[serde(default, with = "serde_yaml::with::singleton_map")]
    pub path_rewrite: PathRewrite,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub listen_addr: String,
    pub registry_url: String,
    pub discovery_locator: bool,
    pub load_balancing: LoadBalancingStrategy,
    pub timeouts: TimeoutPolicy,
    pub retry: RetryPolicy,
    pub shutdown_grace_secs: u64,
    pub routes: Vec<RouteConfig>,
    /// Absent means cross-origin requests are not checked
    pub cors: Option<CorsConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            registry_url: "http://127.0.0.1:8761".to_string(),
            discovery_locator: false,
            load_balancing: LoadBalancingStrategy::default(),
            timeouts: TimeoutPolicy::default(),
            retry: RetryPolicy::default(),
            shutdown_grace_secs: 10,
            routes: Vec::new(),
            cors: None,
        }
    }
}

impl GatewayConfig {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: GatewayConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&text)
    }

    /// Load from `ROUTER_CONFIG` (or the default path) and apply env overrides.
    /// A missing file at the default path falls back to built-in defaults.
    pub fn load() -> Result<Self> {
        let explicit = std::env::var(CONFIG_PATH_ENV).ok();
        let path = explicit.clone().unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

        let config = if explicit.is_none() && !Path::new(&path).exists() {
            info!("No config at {}, using defaults", path);
            Self::default()
        } else {
            info!("Loading gateway config from {}", path);
            Self::from_file(&path)?
        };

        let config = config.with_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `ROUTER_LISTEN_ADDR` / `REGISTRY_URL` style overrides from `lookup`
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup(LISTEN_ADDR_ENV).filter(|v| !v.trim().is_empty()) {
            self.listen_addr = addr;
        }
        if let Some(url) = lookup(REGISTRY_URL_ENV).filter(|v| !v.trim().is_empty()) {
            self.registry_url = url;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.socket_addr()?;
        if !self.registry_url.starts_with("http://") && !self.registry_url.starts_with("https://") {
            return Err(ProxyError::InvalidConfiguration(format!(
                "registry_url {} must be an http(s) URL",
                self.registry_url
            )));
        }
        if self.timeouts.request_timeout_secs == 0 || self.timeouts.resolve_timeout_secs == 0 {
            return Err(ProxyError::InvalidConfiguration(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        self.route_table().map(|_| ())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.listen_addr.parse().map_err(|_| {
            ProxyError::InvalidConfiguration(format!("invalid listen_addr {}", self.listen_addr))
        })
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Compile the configured routes, in order
    pub fn route_table(&self) -> Result<RouteTable> {
        let rules = self
            .routes
            .iter()
            .map(|r| RouteRule::new(&r.path_pattern, &r.target_service, r.path_rewrite.clone()))
            .collect::<Result<Vec<_>>>()?;
        Ok(RouteTable::new(rules).with_discovery_locator(self.discovery_locator))
    }
}
