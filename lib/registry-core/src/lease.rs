//! Lease data model

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Instance status as advertised in a lease
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum LeaseStatus {
    Up,
    Down,
    #[default]
    Unknown,
}

impl fmt::Display for LeaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LeaseStatus::Up => "UP",
            LeaseStatus::Down => "DOWN",
            LeaseStatus::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Host and port a router can reach an instance on
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceAddress {
    pub host: String,
    pub port: u16,
}

impl InstanceAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Host as it must appear in an authority; IPv6 literals get brackets
    pub fn authority_host(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }

    /// Base URL for plain HTTP calls to this instance
    pub fn http_base(&self) -> String {
        format!("http://{}", self)
    }
}

impl fmt::Display for InstanceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.authority_host(), self.port)
    }
}

/// Longest TTL a registration may ask for (one year)
pub const MAX_TTL_SECONDS: u64 = 365 * 24 * 60 * 60;

/// A time-bounded claim that one instance of a named service is alive
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub service_name: String,
    pub instance_id: String,
    pub address: InstanceAddress,
    #[serde(default)]
    pub health_check_url: Option<String>,
    #[serde(default)]
    pub status: LeaseStatus,
    /// Stamped by the registry; ignored when a client submits a registration
    #[serde(default)]
    pub registered_at: DateTime<Utc>,
    /// Stamped by the registry on registration and every heartbeat
    #[serde(default)]
    pub last_renewed_at: DateTime<Utc>,
    pub ttl_seconds: u64,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Lease {
    /// Build an `UP` lease whose instance id is `host:port`
    pub fn new(service_name: &str, address: InstanceAddress, ttl_seconds: u64) -> Self {
        Self {
            service_name: normalize_service_name(service_name),
            instance_id: address.to_string(),
            health_check_url: Some(format!("{}/health", address.http_base())),
            address,
            status: LeaseStatus::Up,
            registered_at: DateTime::<Utc>::default(),
            last_renewed_at: DateTime::<Utc>::default(),
            ttl_seconds,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    pub fn with_health_check_url(mut self, url: Option<String>) -> Self {
        self.health_check_url = url;
        self
    }

    pub fn with_status(mut self, status: LeaseStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn ttl(&self) -> Duration {
        i64::try_from(self.ttl_seconds)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or(Duration::MAX)
    }

    /// Instant after which the lease is no longer valid without a renewal
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.last_renewed_at
            .checked_add_signed(self.ttl())
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.last_renewed_at >= self.ttl()
    }

    /// Visible to routing: `UP` and renewed within the TTL
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.status == LeaseStatus::Up && !self.is_expired(now)
    }
}

/// Service names are case-insensitive; the registry keys them upper case
pub fn normalize_service_name(name: &str) -> String {
    name.trim().to_ascii_uppercase()
}
