//! Traffic policies for request handling

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timeout policy for requests
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutPolicy {
    /// Total timeout for one forwarded exchange
    pub request_timeout_secs: u64,
    /// Connection timeout toward an upstream
    pub connect_timeout_secs: u64,
    /// Timeout for resolving a service through the registry
    pub resolve_timeout_secs: u64,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            connect_timeout_secs: 10,
            resolve_timeout_secs: 5,
        }
    }
}

impl TimeoutPolicy {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.resolve_timeout_secs)
    }
}

/// Retry policy for requests that never reached an upstream
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RetryPolicy {
    /// Extra attempts, each against a different live instance
    pub max_retries: u32,
}

impl RetryPolicy {
    /// Total attempts allowed for one request
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Whether attempt number `attempt` (1-based) may be followed by another
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts()
    }
}
