//! W3C trace context propagation between the gateway and upstreams

use crate::middleware::{Middleware, MiddlewareContext};
use anyhow::Result;
use std::collections::HashMap;
use std::fmt::Write;
use tracing::{info, warn};

/// Metadata key holding the `traceparent` value sent upstream
pub const OUTGOING_TRACEPARENT: &str = "traceparent";

/// Parsed `traceparent` header
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceParent {
    pub trace_id: String,
    pub span_id: String,
    pub flags: String,
}

impl TraceParent {
    /// Parse `version-trace_id-span_id-flags`, rejecting malformed or all-zero ids
    pub fn parse(value: &str) -> Option<Self> {
        let parts: Vec<&str> = value.trim().split('-').collect();
        let &[version, trace_id, span_id, flags] = parts.as_slice() else {
            return None;
        };

        let is_hex = |s: &str, len: usize| s.len() == len && s.bytes().all(|b| b.is_ascii_hexdigit());
        let is_zero = |s: &str| s.bytes().all(|b| b == b'0');
        if !is_hex(version, 2) || version == "ff" {
            return None;
        }
        if !is_hex(trace_id, 32) || is_zero(trace_id) || !is_hex(span_id, 16) || is_zero(span_id) {
            return None;
        }
        if !is_hex(flags, 2) {
            return None;
        }

        Some(Self {
            trace_id: trace_id.to_ascii_lowercase(),
            span_id: span_id.to_ascii_lowercase(),
            flags: flags.to_ascii_lowercase(),
        })
    }

    /// Start a new sampled trace
    pub fn generate() -> Self {
        Self {
            trace_id: random_hex(16),
            span_id: random_hex(8),
            flags: "01".to_string(),
        }
    }

    /// Same trace, new span for the hop to the upstream
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: random_hex(8),
            flags: self.flags.clone(),
        }
    }

    pub fn header_value(&self) -> String {
        format!("00-{}-{}-{}", self.trace_id, self.span_id, self.flags)
    }
}

fn random_hex(bytes: usize) -> String {
    let mut id = String::with_capacity(bytes * 2);
    for _ in 0..bytes {
        let _ = write!(&mut id, "{:02x}", rand::random::<u8>());
    }
    // W3C trace context forbids all-zero ids
    if id.bytes().all(|b| b == b'0') {
        id.replace_range(id.len() - 1.., "1");
    }
    id
}

/// Continues or starts a trace for every request and logs it with its trace id
pub struct TraceContextMiddleware {
    /// Service name attached to trace log lines
    pub service_name: String,
}

impl TraceContextMiddleware {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    /// Incoming trace context, if the caller sent a valid one
    pub fn extract(headers: &HashMap<String, String>) -> Option<TraceParent> {
        headers.get("traceparent").and_then(|v| TraceParent::parse(v))
    }
}

impl Default for TraceContextMiddleware {
    fn default() -> Self {
        Self::new("router-gateway")
    }
}

#[async_trait::async_trait]
impl Middleware for TraceContextMiddleware {
    fn name(&self) -> &'static str {
        "TraceContextMiddleware"
    }

    async fn on_request(&self, context: &MiddlewareContext) -> Result<()> {
        let outgoing = match Self::extract(&context.request_headers) {
            Some(incoming) => incoming.child(),
            None => TraceParent::generate(),
        };

        context.set_metadata("trace_id", outgoing.trace_id.clone());
        context.set_metadata(OUTGOING_TRACEPARENT, outgoing.header_value());

        info!(
            trace_id = %outgoing.trace_id,
            service = %self.service_name,
            method = %context.method,
            path = %context.path,
            "Request started"
        );
        Ok(())
    }

    async fn on_response(&self, context: &MiddlewareContext, status: u16) -> Result<()> {
        let trace_id = context.get_metadata("trace_id").unwrap_or_default();
        info!(
            trace_id = %trace_id,
            status = status,
            method = %context.method,
            path = %context.path,
            elapsed_ms = context.elapsed_ms() as u64,
            "Request completed"
        );
        Ok(())
    }

    async fn on_error(&self, context: &MiddlewareContext, error: &str) -> Result<()> {
        let trace_id = context.get_metadata("trace_id").unwrap_or_default();
        warn!(
            trace_id = %trace_id,
            error = %error,
            method = %context.method,
            path = %context.path,
            "Request failed"
        );
        Ok(())
    }
}
