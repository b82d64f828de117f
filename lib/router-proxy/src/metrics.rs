//! Prometheus metrics for the gateway

use crate::middleware::{Middleware, MiddlewareContext};
use anyhow::Result;
use prometheus::{Counter, CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::Arc;
use tracing::debug;

/// Service label used before a discovery route's name is confirmed by the registry
pub const UNRESOLVED_SERVICE_LABEL: &str = "unknown";

/// Outcome label for requests routed to a backend service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamOutcome {
    Forwarded,
    NoInstance,
    RegistryUnavailable,
    UpstreamError,
    UpstreamTimeout,
}

impl UpstreamOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamOutcome::Forwarded => "forwarded",
            UpstreamOutcome::NoInstance => "no_instance",
            UpstreamOutcome::RegistryUnavailable => "registry_unavailable",
            UpstreamOutcome::UpstreamError => "upstream_error",
            UpstreamOutcome::UpstreamTimeout => "upstream_timeout",
        }
    }
}

/// Prometheus metrics collector for gateway traffic
#[derive(Clone)]
pub struct MetricsCollector {
    /// Requests received, by method
    pub http_requests_total: CounterVec,
    /// Responses sent, by status
    pub http_responses_total: CounterVec,
    /// Request latency by method
    pub http_request_duration_seconds: HistogramVec,
    /// Requests that could not be served by an upstream
    pub http_errors_total: Counter,
    /// Routed requests by target service and outcome
    pub upstream_requests_total: CounterVec,
    pub registry: Arc<Registry>,
}

impl MetricsCollector {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let http_requests_total = CounterVec::new(
            Opts::new("gateway_http_requests_total", "Total HTTP requests received"),
            &["method"],
        )?;
        let http_responses_total = CounterVec::new(
            Opts::new("gateway_http_responses_total", "Total HTTP responses by status"),
            &["status"],
        )?;
        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "gateway_http_request_duration_seconds",
                "HTTP request latency in seconds",
            ),
            &["method"],
        )?;
        let http_errors_total = Counter::new(
            "gateway_http_errors_total",
            "Requests that failed before an upstream response was relayed",
        )?;
        let upstream_requests_total = CounterVec::new(
            Opts::new(
                "gateway_upstream_requests_total",
                "Routed requests by target service and outcome",
            ),
            &["service", "outcome"],
        )?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_responses_total.clone()))?;
        registry.register(Box::new(http_request_duration_seconds.clone()))?;
        registry.register(Box::new(http_errors_total.clone()))?;
        registry.register(Box::new(upstream_requests_total.clone()))?;

        Ok(Self {
            http_requests_total,
            http_responses_total,
            http_request_duration_seconds,
            http_errors_total,
            upstream_requests_total,
            registry,
        })
    }

    pub fn record_upstream(&self, service: &str, outcome: UpstreamOutcome) {
        self.upstream_requests_total
            .with_label_values(&[service, outcome.as_str()])
            .inc();
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = vec![];
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Records request counts, response statuses and latency
pub struct MetricsMiddleware {
    pub collector: MetricsCollector,
}

impl MetricsMiddleware {
    pub fn new(collector: MetricsCollector) -> Self {
        Self { collector }
    }
}

#[async_trait::async_trait]
impl Middleware for MetricsMiddleware {
    fn name(&self) -> &'static str {
        "MetricsMiddleware"
    }

    async fn on_request(&self, context: &MiddlewareContext) -> Result<()> {
        self.collector
            .http_requests_total
            .with_label_values(&[context.method.as_str()])
            .inc();
        Ok(())
    }

    async fn on_response(&self, context: &MiddlewareContext, status: u16) -> Result<()> {
        self.collector
            .http_responses_total
            .with_label_values(&[status.to_string().as_str()])
            .inc();
        self.collector
            .http_request_duration_seconds
            .with_label_values(&[context.method.as_str()])
            .observe(context.started_at.elapsed().as_secs_f64());
        Ok(())
    }

    async fn on_error(&self, context: &MiddlewareContext, error: &str) -> Result<()> {
        debug!("Recording error for {} {}: {}", context.method, context.path, error);
        self.collector.http_errors_total.inc();
        Ok(())
    }
}
