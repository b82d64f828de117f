//! Prometheus metrics for the registry

use anyhow::Result;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct RegistryMetrics {
    /// Stored leases, refreshed on every scrape
    pub leases: IntGauge,
    pub services: IntGauge,
    /// Registry operations by name and result
    pub operations_total: IntCounterVec,
    /// Leases removed by the background sweep
    pub swept_total: IntCounter,
    registry: Arc<Registry>,
}

impl RegistryMetrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let leases = IntGauge::new("registry_leases", "Leases currently stored")?;
        let services = IntGauge::new("registry_services", "Services with at least one stored lease")?;
        let operations_total = IntCounterVec::new(
            Opts::new("registry_operations_total", "Registry operations by result"),
            &["operation", "result"],
        )?;
        let swept_total = IntCounter::new(
            "registry_swept_leases_total",
            "Expired leases removed by the background sweep",
        )?;

        registry.register(Box::new(leases.clone()))?;
        registry.register(Box::new(services.clone()))?;
        registry.register(Box::new(operations_total.clone()))?;
        registry.register(Box::new(swept_total.clone()))?;

        Ok(Self {
            leases,
            services,
            operations_total,
            swept_total,
            registry,
        })
    }

    pub fn record(&self, operation: &str, result: &str) {
        self.operations_total
            .with_label_values(&[operation, result])
            .inc();
    }

    pub fn gather(&self) -> Result<String> {
        let mut buffer = vec![];
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
