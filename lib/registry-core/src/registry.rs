//! In-memory lease table with lazy expiry

use crate::clock::{Clock, SystemClock};
use crate::lease::{normalize_service_name, MAX_TTL_SECONDS};
use crate::{CoreError, Lease, LeaseStatus, RegistryApi, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Service name -> instance id -> lease
type LeaseTable = HashMap<String, HashMap<String, Lease>>;

/// ServiceRegistry owns the lease table of every registered instance
pub struct ServiceRegistry {
    leases: RwLock<LeaseTable>,
    clock: Arc<dyn Clock>,
}

/// Point-in-time view of one stored lease
#[derive(Clone, Debug, serde::Serialize)]
pub struct LeaseView {
    #[serde(flatten)]
    pub lease: Lease,
    pub is_live: bool,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a registry reading time from `clock`
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            leases: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Register or replace a lease, stamping it with the registry's clock
    pub async fn register(&self, mut lease: Lease) -> Result<()> {
        if lease.instance_id.trim().is_empty() {
            return Err(CoreError::InvalidRegistration(
                "instance_id must not be empty".to_string(),
            ));
        }
        if lease.service_name.trim().is_empty() {
            return Err(CoreError::InvalidRegistration(
                "service_name must not be empty".to_string(),
            ));
        }
        if lease.ttl_seconds == 0 {
            return Err(CoreError::InvalidRegistration(
                "ttl_seconds must be positive".to_string(),
            ));
        }
        if lease.ttl_seconds > MAX_TTL_SECONDS {
            return Err(CoreError::InvalidRegistration(format!(
                "ttl_seconds must not exceed {}",
                MAX_TTL_SECONDS
            )));
        }

        let now = self.clock.now();
        lease.service_name = normalize_service_name(&lease.service_name);
        lease.registered_at = now;
        lease.last_renewed_at = now;

        let mut leases = self.leases.write().await;
        debug!(
            "Registered {}/{} at {} (ttl {}s)",
            lease.service_name, lease.instance_id, lease.address, lease.ttl_seconds
        );
        leases
            .entry(lease.service_name.clone())
            .or_default()
            .insert(lease.instance_id.clone(), lease);
        Ok(())
    }

    /// Renew a lease. Expired leases are dropped and reported as not found.
    pub async fn heartbeat(&self, service_name: &str, instance_id: &str) -> Result<()> {
        let service = normalize_service_name(service_name);
        let now = self.clock.now();

        let mut leases = self.leases.write().await;
        let instances = leases
            .get_mut(&service)
            .ok_or_else(|| CoreError::lease_not_found(&service, instance_id))?;

        if let Some(lease) = instances.get_mut(instance_id) {
            if !lease.is_expired(now) {
                lease.last_renewed_at = now;
                debug!("Renewed {}/{}", service, instance_id);
                return Ok(());
            }
        } else {
            return Err(CoreError::lease_not_found(&service, instance_id));
        }

        // Expired but not yet swept
        instances.remove(instance_id);
        if instances.is_empty() {
            leases.remove(&service);
        }
        debug!("Heartbeat for expired lease {}/{}", service, instance_id);
        Err(CoreError::lease_not_found(&service, instance_id))
    }

    /// Remove a lease unconditionally
    pub async fn deregister(&self, service_name: &str, instance_id: &str) -> Result<()> {
        let service = normalize_service_name(service_name);

        let mut leases = self.leases.write().await;
        if let Some(instances) = leases.get_mut(&service) {
            if instances.remove(instance_id).is_some() {
                debug!("Deregistered {}/{}", service, instance_id);
            }
            if instances.is_empty() {
                leases.remove(&service);
            }
        }
        Ok(())
    }

    /// Leases of a service that are `UP` and unexpired
    pub async fn resolve_live(&self, service_name: &str) -> Vec<Lease> {
        let service = normalize_service_name(service_name);
        let now = self.clock.now();

        let leases = self.leases.read().await;
        leases
            .get(&service)
            .map(|instances| {
                instances
                    .values()
                    .filter(|lease| lease.is_live(now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Override the status of a live lease without renewing it
    pub async fn update_status(
        &self,
        service_name: &str,
        instance_id: &str,
        status: LeaseStatus,
    ) -> Result<()> {
        let service = normalize_service_name(service_name);
        let now = self.clock.now();

        let mut leases = self.leases.write().await;
        match leases
            .get_mut(&service)
            .and_then(|instances| instances.get_mut(instance_id))
        {
            Some(lease) if !lease.is_expired(now) => {
                debug!("Status of {}/{} set to {}", service, instance_id, status);
                lease.status = status;
                Ok(())
            }
            _ => Err(CoreError::lease_not_found(&service, instance_id)),
        }
    }

    /// Every stored lease grouped by service, expired ones included
    pub async fn list_services(&self) -> BTreeMap<String, Vec<LeaseView>> {
        let now = self.clock.now();
        let leases = self.leases.read().await;

        leases
            .iter()
            .map(|(service, instances)| {
                let mut views: Vec<LeaseView> = instances
                    .values()
                    .map(|lease| LeaseView {
                        is_live: lease.is_live(now),
                        lease: lease.clone(),
                    })
                    .collect();
                views.sort_by(|a, b| a.lease.instance_id.cmp(&b.lease.instance_id));
                (service.clone(), views)
            })
            .collect()
    }

    /// Drop expired leases and return how many were removed
    pub async fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut leases = self.leases.write().await;

        let mut removed = 0;
        leases.retain(|service, instances| {
            instances.retain(|instance_id, lease| {
                let keep = !lease.is_expired(now);
                if !keep {
                    debug!("Evicting expired lease {}/{}", service, instance_id);
                    removed += 1;
                }
                keep
            });
            !instances.is_empty()
        });
        removed
    }

    /// Number of stored leases, expired ones included
    pub async fn lease_count(&self) -> usize {
        let leases = self.leases.read().await;
        leases.values().map(HashMap::len).sum()
    }

    /// Number of services with at least one stored lease
    pub async fn service_count(&self) -> usize {
        let leases = self.leases.read().await;
        leases.len()
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegistryApi for ServiceRegistry {
    async fn register(&self, lease: Lease) -> Result<()> {
        ServiceRegistry::register(self, lease).await
    }

    async fn heartbeat(&self, service_name: &str, instance_id: &str) -> Result<()> {
        ServiceRegistry::heartbeat(self, service_name, instance_id).await
    }

    async fn deregister(&self, service_name: &str, instance_id: &str) -> Result<()> {
        ServiceRegistry::deregister(self, service_name, instance_id).await
    }

    async fn resolve_live(&self, service_name: &str) -> Result<Vec<Lease>> {
        Ok(ServiceRegistry::resolve_live(self, service_name).await)
    }

    async fn update_status(
        &self,
        service_name: &str,
        instance_id: &str,
        status: LeaseStatus,
    ) -> Result<()> {
        ServiceRegistry::update_status(self, service_name, instance_id, status).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::InstanceAddress;
    use chrono::Duration;

    fn registry() -> (Arc<ManualClock>, ServiceRegistry) {
        let clock = Arc::new(ManualClock::default());
        let registry = ServiceRegistry::with_clock(clock.clone());
        (clock, registry)
    }

    fn lease(service: &str, port: u16, ttl: u64) -> Lease {
        Lease::new(service, InstanceAddress::new("127.0.0.1", port), ttl)
    }

    #[tokio::test]
    async fn test_heartbeats_within_ttl_keep_instance_live() {
        let (clock, registry) = registry();
        registry.register(lease("ORDER-SERVICE", 9092, 30)).await.unwrap();

        for _ in 0..10 {
            clock.advance(Duration::seconds(29));
            registry
                .heartbeat("ORDER-SERVICE", "127.0.0.1:9092")
                .await
                .unwrap();
            let live = registry.resolve_live("ORDER-SERVICE").await;
            assert_eq!(live.len(), 1);
            assert_eq!(live[0].instance_id, "127.0.0.1:9092");
        }
    }

    #[tokio::test]
    async fn test_missing_heartbeat_expires_lease() {
        let (clock, registry) = registry();
        registry.register(lease("ORDER-SERVICE", 9092, 30)).await.unwrap();

        clock.advance(Duration::seconds(29));
        assert_eq!(registry.resolve_live("ORDER-SERVICE").await.len(), 1);

        clock.advance(Duration::seconds(1));
        assert!(registry.resolve_live("ORDER-SERVICE").await.is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_on_expired_lease_requires_register() {
        let (clock, registry) = registry();
        registry.register(lease("ORDER-SERVICE", 9092, 30)).await.unwrap();
        clock.advance(Duration::seconds(31));

        let err = registry
            .heartbeat("ORDER-SERVICE", "127.0.0.1:9092")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(registry.lease_count().await, 0);
    }

    #[tokio::test]
    async fn test_deregister_is_idempotent() {
        let (_clock, registry) = registry();
        registry.register(lease("PRODUCT-SERVICE", 9091, 30)).await.unwrap();

        registry
            .deregister("PRODUCT-SERVICE", "127.0.0.1:9091")
            .await
            .unwrap();
        registry
            .deregister("PRODUCT-SERVICE", "127.0.0.1:9091")
            .await
            .unwrap();
        registry.deregister("UNKNOWN", "nowhere:1").await.unwrap();

        assert!(registry.resolve_live("PRODUCT-SERVICE").await.is_empty());
        assert_eq!(registry.service_count().await, 0);
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_then_register() {
        let (_clock, registry) = registry();

        let err = registry
            .heartbeat("ORDER-SERVICE", "127.0.0.1:9092")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::LeaseNotFound { .. }));

        registry.register(lease("ORDER-SERVICE", 9092, 30)).await.unwrap();
        assert_eq!(registry.resolve_live("ORDER-SERVICE").await.len(), 1);
        registry
            .heartbeat("ORDER-SERVICE", "127.0.0.1:9092")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_register_replaces_existing_record() {
        let (clock, registry) = registry();
        registry
            .register(lease("ORDER-SERVICE", 9092, 30).with_metadata("version", "1"))
            .await
            .unwrap();
        registry
            .update_status("ORDER-SERVICE", "127.0.0.1:9092", LeaseStatus::Down)
            .await
            .unwrap();
        assert!(registry.resolve_live("ORDER-SERVICE").await.is_empty());

        clock.advance(Duration::seconds(10));
        registry
            .register(lease("ORDER-SERVICE", 9092, 30).with_metadata("version", "2"))
            .await
            .unwrap();

        let live = registry.resolve_live("ORDER-SERVICE").await;
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].metadata.get("version").map(String::as_str), Some("2"));
        assert_eq!(live[0].registered_at, clock.now());
        assert_eq!(registry.lease_count().await, 1);
    }

    #[tokio::test]
    async fn test_service_names_are_case_insensitive() {
        let (_clock, registry) = registry();
        registry.register(lease("order-service", 9092, 30)).await.unwrap();

        assert_eq!(registry.resolve_live("ORDER-SERVICE").await.len(), 1);
        assert_eq!(registry.resolve_live("Order-Service").await.len(), 1);
        registry
            .heartbeat("order-SERVICE", "127.0.0.1:9092")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_register_rejects_invalid_lease() {
        let (_clock, registry) = registry();
        let err = registry
            .register(lease("ORDER-SERVICE", 9092, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidRegistration(_)));

        let err = registry
            .register(lease("ORDER-SERVICE", 9092, 30).with_instance_id(""))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidRegistration(_)));
    }

    #[tokio::test]
    async fn test_register_rejects_oversized_ttl() {
        let (_clock, registry) = registry();
        let err = registry
            .register(lease("ORDER-SERVICE", 9092, 10_000_000_000_000_000))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidRegistration(_)));
        assert_eq!(registry.lease_count().await, 0);

        registry
            .register(lease("ORDER-SERVICE", 9092, MAX_TTL_SECONDS))
            .await
            .unwrap();
        assert_eq!(registry.resolve_live("ORDER-SERVICE").await.len(), 1);
        registry.heartbeat("ORDER-SERVICE", "127.0.0.1:9092").await.unwrap();
        assert_eq!(registry.sweep_expired().await, 0);
        assert_eq!(registry.list_services().await.len(), 1);
    }

    #[tokio::test]
    async fn test_update_status_unknown_lease() {
        let (_clock, registry) = registry();
        let err = registry
            .update_status("ORDER-SERVICE", "127.0.0.1:9092", LeaseStatus::Down)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired() {
        let (clock, registry) = registry();
        registry.register(lease("ORDER-SERVICE", 9092, 30)).await.unwrap();
        registry.register(lease("PRODUCT-SERVICE", 9091, 120)).await.unwrap();

        clock.advance(Duration::seconds(60));
        assert_eq!(registry.sweep_expired().await, 1);
        assert_eq!(registry.service_count().await, 1);
        assert_eq!(registry.resolve_live("PRODUCT-SERVICE").await.len(), 1);
    }

    #[tokio::test]
    async fn test_list_services_flags_expired() {
        let (clock, registry) = registry();
        registry.register(lease("ORDER-SERVICE", 9092, 30)).await.unwrap();
        registry.register(lease("ORDER-SERVICE", 9093, 120)).await.unwrap();
        clock.advance(Duration::seconds(45));

        let services = registry.list_services().await;
        let orders = &services["ORDER-SERVICE"];
        assert_eq!(orders.len(), 2);
        assert!(!orders[0].is_live);
        assert!(orders[1].is_live);
    }

    #[tokio::test]
    async fn test_register_heartbeat_resolve_deregister_scenario() {
        let (clock, registry) = registry();
        let a = lease("PRODUCT-SERVICE", 9091, 90);
        registry.register(a.clone()).await.unwrap();

        clock.advance(Duration::seconds(30));
        registry
            .heartbeat("PRODUCT-SERVICE", &a.instance_id)
            .await
            .unwrap();

        let live = registry.resolve_live("PRODUCT-SERVICE").await;
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].instance_id, a.instance_id);
        assert_eq!(live[0].address, a.address);

        registry
            .deregister("PRODUCT-SERVICE", &a.instance_id)
            .await
            .unwrap();
        assert!(registry.resolve_live("PRODUCT-SERVICE").await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_resolve_never_sees_torn_lease() {
        let registry = Arc::new(ServiceRegistry::new());
        registry.register(lease("ORDER-SERVICE", 9092, 60)).await.unwrap();

        let writer = {
            let registry = registry.clone();
            tokio::spawn(async move {
                for round in 0..200u32 {
                    let version = round.to_string();
                    let lease = lease("ORDER-SERVICE", 9092, 60)
                        .with_metadata("version", version.clone())
                        .with_metadata("mirror", version);
                    registry.register(lease).await.unwrap();
                    registry
                        .heartbeat("ORDER-SERVICE", "127.0.0.1:9092")
                        .await
                        .unwrap();
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    for _ in 0..200 {
                        for lease in registry.resolve_live("ORDER-SERVICE").await {
                            assert_eq!(lease.address.port, 9092);
                            assert_eq!(lease.metadata.get("version"), lease.metadata.get("mirror"));
                            assert!(lease.last_renewed_at >= lease.registered_at);
                        }
                    }
                })
            })
            .collect();

        writer.await.unwrap();
        for result in futures::future::join_all(readers).await {
            result.unwrap();
        }
        assert_eq!(registry.resolve_live("ORDER-SERVICE").await.len(), 1);
    }
}
