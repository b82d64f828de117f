//! Registry operations shared by the in-process registry and remote clients

use crate::{Lease, LeaseStatus, Result};
use async_trait::async_trait;

/// The register/heartbeat/deregister/resolve contract of a service registry.
///
/// `heartbeat` and `update_status` fail with `CoreError::LeaseNotFound` when
/// the caller must register again. Every other failure is transient.
#[async_trait]
pub trait RegistryApi: Send + Sync {
    /// Insert or replace the lease for `(service_name, instance_id)`
    async fn register(&self, lease: Lease) -> Result<()>;

    /// Refresh the renewal timestamp of an existing lease
    async fn heartbeat(&self, service_name: &str, instance_id: &str) -> Result<()>;

    /// Remove a lease; removing an absent lease is not an error
    async fn deregister(&self, service_name: &str, instance_id: &str) -> Result<()>;

    /// All leases of a service that are `UP` and unexpired
    async fn resolve_live(&self, service_name: &str) -> Result<Vec<Lease>>;

    /// Override the status of an existing lease
    async fn update_status(
        &self,
        service_name: &str,
        instance_id: &str,
        status: LeaseStatus,
    ) -> Result<()>;
}

/// Root of the registry's HTTP surface
pub const SERVICES_PATH: &str = "/v1/services";

/// Body of a status override request
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StatusUpdate {
    pub status: LeaseStatus,
}
