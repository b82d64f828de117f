//! HTTP client for a remote registry

use async_trait::async_trait;
use registry_core::{
    CoreError, Lease, LeaseStatus, RegistryApi, Result, StatusUpdate, SERVICES_PATH,
};
use reqwest::{Response, StatusCode};
use std::time::Duration;
use tracing::debug;

/// RegistryClient talks to a registry-server over its JSON API.
///
/// Every call is bounded by the timeout given at construction.
#[derive(Clone)]
pub struct RegistryClient {
    http: reqwest::Client,
    base_url: String,
}

impl RegistryClient {
    /// Create a client for the registry at `base_url` (e.g. `http://127.0.0.1:8761`)
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(transport)?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn instances_url(&self, service_name: &str) -> String {
        format!(
            "{}{}/{}/instances",
            self.base_url,
            SERVICES_PATH,
            urlencoding::encode(service_name)
        )
    }

    fn instance_url(&self, service_name: &str, instance_id: &str) -> String {
        format!(
            "{}/{}",
            self.instances_url(service_name),
            urlencoding::encode(instance_id)
        )
    }

    /// Map a response to `Ok`, `LeaseNotFound` or a transport error
    fn expect_success(response: Response, service_name: &str, instance_id: &str) -> Result<Response> {
        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::NOT_FOUND => Err(CoreError::lease_not_found(service_name, instance_id)),
            status => Err(CoreError::Transport(format!(
                "registry responded with {} for {}",
                status,
                response.url()
            ))),
        }
    }
}

fn transport(err: reqwest::Error) -> CoreError {
    CoreError::Transport(err.to_string())
}

#[async_trait]
impl RegistryApi for RegistryClient {
    async fn register(&self, lease: Lease) -> Result<()> {
        let url = self.instances_url(&lease.service_name);
        debug!("Registering {}/{} at {}", lease.service_name, lease.instance_id, url);

        let response = self
            .http
            .post(&url)
            .json(&lease)
            .send()
            .await
            .map_err(transport)?;
        Self::expect_success(response, &lease.service_name, &lease.instance_id)?;
        Ok(())
    }

    async fn heartbeat(&self, service_name: &str, instance_id: &str) -> Result<()> {
        let url = format!("{}/heartbeat", self.instance_url(service_name, instance_id));
        let response = self.http.put(&url).send().await.map_err(transport)?;
        Self::expect_success(response, service_name, instance_id)?;
        Ok(())
    }

    async fn deregister(&self, service_name: &str, instance_id: &str) -> Result<()> {
        let url = self.instance_url(service_name, instance_id);
        let response = self.http.delete(&url).send().await.map_err(transport)?;
        match Self::expect_success(response, service_name, instance_id) {
            Ok(_) | Err(CoreError::LeaseNotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn resolve_live(&self, service_name: &str) -> Result<Vec<Lease>> {
        let url = self.instances_url(service_name);
        let response = self.http.get(&url).send().await.map_err(transport)?;
        let response = match Self::expect_success(response, service_name, "*") {
            Ok(response) => response,
            // An unknown service simply has no live instances
            Err(CoreError::LeaseNotFound { .. }) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let leases: Vec<Lease> = response.json().await.map_err(transport)?;
        debug!("Resolved {} live instance(s) of {}", leases.len(), service_name);
        Ok(leases)
    }

    async fn update_status(
        &self,
        service_name: &str,
        instance_id: &str,
        status: LeaseStatus,
    ) -> Result<()> {
        let url = format!("{}/status", self.instance_url(service_name, instance_id));
        let response = self
            .http
            .put(&url)
            .json(&StatusUpdate { status })
            .send()
            .await
            .map_err(transport)?;
        Self::expect_success(response, service_name, instance_id)?;
        Ok(())
    }
}
