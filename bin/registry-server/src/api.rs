//! HTTP surface of the registry

use crate::metrics::RegistryMetrics;
use hyper::body::{Body, Bytes};
use hyper::{Method, Request, StatusCode};
use registry_core::{normalize_service_name, CoreError, Lease, ServiceRegistry, StatusUpdate};
use router_proxy::forwarder::RequestForwarder;
use router_proxy::http::{
    empty_response, error_response, json_response, method_not_allowed_response,
    not_found_response, text_response, HttpResponse,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct RegistryHttpApi {
    registry: Arc<ServiceRegistry>,
    metrics: RegistryMetrics,
}

impl RegistryHttpApi {
    pub fn new(registry: Arc<ServiceRegistry>, metrics: RegistryMetrics) -> Self {
        Self { registry, metrics }
    }

    pub async fn handle<B>(&self, req: Request<B>) -> HttpResponse
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let segments = match decode_segments(&path) {
            Some(segments) => segments,
            None => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "bad_request",
                    "path is not valid percent-encoded UTF-8",
                )
            }
        };
        let segments: Vec<&str> = segments.iter().map(String::as_str).collect();

        let response = match segments.as_slice() {
            ["healthz"] => match method {
                Method::GET => text_response(StatusCode::OK, "ok\n"),
                _ => method_not_allowed_response(),
            },
            ["metrics"] => match method {
                Method::GET => self.metrics_response().await,
                _ => method_not_allowed_response(),
            },
            ["v1", "services"] => match method {
                Method::GET => json_response(StatusCode::OK, &self.registry.list_services().await),
                _ => method_not_allowed_response(),
            },
            ["v1", "services", service, "instances"] => match method {
                Method::GET => self.resolve(service).await,
                Method::POST => match read_body(req).await {
                    Ok(body) => self.register(service, &body).await,
                    Err(response) => response,
                },
                _ => method_not_allowed_response(),
            },
            ["v1", "services", service, "instances", instance] => match method {
                Method::DELETE => self.deregister(service, instance).await,
                _ => method_not_allowed_response(),
            },
            ["v1", "services", service, "instances", instance, "heartbeat"] => match method {
                Method::PUT => self.heartbeat(service, instance).await,
                _ => method_not_allowed_response(),
            },
            ["v1", "services", service, "instances", instance, "status"] => match method {
                Method::PUT => match read_body(req).await {
                    Ok(body) => self.update_status(service, instance, &body).await,
                    Err(response) => response,
                },
                _ => method_not_allowed_response(),
            },
            _ => not_found_response(&path),
        };

        debug!("{} {} -> {}", method, path, response.status());
        response
    }

    async fn register(&self, service: &str, body: &[u8]) -> HttpResponse {
        let lease: Lease = match serde_json::from_slice(body) {
            Ok(lease) => lease,
            Err(e) => {
                self.metrics.record("register", "invalid");
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "bad_request",
                    format!("malformed lease: {}", e),
                );
            }
        };

        if normalize_service_name(&lease.service_name) != normalize_service_name(service) {
            self.metrics.record("register", "invalid");
            return error_response(
                StatusCode::BAD_REQUEST,
                "bad_request",
                format!(
                    "lease is for {} but was posted to {}",
                    lease.service_name, service
                ),
            );
        }

        let (service_name, instance_id) = (lease.service_name.clone(), lease.instance_id.clone());
        match self.registry.register(lease).await {
            Ok(()) => {
                info!("Registered {}/{}", normalize_service_name(&service_name), instance_id);
                self.metrics.record("register", "ok");
                empty_response(StatusCode::NO_CONTENT)
            }
            Err(e) => self.failure("register", e),
        }
    }

    async fn heartbeat(&self, service: &str, instance: &str) -> HttpResponse {
        match self.registry.heartbeat(service, instance).await {
            Ok(()) => {
                self.metrics.record("heartbeat", "ok");
                empty_response(StatusCode::NO_CONTENT)
            }
            Err(e) => self.failure("heartbeat", e),
        }
    }

    async fn deregister(&self, service: &str, instance: &str) -> HttpResponse {
        match self.registry.deregister(service, instance).await {
            Ok(()) => {
                info!("Deregistered {}/{}", normalize_service_name(service), instance);
                self.metrics.record("deregister", "ok");
                empty_response(StatusCode::NO_CONTENT)
            }
            Err(e) => self.failure("deregister", e),
        }
    }

    async fn resolve(&self, service: &str) -> HttpResponse {
        let leases = self.registry.resolve_live(service).await;
        self.metrics.record("resolve", "ok");
        json_response(StatusCode::OK, &leases)
    }

    async fn update_status(&self, service: &str, instance: &str, body: &[u8]) -> HttpResponse {
        let update: StatusUpdate = match serde_json::from_slice(body) {
            Ok(update) => update,
            Err(e) => {
                self.metrics.record("status", "invalid");
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "bad_request",
                    format!("malformed status update: {}", e),
                );
            }
        };

        match self.registry.update_status(service, instance, update.status).await {
            Ok(()) => {
                info!(
                    "Status of {}/{} set to {}",
                    normalize_service_name(service),
                    instance,
                    update.status
                );
                self.metrics.record("status", "ok");
                empty_response(StatusCode::NO_CONTENT)
            }
            Err(e) => self.failure("status", e),
        }
    }

    fn failure(&self, operation: &str, error: CoreError) -> HttpResponse {
        match error {
            CoreError::LeaseNotFound { .. } => {
                self.metrics.record(operation, "not_found");
                error_response(StatusCode::NOT_FOUND, "lease_not_found", error.to_string())
            }
            CoreError::InvalidRegistration(_) => {
                self.metrics.record(operation, "invalid");
                error_response(StatusCode::BAD_REQUEST, "bad_request", error.to_string())
            }
            other => {
                warn!("{} failed: {}", operation, other);
                self.metrics.record(operation, "error");
                error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "registry operation failed",
                )
            }
        }
    }

    async fn metrics_response(&self) -> HttpResponse {
        self.metrics
            .leases
            .set(self.registry.lease_count().await as i64);
        self.metrics
            .services
            .set(self.registry.service_count().await as i64);

        match self.metrics.gather() {
            Ok(text) => text_response(StatusCode::OK, text),
            Err(e) => {
                warn!("Failed to gather metrics: {}", e);
                error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "failed to gather metrics",
                )
            }
        }
    }
}

/// Split a request path into percent-decoded segments
fn decode_segments(path: &str) -> Option<Vec<String>> {
    path.trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| urlencoding::decode(s).ok().map(|d| d.into_owned()))
        .collect()
}

async fn read_body<B>(req: Request<B>) -> Result<Bytes, HttpResponse>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    RequestForwarder::collect_body(req.into_body())
        .await
        .map_err(|e| {
            debug!("Failed to read request body: {}", e);
            error_response(
                StatusCode::BAD_REQUEST,
                "bad_request",
                "failed to read request body",
            )
        })
}
