//! Front-door pipeline: CORS, route, resolve through the registry, forward, relay

use crate::config::GatewayConfig;
use crate::cors::{CorsDecision, CorsPolicy};
use crate::forwarder::{ForwardError, RequestForwarder};
use crate::http::{
    bad_gateway_response, empty_response, error_response, gateway_timeout_response,
    not_found_response, service_error_response, service_unavailable_response, text_response,
    HttpResponse,
};
use crate::load_balancer::LoadBalancer;
use crate::metrics::{MetricsCollector, MetricsMiddleware, UpstreamOutcome, UNRESOLVED_SERVICE_LABEL};
use crate::middleware::{LoggingMiddleware, MiddlewareChain, MiddlewareContext};
use crate::policy::RetryPolicy;
use crate::rules::{RouteMatch, RouteTable};
use crate::trace_context::{TraceContextMiddleware, OUTGOING_TRACEPARENT};
use http_body_util::Full;
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::{Method, Request, StatusCode};
use registry_core::{Lease, RegistryApi};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const HEALTH_PATH: &str = "/healthz";
pub const METRICS_PATH: &str = "/metrics";

pub struct Gateway {
    routes: RouteTable,
    cors: Option<CorsPolicy>,
    registry: Arc<dyn RegistryApi>,
    balancer: LoadBalancer,
    forwarder: RequestForwarder,
    retry: RetryPolicy,
    resolve_timeout: Duration,
    middleware: MiddlewareChain,
    metrics: MetricsCollector,
}

impl Gateway {
    /// Build a gateway resolving services through `registry`
    pub fn from_config(config: &GatewayConfig, registry: Arc<dyn RegistryApi>) -> anyhow::Result<Self> {
        let metrics = MetricsCollector::new()?;
        let middleware = MiddlewareChain::new()
            .add(TraceContextMiddleware::default())
            .add(LoggingMiddleware)
            .add(MetricsMiddleware::new(metrics.clone()));

        let routes = config.route_table()?;
        info!(
            "Gateway configured with {} routes (discovery locator: {}, max retries: {})",
            routes.rules().len(),
            config.discovery_locator,
            config.retry.max_retries
        );

        Ok(Self {
            routes,
            cors: config.cors.as_ref().map(CorsPolicy::new),
            registry,
            balancer: LoadBalancer::new(config.load_balancing),
            forwarder: RequestForwarder::new(
                config.timeouts.request_timeout(),
                config.timeouts.connect_timeout(),
            ),
            retry: config.retry.clone(),
            resolve_timeout: config.timeouts.resolve_timeout(),
            middleware,
            metrics,
        })
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Handle one client request. Never fails; every outcome is a response.
    pub async fn handle<B>(&self, req: Request<B>) -> HttpResponse
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let context = MiddlewareContext::from_request(&req);
        if let Err(e) = self.middleware.on_request(&context).await {
            warn!("Request middleware failed: {}", e);
        }

        let response = self.dispatch(req, &context).await;

        if let Err(e) = self
            .middleware
            .on_response(&context, response.status().as_u16())
            .await
        {
            warn!("Response middleware failed: {}", e);
        }
        response
    }

    async fn dispatch<B>(&self, req: Request<B>, context: &MiddlewareContext) -> HttpResponse
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        if req.method() == Method::GET {
            match req.uri().path() {
                HEALTH_PATH => return text_response(StatusCode::OK, "ok\n"),
                METRICS_PATH => return self.metrics_response(),
                _ => {}
            }
        }

        let allowed_origin = match &self.cors {
            None => None,
            Some(policy) => match policy.evaluate(req.method(), req.headers()) {
                CorsDecision::NotCrossOrigin => None,
                CorsDecision::Allowed(origin) => Some(origin),
                CorsDecision::Preflight(origin) => {
                    let mut response = empty_response(StatusCode::NO_CONTENT);
                    policy.apply_preflight_headers(response.headers_mut(), &origin, req.headers());
                    return response;
                }
                CorsDecision::Rejected(reason) => {
                    debug!("CORS rejected {} {}: {}", req.method(), req.uri().path(), reason);
                    return error_response(StatusCode::FORBIDDEN, "cors_rejected", reason);
                }
            },
        };

        let mut response = self.route_and_forward(req, context).await;
        if let (Some(policy), Some(origin)) = (&self.cors, &allowed_origin) {
            policy.apply_response_headers(response.headers_mut(), origin);
        }
        response
    }

    async fn route_and_forward<B>(&self, req: Request<B>, context: &MiddlewareContext) -> HttpResponse
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let Some(route) = self.routes.route(req.uri().path()) else {
            return not_found_response(req.uri().path());
        };
        context.set_metadata("service", route.service.clone());

        // Locator routes take the name from the client's path; keep it out of
        // metric labels until the registry confirms the service exists
        let unresolved_label = if route.is_discovery() {
            UNRESOLVED_SERVICE_LABEL
        } else {
            route.service.as_str()
        };

        let instances = match self.resolve(&route.service).await {
            Ok(instances) => instances,
            Err(reason) => {
                warn!("Could not resolve {}: {}", route.service, reason);
                self.metrics
                    .record_upstream(unresolved_label, UpstreamOutcome::RegistryUnavailable);
                self.report_error(context, &reason).await;
                return service_error_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "registry_unavailable",
                    &route.service,
                    "service registry is unreachable",
                );
            }
        };

        if instances.is_empty() {
            debug!("No live instance of {}", route.service);
            self.metrics
                .record_upstream(unresolved_label, UpstreamOutcome::NoInstance);
            self.report_error(context, "no live instance").await;
            return service_unavailable_response(&route.service);
        }

        let (mut parts, body) = req.into_parts();
        let body = match RequestForwarder::collect_body(body).await {
            Ok(body) => body,
            Err(e) => {
                debug!("Failed to read request body: {}", e);
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "bad_request",
                    "failed to read request body",
                );
            }
        };

        if let Some(traceparent) = context.get_metadata(OUTGOING_TRACEPARENT) {
            if let Ok(value) = HeaderValue::from_str(&traceparent) {
                parts
                    .headers
                    .insert(HeaderName::from_static(OUTGOING_TRACEPARENT), value);
            }
        }

        let path_and_query = match parts.uri.query() {
            Some(query) => format!("{}?{}", route.upstream_path, query),
            None => route.upstream_path.clone(),
        };

        match self
            .forward_with_retry(&route, &instances, &path_and_query, &parts.method, &parts.headers, body)
            .await
        {
            Ok(upstream) => {
                self.metrics
                    .record_upstream(&route.service, UpstreamOutcome::Forwarded);
                upstream.map(Full::new)
            }
            Err(ForwardError::Timeout(after)) => {
                warn!("{} timed out after {:?}", route.service, after);
                self.metrics
                    .record_upstream(&route.service, UpstreamOutcome::UpstreamTimeout);
                self.report_error(context, "upstream timeout").await;
                gateway_timeout_response(&route.service)
            }
            Err(e) => {
                warn!("Forwarding to {} failed: {}", route.service, e);
                self.metrics
                    .record_upstream(&route.service, UpstreamOutcome::UpstreamError);
                self.report_error(context, &e.to_string()).await;
                bad_gateway_response(&route.service)
            }
        }
    }

    async fn resolve(&self, service: &str) -> Result<Vec<Lease>, String> {
        match tokio::time::timeout(self.resolve_timeout, self.registry.resolve_live(service)).await {
            Ok(Ok(instances)) => Ok(instances),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("resolve timed out after {:?}", self.resolve_timeout)),
        }
    }

    /// Try instances in balancer order. Only connect failures move on to
    /// another instance, and each instance is tried at most once.
    async fn forward_with_retry(
        &self,
        route: &RouteMatch,
        instances: &[Lease],
        path_and_query: &str,
        method: &Method,
        headers: &hyper::header::HeaderMap,
        body: Bytes,
    ) -> Result<hyper::Response<Bytes>, ForwardError> {
        let mut tried = HashSet::new();
        let mut attempt = 0;
        let mut last_error = None;

        loop {
            attempt += 1;
            let Some(instance) = self.balancer.select(instances, &tried) else {
                return Err(last_error.unwrap_or_else(|| {
                    ForwardError::Connect(format!("no instance of {} left to try", route.service))
                }));
            };

            let target = format!("{}{}", instance.address.http_base(), path_and_query);
            debug!(
                "Routing {} via {} to {} (attempt {})",
                path_and_query, route.route, target, attempt
            );

            match self.forwarder.forward(&target, method, headers, body.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && self.retry.should_retry(attempt) => {
                    warn!(
                        "Instance {} of {} unreachable, trying another: {}",
                        instance.instance_id, route.service, e
                    );
                    tried.insert(instance.instance_id.clone());
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn metrics_response(&self) -> HttpResponse {
        match self.metrics.gather() {
            Ok(text) => {
                let mut response = text_response(StatusCode::OK, text);
                response.headers_mut().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; version=0.0.4"),
                );
                response
            }
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

    async fn report_error(&self, context: &MiddlewareContext, error: &str) {
        if let Err(e) = self.middleware.on_error(context, error).await {
            warn!("Error middleware failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{json_response, ErrorBody};
    use crate::server::serve;
    use async_trait::async_trait;
    use http_body_util::BodyExt;
    use hyper::body::Incoming;
    use hyper::header::{
        ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_REQUEST_METHOD,
        ORIGIN,
    };
    use registry_core::{CoreError, InstanceAddress, LeaseStatus, ServiceRegistry};
    use serde_json::Value;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    /// In-process registry that counts resolutions and can be made unreachable
    struct CountingRegistry {
        inner: ServiceRegistry,
        resolves: AtomicUsize,
        unreachable: bool,
    }

    impl CountingRegistry {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: ServiceRegistry::new(),
                resolves: AtomicUsize::new(0),
                unreachable: false,
            })
        }

        fn unreachable() -> Arc<Self> {
            Arc::new(Self {
                inner: ServiceRegistry::new(),
                resolves: AtomicUsize::new(0),
                unreachable: true,
            })
        }

        async fn add(&self, service: &str, addr: SocketAddr) {
            let lease = Lease::new(service, InstanceAddress::new("127.0.0.1", addr.port()), 90);
            self.inner.register(lease).await.unwrap();
        }

        fn resolves(&self) -> usize {
            self.resolves.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RegistryApi for CountingRegistry {
        async fn register(&self, lease: Lease) -> registry_core::Result<()> {
            self.inner.register(lease).await
        }

        async fn heartbeat(&self, service: &str, id: &str) -> registry_core::Result<()> {
            self.inner.heartbeat(service, id).await
        }

        async fn deregister(&self, service: &str, id: &str) -> registry_core::Result<()> {
            self.inner.deregister(service, id).await
        }

        async fn resolve_live(&self, service: &str) -> registry_core::Result<Vec<Lease>> {
            self.resolves.fetch_add(1, Ordering::SeqCst);
            if self.unreachable {
                return Err(CoreError::Transport("connection refused".to_string()));
            }
            Ok(self.inner.resolve_live(service).await)
        }

        async fn update_status(
            &self,
            service: &str,
            id: &str,
            status: LeaseStatus,
        ) -> registry_core::Result<()> {
            self.inner.update_status(service, id, status).await
        }
    }

    /// Backend echoing what it received as JSON
    async fn spawn_backend(name: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handler = move |req: Request<Incoming>| async move {
            let method = req.method().to_string();
            let uri = req.uri().to_string();
            let traceparent = req
                .headers()
                .get("traceparent")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let host = req
                .headers()
                .get("host")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = RequestForwarder::collect_body(req.into_body())
                .await
                .unwrap_or_default();
            let mut response = json_response(
                StatusCode::OK,
                &serde_json::json!({
                    "backend": name,
                    "method": method,
                    "uri": uri,
                    "host": host,
                    "traceparent": traceparent,
                    "body": String::from_utf8_lossy(&body),
                }),
            );
            response
                .headers_mut()
                .insert("x-backend", HeaderValue::from_static(name));
            response
        };
        tokio::spawn(serve(
            listener,
            handler,
            std::future::pending::<()>(),
            Duration::from_secs(1),
        ));
        addr
    }

    /// Backend with a fixed response body
    async fn spawn_fixed_backend(body: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(
            listener,
            move |_req: Request<Incoming>| async move {
                let mut response = text_response(StatusCode::CREATED, body);
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                response
            },
            std::future::pending::<()>(),
            Duration::from_secs(1),
        ));
        addr
    }

    /// Address with nothing listening on it
    async fn closed_port() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    fn gateway(yaml: &str, registry: Arc<CountingRegistry>) -> Gateway {
        let config = GatewayConfig::from_yaml(yaml).unwrap();
        Gateway::from_config(&config, registry).unwrap()
    }

    const ORDERS: &str = r#"
routes:
  - path_pattern: /api/orders/**
    target_service: ORDER-SERVICE
    path_rewrite: { strip_prefix: 1 }
"#;

    const ORDERS_WITH_CORS: &str = r#"
routes:
  - path_pattern: /api/orders/**
    target_service: ORDER-SERVICE
    path_rewrite: { strip_prefix: 1 }
cors:
  allowed_origins: [http://localhost:3000]
  allowed_methods: [GET, POST]
  allowed_headers: [content-type]
"#;

    fn request(method: Method, uri: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    async fn body_bytes(response: HttpResponse) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    async fn body_json(response: HttpResponse) -> Value {
        serde_json::from_slice(&body_bytes(response).await).unwrap()
    }

    #[tokio::test]
    async fn test_relays_upstream_response_verbatim() {
        let registry = CountingRegistry::new();
        let addr = spawn_fixed_backend(r#"{"id":"o101","total":42}"#).await;
        registry.add("ORDER-SERVICE", addr).await;
        let gateway = gateway(ORDERS, registry.clone());

        let response = gateway.handle(request(Method::GET, "/api/orders/o101")).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
        assert_eq!(
            body_bytes(response).await,
            Bytes::from_static(br#"{"id":"o101","total":42}"#)
        );
        assert_eq!(registry.resolves(), 1);
    }

    #[tokio::test]
    async fn test_rewrites_path_and_forwards_method_query_body() {
        let registry = CountingRegistry::new();
        registry.add("ORDER-SERVICE", spawn_backend("a").await).await;
        let gateway = gateway(ORDERS, registry);

        let req = Request::builder()
            .method(Method::POST)
            .uri("/api/orders/o101?expand=items")
            .header("host", "gateway.example")
            .header("connection", "keep-alive")
            .body(Full::new(Bytes::from_static(b"{\"qty\":2}")))
            .unwrap();
        let response = gateway.handle(req).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-backend"], "a");

        let echoed = body_json(response).await;
        assert_eq!(echoed["method"], "POST");
        assert_eq!(echoed["uri"], "/orders/o101?expand=items");
        assert_eq!(echoed["body"], "{\"qty\":2}");
        assert_ne!(echoed["host"], "gateway.example");
    }

    #[tokio::test]
    async fn test_propagates_traceparent() {
        let registry = CountingRegistry::new();
        registry.add("ORDER-SERVICE", spawn_backend("a").await).await;
        let gateway = gateway(ORDERS, registry);

        let incoming = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";
        let req = Request::builder()
            .uri("/api/orders/1")
            .header("traceparent", incoming)
            .body(Full::new(Bytes::new()))
            .unwrap();
        let echoed = body_json(gateway.handle(req).await).await;
        let forwarded = echoed["traceparent"].as_str().unwrap();
        assert!(forwarded.starts_with("00-4bf92f3577b34da6a3ce929d0e0e4736-"));
        assert_ne!(forwarded, incoming);

        let echoed = body_json(gateway.handle(request(Method::GET, "/api/orders/1")).await).await;
        assert!(echoed["traceparent"].as_str().unwrap().starts_with("00-"));
    }

    #[tokio::test]
    async fn test_no_live_instance_is_503() {
        let registry = CountingRegistry::new();
        let gateway = gateway(ORDERS, registry.clone());

        let response = gateway.handle(request(Method::GET, "/api/orders/o101")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: ErrorBody = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(body.error, "service_unavailable");
        assert_eq!(body.status, 503);
        assert_eq!(body.service.as_deref(), Some("ORDER-SERVICE"));
        assert_eq!(registry.resolves(), 1);
    }

    #[tokio::test]
    async fn test_registry_unreachable_is_503() {
        let registry = CountingRegistry::unreachable();
        let gateway = gateway(ORDERS, registry);

        let response = gateway.handle(request(Method::GET, "/api/orders/o101")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(response).await["error"], "registry_unavailable");
    }

    #[tokio::test]
    async fn test_unmatched_path_is_404_without_resolve() {
        let registry = CountingRegistry::new();
        let gateway = gateway(ORDERS, registry.clone());

        let response = gateway.handle(request(Method::GET, "/api/customers/1")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(registry.resolves(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_instance_is_502() {
        let registry = CountingRegistry::new();
        registry.add("ORDER-SERVICE", closed_port().await).await;
        let gateway = gateway(ORDERS, registry);

        let response = gateway.handle(request(Method::GET, "/api/orders/1")).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(body_json(response).await["error"], "bad_gateway");
    }

    #[tokio::test]
    async fn test_silent_instance_is_504() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let registry = CountingRegistry::new();
        registry.add("ORDER-SERVICE", listener.local_addr().unwrap()).await;
        let yaml = format!("timeouts: {{ request_timeout_secs: 1 }}\n{}", ORDERS);
        let gateway = gateway(&yaml, registry);

        let response = gateway.handle(request(Method::GET, "/api/orders/1")).await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        drop(listener);
    }

    #[tokio::test]
    async fn test_retries_connect_failure_on_another_instance() {
        let registry = CountingRegistry::new();
        registry.add("ORDER-SERVICE", closed_port().await).await;
        registry.add("ORDER-SERVICE", spawn_backend("live").await).await;
        let yaml = format!("retry: {{ max_retries: 1 }}\n{}", ORDERS);
        let gateway = gateway(&yaml, registry);

        // Round robin starts at both instances across these requests
        for _ in 0..4 {
            let response = gateway.handle(request(Method::GET, "/api/orders/1")).await;
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()["x-backend"], "live");
        }
    }

    #[tokio::test]
    async fn test_without_retry_connect_failure_surfaces() {
        let registry = CountingRegistry::new();
        registry.add("ORDER-SERVICE", closed_port().await).await;
        registry.add("ORDER-SERVICE", spawn_backend("live").await).await;
        let gateway = gateway(ORDERS, registry);

        let mut statuses = Vec::new();
        for _ in 0..2 {
            statuses.push(gateway.handle(request(Method::GET, "/api/orders/1")).await.status());
        }
        statuses.sort();
        assert_eq!(statuses, vec![StatusCode::OK, StatusCode::BAD_GATEWAY]);
    }

    #[tokio::test]
    async fn test_round_robin_alternates_instances() {
        let registry = CountingRegistry::new();
        registry.add("ORDER-SERVICE", spawn_backend("a").await).await;
        registry.add("ORDER-SERVICE", spawn_backend("b").await).await;
        let gateway = gateway(ORDERS, registry);

        let mut seen = HashSet::new();
        for _ in 0..2 {
            let response = gateway.handle(request(Method::GET, "/api/orders/1")).await;
            seen.insert(response.headers()["x-backend"].to_str().unwrap().to_string());
        }
        assert_eq!(seen.len(), 2);
    }

    #[tokio::test]
    async fn test_cors_rejects_before_resolve() {
        let registry = CountingRegistry::new();
        registry.add("ORDER-SERVICE", spawn_backend("a").await).await;
        let gateway = gateway(ORDERS_WITH_CORS, registry.clone());

        let req = Request::builder()
            .uri("/api/orders/1")
            .header(ORIGIN, "http://evil.example")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = gateway.handle(req).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_json(response).await["error"], "cors_rejected");
        assert_eq!(registry.resolves(), 0);
    }

    #[tokio::test]
    async fn test_cors_allowed_origin_is_decorated() {
        let registry = CountingRegistry::new();
        registry.add("ORDER-SERVICE", spawn_backend("a").await).await;
        let gateway = gateway(ORDERS_WITH_CORS, registry);

        let req = Request::builder()
            .uri("/api/orders/1")
            .header(ORIGIN, "http://localhost:3000")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = gateway.handle(req).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN],
            "http://localhost:3000"
        );
    }

    #[tokio::test]
    async fn test_cors_preflight_answered_locally() {
        let registry = CountingRegistry::new();
        let gateway = gateway(ORDERS_WITH_CORS, registry.clone());

        let req = Request::builder()
            .method(Method::OPTIONS)
            .uri("/api/orders/1")
            .header(ORIGIN, "http://localhost:3000")
            .header(ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = gateway.handle(req).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN],
            "http://localhost:3000"
        );
        assert!(response.headers().contains_key(ACCESS_CONTROL_ALLOW_METHODS));
        assert_eq!(registry.resolves(), 0);

        let req = Request::builder()
            .method(Method::OPTIONS)
            .uri("/api/orders/1")
            .header(ORIGIN, "http://localhost:3000")
            .header(ACCESS_CONTROL_REQUEST_METHOD, "DELETE")
            .body(Full::new(Bytes::new()))
            .unwrap();
        assert_eq!(gateway.handle(req).await.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_discovery_locator_fallback() {
        let registry = CountingRegistry::new();
        registry.add("ORDER-SERVICE", spawn_backend("a").await).await;
        registry.add("INVENTORY", spawn_backend("inv").await).await;
        let yaml = format!("discovery_locator: true\n{}", ORDERS);
        let gateway = gateway(&yaml, registry);

        let echoed = body_json(gateway.handle(request(Method::GET, "/inventory/items/7")).await).await;
        assert_eq!(echoed["backend"], "inv");
        assert_eq!(echoed["uri"], "/items/7");

        // explicit rules still win
        let echoed = body_json(gateway.handle(request(Method::GET, "/api/orders/9")).await).await;
        assert_eq!(echoed["backend"], "a");
        assert_eq!(echoed["uri"], "/orders/9");
    }

    #[tokio::test]
    async fn test_local_endpoints_are_not_routed() {
        let registry = CountingRegistry::new();
        let yaml = "discovery_locator: true\n";
        let gateway = gateway(yaml, registry.clone());

        let response = gateway.handle(request(Method::GET, "/healthz")).await;
        assert_eq!(response.status(), StatusCode::OK);

        gateway.handle(request(Method::GET, "/orders/1")).await;
        let response = gateway.handle(request(Method::GET, "/metrics")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let text = String::from_utf8(body_bytes(response).await.to_vec()).unwrap();
        assert!(text.contains("gateway_upstream_requests_total"));
        assert!(text.contains("outcome=\"no_instance\""));

        assert_eq!(registry.resolves(), 1);
    }

    async fn metrics_text(gateway: &Gateway) -> String {
        let response = gateway.handle(request(Method::GET, "/metrics")).await;
        String::from_utf8(body_bytes(response).await.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_discovery_services_share_one_metric_label() {
        let registry = CountingRegistry::new();
        registry.add("INVENTORY", spawn_backend("inv").await).await;
        let yaml = format!("discovery_locator: true\n{}", ORDERS);
        let gateway = gateway(&yaml, registry);

        for i in 0..20 {
            let uri = format!("/junk{}/x", i);
            let response = gateway.handle(request(Method::GET, &uri)).await;
            assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        }
        gateway.handle(request(Method::GET, "/api/orders/1")).await;
        gateway.handle(request(Method::GET, "/inventory/items")).await;

        let text = metrics_text(&gateway).await;
        assert!(!text.contains("JUNK"));
        let unknown = text
            .lines()
            .filter(|l| l.starts_with("gateway_upstream_requests_total") && l.contains("service=\"unknown\""))
            .collect::<Vec<_>>();
        assert_eq!(unknown.len(), 1);
        assert!(unknown[0].ends_with(" 20"));

        // configured routes and resolved locator routes keep their names
        assert!(text.contains("service=\"ORDER-SERVICE\""));
        assert!(text.contains("service=\"INVENTORY\""));
    }

    #[tokio::test]
    async fn test_unreachable_registry_on_locator_route_uses_fixed_label() {
        let yaml = "discovery_locator: true\n";
        let gateway = gateway(yaml, CountingRegistry::unreachable());

        for uri in ["/a/1", "/b/2", "/c/3"] {
            let response = gateway.handle(request(Method::GET, uri)).await;
            assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        }

        let text = metrics_text(&gateway).await;
        assert!(text.contains("outcome=\"registry_unavailable\""));
        assert!(!text.contains("service=\"A\""));
        assert!(text.contains("service=\"unknown\""));
    }

    #[tokio::test]
    async fn test_forwards_to_ipv6_instance() {
        // Hosts without IPv6 loopback cannot run this
        let Ok(listener) = TcpListener::bind("[::1]:0").await else {
            return;
        };
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(serve(
            listener,
            |_req: Request<Incoming>| async { text_response(StatusCode::OK, "v6") },
            std::future::pending::<()>(),
            Duration::from_secs(1),
        ));

        let registry = CountingRegistry::new();
        let lease = Lease::new("ORDER-SERVICE", InstanceAddress::new("::1", port), 90);
        registry.register(lease).await.unwrap();
        let gateway = gateway(ORDERS, registry);

        let response = gateway.handle(request(Method::GET, "/api/orders/1")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, Bytes::from_static(b"v6"));
    }
}
