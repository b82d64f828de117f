//! Registry-backed HTTP gateway: routing rules, CORS, load balancing and forwarding
pub mod config;
pub mod cors;
pub mod error;
pub mod forwarder;
pub mod gateway;
pub mod http;
pub mod load_balancer;
pub mod metrics;
pub mod middleware;
pub mod policy;
pub mod rules;
pub mod server;
pub mod trace_context;

pub use config::{GatewayConfig, RouteConfig};
pub use cors::{CorsConfig, CorsDecision, CorsPolicy};
pub use error::{ProxyError, Result};
pub use forwarder::{ForwardError, RequestForwarder};
pub use gateway::Gateway;
pub use http::{ErrorBody, HttpResponse};
pub use load_balancer::{LoadBalancer, LoadBalancingStrategy};
pub use metrics::{MetricsCollector, MetricsMiddleware, UpstreamOutcome, UNRESOLVED_SERVICE_LABEL};
pub use middleware::{LoggingMiddleware, Middleware, MiddlewareChain, MiddlewareContext};
pub use policy::{RetryPolicy, TimeoutPolicy};
pub use rules::{PathPattern, PathRewrite, RouteMatch, RouteRule, RouteTable};
pub use trace_context::{TraceContextMiddleware, TraceParent};
