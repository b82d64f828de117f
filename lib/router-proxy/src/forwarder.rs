//! HTTP request/response forwarding to a resolved upstream instance

use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderMap, HeaderName, CONNECTION, HOST};
use hyper::{Method, Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::tokio::TokioExecutor;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout as tokio_timeout;
use tracing::debug;

/// Why a forwarded call produced no upstream response
#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("invalid upstream target {0}")]
    InvalidTarget(String),

    /// The request never reached the upstream; safe to try another instance
    #[error("upstream connection failed: {0}")]
    Connect(String),

    /// The exchange broke after the request was sent
    #[error("upstream exchange failed: {0}")]
    Upstream(String),

    #[error("upstream timed out after {0:?}")]
    Timeout(Duration),
}

impl ForwardError {
    /// Retrying against another instance cannot duplicate side effects
    pub fn is_retryable(&self) -> bool {
        matches!(self, ForwardError::Connect(_))
    }
}

/// HTTP request forwarder with connection pooling and a per-call deadline
pub struct RequestForwarder {
    client: Client<HttpConnector, Full<Bytes>>,
    timeout: Duration,
}

impl RequestForwarder {
    /// Create a forwarder whose whole exchange is bounded by `request_timeout`
    pub fn new(request_timeout: Duration, connect_timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(connect_timeout));
        connector.set_keepalive(Some(Duration::from_secs(30)));

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .build::<_, Full<Bytes>>(connector);

        Self {
            client,
            timeout: request_timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send `method target_url` with the end-to-end headers of `headers`
    /// and relay the upstream response with its body fully buffered
    pub async fn forward(
        &self,
        target_url: &str,
        method: &Method,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response<Bytes>, ForwardError> {
        let uri: Uri = target_url
            .parse()
            .map_err(|_| ForwardError::InvalidTarget(target_url.to_string()))?;

        let mut request = Request::new(Full::new(body));
        *request.method_mut() = method.clone();
        *request.uri_mut() = uri;
        *request.headers_mut() = Self::end_to_end_headers(headers);

        debug!(
            "Forwarding {} {} ({} headers, {}s timeout)",
            method,
            target_url,
            request.headers().len(),
            self.timeout.as_secs()
        );

        let exchange = async {
            let response = self.client.request(request).await.map_err(|e| {
                if e.is_connect() {
                    ForwardError::Connect(e.to_string())
                } else {
                    ForwardError::Upstream(e.to_string())
                }
            })?;

            let (mut parts, body) = response.into_parts();
            let bytes = Self::collect_body(body)
                .await
                .map_err(|e| ForwardError::Upstream(e.to_string()))?;
            parts.headers = Self::end_to_end_headers(&parts.headers);

            debug!("Upstream responded {} with {} bytes", parts.status, bytes.len());
            Ok(Response::from_parts(parts, bytes))
        };

        match tokio_timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(ForwardError::Timeout(self.timeout)),
        }
    }

    /// Collect an entire body into Bytes
    pub async fn collect_body<B>(body: B) -> anyhow::Result<Bytes>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let collected = body.collect().await.map_err(|e| {
            let err: Box<dyn std::error::Error + Send + Sync> = e.into();
            anyhow::anyhow!(err)
        })?;
        Ok(collected.to_bytes())
    }

    /// Copy headers, dropping hop-by-hop ones, any named in `Connection`, and `Host`
    pub fn end_to_end_headers(headers: &HeaderMap) -> HeaderMap {
        let connection_listed: Vec<HeaderName> = headers
            .get_all(CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .filter_map(|name| name.trim().parse::<HeaderName>().ok())
            .collect();

        let mut filtered = HeaderMap::with_capacity(headers.len());
        for (name, value) in headers {
            if Self::is_hop_by_hop_header(name.as_str())
                || name == HOST
                || connection_listed.contains(name)
            {
                continue;
            }
            filtered.append(name.clone(), value.clone());
        }
        filtered
    }

    /// Check if header is hop-by-hop (should not be forwarded)
    pub fn is_hop_by_hop_header(name: &str) -> bool {
        matches!(
            name,
            "connection"
                | "keep-alive"
                | "proxy-authenticate"
                | "proxy-authorization"
                | "proxy-connection"
                | "te"
                | "trailer"
                | "trailers"
                | "transfer-encoding"
                | "upgrade"
        )
    }
}
