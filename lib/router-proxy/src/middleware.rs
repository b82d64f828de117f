//! Middleware framework for extensible request/response processing

use anyhow::Result;
use hyper::header::HeaderMap;
use hyper::{Method, Request, Uri};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, span, Instrument, Level};

/// Context passed through middleware chain
#[derive(Clone)]
pub struct MiddlewareContext {
    /// Request path
    pub path: String,
    /// Request method
    pub method: String,
    /// Request headers (lower-case names, first value only)
    pub request_headers: HashMap<String, String>,
    /// When the gateway started handling the request
    pub started_at: Instant,
    /// Custom metadata for middleware
    pub metadata: Arc<Mutex<HashMap<String, String>>>,
}

impl MiddlewareContext {
    /// Create a new middleware context from request parts
    pub fn new(method: &Method, uri: &Uri, headers: &HeaderMap) -> Self {
        let mut request_headers = HashMap::new();
        for (k, v) in headers {
            if let Ok(v_str) = v.to_str() {
                request_headers
                    .entry(k.to_string())
                    .or_insert_with(|| v_str.to_string());
            }
        }

        Self {
            path: uri.path().to_string(),
            method: method.to_string(),
            request_headers,
            started_at: Instant::now(),
            metadata: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Create a new middleware context from a request
    pub fn from_request<B>(req: &Request<B>) -> Self {
        Self::new(req.method(), req.uri(), req.headers())
    }

    /// Get a metadata value
    pub fn get_metadata(&self, key: &str) -> Option<String> {
        self.metadata
            .lock()
            .ok()
            .and_then(|m| m.get(key).cloned())
    }

    /// Set a metadata value
    pub fn set_metadata(&self, key: &str, value: String) {
        if let Ok(mut m) = self.metadata.lock() {
            m.insert(key.to_string(), value);
        }
    }

    /// Milliseconds since the request was received
    pub fn elapsed_ms(&self) -> u128 {
        self.started_at.elapsed().as_millis()
    }
}

/// Middleware trait for processing requests and responses
#[async_trait::async_trait]
pub trait Middleware: Send + Sync {
    /// Name used in middleware spans
    fn name(&self) -> &'static str {
        "UnnamedMiddleware"
    }

    /// Called before request is processed
    async fn on_request(&self, _context: &MiddlewareContext) -> Result<()> {
        Ok(())
    }

    /// Called once the response status is known
    async fn on_response(&self, _context: &MiddlewareContext, _status: u16) -> Result<()> {
        Ok(())
    }

    /// Called when the request could not be served by an upstream
    async fn on_error(&self, _context: &MiddlewareContext, _error: &str) -> Result<()> {
        Ok(())
    }
}

/// Chain of middleware to execute in order
pub struct MiddlewareChain {
    middleware: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    /// Create a new middleware chain
    pub fn new() -> Self {
        Self {
            middleware: Vec::new(),
        }
    }

    /// Add middleware to the chain
    pub fn add<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn len(&self) -> usize {
        self.middleware.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middleware.is_empty()
    }

    /// Process request through all middleware
    pub async fn on_request(&self, context: &MiddlewareContext) -> Result<()> {
        for mw in &self.middleware {
            let span = span!(Level::DEBUG, "middleware", name = mw.name());
            mw.on_request(context).instrument(span).await?;
        }
        Ok(())
    }

    /// Process response through all middleware (in reverse order)
    pub async fn on_response(&self, context: &MiddlewareContext, status: u16) -> Result<()> {
        for mw in self.middleware.iter().rev() {
            let span = span!(Level::DEBUG, "middleware", name = mw.name());
            mw.on_response(context, status).instrument(span).await?;
        }
        Ok(())
    }

    /// Process error through all middleware
    pub async fn on_error(&self, context: &MiddlewareContext, error: &str) -> Result<()> {
        for mw in &self.middleware {
            let span = span!(Level::DEBUG, "middleware", name = mw.name());
            mw.on_error(context, error).instrument(span).await?;
        }
        Ok(())
    }
}

impl Default for MiddlewareChain {
    fn default() -> Self {
        Self::new()
    }
}

/// Logging middleware that logs request and response info
pub struct LoggingMiddleware;

#[async_trait::async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &'static str {
        "LoggingMiddleware"
    }

    async fn on_request(&self, context: &MiddlewareContext) -> Result<()> {
        debug!(
            "Request: {} {} (headers: {})",
            context.method,
            context.path,
            context.request_headers.len()
        );
        Ok(())
    }

    async fn on_response(&self, context: &MiddlewareContext, status: u16) -> Result<()> {
        let service = context.get_metadata("service").unwrap_or_else(|| "-".to_string());
        debug!(
            "Response: {} {} -> {} via {} (duration: {}ms)",
            context.method,
            context.path,
            status,
            service,
            context.elapsed_ms()
        );
        Ok(())
    }

    async fn on_error(&self, context: &MiddlewareContext, error: &str) -> Result<()> {
        debug!("Error: {} {} - {}", context.method, context.path, error);
        Ok(())
    }
}
