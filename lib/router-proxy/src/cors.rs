//! Cross-origin allow-list enforced before any routing work

use hyper::header::{
    HeaderMap, HeaderValue, ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS,
    ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE,
    ACCESS_CONTROL_REQUEST_HEADERS, ACCESS_CONTROL_REQUEST_METHOD, ORIGIN, VARY,
};
use hyper::Method;
use serde::{Deserialize, Serialize};

/// CORS allow-list as written in the gateway config. `*` in a list allows anything.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub allow_credentials: bool,
    pub max_age_seconds: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            allowed_methods: vec![
                "GET".to_string(),
                "POST".to_string(),
                "PUT".to_string(),
                "DELETE".to_string(),
                "OPTIONS".to_string(),
            ],
            allowed_headers: vec!["*".to_string()],
            allow_credentials: false,
            max_age_seconds: 3600,
        }
    }
}

/// What the gateway should do with a request, CORS-wise
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CorsDecision {
    /// No `Origin` header; nothing to enforce
    NotCrossOrigin,
    /// Allowed; decorate the response for this origin
    Allowed(HeaderValue),
    /// Allowed preflight; answer it directly
    Preflight(HeaderValue),
    /// Refused before any forwarding
    Rejected(String),
}

/// Evaluates requests against a `CorsConfig`
#[derive(Clone, Debug)]
pub struct CorsPolicy {
    any_origin: bool,
    origins: Vec<String>,
    any_method: bool,
    methods: Vec<Method>,
    any_header: bool,
    headers: Vec<String>,
    allow_credentials: bool,
    max_age_seconds: u64,
}

impl CorsPolicy {
    pub fn new(config: &CorsConfig) -> Self {
        let has_star = |list: &[String]| list.iter().any(|v| v.trim() == "*");

        Self {
            any_origin: has_star(&config.allowed_origins),
            origins: config
                .allowed_origins
                .iter()
                .map(|o| o.trim().trim_end_matches('/').to_string())
                .collect(),
            any_method: has_star(&config.allowed_methods),
            methods: config
                .allowed_methods
                .iter()
                .filter_map(|m| m.trim().to_ascii_uppercase().parse().ok())
                .collect(),
            any_header: has_star(&config.allowed_headers),
            headers: config
                .allowed_headers
                .iter()
                .map(|h| h.trim().to_ascii_lowercase())
                .collect(),
            allow_credentials: config.allow_credentials,
            max_age_seconds: config.max_age_seconds,
        }
    }

    fn origin_allowed(&self, origin: &str) -> bool {
        self.any_origin || self.origins.iter().any(|o| o == origin)
    }

    fn method_allowed(&self, method: &Method) -> bool {
        // Preflight itself is always answered
        self.any_method || method == Method::OPTIONS || self.methods.contains(method)
    }

    fn header_allowed(&self, header: &str) -> bool {
        self.any_header || self.headers.iter().any(|h| h.eq_ignore_ascii_case(header))
    }

    /// Classify a request from its method and headers
    pub fn evaluate(&self, method: &Method, headers: &HeaderMap) -> CorsDecision {
        let Some(origin) = headers.get(ORIGIN) else {
            return CorsDecision::NotCrossOrigin;
        };
        let Ok(origin_str) = origin.to_str() else {
            return CorsDecision::Rejected("malformed Origin header".to_string());
        };

        if !self.origin_allowed(origin_str) {
            return CorsDecision::Rejected(format!("origin {} is not allowed", origin_str));
        }

        let requested_method = headers.get(ACCESS_CONTROL_REQUEST_METHOD);
        if method == Method::OPTIONS && requested_method.is_some() {
            let requested = requested_method
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<Method>().ok());
            match requested {
                Some(m) if self.method_allowed(&m) => {}
                _ => return CorsDecision::Rejected("requested method is not allowed".to_string()),
            }

            let requested_headers = headers
                .get_all(ACCESS_CONTROL_REQUEST_HEADERS)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .flat_map(|v| v.split(','))
                .map(str::trim)
                .filter(|h| !h.is_empty());
            for header in requested_headers {
                if !self.header_allowed(header) {
                    return CorsDecision::Rejected(format!("header {} is not allowed", header));
                }
            }

            return CorsDecision::Preflight(origin.clone());
        }

        if !self.method_allowed(method) {
            return CorsDecision::Rejected(format!("method {} is not allowed", method));
        }

        CorsDecision::Allowed(origin.clone())
    }

    fn allow_origin_value(&self, origin: &HeaderValue) -> HeaderValue {
        if self.any_origin && !self.allow_credentials {
            HeaderValue::from_static("*")
        } else {
            origin.clone()
        }
    }

    /// Add the headers every allowed cross-origin response carries
    pub fn apply_response_headers(&self, headers: &mut HeaderMap, origin: &HeaderValue) {
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, self.allow_origin_value(origin));
        if self.allow_credentials {
            headers.insert(
                ACCESS_CONTROL_ALLOW_CREDENTIALS,
                HeaderValue::from_static("true"),
            );
        }
        headers.append(VARY, HeaderValue::from_static("Origin"));
    }

    /// Add the headers answering a preflight request
    pub fn apply_preflight_headers(
        &self,
        headers: &mut HeaderMap,
        origin: &HeaderValue,
        request_headers: &HeaderMap,
    ) {
        self.apply_response_headers(headers, origin);

        let methods = if self.any_method {
            request_headers
                .get(ACCESS_CONTROL_REQUEST_METHOD)
                .cloned()
                .unwrap_or_else(|| HeaderValue::from_static("*"))
        } else {
            let joined = self
                .methods
                .iter()
                .map(Method::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            HeaderValue::from_str(&joined).unwrap_or_else(|_| HeaderValue::from_static("GET"))
        };
        headers.insert(ACCESS_CONTROL_ALLOW_METHODS, methods);

        let allowed_headers = if self.any_header {
            request_headers.get(ACCESS_CONTROL_REQUEST_HEADERS).cloned()
        } else if self.headers.is_empty() {
            None
        } else {
            HeaderValue::from_str(&self.headers.join(", ")).ok()
        };
        if let Some(value) = allowed_headers {
            headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, value);
        }

        if self.max_age_seconds > 0 {
            headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from(self.max_age_seconds));
        }
    }
}
