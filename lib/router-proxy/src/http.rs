//! Response builders shared by the gateway, the registry server and backends

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::Serialize;
use tracing::warn;

/// Body type of every response produced in this workspace
pub type HttpResponse = Response<Full<Bytes>>;

/// Structured error body; never carries internal state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
}

/// Response with the given status and an empty body
pub fn empty_response(status: StatusCode) -> HttpResponse {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

/// Plain text response
pub fn text_response(status: StatusCode, body: impl Into<Bytes>) -> HttpResponse {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// JSON response; serialization failures degrade to a 500
pub fn json_response<T: Serialize>(status: StatusCode, value: &T) -> HttpResponse {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            warn!("Failed to serialize response body: {}", e);
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error\n")
        }
    }
}

/// Structured error response
pub fn error_response(status: StatusCode, error: &str, message: impl Into<String>) -> HttpResponse {
    json_response(
        status,
        &ErrorBody {
            error: error.to_string(),
            message: message.into(),
            status: status.as_u16(),
            service: None,
        },
    )
}

/// Structured error response naming the logical service involved
pub fn service_error_response(
    status: StatusCode,
    error: &str,
    service: &str,
    message: impl Into<String>,
) -> HttpResponse {
    json_response(
        status,
        &ErrorBody {
            error: error.to_string(),
            message: message.into(),
            status: status.as_u16(),
            service: Some(service.to_string()),
        },
    )
}

/// 404 for paths no route or handler claims
pub fn not_found_response(path: &str) -> HttpResponse {
    error_response(
        StatusCode::NOT_FOUND,
        "not_found",
        format!("no route matches {}", path),
    )
}

/// 503 when a service has no live instance
pub fn service_unavailable_response(service: &str) -> HttpResponse {
    service_error_response(
        StatusCode::SERVICE_UNAVAILABLE,
        "service_unavailable",
        service,
        format!("no live instance of {}", service),
    )
}

/// 502 when the selected instance could not be reached
pub fn bad_gateway_response(service: &str) -> HttpResponse {
    service_error_response(
        StatusCode::BAD_GATEWAY,
        "bad_gateway",
        service,
        format!("error communicating with {}", service),
    )
}

/// 504 when the selected instance did not answer in time
pub fn gateway_timeout_response(service: &str) -> HttpResponse {
    service_error_response(
        StatusCode::GATEWAY_TIMEOUT,
        "gateway_timeout",
        service,
        format!("{} did not respond in time", service),
    )
}

/// 405 for a known path with an unsupported method
pub fn method_not_allowed_response() -> HttpResponse {
    error_response(
        StatusCode::METHOD_NOT_ALLOWED,
        "method_not_allowed",
        "method not allowed",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_of(response: HttpResponse) -> ErrorBody {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_service_unavailable_body() {
        let response = service_unavailable_response("ORDER-SERVICE");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");

        let body = body_of(response).await;
        assert_eq!(body.error, "service_unavailable");
        assert_eq!(body.status, 503);
        assert_eq!(body.service.as_deref(), Some("ORDER-SERVICE"));
    }

    #[tokio::test]
    async fn test_not_found_omits_service() {
        let response = not_found_response("/nowhere");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_of(response).await;
        assert_eq!(body.service, None);
        assert!(body.message.contains("/nowhere"));
    }

    #[test]
    fn test_gateway_failure_statuses() {
        assert_eq!(bad_gateway_response("A").status(), StatusCode::BAD_GATEWAY);
        assert_eq!(gateway_timeout_response("A").status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(empty_response(StatusCode::NO_CONTENT).status(), StatusCode::NO_CONTENT);
    }
}
