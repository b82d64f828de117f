//! In-memory JSON item store served under `/{resource}`

use hyper::body::{Body, Bytes};
use hyper::{Method, Request, StatusCode};
use router_proxy::forwarder::RequestForwarder;
use router_proxy::http::{
    empty_response, error_response, json_response, method_not_allowed_response,
    not_found_response, HttpResponse,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

pub struct ItemStore {
    service_name: String,
    resource: String,
    items: RwLock<BTreeMap<String, Value>>,
    next_id: AtomicU64,
}

impl ItemStore {
    pub fn new(service_name: &str, resource: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            resource: resource.trim_matches('/').to_string(),
            items: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn handle<B>(&self, req: Request<B>) -> HttpResponse
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        match segments.as_slice() {
            ["health"] => match method {
                Method::GET => json_response(
                    StatusCode::OK,
                    &serde_json::json!({ "status": "UP", "service": self.service_name }),
                ),
                _ => method_not_allowed_response(),
            },
            [resource] if *resource == self.resource => match method {
                Method::GET => self.list().await,
                Method::POST => match read_json(req).await {
                    Ok(value) => self.create(value).await,
                    Err(response) => response,
                },
                _ => method_not_allowed_response(),
            },
            [resource, id] if *resource == self.resource => match method {
                Method::GET => self.get(id).await,
                Method::PUT => match read_json(req).await {
                    Ok(value) => self.put(id, value).await,
                    Err(response) => response,
                },
                Method::DELETE => self.delete(id).await,
                _ => method_not_allowed_response(),
            },
            _ => not_found_response(&path),
        }
    }

    async fn list(&self) -> HttpResponse {
        let items = self.items.read().await;
        let listed: Vec<Value> = items
            .iter()
            .map(|(id, item)| serde_json::json!({ "id": id, "item": item }))
            .collect();
        json_response(StatusCode::OK, &listed)
    }

    async fn create(&self, value: Value) -> HttpResponse {
        let mut items = self.items.write().await;
        let id = match value.get("id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => id.to_string(),
            // Skip numbers a client already used as explicit ids
            _ => loop {
                let candidate = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
                if !items.contains_key(&candidate) {
                    break candidate;
                }
            },
        };

        if items.contains_key(&id) {
            return error_response(
                StatusCode::CONFLICT,
                "conflict",
                format!("{} {} already exists", self.resource, id),
            );
        }
        items.insert(id.clone(), value.clone());
        debug!("Created {} {}", self.resource, id);
        json_response(StatusCode::CREATED, &serde_json::json!({ "id": id, "item": value }))
    }

    async fn get(&self, id: &str) -> HttpResponse {
        match self.items.read().await.get(id) {
            Some(item) => json_response(StatusCode::OK, item),
            None => self.missing(id),
        }
    }

    async fn put(&self, id: &str, value: Value) -> HttpResponse {
        let previous = self.items.write().await.insert(id.to_string(), value.clone());
        let status = if previous.is_some() {
            StatusCode::OK
        } else {
            StatusCode::CREATED
        };
        json_response(status, &value)
    }

    async fn delete(&self, id: &str) -> HttpResponse {
        match self.items.write().await.remove(id) {
            Some(_) => empty_response(StatusCode::NO_CONTENT),
            None => self.missing(id),
        }
    }

    fn missing(&self, id: &str) -> HttpResponse {
        error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("{} {} does not exist", self.resource, id),
        )
    }
}

async fn read_json<B>(req: Request<B>) -> Result<Value, HttpResponse>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let body = RequestForwarder::collect_body(req.into_body())
        .await
        .map_err(|_| {
            error_response(StatusCode::BAD_REQUEST, "bad_request", "failed to read request body")
        })?;
    serde_json::from_slice(&body).map_err(|e| {
        error_response(
            StatusCode::BAD_REQUEST,
            "bad_request",
            format!("body is not valid JSON: {}", e),
        )
    })
}
