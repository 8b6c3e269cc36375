//! API gateway request router: static prefix table, health-gated upstream
//! resolution, path rewriting, and HTTP proxying.
//!
//! No retries live here — idempotency is the upstream's concern. Transport
//! failures map to 502, unhealthy upstreams to 503, unknown prefixes to 404.

use std::sync::Arc;

use axum::body::{to_bytes, Body, Bytes};
use axum::extract::Request;
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tracing::{error, warn};

use crate::error::ApiError;
use crate::registry::ServiceRegistry;
use crate::util::now_ms;

/// Proxied request bodies are capped so a single client cannot buffer the
/// gateway into the ground.
const MAX_PROXY_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Prefix table, most-specific-first. Every entry maps an exact path prefix
/// to an upstream service name.
const ROUTE_TABLE: &[(&str, &str)] = &[
    ("/api/localization", "localization"),
    ("/api/slam", "localization"),
    ("/api/vio", "localization"),
    ("/api/pose", "localization"),
    ("/api/maps", "mapping"),
    ("/api/reconstruction", "mapping"),
    ("/api/multiplayer", "nakama"),
    ("/api/auth", "nakama"),
];

/// Hop-by-hop headers stripped before proxying
const HOP_BY_HOP: &[header::HeaderName] =
    &[header::HOST, header::CONTENT_LENGTH, header::CONNECTION];

pub struct RequestRouter {
    registry: Arc<ServiceRegistry>,
    client: reqwest::Client,
}

impl RequestRouter {
    pub fn new(registry: Arc<ServiceRegistry>) -> Arc<Self> {
        Arc::new(Self { registry, client: reqwest::Client::new() })
    }

    /// Which upstream owns this path, if any.
    pub fn target_service(path: &str) -> Option<&'static str> {
        ROUTE_TABLE
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix))
            .map(|(_, service)| *service)
    }

    /// Rewrite the public path into the upstream's scheme.
    pub fn rewrite_path(path: &str, service: &str) -> String {
        let rewritten = match service {
            "localization" => {
                // /api/localization/status -> /status
                // /api/slam/init -> /slam/init (and vio, pose alike)
                if let Some(rest) = path.strip_prefix("/api/localization") {
                    rest.to_string()
                } else {
                    path.strip_prefix("/api").unwrap_or(path).to_string()
                }
            }
            "nakama" => {
                // /api/multiplayer/* -> /v2/*, /api/auth/* -> /v2/account/*
                if let Some(rest) = path.strip_prefix("/api/multiplayer") {
                    format!("/v2{rest}")
                } else if let Some(rest) = path.strip_prefix("/api/auth") {
                    format!("/v2/account{rest}")
                } else {
                    path.to_string()
                }
            }
            // mapping and anything else: drop the /api prefix
            _ => path.strip_prefix("/api").unwrap_or(path).to_string(),
        };
        if rewritten.is_empty() {
            "/".to_string()
        } else {
            rewritten
        }
    }

    pub fn filter_headers(headers: &HeaderMap) -> HeaderMap {
        let mut filtered = HeaderMap::new();
        for (name, value) in headers {
            if !HOP_BY_HOP.contains(name) {
                filtered.insert(name.clone(), value.clone());
            }
        }
        filtered
    }

    /// Proxy one request to its upstream and translate the response.
    pub async fn route(&self, request: Request<Body>) -> Response {
        let method = request.method().clone();
        let path = request.uri().path().to_string();
        let query = request.uri().query().map(|q| q.to_string());
        let headers = Self::filter_headers(request.headers());

        let Some(service) = Self::target_service(&path) else {
            let body = json!({
                "error": true,
                "code": "NOT_FOUND",
                "message": format!("no service found for path: {path}"),
                "timestamp": now_ms(),
            });
            return (StatusCode::NOT_FOUND, Json(body)).into_response();
        };

        let Some(base_url) = self.registry.get_url(service).await else {
            return ApiError::UpstreamUnavailable(format!("service {service} is not available"))
                .into_response();
        };

        let body = match to_bytes(request.into_body(), MAX_PROXY_BODY_BYTES).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to read proxy request body: {e}");
                return ApiError::Validation("request body unreadable".into()).into_response();
            }
        };

        let mut target_url = format!("{base_url}{}", Self::rewrite_path(&path, service));
        if let Some(query) = query {
            target_url = format!("{target_url}?{query}");
        }

        match self.forward(method, &target_url, headers, body).await {
            Ok(response) => response,
            Err(e) => {
                // Transport failure is a 502; an unhealthy upstream would
                // have been caught above as a 503
                error!("Proxy to {target_url} failed: {e}");
                let body = json!({
                    "error": true,
                    "code": ApiError::UpstreamUnavailable(String::new()).code(),
                    "message": "backend service error",
                    "timestamp": now_ms(),
                });
                (StatusCode::BAD_GATEWAY, Json(body)).into_response()
            }
        }
    }

    async fn forward(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<Response, reqwest::Error> {
        let upstream = self
            .client
            .request(method, url)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status =
            StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        let content_type = upstream
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.contains("application/json") {
            let value: Value = upstream.json().await?;
            Ok((status, Json(value)).into_response())
        } else {
            let text = upstream.text().await?;
            Ok((status, Json(json!({ "content": text, "content_type": content_type })))
                .into_response())
        }
    }
}
