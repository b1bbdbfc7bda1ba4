use axum::{
    extract::State,
    http::{HeaderMap, Method, Uri},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{Local, SecondsFormat};
use serde::Serialize;
use std::sync::Arc;

use crate::proxy::OssProxy;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub timestamp: String,
}

/// Liveness check. Never touches the origin.
pub async fn health_check() -> impl IntoResponse {
    Json(HealthStatus {
        status: "ok",
        timestamp: Local::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    })
}

pub async fn proxy_request(
    State(proxy): State<Arc<OssProxy>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    match proxy.forward(&method, &uri, &headers).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}
