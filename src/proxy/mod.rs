use axum::{
    body::Body,
    http::{
        header::{self, HeaderName},
        HeaderMap, Method, Response, Uri,
    },
};
use tracing::{debug, error, info};
use url::Url;

use crate::{config::AppConfig, error::AppError};

mod client;
mod relay;

pub use client::build_client;
pub use relay::Relay;

/// Inbound headers that are copied onto the upstream request. Everything else
/// is dropped.
pub const FORWARDED_HEADERS: [HeaderName; 4] = [
    header::USER_AGENT,
    header::ACCEPT,
    header::ACCEPT_ENCODING,
    header::ACCEPT_LANGUAGE,
];

/// Relays GET requests to the object-storage origin.
pub struct OssProxy {
    client: reqwest::Client,
    base_url: String,
}

impl OssProxy {
    pub fn new(config: &AppConfig) -> reqwest::Result<Self> {
        Ok(Self {
            client: build_client(config)?,
            base_url: config.base_url.clone(),
        })
    }

    /// Issues exactly one upstream request for `uri` and hands back a response
    /// whose status, headers and body mirror the origin's.
    pub async fn forward(
        &self,
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
    ) -> Result<Response<Body>, AppError> {
        if method != Method::GET {
            debug!(method = %method, path = %uri.path(), "Rejecting non-GET request");
            return Err(AppError::MethodNotAllowed);
        }

        let path = uri.path();
        let url = upstream_url(&self.base_url, path).inspect_err(|e| {
            error!("Failed to build OSS request: {}", e);
        })?;

        info!(path = path, upstream = %url, "Proxying request");

        let upstream = self
            .client
            .get(url.clone())
            .headers(forwarded_headers(headers))
            .send()
            .await
            .inspect_err(|e| {
                error!(
                    path = path,
                    upstream = %url,
                    timeout = e.is_timeout(),
                    connect = e.is_connect(),
                    "OSS request failed: {:?}",
                    e
                );
            })?;

        let status = upstream.status();
        let mut response = Response::new(Body::empty());
        *response.status_mut() = status;

        // Append rather than insert so repeated headers keep every value.
        let relayed = response.headers_mut();
        for (name, value) in upstream.headers() {
            relayed.append(name.clone(), value.clone());
        }

        let expected = upstream.content_length();
        *response.body_mut() =
            Body::from_stream(Relay::new(upstream.bytes_stream(), path, status, expected));
        Ok(response)
    }
}

/// Joins the origin with the raw inbound path. The query string is not carried
/// over.
fn upstream_url(base_url: &str, path: &str) -> Result<Url, AppError> {
    let joined = format!("{}{}", base_url.trim_end_matches('/'), path);
    Url::parse(&joined).map_err(|source| AppError::InvalidUpstreamUrl {
        url: joined,
        source,
    })
}

/// Picks the allow-listed headers that carry a non-empty value. Only the first
/// value of each is kept.
fn forwarded_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut outbound = HeaderMap::with_capacity(FORWARDED_HEADERS.len());
    for name in FORWARDED_HEADERS {
        if let Some(value) = inbound.get(&name).filter(|v| !v.is_empty()) {
            outbound.insert(name, value.clone());
        }
    }
    outbound
}
