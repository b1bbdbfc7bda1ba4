use std::time::Duration;

use crate::config::AppConfig;

/// Builds the outbound client shared by every forwarded request.
///
/// Transparent decompression stays off so encoded bodies reach the caller
/// exactly as the origin sent them. Proxy settings from the environment are
/// ignored; the origin is always contacted directly.
pub fn build_client(config: &AppConfig) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .pool_idle_timeout(Duration::from_secs(30))
        .pool_max_idle_per_host(32)
        .tcp_keepalive(Duration::from_secs(60))
        .timeout(config.request_timeout)
        .no_gzip()
        .no_brotli()
        .no_deflate()
        .no_proxy()
        .build()
}
