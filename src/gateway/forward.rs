//! Forwarding of admitted requests to the upstream origin.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{Body, HttpBody};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Request, Response, Uri};
use reqwest::Url;
use tracing::{debug, info};

use crate::error::{GatewayError, Result};

/// Headers that describe a single connection and are not forwarded.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Hands an admitted request to the backend and returns its response.
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Forward `request`, received from `client`, upstream.
    async fn forward(&self, request: Request<Body>, client: IpAddr) -> Result<Response<Body>>;
}

/// Reverse proxy to a single fixed origin.
///
/// Method, path, query, headers and body are passed through. The upstream
/// status, headers and body are streamed back unmodified apart from
/// connection-level headers.
pub struct UpstreamProxy {
    /// HTTP client with the upstream trust root installed
    client: reqwest::Client,
    /// The origin every request is sent to
    origin: Url,
}

impl UpstreamProxy {
    /// Create a proxy to `origin`.
    ///
    /// `tls` replaces the client's trust configuration when given.
    pub fn new(
        origin: &str,
        tls: Option<rustls::ClientConfig>,
        connect_timeout: Duration,
        keepalive: Duration,
    ) -> Result<Self> {
        let origin = Url::parse(origin)
            .map_err(|e| GatewayError::Config(format!("Invalid upstream URL {}: {}", origin, e)))?;

        let mut builder = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .tcp_keepalive(keepalive)
            .redirect(reqwest::redirect::Policy::none());
        if let Some(tls) = tls {
            builder = builder.use_preconfigured_tls(tls);
        }
        let client = builder.build()?;

        info!(origin = %origin, "Upstream proxy ready");
        Ok(Self { client, origin })
    }

    /// The upstream origin.
    pub fn origin(&self) -> &Url {
        &self.origin
    }

    /// Upstream URL for an incoming request URI.
    pub fn target_url(&self, uri: &Uri) -> Url {
        target_url(&self.origin, uri)
    }
}

/// Join the origin and request paths with exactly one slash between them,
/// and merge their query strings.
fn target_url(origin: &Url, uri: &Uri) -> Url {
    let mut url = origin.clone();

    let base = origin.path().trim_end_matches('/');
    let path = uri.path().trim_start_matches('/');
    url.set_path(&format!("{}/{}", base, path));

    let query = match (origin.query().filter(|q| !q.is_empty()), uri.query()) {
        (Some(base), Some(extra)) if !extra.is_empty() => Some(format!("{}&{}", base, extra)),
        (Some(base), _) => Some(base.to_string()),
        (None, Some(extra)) if !extra.is_empty() => Some(extra.to_string()),
        _ => None,
    };
    url.set_query(query.as_deref());

    url
}

/// Drop hop-by-hop headers, including any named by `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

/// Append the client address to `X-Forwarded-For`.
fn append_forwarded_for(headers: &mut HeaderMap, client: IpAddr) {
    let name = HeaderName::from_static("x-forwarded-for");
    let value = match headers.get(&name).and_then(|v| v.to_str().ok()) {
        Some(prior) if !prior.is_empty() => format!("{}, {}", prior, client),
        _ => client.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(name, value);
    }
}

#[async_trait]
impl Forwarder for UpstreamProxy {
    async fn forward(&self, request: Request<Body>, client: IpAddr) -> Result<Response<Body>> {
        let (parts, body) = request.into_parts();
        let url = self.target_url(&parts.uri);

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);
        append_forwarded_for(&mut headers, client);

        debug!(method = %parts.method, url = %url, "Forwarding upstream");

        let mut upstream = self.client.request(parts.method, url).headers(headers);
        if body.size_hint().exact() != Some(0) {
            upstream = upstream.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }
        let upstream = upstream.send().await?;

        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        strip_hop_by_hop(&mut headers);

        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(origin: &str, uri: &str) -> String {
        target_url(&Url::parse(origin).unwrap(), &uri.parse().unwrap()).to_string()
    }

    #[test]
    fn test_target_url_joins_paths() {
        assert_eq!(url("https://dumbserver/", "/haha"), "https://dumbserver/haha");
        assert_eq!(url("https://dumbserver", "/a/b"), "https://dumbserver/a/b");
        assert_eq!(url("https://backend/api/", "/v1"), "https://backend/api/v1");
        assert_eq!(url("https://backend/api", "/"), "https://backend/api/");
    }

    #[test]
    fn test_target_url_merges_queries() {
        assert_eq!(url("https://b/", "/x?a=1"), "https://b/x?a=1");
        assert_eq!(url("https://b/?k=v", "/x"), "https://b/x?k=v");
        assert_eq!(url("https://b/?k=v", "/x?a=1"), "https://b/x?k=v&a=1");
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("close, x-private"));
        headers.insert("x-private", HeaderValue::from_static("1"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert_eq!(headers[header::CONTENT_TYPE], "text/plain");
    }

    #[test]
    fn test_append_forwarded_for() {
        let client: IpAddr = "10.0.0.9".parse().unwrap();

        let mut headers = HeaderMap::new();
        append_forwarded_for(&mut headers, client);
        assert_eq!(headers["x-forwarded-for"], "10.0.0.9");

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.1"));
        append_forwarded_for(&mut headers, client);
        assert_eq!(headers["x-forwarded-for"], "203.0.113.1, 10.0.0.9");
    }

    #[test]
    fn test_invalid_origin_rejected() {
        let result = UpstreamProxy::new(
            "not a url",
            None,
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        assert!(matches!(result, Err(GatewayError::Config(_))));
    }
}
