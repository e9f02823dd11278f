//! Client key extraction.

use std::net::SocketAddr;

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};

/// A key that identifies the caller a request is accounted to.
///
/// The key is opaque to the limiter. It is not authenticated, and callers
/// sharing an address (NAT, proxies) share a budget.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey(String);

impl ClientKey {
    /// Wrap an already-derived identity.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key for a peer address: the host portion, port stripped.
    pub fn from_remote_addr(addr: &SocketAddr) -> Self {
        Self(addr.ip().to_string())
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives a [`ClientKey`] from connection and request information.
pub trait KeyExtractor: Send + Sync {
    /// Extract the key for a request received from `peer`.
    fn extract(&self, peer: &SocketAddr, headers: &HeaderMap) -> ClientKey;
}

/// Which extractor the gateway uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientKeySource {
    /// The peer address of the TCP connection
    #[default]
    RemoteAddr,
    /// The first `X-Forwarded-For` entry, for gateways behind a load balancer
    ForwardedFor,
}

impl ClientKeySource {
    /// Build the extractor for this source.
    pub fn extractor(self) -> Box<dyn KeyExtractor> {
        match self {
            ClientKeySource::RemoteAddr => Box::new(RemoteAddr),
            ClientKeySource::ForwardedFor => Box::new(ForwardedFor),
        }
    }
}

/// Keys requests by the host of the connection's peer address.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoteAddr;

impl KeyExtractor for RemoteAddr {
    fn extract(&self, peer: &SocketAddr, _headers: &HeaderMap) -> ClientKey {
        ClientKey::from_remote_addr(peer)
    }
}

/// Keys requests by the left-most `X-Forwarded-For` address.
///
/// Falls back to the peer address when the header is missing or empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardedFor;

impl KeyExtractor for ForwardedFor {
    fn extract(&self, peer: &SocketAddr, headers: &HeaderMap) -> ClientKey {
        headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ClientKey::new)
            .unwrap_or_else(|| ClientKey::from_remote_addr(peer))
    }
}
