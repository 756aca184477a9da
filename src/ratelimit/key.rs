//! Client key extraction from inbound requests.

use hyper::http::request::Parts;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;

/// Key used when a request carries no usable identity at all.
pub const UNKNOWN_KEY: &str = "unknown";

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

/// Remote address of the connection a request arrived on.
///
/// Inserted into request extensions by the HTTP server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr(pub SocketAddr);

/// Derives the rate limit key for a request.
pub trait KeyExtractor: Send + Sync + 'static {
    fn extract(&self, parts: &Parts) -> String;
}

impl<F> KeyExtractor for F
where
    F: Fn(&Parts) -> String + Send + Sync + 'static,
{
    fn extract(&self, parts: &Parts) -> String {
        self(parts)
    }
}

/// Client address as reported by proxies, falling back to the peer.
///
/// Checks the first `X-Forwarded-For` hop, then `X-Real-IP`, then the
/// connection's peer IP.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealIp;

impl KeyExtractor for RealIp {
    fn extract(&self, parts: &Parts) -> String {
        forwarded_for(parts)
            .or_else(|| header_value(parts, X_REAL_IP))
            .or_else(|| peer_ip(parts))
            .unwrap_or_else(|| UNKNOWN_KEY.to_string())
    }
}

/// The connection's peer IP, ignoring forwarding headers.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerIp;

impl KeyExtractor for PeerIp {
    fn extract(&self, parts: &Parts) -> String {
        peer_ip(parts).unwrap_or_else(|| UNKNOWN_KEY.to_string())
    }
}

/// Value of a request header such as an API key; [`RealIp`] when absent.
#[derive(Debug, Clone)]
pub struct HeaderKey {
    name: String,
}

impl HeaderKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into().to_ascii_lowercase(),
        }
    }
}

impl KeyExtractor for HeaderKey {
    fn extract(&self, parts: &Parts) -> String {
        header_value(parts, &self.name).unwrap_or_else(|| RealIp.extract(parts))
    }
}

/// Configurable choice of key extractor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeySource {
    /// Proxy-aware client IP
    #[default]
    RealIp,
    /// Socket peer IP
    PeerIp,
    /// A named request header
    Header { name: String },
}

impl KeySource {
    /// Build the extractor this source describes.
    pub fn extractor(&self) -> Arc<dyn KeyExtractor> {
        match self {
            KeySource::RealIp => Arc::new(RealIp),
            KeySource::PeerIp => Arc::new(PeerIp),
            KeySource::Header { name } => Arc::new(HeaderKey::new(name.clone())),
        }
    }
}

fn header_value(parts: &Parts, name: &str) -> Option<String> {
    let value = parts.headers.get(name)?.to_str().ok()?.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn forwarded_for(parts: &Parts) -> Option<String> {
    let value = parts.headers.get(X_FORWARDED_FOR)?.to_str().ok()?;
    let first = value.split(',').next()?.trim();
    if first.is_empty() {
        None
    } else {
        Some(first.to_string())
    }
}

fn peer_ip(parts: &Parts) -> Option<String> {
    parts
        .extensions
        .get::<PeerAddr>()
        .map(|PeerAddr(addr)| addr.ip().to_string())
}
