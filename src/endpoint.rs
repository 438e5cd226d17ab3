//! Endpoint identity used as the session cache key.

use std::fmt;

use url::Url;

use crate::error::{Error, Result};

/// Identifies a unique scheme/host/port destination.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct EndpointKey {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl EndpointKey {
    /// Create a new endpoint key. Scheme and host are lowercased.
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: scheme.into().to_ascii_lowercase(),
            host: host.into().to_ascii_lowercase(),
            port,
        }
    }

    /// Derive the key for a request URL.
    ///
    /// Explicit default ports and omitted ports produce the same key.
    pub fn from_url(url: &Url) -> Result<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| Error::invalid_request(format!("URL has no host: {}", url)))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::invalid_request(format!("URL has no port: {}", url)))?;
        Ok(Self::new(url.scheme(), host, port))
    }

    /// True for `https`.
    pub fn is_https(&self) -> bool {
        self.scheme == "https"
    }

    /// `host:port`, as sent in `:authority`.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `scheme://host:port`.
    pub fn origin(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}
