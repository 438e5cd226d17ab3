//! Client façade: request normalization on top of the session cache.
//!
//! ```rust,ignore
//! use muxreq::Client;
//!
//! let client = Client::builder().build()?;
//! let response = client
//!     .get("http://svc:8080/items?page=2")
//!     .header("accept", "application/json")
//!     .send()
//!     .await?;
//! let body = response.text().await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use tokio::time::timeout as tokio_timeout;
use url::Url;

use crate::abort::AbortSignal;
use crate::config::{CacheConfig, Http2Settings};
use crate::dispatch;
use crate::endpoint::EndpointKey;
use crate::error::{Error, Result};
use crate::pool::SessionCache;
use crate::request::{PendingRequest, RequestBody};
use crate::response::Response;
use crate::transport::{BoxedTransport, ConnectOptions, H2Engine, ProtocolEngine};

/// Multiplexing HTTP/2 client. Clones share one session cache.
#[derive(Clone)]
pub struct Client {
    cache: SessionCache,
}

/// Builder for HTTP requests.
pub struct RequestBuilder<'a> {
    client: &'a Client,
    url: String,
    method: Method,
    headers: HeaderMap,
    body: RequestBody,
    socket: Option<BoxedTransport>,
    signal: Option<AbortSignal>,
    error: Option<Error>,
}

/// Builder for creating clients.
pub struct ClientBuilder {
    engine: Option<Arc<dyn ProtocolEngine>>,
    config: CacheConfig,
    http2_settings: Option<Http2Settings>,
}

impl Client {
    /// Create a new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Create a GET request builder.
    pub fn get(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::GET, url)
    }

    /// Create a POST request builder.
    pub fn post(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::POST, url)
    }

    /// Create a custom method request builder.
    pub fn request(&self, method: Method, url: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder {
            client: self,
            url: url.into(),
            method,
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
            socket: None,
            signal: None,
            error: None,
        }
    }

    /// Dispatch an already normalized request to the endpoint of `url`.
    ///
    /// A socket on the request is used only if a new session must be dialed.
    pub async fn execute(
        &self,
        url: &Url,
        mut request: PendingRequest,
        signal: Option<&AbortSignal>,
    ) -> Result<Response> {
        let key = EndpointKey::from_url(url)?;
        let options = match request.socket.take() {
            Some(transport) => ConnectOptions::with_transport(transport),
            None => ConnectOptions::new(),
        };

        let dispatch = dispatch::send_cached(&self.cache, &key, options, request, signal);

        match self.cache.config().ttfb_timeout {
            Some(limit) => tokio_timeout(limit, dispatch)
                .await
                .unwrap_or(Err(Error::TtfbTimeout(limit))),
            None => dispatch.await,
        }
    }

    /// The session cache backing this client.
    pub fn cache(&self) -> &SessionCache {
        &self.cache
    }

    /// Gracefully close every session.
    pub fn shutdown(&self) {
        self.cache.close_all();
    }
}

impl<'a> RequestBuilder<'a> {
    /// Add a header to the request.
    ///
    /// An invalid name or value fails the request on `send`.
    pub fn header(mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        let key = key.as_ref();
        let parsed = HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| Error::invalid_request(format!("Invalid header name '{}': {}", key, e)))
            .and_then(|name| {
                HeaderValue::from_str(value.as_ref())
                    .map(|value| (name, value))
                    .map_err(|e| Error::invalid_request(format!("Invalid value for '{}': {}", key, e)))
            });
        match parsed {
            Ok((name, value)) => {
                self.headers.append(name, value);
            }
            Err(e) => {
                self.error.get_or_insert(e);
            }
        }
        self
    }

    /// Set all headers (replaces existing headers).
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Set the request body.
    pub fn body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = body.into();
        self
    }

    /// Offer a pre-established transport for a new session.
    pub fn socket(mut self, socket: BoxedTransport) -> Self {
        self.socket = Some(socket);
        self
    }

    /// Cancel the request when `signal` fires.
    pub fn signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Send the request and return the response.
    pub async fn send(self) -> Result<Response> {
        if let Some(e) = self.error {
            return Err(e);
        }

        let url = Url::parse(&self.url)?;
        let mut request = PendingRequest::from_url(self.method, &url)
            .headers(self.headers)
            .body(self.body);
        request.socket = self.socket;

        self.client.execute(&url, request, self.signal.as_ref()).await
    }
}

impl ClientBuilder {
    /// Create a new client builder with default settings.
    pub fn new() -> Self {
        Self {
            engine: None,
            config: CacheConfig::default(),
            http2_settings: None,
        }
    }

    /// Use a custom protocol engine instead of [`H2Engine`].
    pub fn engine(mut self, engine: impl ProtocolEngine) -> Self {
        self.engine = Some(Arc::new(engine));
        self
    }

    /// Replace the whole cache configuration.
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Set idle session timeout.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.idle_timeout(timeout);
        self
    }

    /// Set connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.connect_timeout(timeout);
        self
    }

    /// Set time-to-first-byte timeout.
    pub fn ttfb_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.ttfb_timeout(timeout);
        self
    }

    /// Set HTTP/2 settings for the default engine.
    pub fn http2_settings(mut self, settings: Http2Settings) -> Self {
        self.http2_settings = Some(settings);
        self
    }

    /// Build the client.
    pub fn build(self) -> Result<Client> {
        let engine = match (self.engine, self.http2_settings) {
            (Some(_), Some(_)) => {
                return Err(Error::invalid_request(
                    "http2_settings only apply to the default engine",
                ))
            }
            (Some(engine), None) => engine,
            (None, settings) => Arc::new(H2Engine::new(settings.unwrap_or_default())),
        };

        Ok(Client {
            cache: SessionCache::with_engine(engine, self.config),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let client = Client::builder().build().unwrap();
        let config = client.cache().config();
        assert_eq!(config.idle_timeout, Some(CacheConfig::DEFAULT_IDLE_TIMEOUT));
        assert_eq!(config.ttfb_timeout, None);
        assert!(client.cache().is_empty());
    }

    #[test]
    fn test_engine_with_settings_rejected() {
        let result = Client::builder()
            .engine(H2Engine::default())
            .http2_settings(Http2Settings::default())
            .build();
        assert!(matches!(result, Err(Error::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_invalid_header_fails_on_send() {
        let client = Client::builder().build().unwrap();
        let err = client
            .get("http://svc/")
            .header("bad header", "x")
            .send()
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidRequest(_)));
        assert!(client.cache().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_url_fails_on_send() {
        let client = Client::builder().build().unwrap();
        let err = client.get("not a url").send().await.err().unwrap();
        assert!(matches!(err, Error::UrlParse(_)));
    }
}
