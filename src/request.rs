//! Normalized request model and stream head construction.

use std::fmt;
use std::io;
use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;
use http::header::HOST;
use http::{HeaderMap, Method};
use url::Url;

use crate::endpoint::EndpointKey;
use crate::transport::{BoxedTransport, HeaderList};

/// Lazily produced request body.
pub type BodyStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Request body, one handling path per variant.
#[derive(Default)]
pub enum RequestBody {
    /// No body; the stream is opened with end-of-stream set.
    #[default]
    Empty,
    /// Fixed buffer written once.
    Full(Bytes),
    /// Byte stream piped chunk by chunk.
    Streaming(BodyStream),
}

impl RequestBody {
    /// Wrap a byte stream.
    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        Self::Streaming(Box::pin(stream))
    }

    /// True only for [`RequestBody::Empty`].
    ///
    /// A zero-length `Full` buffer still sends one empty DATA frame.
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Full(bytes) => f.debug_tuple("Full").field(&bytes.len()).finish(),
            Self::Streaming(_) => f.write_str("Streaming(..)"),
        }
    }
}

impl From<Bytes> for RequestBody {
    fn from(bytes: Bytes) -> Self {
        Self::Full(bytes)
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Full(Bytes::from(bytes))
    }
}

impl From<String> for RequestBody {
    fn from(text: String) -> Self {
        Self::Full(Bytes::from(text))
    }
}

impl From<&'static str> for RequestBody {
    fn from(text: &'static str) -> Self {
        Self::Full(Bytes::from_static(text.as_bytes()))
    }
}

/// A request ready to be dispatched onto a session.
pub struct PendingRequest {
    pub method: Method,
    /// Pathname, query and fragment.
    pub path: String,
    pub headers: HeaderMap,
    pub body: RequestBody,
    /// Pre-established transport to connect over instead of dialing.
    pub socket: Option<BoxedTransport>,
}

impl PendingRequest {
    /// Create a bodiless request for `path`.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
            socket: None,
        }
    }

    /// Create a request targeting the path of `url`.
    pub fn from_url(method: Method, url: &Url) -> Self {
        Self::new(method, resolve_path(url))
    }

    /// Replace the headers.
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Set the body.
    pub fn body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = body.into();
        self
    }

    /// Offer a pre-established transport.
    pub fn socket(mut self, socket: BoxedTransport) -> Self {
        self.socket = Some(socket);
        self
    }

    /// Split into the stream head, body and any leftover transport.
    pub(crate) fn into_stream_parts(
        self,
        endpoint: &EndpointKey,
    ) -> (StreamHead, RequestBody, Option<BoxedTransport>) {
        let head = StreamHead::build(self.method, endpoint, self.path, self.headers);
        (head, self.body, self.socket)
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .field("socket", &self.socket.is_some())
            .finish()
    }
}

/// `pathname + search + fragment`, pathname defaulting to `/`.
pub fn resolve_path(url: &Url) -> String {
    let mut path = match url.path() {
        "" => "/".to_string(),
        p => p.to_string(),
    };
    if let Some(query) = url.query().filter(|q| !q.is_empty()) {
        path.push('?');
        path.push_str(query);
    }
    if let Some(fragment) = url.fragment().filter(|f| !f.is_empty()) {
        path.push('#');
        path.push_str(fragment);
    }
    path
}

/// Opening HEADERS of a stream: pseudo-headers plus regular headers.
#[derive(Debug, Clone)]
pub struct StreamHead {
    pub method: Method,
    pub scheme: String,
    pub authority: String,
    pub path: String,
    /// Regular headers; never contains `host`.
    pub headers: HeaderMap,
}

impl StreamHead {
    /// Build the head, moving a `host` header into `:authority`.
    pub fn build(
        method: Method,
        endpoint: &EndpointKey,
        path: impl Into<String>,
        mut headers: HeaderMap,
    ) -> Self {
        let authority = match headers.remove(HOST) {
            Some(host) => String::from_utf8_lossy(host.as_bytes()).into_owned(),
            None => endpoint.authority(),
        };
        let path = path.into();
        Self {
            method,
            scheme: endpoint.scheme.clone(),
            authority,
            path: if path.is_empty() { "/".to_string() } else { path },
            headers,
        }
    }

    /// Flatten to the on-wire order: `:method, :scheme, :authority, :path`, then headers.
    pub fn header_list(&self) -> HeaderList {
        let mut list = Vec::with_capacity(self.headers.len() + 4);
        list.push((":method".to_string(), self.method.as_str().to_string()));
        list.push((":scheme".to_string(), self.scheme.clone()));
        list.push((":authority".to_string(), self.authority.clone()));
        list.push((":path".to_string(), self.path.clone()));
        for (name, value) in self.headers.iter() {
            list.push((
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            ));
        }
        list
    }
}
