//! Response adaptation: stream HEADERS in, [`Response`] out.
//!
//! The body is not buffered. [`ResponseBody`] pulls DATA from the stream as
//! it is polled, and holds the stream's [`StreamGuard`] until it is exhausted
//! or dropped.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::{HeaderMap, Version};

use crate::abort::{fired, AbortSignal};
use crate::error::{Error, Result};
use crate::pool::StreamGuard;
use crate::transport::{HeaderList, ResponseSource};

/// HTTP/2 response with a lazily read body.
pub struct Response {
    pub status: u16,
    /// Regular headers; pseudo-headers are stripped.
    pub headers: HeaderMap,
    body: ResponseBody,
}

impl Response {
    pub fn version(&self) -> Version {
        Version::HTTP_2
    }

    pub fn http_version(&self) -> &str {
        "2.0"
    }

    pub fn http_version_major(&self) -> u8 {
        2
    }

    pub fn http_version_minor(&self) -> u8 {
        0
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }

    pub fn body_mut(&mut self) -> &mut ResponseBody {
        &mut self.body
    }

    pub fn into_body(self) -> ResponseBody {
        self.body
    }

    /// Read the whole body.
    pub async fn bytes(self) -> Result<Bytes> {
        let mut body = self.body;
        let mut buf = BytesMut::new();
        while let Some(chunk) = body.chunk().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    /// Read the whole body as UTF-8.
    pub async fn text(self) -> Result<String> {
        let bytes = self.bytes().await?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::http_protocol(format!("UTF-8 decode error: {}", e)))
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("version", &self.version())
            .field("headers", &self.headers)
            .finish()
    }
}

/// Single-pass response body stream.
pub struct ResponseBody {
    inner: BoxStream<'static, Result<Bytes>>,
}

impl ResponseBody {
    /// Next chunk, or `None` at end of stream.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        self.inner.next().await.transpose()
    }
}

impl Stream for ResponseBody {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ResponseBody(..)")
    }
}

/// Build a [`Response`] from the stream's response HEADERS.
///
/// `:status` becomes the status code, other pseudo-headers are dropped.
/// The body reads from `source` and keeps `guard` alive until it ends.
pub fn adapt(
    head: HeaderList,
    source: Box<dyn ResponseSource>,
    guard: StreamGuard,
    signal: Option<AbortSignal>,
) -> Result<Response> {
    let mut status = None;
    let mut headers = HeaderMap::with_capacity(head.len());

    for (name, value) in head {
        if name == ":status" {
            let code = value
                .parse::<u16>()
                .ok()
                .filter(|code| (100..1000).contains(code))
                .ok_or_else(|| Error::http_protocol(format!("Invalid :status '{}'", value)))?;
            status = Some(code);
            continue;
        }
        if name.starts_with(':') {
            continue;
        }
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::http_protocol(format!("Invalid header name '{}': {}", name, e)))?;
        let value = HeaderValue::from_bytes(value.as_bytes())
            .map_err(|e| Error::http_protocol(format!("Invalid value for '{}': {}", name, e)))?;
        headers.append(name, value);
    }

    let status = status.ok_or_else(|| Error::http_protocol("Response missing :status"))?;

    Ok(Response {
        status,
        headers,
        body: ResponseBody {
            inner: body_stream(source, guard, signal),
        },
    })
}

struct BodyState {
    source: Box<dyn ResponseSource>,
    guard: Option<StreamGuard>,
    signal: Option<AbortSignal>,
}

impl BodyState {
    fn finish(&mut self, reset: bool) {
        if reset {
            self.source.reset();
        }
        self.guard = None;
    }
}

impl Drop for BodyState {
    fn drop(&mut self) {
        // Dropped before end of stream: the peer should stop sending.
        if self.guard.is_some() {
            self.source.reset();
        }
    }
}

enum Read {
    Aborted(crate::abort::AbortKind),
    Data(Option<Result<Bytes>>),
}

fn body_stream(
    source: Box<dyn ResponseSource>,
    guard: StreamGuard,
    signal: Option<AbortSignal>,
) -> BoxStream<'static, Result<Bytes>> {
    let state = BodyState {
        source,
        guard: Some(guard),
        signal,
    };

    stream::unfold(state, |mut state| async move {
        state.guard.as_ref()?;

        let read = tokio::select! {
            biased;
            kind = fired(state.signal.as_ref()) => Read::Aborted(kind),
            data = state.source.data() => Read::Data(data),
        };

        match read {
            Read::Data(Some(Ok(chunk))) => Some((Ok(chunk), state)),
            Read::Data(None) => {
                state.finish(false);
                None
            }
            Read::Data(Some(Err(e))) => {
                let err = match state.signal.as_ref().and_then(AbortSignal::reason) {
                    Some(kind) => Error::aborted(kind),
                    None => e,
                };
                state.finish(true);
                Some((Err(err), state))
            }
            Read::Aborted(kind) => {
                tracing::debug!("Response body aborted ({})", kind);
                state.finish(true);
                Some((Err(Error::aborted(kind)), state))
            }
        }
    })
    .fuse()
    .boxed()
}
