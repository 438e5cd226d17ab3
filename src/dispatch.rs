//! Request dispatch: one request onto one stream of a session.
//!
//! ```text
//!   usable? ──▶ await Ready ──▶ open stream ──▶ upload body (spawned)
//!                                   │
//!                                   └──▶ await response HEADERS ──▶ response::adapt
//! ```
//!
//! Every wait races the abort signal with a biased select, so a fired signal
//! wins over anything that completes at the same time.

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use tokio::task::JoinHandle;

use crate::abort::{fired, AbortSignal};
use crate::endpoint::EndpointKey;
use crate::error::{Error, Result};
use crate::pool::{Session, SessionCache};
use crate::request::{PendingRequest, RequestBody, StreamHead};
use crate::response::{self, Response};
use crate::transport::{release_transport, ConnectOptions, RequestSink};

/// Send `request` on `session` and resolve once response headers arrive.
///
/// The returned [`Response`] keeps the stream counted as open on the session
/// until its body is exhausted or dropped. A session that refuses the stream
/// (GOAWAY received, handle closed) is moved to Closing.
pub async fn send(
    session: &Arc<Session>,
    request: PendingRequest,
    signal: Option<&AbortSignal>,
) -> Result<Response> {
    let (head, body, socket) = request.into_stream_parts(session.key());
    if let Some(socket) = socket {
        release_transport(socket);
    }
    attempt(session, head, body, signal)
        .await
        .map_err(Failure::into_error)
}

/// Send `request` on the cached session for `key`.
///
/// If that session refuses the stream, nothing reached the peer, so the
/// request goes once more to the fresh session that replaces it.
pub(crate) async fn send_cached(
    cache: &SessionCache,
    key: &EndpointKey,
    options: ConnectOptions,
    request: PendingRequest,
    signal: Option<&AbortSignal>,
) -> Result<Response> {
    let session = cache.acquire(key, options);
    let (head, body, socket) = request.into_stream_parts(session.key());
    if let Some(socket) = socket {
        release_transport(socket);
    }

    match attempt(&session, head, body, signal).await {
        Ok(response) => Ok(response),
        Err(Failure::Error(e)) => Err(e),
        Err(Failure::Refused { error, head, body }) => {
            let retry = cache.acquire(key, ConnectOptions::new());
            tracing::debug!(
                "Session {}: stream refused ({}), retrying on session {}",
                session.id(),
                error,
                retry.id()
            );
            attempt(&retry, head, body, signal)
                .await
                .map_err(Failure::into_error)
        }
    }
}

/// Why an attempt produced no response.
enum Failure {
    Error(Error),
    /// The session would not open the stream; head and body were not sent.
    Refused {
        error: Error,
        head: StreamHead,
        body: RequestBody,
    },
}

impl Failure {
    fn into_error(self) -> Error {
        match self {
            Self::Error(error) | Self::Refused { error, .. } => error,
        }
    }
}

impl From<Error> for Failure {
    fn from(error: Error) -> Self {
        Self::Error(error)
    }
}

async fn attempt(
    session: &Arc<Session>,
    head: StreamHead,
    body: RequestBody,
    signal: Option<&AbortSignal>,
) -> std::result::Result<Response, Failure> {
    let state = session.state();
    if !state.is_usable() {
        return Err(Error::connection(format!(
            "session {} to {} is {}",
            session.id(),
            session.key(),
            state
        ))
        .into());
    }
    if let Some(kind) = signal.and_then(AbortSignal::reason) {
        return Err(Error::aborted(kind).into());
    }

    let guard = session.track_stream();

    let handle = tokio::select! {
        biased;
        kind = fired(signal) => return Err(Error::aborted(kind).into()),
        handle = session.ready() => handle?,
    };

    let end_of_stream = body.is_empty();
    tracing::debug!(
        "Session {}: {} {}{} (end_of_stream: {})",
        session.id(),
        head.method,
        session.key().origin(),
        head.path,
        end_of_stream
    );

    let unsent = head.clone();
    let opened = tokio::select! {
        biased;
        kind = fired(signal) => return Err(Error::aborted(kind).into()),
        opened = handle.open_stream(head, end_of_stream) => opened,
    };
    let (sink, mut source) = match opened {
        Ok(opened) => opened,
        Err(error) if error.is_connection() => {
            session.begin_close(&format!("stream refused: {}", error));
            return Err(Failure::Refused {
                error,
                head: unsent,
                body,
            });
        }
        Err(error) => return Err(error.into()),
    };

    let upload = if end_of_stream {
        Upload::none()
    } else {
        Upload::spawn(sink, body, signal.cloned())
    };

    let headers = tokio::select! {
        biased;
        kind = fired(signal) => Err(Error::aborted(kind)),
        headers = source.headers() => headers,
        err = session.closed() => Err(err),
    };

    match headers {
        Ok(head) => {
            let response = response::adapt(head, source, guard, signal.cloned())?;
            upload.detach();
            Ok(response)
        }
        Err(e) => {
            drop(upload);
            source.reset();
            let e = match signal.and_then(AbortSignal::reason) {
                Some(kind) => Error::aborted(kind),
                None => e,
            };
            tracing::debug!("Session {}: request failed before headers: {}", session.id(), e);
            Err(e.into())
        }
    }
}

/// Body upload task. Aborted on drop unless detached.
struct Upload(Option<JoinHandle<()>>);

impl Upload {
    fn none() -> Self {
        Self(None)
    }

    fn spawn(sink: Box<dyn RequestSink>, body: RequestBody, signal: Option<AbortSignal>) -> Self {
        Self(Some(tokio::spawn(upload_body(sink, body, signal))))
    }

    fn detach(mut self) {
        self.0.take();
    }
}

impl Drop for Upload {
    fn drop(&mut self) {
        if let Some(task) = self.0.take() {
            task.abort();
        }
    }
}

async fn upload_body(mut sink: Box<dyn RequestSink>, body: RequestBody, signal: Option<AbortSignal>) {
    let result = tokio::select! {
        biased;
        kind = fired(signal.as_ref()) => Err(Error::aborted(kind)),
        result = write_body(sink.as_mut(), body) => result,
    };

    if let Err(e) = result {
        if e.is_aborted() {
            tracing::debug!("Request body upload aborted: {}", e);
        } else {
            tracing::warn!("Request body upload failed: {}", e);
        }
        sink.reset();
    }
}

async fn write_body(sink: &mut dyn RequestSink, body: RequestBody) -> Result<()> {
    match body {
        RequestBody::Empty => Ok(()),
        RequestBody::Full(bytes) => sink.send_data(bytes, true).await,
        RequestBody::Streaming(mut stream) => {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                if chunk.is_empty() {
                    continue;
                }
                sink.send_data(chunk, false).await?;
            }
            sink.send_data(Bytes::new(), true).await
        }
    }
}
