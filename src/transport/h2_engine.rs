//! Protocol engine on the `h2` crate.
//!
//! Dials through a [`Dialer`] (plain TCP by default, speaking HTTP/2 with
//! prior knowledge) or runs over a caller-supplied transport, performs the
//! HTTP/2 handshake with the configured SETTINGS and spawns a task that
//! drives the connection and reports its end as [`ConnectionEvent`]s.

use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::poll_fn;
use h2::client::{Builder, ResponseFuture, SendRequest};
use h2::{Reason, RecvStream, SendStream};
use http::header::{CONNECTION, TE, TRANSFER_ENCODING, UPGRADE};
use http::{HeaderName, Request, Uri, Version};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout as tokio_timeout;

use crate::config::Http2Settings;
use crate::endpoint::EndpointKey;
use crate::error::{Error, Result};
use crate::request::StreamHead;
use crate::transport::{
    BoxedTransport, ConnectOptions, ConnectionEvent, ConnectionHandle, EngineConnection,
    HeaderList, ProtocolEngine, RequestSink, ResponseSource,
};

/// Headers HTTP/2 forbids on the wire (RFC 9113 Section 8.2.2).
const CONNECTION_SPECIFIC: [&str; 3] = ["keep-alive", "proxy-connection", "http2-settings"];

/// Opens the byte transport a connection runs over.
///
/// TLS is layered here: a TLS dialer returns the negotiated stream.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, endpoint: &EndpointKey) -> io::Result<BoxedTransport>;
}

/// Plain TCP dialer with `TCP_NODELAY`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, endpoint: &EndpointKey) -> io::Result<BoxedTransport> {
        let host = endpoint.host.trim_start_matches('[').trim_end_matches(']');
        let stream = TcpStream::connect((host, endpoint.port)).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// `h2`-backed [`ProtocolEngine`].
#[derive(Clone)]
pub struct H2Engine {
    settings: Http2Settings,
    dialer: Arc<dyn Dialer>,
}

impl H2Engine {
    /// Create an engine dialing plain TCP.
    pub fn new(settings: Http2Settings) -> Self {
        Self {
            settings,
            dialer: Arc::new(TcpDialer),
        }
    }

    /// Replace the dialer.
    pub fn with_dialer(mut self, dialer: impl Dialer) -> Self {
        self.dialer = Arc::new(dialer);
        self
    }

    /// Get the settings.
    pub fn settings(&self) -> &Http2Settings {
        &self.settings
    }

    fn builder(&self) -> Builder {
        let settings = &self.settings;
        let mut builder = Builder::new();
        builder
            .header_table_size(settings.header_table_size)
            .initial_window_size(settings.initial_window_size)
            .initial_connection_window_size(settings.initial_connection_window_size)
            .max_concurrent_streams(settings.max_concurrent_streams)
            .max_frame_size(settings.max_frame_size)
            .max_header_list_size(settings.max_header_list_size)
            .enable_push(settings.enable_push);
        builder
    }
}

impl Default for H2Engine {
    fn default() -> Self {
        Self::new(Http2Settings::default())
    }
}

#[async_trait]
impl ProtocolEngine for H2Engine {
    async fn connect(
        &self,
        endpoint: &EndpointKey,
        options: ConnectOptions,
    ) -> Result<EngineConnection> {
        let io = match options.transport {
            Some(transport) => {
                tracing::debug!("H2Engine: running {} over supplied transport", endpoint);
                transport
            }
            None => {
                tracing::debug!("H2Engine: dialing {}", endpoint);
                self.dialer
                    .dial(endpoint)
                    .await
                    .map_err(|e| Error::dial(format!("{}: {}", endpoint, e)))?
            }
        };

        let builder = self.builder();
        let handshake = builder.handshake::<_, Bytes>(io);
        let handshake = match self.settings.handshake_timeout {
            Some(limit) => tokio_timeout(limit, handshake).await.map_err(|_| {
                Error::dial(format!("{}: HTTP/2 handshake timed out after {:?}", endpoint, limit))
            })?,
            None => handshake.await,
        };
        let (send_request, connection) = handshake
            .map_err(|e| Error::dial(format!("{}: HTTP/2 handshake failed: {}", endpoint, e)))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let origin = endpoint.to_string();
        tokio::spawn(async move {
            match connection.await {
                Ok(()) => tracing::debug!("H2Engine: connection to {} finished", origin),
                Err(e) => {
                    tracing::error!("HTTP/2 connection error ({}): {}", origin, e);
                    let _ = events_tx.send(ConnectionEvent::Error(e.to_string()));
                }
            }
            let _ = events_tx.send(ConnectionEvent::Close);
        });

        Ok(EngineConnection {
            handle: Arc::new(H2ConnectionHandle {
                sender: Mutex::new(Some(send_request)),
            }),
            events: events_rx,
        })
    }
}

/// Open streams through a shared `SendRequest`.
///
/// Dropping the last `SendRequest` lets `h2` finish in-flight streams and
/// then close the connection, which is what [`ConnectionHandle::close`] does.
struct H2ConnectionHandle {
    sender: Mutex<Option<SendRequest<Bytes>>>,
}

#[async_trait]
impl ConnectionHandle for H2ConnectionHandle {
    async fn open_stream(
        &self,
        head: StreamHead,
        end_of_stream: bool,
    ) -> Result<(Box<dyn RequestSink>, Box<dyn ResponseSource>)> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| Error::connection("HTTP/2 connection is closing"))?;

        let mut sender = sender.ready().await.map_err(map_h2_error)?;
        let request = build_request(head)?;
        let (response, send_stream) = sender
            .send_request(request, end_of_stream)
            .map_err(map_h2_error)?;

        Ok((
            Box::new(H2RequestSink {
                stream: send_stream,
            }),
            Box::new(H2ResponseSource {
                response: Some(response),
                body: None,
            }),
        ))
    }

    fn close(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

struct H2RequestSink {
    stream: SendStream<Bytes>,
}

#[async_trait]
impl RequestSink for H2RequestSink {
    async fn send_data(&mut self, mut data: Bytes, end_of_stream: bool) -> Result<()> {
        if data.is_empty() {
            return self
                .stream
                .send_data(data, end_of_stream)
                .map_err(map_h2_error);
        }

        while !data.is_empty() {
            self.stream.reserve_capacity(data.len());
            let available = match poll_fn(|cx| self.stream.poll_capacity(cx)).await {
                Some(Ok(n)) => n,
                Some(Err(e)) => return Err(map_h2_error(e)),
                None => {
                    return Err(Error::stream(
                        "stream closed while waiting for send capacity",
                    ))
                }
            };
            if available == 0 {
                continue;
            }
            let chunk = data.split_to(available.min(data.len()));
            let last = end_of_stream && data.is_empty();
            self.stream.send_data(chunk, last).map_err(map_h2_error)?;
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.stream.send_reset(Reason::CANCEL);
    }
}

struct H2ResponseSource {
    response: Option<ResponseFuture>,
    body: Option<RecvStream>,
}

#[async_trait]
impl ResponseSource for H2ResponseSource {
    async fn headers(&mut self) -> Result<HeaderList> {
        let response = self
            .response
            .take()
            .ok_or_else(|| Error::stream("response headers already consumed"))?;
        let (parts, body) = response.await.map_err(map_h2_error)?.into_parts();

        let mut list = Vec::with_capacity(parts.headers.len() + 1);
        list.push((":status".to_string(), parts.status.as_str().to_string()));
        for (name, value) in parts.headers.iter() {
            list.push((
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            ));
        }
        self.body = Some(body);
        Ok(list)
    }

    async fn data(&mut self) -> Option<Result<Bytes>> {
        let body = self.body.as_mut()?;
        match body.data().await? {
            Ok(chunk) => {
                let _ = body.flow_control().release_capacity(chunk.len());
                Some(Ok(chunk))
            }
            Err(e) => Some(Err(map_h2_error(e))),
        }
    }

    fn reset(&mut self) {
        // Dropping every handle to an unfinished stream makes h2 send RST_STREAM(CANCEL).
        self.response = None;
        self.body = None;
    }
}

fn build_request(head: StreamHead) -> Result<Request<()>> {
    // `:path` carries no fragment (RFC 9113 Section 8.3.1).
    let target = head
        .path
        .split_once('#')
        .map_or(head.path.as_str(), |(target, _)| target);
    let target = if target.is_empty() { "/" } else { target };

    let uri = Uri::builder()
        .scheme(head.scheme.as_str())
        .authority(head.authority.as_str())
        .path_and_query(target)
        .build()
        .map_err(|e| Error::invalid_request(format!("Invalid request target: {}", e)))?;

    let mut request = Request::builder()
        .method(head.method)
        .uri(uri)
        .version(Version::HTTP_2)
        .body(())
        .map_err(|e| Error::invalid_request(format!("Failed to build request: {}", e)))?;

    let headers = request.headers_mut();
    for (name, value) in head.headers.iter() {
        if is_connection_specific(name, value.as_bytes()) {
            tracing::debug!("H2Engine: dropping connection-specific header {}", name);
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    Ok(request)
}

fn is_connection_specific(name: &HeaderName, value: &[u8]) -> bool {
    if *name == CONNECTION || *name == TRANSFER_ENCODING || *name == UPGRADE {
        return true;
    }
    if *name == TE {
        return !value.eq_ignore_ascii_case(b"trailers");
    }
    CONNECTION_SPECIFIC.contains(&name.as_str())
}

fn map_h2_error(e: h2::Error) -> Error {
    if e.is_io() || e.is_go_away() {
        Error::session(e.to_string())
    } else if e.is_reset() {
        Error::stream(e.to_string())
    } else {
        Error::http_protocol(e.to_string())
    }
}
