//! Protocol engine seam.
//!
//! The session cache and dispatcher never touch frames. They drive a
//! [`ProtocolEngine`] that dials connections and a [`ConnectionHandle`] that
//! opens streams, and they observe connection lifecycle through
//! [`ConnectionEvent`]s:
//!
//! ```text
//!   SessionCache ──connect──▶ ProtocolEngine ──▶ EngineConnection
//!                                                 ├─ handle: open_stream / close
//!                                                 └─ events: Origin | Timeout | Close | Error
//!   dispatch ──open_stream──▶ (RequestSink, ResponseSource)
//! ```
//!
//! - [`h2_engine::H2Engine`]: production engine on the `h2` crate

pub mod h2_engine;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::endpoint::EndpointKey;
use crate::error::Result;
use crate::request::StreamHead;

pub use h2_engine::{Dialer, H2Engine, TcpDialer};

/// Ordered `(name, value)` header list, pseudo-headers included.
pub type HeaderList = Vec<(String, String)>;

/// Byte transport an engine can run a connection over.
pub trait AsyncTransport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AsyncTransport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Owned, type-erased transport.
pub type BoxedTransport = Box<dyn AsyncTransport>;

/// Shut down and drop a transport nobody is going to use.
pub fn release_transport(mut transport: BoxedTransport) {
    tokio::spawn(async move {
        if let Err(e) = transport.shutdown().await {
            tracing::debug!("Releasing unused transport: shutdown failed: {}", e);
        }
    });
}

/// Per-dial options.
#[derive(Default)]
pub struct ConnectOptions {
    /// Run the connection over this transport instead of dialing.
    pub transport: Option<BoxedTransport>,
}

impl ConnectOptions {
    /// Options that dial a fresh connection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reuse an existing transport.
    pub fn with_transport(transport: BoxedTransport) -> Self {
        Self {
            transport: Some(transport),
        }
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("transport", &self.transport.is_some())
            .finish()
    }
}

/// Connection-level lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The peer advertised origins this connection is authoritative for.
    Origin(Vec<String>),
    /// The engine's own inactivity timer fired.
    Timeout,
    /// The connection is gone.
    Close,
    /// Unrecoverable connection error.
    Error(String),
}

/// A freshly established connection.
pub struct EngineConnection {
    pub handle: Arc<dyn ConnectionHandle>,
    pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

/// Dials multiplexed connections.
#[async_trait]
pub trait ProtocolEngine: Send + Sync + 'static {
    /// Establish a connection to `endpoint`.
    async fn connect(
        &self,
        endpoint: &EndpointKey,
        options: ConnectOptions,
    ) -> Result<EngineConnection>;
}

/// Live multiplexed connection.
#[async_trait]
pub trait ConnectionHandle: Send + Sync {
    /// Open a new stream and send its HEADERS.
    async fn open_stream(
        &self,
        head: StreamHead,
        end_of_stream: bool,
    ) -> Result<(Box<dyn RequestSink>, Box<dyn ResponseSource>)>;

    /// Stop accepting new streams; let in-flight streams finish.
    fn close(&self);
}

/// Outbound half of a stream.
#[async_trait]
pub trait RequestSink: Send {
    /// Send a DATA frame, waiting for flow-control capacity.
    async fn send_data(&mut self, data: Bytes, end_of_stream: bool) -> Result<()>;

    /// Reset the stream.
    fn reset(&mut self);
}

/// Inbound half of a stream.
#[async_trait]
pub trait ResponseSource: Send {
    /// Wait for the response HEADERS, `:status` included.
    async fn headers(&mut self) -> Result<HeaderList>;

    /// Next body chunk; `None` at end of stream.
    async fn data(&mut self) -> Option<Result<Bytes>>;

    /// Reset the stream; no further data is delivered.
    fn reset(&mut self);
}
