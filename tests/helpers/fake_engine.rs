//! Scriptable in-memory protocol engine.
//!
//! Every dial produces a [`FakeConnection`] the test drives by hand: emit
//! connection events, accept streams, answer them with headers and body,
//! inspect what the client sent.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use muxreq::request::StreamHead;
use muxreq::transport::{
    ConnectionHandle, EngineConnection, HeaderList, RequestSink, ResponseSource,
};
use muxreq::{ConnectOptions, ConnectionEvent, EndpointKey, Error, ProtocolEngine, Result};
use tokio::sync::{mpsc, oneshot, Semaphore};

/// Fake [`ProtocolEngine`]. Clones share state.
#[derive(Clone)]
#[allow(dead_code)]
pub struct FakeEngine {
    inner: Arc<EngineState>,
}

struct EngineState {
    dials: AtomicUsize,
    connect_delay: Mutex<Option<Duration>>,
    fail_dials: AtomicBool,
    refuse_streams: AtomicBool,
    stream_window: Mutex<Option<usize>>,
    connections_tx: mpsc::UnboundedSender<FakeConnection>,
    connections_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<FakeConnection>>,
    endpoints: Mutex<Vec<EndpointKey>>,
}

#[allow(dead_code)]
impl FakeEngine {
    pub fn new() -> Self {
        let (connections_tx, connections_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(EngineState {
                dials: AtomicUsize::new(0),
                connect_delay: Mutex::new(None),
                fail_dials: AtomicBool::new(false),
                refuse_streams: AtomicBool::new(false),
                stream_window: Mutex::new(None),
                connections_tx,
                connections_rx: tokio::sync::Mutex::new(connections_rx),
                endpoints: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Delay every dial by `delay`.
    pub fn with_connect_delay(self, delay: Duration) -> Self {
        *self.inner.connect_delay.lock().unwrap() = Some(delay);
        self
    }

    /// Give each stream `chunks` DATA writes of send capacity; more must be granted.
    pub fn with_stream_window(self, chunks: usize) -> Self {
        *self.inner.stream_window.lock().unwrap() = Some(chunks);
        self
    }

    /// Make subsequent dials fail (or succeed again).
    pub fn fail_dials(&self, fail: bool) {
        self.inner.fail_dials.store(fail, Ordering::SeqCst);
    }

    /// Make connections dialed from now on refuse every stream.
    pub fn refuse_streams(&self, refuse: bool) {
        self.inner.refuse_streams.store(refuse, Ordering::SeqCst);
    }

    /// Number of `connect` calls so far.
    pub fn dial_count(&self) -> usize {
        self.inner.dials.load(Ordering::SeqCst)
    }

    /// Endpoints dialed, in order.
    pub fn dialed(&self) -> Vec<EndpointKey> {
        self.inner.endpoints.lock().unwrap().clone()
    }

    /// Wait for the next established connection.
    pub async fn next_connection(&self) -> FakeConnection {
        let mut rx = self.inner.connections_rx.lock().await;
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("engine dropped")
    }
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProtocolEngine for FakeEngine {
    async fn connect(
        &self,
        endpoint: &EndpointKey,
        options: ConnectOptions,
    ) -> Result<EngineConnection> {
        self.inner.dials.fetch_add(1, Ordering::SeqCst);
        self.inner.endpoints.lock().unwrap().push(endpoint.clone());

        let delay = *self.inner.connect_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.inner.fail_dials.load(Ordering::SeqCst) {
            return Err(Error::dial(format!("{}: connection refused", endpoint)));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (streams_tx, streams_rx) = mpsc::unbounded_channel();
        let connection = FakeConnection {
            inner: Arc::new(ConnectionState {
                endpoint: endpoint.clone(),
                events: Mutex::new(Some(events_tx)),
                streams: tokio::sync::Mutex::new(streams_rx),
                close_calls: AtomicUsize::new(0),
                refusing: AtomicBool::new(self.inner.refuse_streams.load(Ordering::SeqCst)),
                used_transport: options.transport.is_some(),
            }),
        };
        let handle = FakeHandle {
            connection: connection.clone(),
            streams: streams_tx,
            window: *self.inner.stream_window.lock().unwrap(),
        };
        let _ = self.inner.connections_tx.send(connection);

        Ok(EngineConnection {
            handle: Arc::new(handle),
            events: events_rx,
        })
    }
}

/// Test-side control of one fake connection.
#[derive(Clone)]
#[allow(dead_code)]
pub struct FakeConnection {
    inner: Arc<ConnectionState>,
}

struct ConnectionState {
    endpoint: EndpointKey,
    events: Mutex<Option<mpsc::UnboundedSender<ConnectionEvent>>>,
    streams: tokio::sync::Mutex<mpsc::UnboundedReceiver<ServerStream>>,
    close_calls: AtomicUsize,
    refusing: AtomicBool,
    used_transport: bool,
}

#[allow(dead_code)]
impl FakeConnection {
    pub fn endpoint(&self) -> &EndpointKey {
        &self.inner.endpoint
    }

    /// Deliver a connection event to the session.
    pub fn emit(&self, event: ConnectionEvent) {
        if let Some(events) = self.inner.events.lock().unwrap().as_ref() {
            let _ = events.send(event);
        }
    }

    /// End the event channel without a final event.
    pub fn drop_events(&self) {
        self.inner.events.lock().unwrap().take();
    }

    /// Refuse every new stream, as after a GOAWAY. Open streams keep running.
    pub fn refuse_streams(&self) {
        self.inner.refusing.store(true, Ordering::SeqCst);
    }

    /// Times the client called `close()` on this connection.
    pub fn close_calls(&self) -> usize {
        self.inner.close_calls.load(Ordering::SeqCst)
    }

    /// True if the connection ran over a caller-supplied transport.
    pub fn used_transport(&self) -> bool {
        self.inner.used_transport
    }

    /// Wait for the client to open the next stream.
    pub async fn next_stream(&self) -> ServerStream {
        let mut streams = self.inner.streams.lock().await;
        tokio::time::timeout(Duration::from_secs(5), streams.recv())
            .await
            .expect("timed out waiting for a stream")
            .expect("connection handle dropped")
    }
}

struct FakeHandle {
    connection: FakeConnection,
    streams: mpsc::UnboundedSender<ServerStream>,
    window: Option<usize>,
}

#[async_trait]
impl ConnectionHandle for FakeHandle {
    async fn open_stream(
        &self,
        head: StreamHead,
        end_of_stream: bool,
    ) -> Result<(Box<dyn RequestSink>, Box<dyn ResponseSource>)> {
        if self.connection.inner.refusing.load(Ordering::SeqCst) {
            return Err(Error::session("GOAWAY received"));
        }
        let (headers_tx, headers_rx) = oneshot::channel();
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let reset = Arc::new(AtomicBool::new(false));
        let window = self.window.map(|chunks| Arc::new(Semaphore::new(chunks)));

        let stream = ServerStream {
            head,
            end_of_stream,
            headers: Some(headers_tx),
            data: data_tx,
            request: request_rx,
            reset: reset.clone(),
            window: window.clone(),
        };
        self.streams
            .send(stream)
            .map_err(|_| Error::connection("fake connection gone"))?;

        Ok((
            Box::new(FakeSink {
                request: request_tx,
                reset: reset.clone(),
                window,
            }),
            Box::new(FakeSource {
                headers: Some(headers_rx),
                data: data_rx,
                reset,
            }),
        ))
    }

    fn close(&self) {
        self.connection.inner.close_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// One DATA write received from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub data: Bytes,
    pub end_of_stream: bool,
}

/// Server side of one stream.
#[allow(dead_code)]
pub struct ServerStream {
    pub head: StreamHead,
    /// End-of-stream was set on the HEADERS.
    pub end_of_stream: bool,
    headers: Option<oneshot::Sender<Result<HeaderList>>>,
    data: mpsc::UnboundedSender<Option<Result<Bytes>>>,
    request: mpsc::UnboundedReceiver<DataFrame>,
    reset: Arc<AtomicBool>,
    window: Option<Arc<Semaphore>>,
}

#[allow(dead_code)]
impl ServerStream {
    /// Send response HEADERS.
    pub fn respond(&mut self, status: u16, headers: &[(&str, &str)]) {
        let mut list: HeaderList = vec![(":status".to_string(), status.to_string())];
        list.extend(headers.iter().map(|(n, v)| (n.to_string(), v.to_string())));
        self.respond_raw(list);
    }

    /// Send an arbitrary header list, pseudo-headers included.
    pub fn respond_raw(&mut self, list: HeaderList) {
        if let Some(tx) = self.headers.take() {
            let _ = tx.send(Ok(list));
        }
    }

    /// Send one body chunk.
    pub fn send_body(&self, chunk: impl Into<Bytes>) {
        let _ = self.data.send(Some(Ok(chunk.into())));
    }

    /// End the response body.
    pub fn finish(&self) {
        let _ = self.data.send(None);
    }

    /// Fail the stream: the header wait if headers are not sent yet, else the body.
    pub fn fail(&mut self, error: Error) {
        match self.headers.take() {
            Some(tx) => {
                let _ = tx.send(Err(error));
            }
            None => {
                let _ = self.data.send(Some(Err(error)));
            }
        }
    }

    /// Next DATA write from the client, `None` once the upload side is gone.
    pub async fn next_data(&mut self) -> Option<DataFrame> {
        tokio::time::timeout(Duration::from_secs(5), self.request.recv())
            .await
            .expect("timed out waiting for request data")
    }

    /// Collect the request body up to end of stream.
    pub async fn read_body(&mut self) -> Bytes {
        let mut body = BytesMut::new();
        while let Some(frame) = self.next_data().await {
            body.extend_from_slice(&frame.data);
            if frame.end_of_stream {
                break;
            }
        }
        body.freeze()
    }

    /// Let the client send `chunks` more DATA writes.
    pub fn grant(&self, chunks: usize) {
        if let Some(window) = &self.window {
            window.add_permits(chunks);
        }
    }

    /// True once the client reset either half of the stream.
    pub fn is_reset(&self) -> bool {
        self.reset.load(Ordering::SeqCst)
    }

    /// Wait until the client resets the stream.
    pub async fn wait_reset(&self) -> bool {
        super::wait_until(Duration::from_secs(5), || self.is_reset()).await
    }
}

struct FakeSink {
    request: mpsc::UnboundedSender<DataFrame>,
    reset: Arc<AtomicBool>,
    window: Option<Arc<Semaphore>>,
}

#[async_trait]
impl RequestSink for FakeSink {
    async fn send_data(&mut self, data: Bytes, end_of_stream: bool) -> Result<()> {
        if self.reset.load(Ordering::SeqCst) {
            return Err(Error::stream("stream reset"));
        }
        if let (Some(window), false) = (&self.window, data.is_empty()) {
            window
                .acquire()
                .await
                .map_err(|_| Error::stream("window closed"))?
                .forget();
        }
        self.request
            .send(DataFrame {
                data,
                end_of_stream,
            })
            .map_err(|_| Error::stream("peer stopped reading"))
    }

    fn reset(&mut self) {
        self.reset.store(true, Ordering::SeqCst);
    }
}

struct FakeSource {
    headers: Option<oneshot::Receiver<Result<HeaderList>>>,
    data: mpsc::UnboundedReceiver<Option<Result<Bytes>>>,
    reset: Arc<AtomicBool>,
}

#[async_trait]
impl ResponseSource for FakeSource {
    async fn headers(&mut self) -> Result<HeaderList> {
        let rx = self
            .headers
            .take()
            .ok_or_else(|| Error::stream("headers already consumed"))?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::stream("stream dropped by peer")),
        }
    }

    async fn data(&mut self) -> Option<Result<Bytes>> {
        match self.data.recv().await {
            Some(item) => item,
            None => Some(Err(Error::stream("stream dropped by peer"))),
        }
    }

    fn reset(&mut self) {
        self.reset.store(true, Ordering::SeqCst);
    }
}
