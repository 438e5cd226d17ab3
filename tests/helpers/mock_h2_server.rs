use bytes::Bytes;
use h2::server::SendResponse;
use h2::RecvStream;
use http::Request;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;

/// In-process HTTP/2 (prior knowledge) server built on `h2::server`.
/// Each accepted stream is handed to the test's handler.
#[allow(dead_code)]
pub struct MockH2Server {
    listener: TcpListener,
    port: u16,
    tracker: ConnectionTracker,
    requests_per_connection: Option<usize>,
}

impl MockH2Server {
    /// Create a new mock H2 server bound to a random port.
    #[allow(dead_code)]
    pub async fn new() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        Ok(Self {
            listener,
            port,
            tracker: ConnectionTracker::new(),
            requests_per_connection: None,
        })
    }

    /// Close each connection after it has accepted `n` streams.
    #[allow(dead_code)]
    pub fn close_after(mut self, n: usize) -> Self {
        self.requests_per_connection = Some(n);
        self
    }

    /// Get the base URL for this server.
    #[allow(dead_code)]
    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// Get the port this server is listening on.
    #[allow(dead_code)]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Tracker counting completed HTTP/2 handshakes.
    #[allow(dead_code)]
    pub fn tracker(&self) -> ConnectionTracker {
        self.tracker.clone()
    }

    /// Start the server with a per-stream handler.
    #[allow(dead_code)]
    pub fn start<F, Fut>(self, handler: F) -> tokio::task::JoinHandle<()>
    where
        F: Fn(Request<RecvStream>, SendResponse<Bytes>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let limit = self.requests_per_connection;
        let tracker = self.tracker;
        let listener = self.listener;
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let handler = Arc::clone(&handler);
                let tracker = tracker.clone();
                tokio::spawn(async move {
                    let mut conn = match h2::server::handshake(stream).await {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::debug!("Mock server: handshake failed: {}", e);
                            return;
                        }
                    };
                    tracker.record_connection();

                    let mut accepted = 0;
                    while let Some(result) = conn.accept().await {
                        let (request, respond) = match result {
                            Ok(pair) => pair,
                            Err(e) => {
                                tracing::debug!("Mock server: accept failed: {}", e);
                                break;
                            }
                        };
                        tokio::spawn(handler(request, respond));
                        accepted += 1;
                        if limit.is_some_and(|n| accepted >= n) {
                            conn.graceful_shutdown();
                        }
                    }
                });
            }
        })
    }
}

/// Count HTTP/2 connections the server accepted.
#[derive(Clone)]
#[allow(dead_code)]
pub struct ConnectionTracker {
    connections: Arc<AtomicUsize>,
}

#[allow(dead_code)]
impl ConnectionTracker {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Record a completed handshake.
    pub fn record_connection(&self) {
        self.connections.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of connections so far.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Read a request body to the end, releasing flow-control capacity.
#[allow(dead_code)]
pub async fn read_body(body: &mut RecvStream) -> Result<Bytes, h2::Error> {
    let mut buf = bytes::BytesMut::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk?;
        let _ = body.flow_control().release_capacity(chunk.len());
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

/// Respond with `status` and a complete body.
#[allow(dead_code)]
pub fn respond(mut respond: SendResponse<Bytes>, status: u16, body: &'static [u8]) {
    let response = http::Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .body(())
        .unwrap();
    let end_of_stream = body.is_empty();
    let mut stream = match respond.send_response(response, end_of_stream) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::debug!("Mock server: send_response failed: {}", e);
            return;
        }
    };
    if !end_of_stream {
        let _ = stream.send_data(Bytes::from_static(body), true);
    }
}
