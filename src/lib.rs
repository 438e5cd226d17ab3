//! # muxreq
//!
//! Multiplexed HTTP/2 request adapter.
//!
//! Requests to the same endpoint share one long-lived HTTP/2 session instead
//! of opening a connection each. The [`SessionCache`] decides reuse, dials on
//! a miss and evicts sessions that close, error or sit idle; [`dispatch`]
//! maps a request onto a stream and resolves a [`Response`] with a lazily
//! read body once headers arrive.

pub mod abort;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod request;
pub mod response;

// Protocol engine seam and the h2-backed engine
pub mod transport;

// Session lifecycle and caching
pub mod pool;

// Re-exports
pub use abort::{AbortController, AbortKind, AbortSignal};
pub use client::{Client, ClientBuilder, RequestBuilder};
pub use config::{CacheConfig, Http2Settings};
pub use endpoint::EndpointKey;
pub use error::{Error, ErrorKind, Result};
pub use pool::{CacheStats, Session, SessionCache, SessionState};
pub use request::{PendingRequest, RequestBody};
pub use response::{Response, ResponseBody};
pub use transport::{ConnectOptions, ConnectionEvent, H2Engine, ProtocolEngine};
