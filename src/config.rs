//! Session cache and HTTP/2 engine configuration.
//!
//! # Timeout Semantics
//!
//! - **idle**: a session with no open streams for this long is closed and evicted.
//!   The clock restarts every time the last open stream finishes.
//! - **connect**: does NOT reset. Deadline for dial + HTTP/2 handshake.
//! - **ttfb**: does NOT reset. Deadline from dispatch to response headers.
//!
//! ```rust,ignore
//! use muxreq::CacheConfig;
//! use std::time::Duration;
//!
//! let config = CacheConfig::new()
//!     .idle_timeout(Duration::from_secs(60))
//!     .ttfb_timeout(Duration::from_secs(30));
//! ```

use std::time::Duration;

/// Session cache configuration.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Close sessions with no open streams after this long.
    ///
    /// Default: 5 minutes
    pub idle_timeout: Option<Duration>,

    /// Timeout for establishing a session.
    ///
    /// Default: 10s
    pub connect_timeout: Option<Duration>,

    /// Time-to-first-byte timeout for each request.
    ///
    /// Default: None
    pub ttfb_timeout: Option<Duration>,
}

impl CacheConfig {
    /// Default idle timeout (5 minutes).
    pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

    /// Default connect timeout (10 seconds).
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Create a config with the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set idle timeout.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Set connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set TTFB timeout.
    pub fn ttfb_timeout(mut self, timeout: Duration) -> Self {
        self.ttfb_timeout = Some(timeout);
        self
    }

    /// Keep idle sessions open until the peer closes them.
    pub fn no_idle_timeout(mut self) -> Self {
        self.idle_timeout = None;
        self
    }

    /// Disable connect timeout.
    pub fn no_connect_timeout(mut self) -> Self {
        self.connect_timeout = None;
        self
    }

    /// Disable TTFB timeout.
    pub fn no_ttfb_timeout(mut self) -> Self {
        self.ttfb_timeout = None;
        self
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Some(Self::DEFAULT_IDLE_TIMEOUT),
            connect_timeout: Some(Self::DEFAULT_CONNECT_TIMEOUT),
            ttfb_timeout: None,
        }
    }
}

/// HTTP/2 SETTINGS and handshake options for [`crate::transport::H2Engine`].
#[derive(Debug, Clone)]
pub struct Http2Settings {
    pub header_table_size: u32,
    pub enable_push: bool,
    pub max_concurrent_streams: u32,
    pub initial_window_size: u32,
    /// Connection-level receive window.
    pub initial_connection_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: u32,
    /// Handshake timeout for waiting for server SETTINGS frame.
    /// Set to None for no timeout.
    pub handshake_timeout: Option<Duration>,
}

impl Default for Http2Settings {
    fn default() -> Self {
        Self {
            header_table_size: 4096,
            enable_push: false,
            max_concurrent_streams: 100,
            initial_window_size: 1024 * 1024,
            initial_connection_window_size: 4 * 1024 * 1024,
            max_frame_size: 16384,
            max_header_list_size: 262144,
            handshake_timeout: Some(Duration::from_secs(10)),
        }
    }
}

impl Http2Settings {
    /// Set header table size (SETTINGS_HEADER_TABLE_SIZE).
    pub fn header_table_size(mut self, size: u32) -> Self {
        self.header_table_size = size;
        self
    }

    /// Set initial stream window size (SETTINGS_INITIAL_WINDOW_SIZE).
    pub fn initial_window_size(mut self, size: u32) -> Self {
        self.initial_window_size = size;
        self
    }

    /// Set connection-level window size.
    pub fn initial_connection_window_size(mut self, size: u32) -> Self {
        self.initial_connection_window_size = size;
        self
    }

    /// Set max concurrent streams (SETTINGS_MAX_CONCURRENT_STREAMS).
    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.max_concurrent_streams = max;
        self
    }

    /// Set max frame size (SETTINGS_MAX_FRAME_SIZE).
    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Set max header list size (SETTINGS_MAX_HEADER_LIST_SIZE).
    pub fn max_header_list_size(mut self, size: u32) -> Self {
        self.max_header_list_size = size;
        self
    }

    /// Set enable push (SETTINGS_ENABLE_PUSH).
    pub fn enable_push(mut self, enable: bool) -> Self {
        self.enable_push = enable;
        self
    }

    /// Set handshake timeout.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }
}
