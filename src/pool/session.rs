//! One multiplexed connection and its lifecycle.
//!
//! ```text
//!   Connecting ──attach──▶ Ready ──begin_close──▶ Closing
//!        │                   │                       │
//!        └──────dial error───┴──close/error event────┴──▶ Closed
//! ```
//!
//! State is published on a `watch` channel so any number of dispatches can
//! wait for Ready or Closed without polling. Closed is terminal.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::time::Instant;

use crate::endpoint::EndpointKey;
use crate::error::{Error, Result};
use crate::transport::ConnectionHandle;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Ready,
    Closing,
    Closed,
}

impl SessionState {
    /// True while the session may take new streams (possibly after connecting).
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Connecting | Self::Ready)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session reached Closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CloseCause {
    /// Dial or handshake failed.
    Dial(String),
    /// Dial did not finish in time.
    ConnectTimeout(Duration),
    /// The connection errored.
    Error(String),
    /// Orderly close (peer, idle timeout, shutdown).
    Closed(String),
}

/// A multiplexed connection to one endpoint.
pub struct Session {
    id: u64,
    key: EndpointKey,
    created_at: Instant,
    state: watch::Sender<SessionState>,
    handle: Mutex<Option<Arc<dyn ConnectionHandle>>>,
    cause: Mutex<Option<CloseCause>>,
    open_streams: AtomicUsize,
    idle_since: Mutex<Option<Instant>>,
    activity: Notify,
}

impl Session {
    pub(crate) fn new(id: u64, key: EndpointKey) -> Arc<Self> {
        let (state, _rx) = watch::channel(SessionState::Connecting);
        Arc::new(Self {
            id,
            key,
            created_at: Instant::now(),
            state,
            handle: Mutex::new(None),
            cause: Mutex::new(None),
            open_streams: AtomicUsize::new(0),
            idle_since: Mutex::new(None),
            activity: Notify::new(),
        })
    }

    /// Unique id within the owning cache.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &EndpointKey {
        &self.key
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Streams currently open on this session.
    pub fn open_streams(&self) -> usize {
        self.open_streams.load(Ordering::Acquire)
    }

    /// Wait until the session is Ready and return its connection handle.
    ///
    /// Fails once the session is Closing or Closed.
    pub async fn ready(&self) -> Result<Arc<dyn ConnectionHandle>> {
        let mut rx = self.state.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                SessionState::Ready => {
                    if let Some(handle) = self.lock_handle().clone() {
                        return Ok(handle);
                    }
                    return Err(self.closed_error());
                }
                SessionState::Closing => {
                    return Err(Error::connection(format!(
                        "session {} to {} is closing",
                        self.id, self.key
                    )))
                }
                SessionState::Closed => return Err(self.closed_error()),
                SessionState::Connecting => {}
            }
            if rx.changed().await.is_err() {
                return Err(self.closed_error());
            }
        }
    }

    /// Resolve once the session is Closed, with the error in-flight requests see.
    pub async fn closed(&self) -> Error {
        let mut rx = self.state.subscribe();
        loop {
            if *rx.borrow_and_update() == SessionState::Closed {
                return self.closed_error();
            }
            if rx.changed().await.is_err() {
                return self.closed_error();
            }
        }
    }

    /// Begin a graceful close; in-flight streams keep running.
    pub fn close(&self) {
        self.begin_close("closed by owner");
    }

    /// Connecting → Ready. A session closed while dialing gets its handle closed.
    pub(crate) fn attach(&self, handle: Arc<dyn ConnectionHandle>) {
        *self.lock_handle() = Some(handle.clone());
        *self.lock_idle_since() = Some(Instant::now());

        let promoted = self.state.send_if_modified(|state| {
            if *state == SessionState::Connecting {
                *state = SessionState::Ready;
                true
            } else {
                false
            }
        });
        if promoted {
            tracing::debug!("Session {} to {}: ready", self.id, self.key);
        } else {
            tracing::debug!(
                "Session {} to {}: connected while {}, closing",
                self.id,
                self.key,
                self.state()
            );
            handle.close();
        }
    }

    /// Connecting/Ready → Closing. Returns false if already closing or closed.
    pub(crate) fn begin_close(&self, reason: &str) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if state.is_usable() {
                *state = SessionState::Closing;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::debug!("Session {} to {}: closing ({})", self.id, self.key, reason);
            if let Some(handle) = self.lock_handle().clone() {
                handle.close();
            }
            self.activity.notify_one();
        }
        changed
    }

    /// Any → Closed. Returns true only for the call that performed the transition.
    pub(crate) fn mark_closed(&self, cause: CloseCause) -> bool {
        let mut cause = Some(cause);
        // The cause is stored before waiters are woken to observe Closed.
        let changed = self.state.send_if_modified(|state| {
            if *state == SessionState::Closed {
                return false;
            }
            *self.lock_cause() = cause.take();
            *state = SessionState::Closed;
            true
        });
        if changed {
            tracing::debug!(
                "Session {} to {}: closed ({:?})",
                self.id,
                self.key,
                self.lock_cause().as_ref()
            );
            self.lock_handle().take();
            self.activity.notify_one();
        }
        changed
    }

    /// Count a stream as open until the guard drops.
    pub(crate) fn track_stream(self: &Arc<Self>) -> StreamGuard {
        self.open_streams.fetch_add(1, Ordering::AcqRel);
        *self.lock_idle_since() = None;
        self.activity.notify_one();
        StreamGuard {
            session: Arc::clone(self),
        }
    }

    /// When the idle timer should fire, if the session is idle.
    pub(crate) fn idle_deadline(&self, idle_timeout: Duration) -> Option<Instant> {
        if self.open_streams() > 0 {
            return None;
        }
        let since = *self.lock_idle_since();
        since.map(|since| since + idle_timeout)
    }

    /// Wait for a stream to open or close, or a state change.
    pub(crate) async fn activity(&self) {
        self.activity.notified().await;
    }

    fn release_stream(&self) {
        if self.open_streams.fetch_sub(1, Ordering::AcqRel) == 1 {
            *self.lock_idle_since() = Some(Instant::now());
        }
        self.activity.notify_one();
    }

    fn closed_error(&self) -> Error {
        match self.lock_cause().clone() {
            Some(CloseCause::Dial(message)) => Error::Dial(message),
            Some(CloseCause::ConnectTimeout(limit)) => Error::ConnectTimeout(limit),
            Some(CloseCause::Error(message)) => Error::Session(message),
            Some(CloseCause::Closed(reason)) => Error::connection(format!(
                "session {} to {} closed: {}",
                self.id, self.key, reason
            )),
            None => Error::connection(format!("session {} to {} closed", self.id, self.key)),
        }
    }

    fn lock_handle(&self) -> std::sync::MutexGuard<'_, Option<Arc<dyn ConnectionHandle>>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_cause(&self) -> std::sync::MutexGuard<'_, Option<CloseCause>> {
        self.cause.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_idle_since(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        self.idle_since.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("state", &self.state())
            .field("open_streams", &self.open_streams())
            .finish()
    }
}

/// Keeps a stream counted as open on its session.
pub struct StreamGuard {
    session: Arc<Session>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.session.release_stream();
    }
}

impl fmt::Debug for StreamGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamGuard")
            .field("session", &self.session.id)
            .finish()
    }
}
