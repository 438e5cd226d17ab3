//! Session cache: at most one live HTTP/2 session per endpoint.
//!
//! - `acquire` is synchronous. The check-then-insert happens under the table
//!   lock before anything yields, so concurrent callers for one endpoint
//!   never both dial.
//! - Each session gets a driver task that turns connection events and the
//!   idle timer into state transitions and evicts the session when it closes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout as tokio_timeout, Instant};

use crate::config::CacheConfig;
use crate::endpoint::EndpointKey;
use crate::error::Error;
use crate::pool::session::{CloseCause, Session, SessionState};
use crate::transport::{release_transport, ConnectOptions, ConnectionEvent, ProtocolEngine};

/// Table of live sessions keyed by endpoint. Cheap to clone.
#[derive(Clone)]
pub struct SessionCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    engine: Arc<dyn ProtocolEngine>,
    config: CacheConfig,
    sessions: Mutex<HashMap<EndpointKey, Arc<Session>>>,
    next_id: AtomicU64,
    dials: AtomicU64,
    evictions: AtomicU64,
}

impl SessionCache {
    /// Create a cache dialing through `engine`.
    pub fn new(engine: impl ProtocolEngine, config: CacheConfig) -> Self {
        Self::with_engine(Arc::new(engine), config)
    }

    /// Create a cache around a shared engine.
    pub fn with_engine(engine: Arc<dyn ProtocolEngine>, config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                engine,
                config,
                sessions: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                dials: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Get the live session for `key`, or start connecting a new one.
    ///
    /// A transport in `options` is only used when a new session is dialed;
    /// otherwise it is shut down and dropped.
    pub fn acquire(&self, key: &EndpointKey, mut options: ConnectOptions) -> Arc<Session> {
        let mut sessions = self.inner.lock_sessions();

        if let Some(existing) = sessions.get(key) {
            if existing.state().is_usable() {
                tracing::debug!(
                    "Session cache: reusing session {} for {} ({}, open streams: {})",
                    existing.id(),
                    key,
                    existing.state(),
                    existing.open_streams()
                );
                let existing = Arc::clone(existing);
                drop(sessions);
                if let Some(transport) = options.transport.take() {
                    tracing::debug!("Session cache: releasing unused transport for {}", key);
                    release_transport(transport);
                }
                return existing;
            }
            tracing::debug!(
                "Session cache: session {} for {} is {}, replacing",
                existing.id(),
                key,
                existing.state()
            );
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Session::new(id, key.clone());
        sessions.insert(key.clone(), Arc::clone(&session));
        drop(sessions);

        tracing::debug!("Session cache: creating session {} for {}", id, key);
        self.inner.spawn_connect(Arc::clone(&session), options);
        session
    }

    /// The cached session for `key`, whatever its state.
    pub fn get(&self, key: &EndpointKey) -> Option<Arc<Session>> {
        self.inner.lock_sessions().get(key).cloned()
    }

    /// Number of cached sessions.
    pub fn len(&self) -> usize {
        self.inner.lock_sessions().len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Gracefully close every session. Each is evicted once its streams finish.
    pub fn close_all(&self) {
        let sessions: Vec<Arc<Session>> = self.inner.lock_sessions().values().cloned().collect();
        tracing::debug!("Session cache: closing {} sessions", sessions.len());
        for session in sessions {
            session.begin_close("cache shutdown");
        }
    }

    /// Get current cache statistics (for debugging/monitoring).
    pub fn stats(&self) -> CacheStats {
        let sessions = self.inner.lock_sessions();
        let count = |state: SessionState| sessions.values().filter(|s| s.state() == state).count();

        CacheStats {
            sessions: sessions.len(),
            connecting: count(SessionState::Connecting),
            ready: count(SessionState::Ready),
            closing: count(SessionState::Closing),
            open_streams: sessions.values().map(|s| s.open_streams()).sum(),
            total_dials: self.inner.dials.load(Ordering::Relaxed),
            total_evictions: self.inner.evictions.load(Ordering::Relaxed),
        }
    }
}

impl CacheInner {
    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<EndpointKey, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_connect(self: &Arc<Self>, session: Arc<Session>, options: ConnectOptions) {
        self.dials.fetch_add(1, Ordering::Relaxed);
        let engine = Arc::clone(&self.engine);
        let cache = Arc::downgrade(self);
        let connect_timeout = self.config.connect_timeout;
        let idle_timeout = self.config.idle_timeout;

        tokio::spawn(async move {
            let connect = engine.connect(session.key(), options);
            let result = match connect_timeout {
                Some(limit) => tokio_timeout(limit, connect)
                    .await
                    .unwrap_or(Err(Error::ConnectTimeout(limit))),
                None => connect.await,
            };

            match result {
                Ok(connection) => {
                    session.attach(connection.handle);
                    drive_session(cache, session, connection.events, idle_timeout).await;
                }
                Err(e) => {
                    tracing::warn!(
                        "Session cache: connecting session {} to {} failed: {}",
                        session.id(),
                        session.key(),
                        e
                    );
                    let cause = match e {
                        Error::ConnectTimeout(limit) => CloseCause::ConnectTimeout(limit),
                        Error::Dial(message) => CloseCause::Dial(message),
                        other => CloseCause::Dial(other.to_string()),
                    };
                    if session.mark_closed(cause) {
                        if let Some(cache) = cache.upgrade() {
                            cache.evict(&session);
                        }
                    }
                }
            }
        });
    }

    /// Remove `session` if it is still the cached entry for its key.
    fn evict(&self, session: &Arc<Session>) {
        let mut sessions = self.lock_sessions();
        match sessions.get(session.key()) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(session.key());
                self.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    "Session cache: evicted session {} for {} ({} remaining)",
                    session.id(),
                    session.key(),
                    sessions.len()
                );
            }
            _ => tracing::debug!(
                "Session cache: session {} for {} already replaced",
                session.id(),
                session.key()
            ),
        }
    }
}

/// Run a Ready session until it closes, then evict it.
async fn drive_session(
    cache: Weak<CacheInner>,
    session: Arc<Session>,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    idle_timeout: Option<Duration>,
) {
    let cause = loop {
        match session.state() {
            SessionState::Closing if session.open_streams() == 0 => {
                break CloseCause::Closed("closed after draining".into());
            }
            SessionState::Closed => return,
            _ => {}
        }

        let idle_deadline = match (session.state(), idle_timeout) {
            (SessionState::Ready, Some(idle)) => session.idle_deadline(idle),
            _ => None,
        };

        tokio::select! {
            event = events.recv() => match event {
                Some(ConnectionEvent::Origin(origins)) => {
                    for origin in origins {
                        tracing::debug!("Session {} to {}: origin {}", session.id(), session.key(), origin);
                    }
                }
                Some(ConnectionEvent::Timeout) => {
                    session.begin_close("connection timeout");
                }
                Some(ConnectionEvent::Error(message)) => {
                    tracing::warn!("Session {} to {}: connection error: {}", session.id(), session.key(), message);
                    break CloseCause::Error(message);
                }
                Some(ConnectionEvent::Close) => break CloseCause::Closed("connection closed".into()),
                None => break CloseCause::Closed("connection events ended".into()),
            },
            _ = session.activity() => {}
            _ = sleep_until_deadline(idle_deadline) => {
                let still_idle = idle_timeout
                    .and_then(|idle| session.idle_deadline(idle))
                    .is_some_and(|deadline| deadline <= Instant::now());
                if still_idle {
                    session.begin_close("idle timeout");
                }
            }
        }
    };

    if session.mark_closed(cause) {
        if let Some(cache) = cache.upgrade() {
            cache.evict(&session);
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Cache statistics for monitoring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub sessions: usize,
    pub connecting: usize,
    pub ready: usize,
    pub closing: usize,
    pub open_streams: usize,
    pub total_dials: u64,
    pub total_evictions: u64,
}
