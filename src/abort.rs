//! Request cancellation.
//!
//! An [`AbortController`] owns the trigger, any number of [`AbortSignal`]s
//! observe it. The first abort wins and records its [`AbortKind`] so callers
//! can tell a caller-initiated cancel from a deadline without parsing messages.
//!
//! ```rust,ignore
//! let controller = AbortController::with_timeout(Duration::from_secs(5));
//! let response = client
//!     .get("https://example.com/slow")
//!     .signal(controller.signal())
//!     .send()
//!     .await;
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// What triggered an abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbortKind {
    /// The caller cancelled explicitly.
    Caller,
    /// A deadline attached to the signal elapsed.
    Deadline,
}

impl AbortKind {
    /// Short lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Caller => "caller",
            Self::Deadline => "deadline",
        }
    }
}

impl fmt::Display for AbortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trigger side of a cancellation.
#[derive(Debug, Clone)]
pub struct AbortController {
    tx: Arc<watch::Sender<Option<AbortKind>>>,
}

impl AbortController {
    /// Create a controller that has not fired.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Create a controller that fires with [`AbortKind::Deadline`] after `timeout`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_timeout(timeout: Duration) -> Self {
        let controller = Self::new();
        let timer = controller.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            timer.abort_with(AbortKind::Deadline);
        });
        controller
    }

    /// Get a signal observing this controller.
    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Abort on behalf of the caller.
    pub fn abort(&self) {
        self.abort_with(AbortKind::Caller);
    }

    /// Abort with an explicit cause. Only the first abort is recorded.
    pub fn abort_with(&self, kind: AbortKind) {
        let fired = self.tx.send_if_modified(|reason| {
            if reason.is_none() {
                *reason = Some(kind);
                true
            } else {
                false
            }
        });
        if fired {
            tracing::debug!("Abort signal fired ({})", kind);
        }
    }

    /// Check whether the controller has fired.
    pub fn is_aborted(&self) -> bool {
        self.tx.borrow().is_some()
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of a cancellation.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<Option<AbortKind>>,
}

impl AbortSignal {
    /// The recorded cause, if the signal has fired.
    pub fn reason(&self) -> Option<AbortKind> {
        *self.rx.borrow()
    }

    /// Check whether the signal has fired.
    pub fn is_aborted(&self) -> bool {
        self.reason().is_some()
    }

    /// Resolve once the signal fires.
    ///
    /// Stays pending forever if every controller is dropped without firing.
    pub async fn aborted(&self) -> AbortKind {
        let mut rx = self.rx.clone();
        loop {
            let current = *rx.borrow_and_update();
            if let Some(kind) = current {
                return kind;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Resolve when `signal` fires; pending forever without a signal.
pub(crate) async fn fired(signal: Option<&AbortSignal>) -> AbortKind {
    match signal {
        Some(signal) => signal.aborted().await,
        None => std::future::pending().await,
    }
}
