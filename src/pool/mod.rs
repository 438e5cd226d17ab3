//! Session pooling.
//!
//! - [`session::Session`]: one multiplexed connection and its state machine
//! - [`cache::SessionCache`]: endpoint → session table with reuse and eviction

pub mod cache;
pub mod session;

pub use cache::{CacheStats, SessionCache};
pub use session::{Session, SessionState, StreamGuard};
