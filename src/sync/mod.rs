//! Actors that own the sync engine's mutable state.

pub mod connection;
pub mod engine;
pub mod poller;
pub mod writer;

use std::sync::Arc;

use kameo::error::SendError;

use crate::core::{CacheKey, EventKind, SyncError};

pub use connection::*;
pub use engine::*;
pub use poller::*;
pub use writer::*;

/// Hook for surfacing sync metrics without coupling to an observability backend.
pub trait SyncMetricsReporter: Send + Sync + 'static {
    fn track_reconnect(&self, connection: &str, attempt: u32);

    /// An authoritative write lost the version race and was dropped.
    fn track_stale_drop(&self, key: &CacheKey);

    #[inline]
    fn track_rollback(&self, _key: &CacheKey) {}

    #[inline]
    fn track_subscriber_failure(&self, _kind: EventKind, _failures: usize) {}

    #[inline]
    fn track_malformed_payload(&self, _context: &'static str) {}

    #[inline]
    fn observe_mutation_latency_us(&self, _latency_us: u64) {}
}

pub type SyncMetricsHook = Arc<dyn SyncMetricsReporter>;

/// Flatten a kameo ask failure into the crate error; handler errors pass through unchanged.
pub(crate) fn map_send_error<M>(err: SendError<M, SyncError>) -> SyncError {
    match err {
        SendError::HandlerError(err) => err,
        other => SyncError::ActorError(other.to_string()),
    }
}
