//! Real-time cache synchronization for the clinic-ops client.
//!
//! Keeps a keyed client cache consistent with one authoritative server across three sources
//! of truth: optimistic local mutations, REST responses and websocket push events. Falls back
//! to pull-based polling while the push channel is down.

pub mod config;
pub mod context;
pub mod core;
pub mod interfaces;
pub mod sync;
pub mod testing;
pub mod tls;
pub mod transport;

pub use config::SyncConfig;
pub use context::{ConfirmedMutation, ContextStats, MutationHandle, SyncContext, SyncContextBuilder};
pub use core::{
    CacheChange, CacheEntry, CacheKey, ChangeKind, ConnectionState, EmitStatus, EventKind,
    HealthSnapshot, KeyPattern, MutationError, RemoteError, RoutedEvent, Staleness,
    SubscriptionToken, SyncError, SyncEvent, SyncResult, WriteOutcome,
};
pub use interfaces::{Credentials, CredentialsProvider, PullBatch, PullSource, RestClient};
pub use sync::{PollerStatus, SyncMetricsHook, SyncMetricsReporter};
pub use transport::tungstenite::TungsteniteTransport;
