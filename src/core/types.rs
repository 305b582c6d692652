use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Convenience result alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Server-assigned, monotonically increasing entity version.
pub type Version = u64;

/// Canonical error surface shared across the sync engine.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String, code: Option<i32> },

    #[error("Transport error ({context}): {error}")]
    TransportError {
        context: &'static str,
        error: String,
    },

    #[error("Parse failed: {0}")]
    ParseFailed(String),

    #[error("Actor error: {0}")]
    ActorError(String),

    #[error("Timeout: {context}")]
    Timeout { context: String },

    #[error("Stale connection: no data for {millis}ms")]
    StaleConnection { millis: u64 },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Backpressure: outbound queue full")]
    OutboundQueueFull,

    #[error("Mutation already in flight for {key}")]
    MutationInFlight { key: String },

    #[error("Unknown mutation: {0}")]
    UnknownMutation(u64),

    #[error("Permission denied: {action}")]
    PermissionDenied { action: String },
}

/// Error reported by the REST collaborator for a remote call or pull.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("remote call failed (status={status:?}): {message}")]
pub struct RemoteError {
    pub status: Option<u16>,
    pub message: String,
}

impl RemoteError {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// Typed failure surfaced to the caller of `mutate`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MutationError {
    /// The remote call rejected; the cache entry has been restored to its prior snapshot.
    #[error("mutation of {key} rejected: {source}")]
    Rejected {
        key: String,
        #[source]
        source: RemoteError,
    },

    /// The engine stopped before the mutation could be reconciled.
    #[error("mutation abandoned: {reason}")]
    Abandoned { reason: String },
}

/// Push-channel connection state; owned by the connection actor, read by everyone else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
    Degraded,
}

impl ConnectionState {
    #[inline]
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
            ConnectionState::Degraded => "degraded",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Freshness of a cache entry as seen by consumers, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Staleness {
    Fresh,
    /// The push channel left `Connected`; the value may lag the server.
    Stale,
    /// Consumers should refetch.
    Invalidated,
}

/// Outcome of `emit`: sending while disconnected is a warned no-op, never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitStatus {
    Sent,
    NotConnected,
    /// The socket refused the frame; the connection is being re-established.
    WriteFailed,
}

/// Canonical causes for a push channel going away.
#[derive(Debug, Clone)]
pub enum DisconnectCause {
    HeartbeatTimeout { silent_for: Duration },
    RemoteClosed,
    ReadFailure { error: String },
    HandshakeFailed { message: String },
    HandshakeTimeout,
    AuthRejected { message: String },
    WriteFailure { error: String },
}

impl DisconnectCause {
    /// Authentication rejections are never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DisconnectCause::AuthRejected { .. })
    }
}

/// Transport-independent buffer sizing parameters used for websocket configuration.
#[derive(Clone, Copy, Debug)]
pub struct WebSocketBufferConfig {
    pub write_buffer_bytes: usize,
    pub max_write_buffer_bytes: usize,
    pub max_message_bytes: usize,
    pub max_frame_bytes: usize,
}

impl Default for WebSocketBufferConfig {
    fn default() -> Self {
        Self {
            write_buffer_bytes: 128 << 10,
            max_write_buffer_bytes: 256 << 10,
            max_message_bytes: 4 * 1024 * 1024,
            max_frame_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Basic push-channel statistics snapshot.
#[derive(Clone, Debug)]
pub struct ConnectionStats {
    pub state: ConnectionState,
    pub uptime: Duration,
    pub messages: u64,
    pub errors: u64,
    pub reconnects: u64,
    pub last_message_age: Duration,
    pub recent_errors: usize,
}

/// Cache and mutation statistics snapshot.
#[derive(Clone, Debug, Default)]
pub struct SyncStats {
    pub entries: usize,
    pub pending_mutations: usize,
    pub confirmed_mutations: u64,
    pub rolled_back_mutations: u64,
    pub stale_drops: u64,
    pub subscribers: usize,
    pub p50_mutation_latency_us: u64,
    pub p99_mutation_latency_us: u64,
    pub mutation_latency_samples: u64,
}
