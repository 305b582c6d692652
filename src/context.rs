//! The per-application sync context.
//!
//! A `SyncContext` owns one engine, one push-channel connection and one fallback poller, and
//! is the only public entry point into them. Construct one explicitly per application (and a
//! fresh one per test); there is no global instance.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use kameo::prelude::{Actor, ActorRef};
use sonic_rs::Value;
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::core::{
    CacheChange, CacheEntry, CacheKey, CallbackError, ConnectionState, ConnectionStats,
    EmitStatus, EventKind, HealthSnapshot, KeyPattern, MutationError, RemoteError, RoutedEvent,
    SharedClock, SubscriptionToken, SyncResult, SyncStats, Version, WriteOutcome,
    encode_entity_event, encode_envelope, system_clock,
};
use crate::interfaces::{Credentials, CredentialsProvider, PullSource};
use crate::sync::{
    ApplyPatch, Arm, BeginCreate, BeginMutation, Connect, ConnectionActor, ConnectionArgs,
    Disarm, Disconnect, Emit, EngineArgs, FallbackPoller, GetConnectionStats, GetEntry,
    GetHealthSnapshot, GetJoinedRooms, GetPollerStatus, GetSyncStats, Invalidate, JoinRoom,
    LeaveRoom, MutationResolution, MutationTicket, PollerArgs, PollerStatus, Reconnect,
    ResolveMutation, Subscribe, SyncEngine, SyncMetricsHook, Unsubscribe, map_send_error,
};
use crate::transport::WsTransport;
use crate::transport::tungstenite::TungsteniteTransport;

/// Server-confirmed outcome of a mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmedMutation {
    pub key: CacheKey,
    pub value: Value,
    pub version: Version,
    /// Temporary key the entity was created under, when the server assigned a new id.
    pub promoted_from: Option<CacheKey>,
}

/// Returned by `mutate`/`create` as soon as the speculative value is in the cache.
pub struct MutationHandle {
    key: CacheKey,
    pending_value: Value,
    outcome: oneshot::Receiver<Result<ConfirmedMutation, MutationError>>,
}

impl MutationHandle {
    /// Key the speculative value lives under (a `tmp-` key for creates).
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn pending_value(&self) -> &Value {
        &self.pending_value
    }

    /// Resolves once the remote call has been reconciled. On rejection the cache has already
    /// been restored to its prior snapshot.
    pub async fn confirmed(self) -> Result<ConfirmedMutation, MutationError> {
        self.outcome.await.unwrap_or_else(|_| {
            Err(MutationError::Abandoned {
                reason: "mutation driver stopped".to_string(),
            })
        })
    }
}

#[derive(Debug, Clone)]
pub struct ContextStats {
    pub sync: SyncStats,
    pub connection: ConnectionStats,
    pub fallback: PollerStatus,
}

pub struct SyncContextBuilder<T: WsTransport> {
    config: SyncConfig,
    transport: T,
    pull_source: Option<Arc<dyn PullSource>>,
    credentials: Option<Arc<dyn CredentialsProvider>>,
    metrics: Option<SyncMetricsHook>,
    clock: SharedClock,
}

impl<T: WsTransport> SyncContextBuilder<T> {
    pub fn transport<U: WsTransport>(self, transport: U) -> SyncContextBuilder<U> {
        SyncContextBuilder {
            config: self.config,
            transport,
            pull_source: self.pull_source,
            credentials: self.credentials,
            metrics: self.metrics,
            clock: self.clock,
        }
    }

    pub fn pull_source(mut self, source: Arc<dyn PullSource>) -> Self {
        self.pull_source = Some(source);
        self
    }

    pub fn credentials(mut self, provider: Arc<dyn CredentialsProvider>) -> Self {
        self.credentials = Some(provider);
        self
    }

    pub fn metrics(mut self, metrics: SyncMetricsHook) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Spawn the actors. Must be called inside a tokio runtime.
    pub fn build(self) -> SyncContext<T> {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (changes_tx, _) = broadcast::channel(self.config.change_capacity.max(1));

        let engine = SyncEngine::spawn(EngineArgs {
            clock: self.clock.clone(),
            coalesce_window: self.config.coalesce_window,
            mutation_buffer: self.config.mutation_buffer,
            tombstone_capacity: self.config.tombstone_capacity,
            changes_tx: changes_tx.clone(),
            connection_rx: state_rx.clone(),
            metrics: self.metrics.clone(),
        });
        let connection = ConnectionActor::<T>::spawn(ConnectionArgs {
            transport: self.transport,
            engine: engine.clone(),
            state_tx,
            policy: self.config.backoff.clone(),
            heartbeat_timeout: self.config.heartbeat_timeout,
            handshake_timeout: self.config.handshake_timeout,
            buffers: self.config.buffers,
            clock: self.clock,
            metrics: self.metrics,
        });
        let poller = FallbackPoller::spawn(PollerArgs {
            engine: engine.clone(),
            state_rx: state_rx.clone(),
            source: self.pull_source,
            poll_interval: self.config.poll_interval,
        });

        SyncContext {
            config: self.config,
            engine,
            connection,
            poller,
            state_rx,
            changes_tx,
            credentials: self.credentials,
        }
    }
}

pub struct SyncContext<T: WsTransport = TungsteniteTransport> {
    config: SyncConfig,
    engine: ActorRef<SyncEngine>,
    connection: ActorRef<ConnectionActor<T>>,
    poller: ActorRef<FallbackPoller>,
    state_rx: watch::Receiver<ConnectionState>,
    changes_tx: broadcast::Sender<CacheChange>,
    credentials: Option<Arc<dyn CredentialsProvider>>,
}

impl SyncContext<TungsteniteTransport> {
    pub fn builder(config: SyncConfig) -> SyncContextBuilder<TungsteniteTransport> {
        SyncContextBuilder {
            config,
            transport: TungsteniteTransport::default(),
            pull_source: None,
            credentials: None,
            metrics: None,
            clock: system_clock(),
        }
    }
}

impl<T: WsTransport> SyncContext<T> {
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    // Event router

    pub async fn subscribe<F>(
        &self,
        kind: EventKind,
        room: Option<&str>,
        callback: F,
    ) -> SyncResult<SubscriptionToken>
    where
        F: Fn(&RoutedEvent) -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        self.engine
            .ask(Subscribe {
                kind,
                room: room.map(str::to_string),
                callback: Box::new(callback),
            })
            .await
            .map_err(map_send_error)
    }

    /// Idempotent; `false` when the token was already gone.
    pub async fn unsubscribe(&self, token: SubscriptionToken) -> SyncResult<bool> {
        self.engine
            .ask(Unsubscribe(token))
            .await
            .map_err(map_send_error)
    }

    // Connection manager

    /// Start connecting to `url` (then the configured fallbacks). Connectivity failures are
    /// reported through `watch_connection`, never returned here.
    pub async fn connect(
        &self,
        url: &str,
        credentials: Option<Credentials>,
    ) -> SyncResult<ConnectionState> {
        let endpoints = self.config.endpoints(Some(url));
        self.connection
            .ask(Connect {
                endpoints,
                credentials,
            })
            .await
            .map_err(map_send_error)
    }

    /// Connect using the configured URL and the credentials provider, if any.
    pub async fn connect_with_config(&self) -> SyncResult<ConnectionState> {
        let credentials = self
            .credentials
            .as_ref()
            .and_then(|provider| provider.credentials());
        self.connection
            .ask(Connect {
                endpoints: self.config.endpoints(None),
                credentials,
            })
            .await
            .map_err(map_send_error)
    }

    pub async fn disconnect(&self) -> SyncResult<()> {
        self.connection
            .ask(Disconnect)
            .await
            .map_err(map_send_error)
    }

    pub async fn reconnect(&self) -> SyncResult<ConnectionState> {
        self.connection
            .ask(Reconnect)
            .await
            .map_err(map_send_error)
    }

    pub async fn emit(&self, event: &str, data: Option<Value>) -> SyncResult<EmitStatus> {
        let frame = encode_envelope(event, data.as_ref())?;
        self.connection
            .ask(Emit {
                event: event.to_string(),
                frame: Bytes::from(frame),
            })
            .await
            .map_err(map_send_error)
    }

    pub async fn join_room(&self, room: &str) -> SyncResult<()> {
        self.connection
            .ask(JoinRoom(room.to_string()))
            .await
            .map_err(map_send_error)
    }

    pub async fn leave_room(&self, room: &str) -> SyncResult<()> {
        self.connection
            .ask(LeaveRoom(room.to_string()))
            .await
            .map_err(map_send_error)
    }

    pub async fn joined_rooms(&self) -> SyncResult<Vec<String>> {
        self.connection
            .ask(GetJoinedRooms)
            .await
            .map_err(map_send_error)
    }

    pub fn connection_status(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    // Optimistic mutations

    /// Apply `diff` speculatively to `key`, then reconcile with `remote_call`'s outcome.
    ///
    /// Fails fast with `MutationInFlight` when `key` already has a pending mutation. The
    /// remote call runs on a spawned task; it is never retried.
    pub async fn mutate<F, Fut>(
        &self,
        key: CacheKey,
        diff: Value,
        remote_call: F,
    ) -> SyncResult<MutationHandle>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, RemoteError>> + Send + 'static,
    {
        let ticket = self
            .engine
            .ask(BeginMutation { key, diff })
            .await
            .map_err(map_send_error)?;
        Ok(self.drive(ticket, EventKind::EntityUpdated, remote_call))
    }

    /// Insert `value` under a temporary id; the server's `id` replaces it on confirmation.
    pub async fn create<F, Fut>(
        &self,
        entity: &str,
        scope: Option<&str>,
        value: Value,
        remote_call: F,
    ) -> SyncResult<MutationHandle>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, RemoteError>> + Send + 'static,
    {
        let ticket = self
            .engine
            .ask(BeginCreate {
                entity: entity.to_string(),
                scope: scope.map(str::to_string),
                value,
            })
            .await
            .map_err(map_send_error)?;
        Ok(self.drive(ticket, EventKind::EntityCreated, remote_call))
    }

    fn drive<F, Fut>(
        &self,
        ticket: MutationTicket,
        announce: EventKind,
        remote_call: F,
    ) -> MutationHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, RemoteError>> + Send + 'static,
    {
        let MutationTicket {
            id,
            key,
            pending_value,
        } = ticket;
        let engine = self.engine.clone();
        let connection = self.connection.clone();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let outcome = remote_call().await;
            let resolution = engine
                .ask(ResolveMutation { id, outcome })
                .await
                .map_err(map_send_error);
            let result = match resolution {
                Ok(MutationResolution::Confirmed {
                    key,
                    value,
                    version,
                    promoted_from,
                }) => {
                    broadcast_confirmed(&connection, announce, &key, version, &value).await;
                    Ok(ConfirmedMutation {
                        key,
                        value,
                        version,
                        promoted_from,
                    })
                }
                Ok(MutationResolution::RolledBack { key, error }) => Err(MutationError::Rejected {
                    key: key.to_string(),
                    source: error,
                }),
                Err(err) => Err(MutationError::Abandoned {
                    reason: err.to_string(),
                }),
            };
            // The caller may have dropped the handle; the cache is reconciled either way.
            let _ = tx.send(result);
        });

        MutationHandle {
            key,
            pending_value,
            outcome: rx,
        }
    }

    // Cache

    pub async fn get_snapshot(&self, key: &CacheKey) -> SyncResult<Option<CacheEntry>> {
        self.engine
            .ask(GetEntry(key.clone()))
            .await
            .map_err(map_send_error)
    }

    pub async fn apply_patch(
        &self,
        key: CacheKey,
        diff: Value,
        version: Version,
    ) -> SyncResult<WriteOutcome> {
        self.engine
            .ask(ApplyPatch { key, diff, version })
            .await
            .map_err(map_send_error)
    }

    pub async fn invalidate(&self, pattern: KeyPattern) -> SyncResult<Vec<CacheKey>> {
        self.engine
            .ask(Invalidate(pattern))
            .await
            .map_err(map_send_error)
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<CacheChange> {
        self.changes_tx.subscribe()
    }

    pub async fn health_snapshot(&self) -> SyncResult<Option<HealthSnapshot>> {
        self.engine
            .ask(GetHealthSnapshot)
            .await
            .map_err(map_send_error)
    }

    // Fallback poller

    /// Arm pull-based refresh; it starts once the push channel has been down for `after`
    /// (the configured delay when `None`).
    pub async fn activate_fallback(&self, after: Option<Duration>) -> SyncResult<()> {
        let after = after.unwrap_or(self.config.fallback_after);
        self.poller
            .ask(Arm { after })
            .await
            .map_err(map_send_error)
    }

    pub async fn deactivate_fallback(&self) -> SyncResult<()> {
        self.poller.ask(Disarm).await.map_err(map_send_error)
    }

    pub async fn fallback_status(&self) -> SyncResult<PollerStatus> {
        self.poller
            .ask(GetPollerStatus)
            .await
            .map_err(map_send_error)
    }

    pub async fn stats(&self) -> SyncResult<ContextStats> {
        let sync = self.engine.ask(GetSyncStats).await.map_err(map_send_error)?;
        let connection = self
            .connection
            .ask(GetConnectionStats)
            .await
            .map_err(map_send_error)?;
        let fallback = self
            .poller
            .ask(GetPollerStatus)
            .await
            .map_err(map_send_error)?;
        Ok(ContextStats {
            sync,
            connection,
            fallback,
        })
    }

    /// Disconnect and stop every actor. Pending mutations resolve as abandoned.
    pub async fn shutdown(self) {
        if let Err(err) = self.disconnect().await {
            debug!(error = %err, "disconnect during shutdown failed");
        }
        let _ = self.poller.stop_gracefully().await;
        self.poller.wait_for_shutdown().await;
        let _ = self.connection.stop_gracefully().await;
        self.connection.wait_for_shutdown().await;
        let _ = self.engine.stop_gracefully().await;
        self.engine.wait_for_shutdown().await;
        info!("sync context shut down");
    }
}

/// Tell other clients about a confirmed mutation. Skipped (with the emit warning) while the
/// push channel is down.
async fn broadcast_confirmed<T: WsTransport>(
    connection: &ActorRef<ConnectionActor<T>>,
    kind: EventKind,
    key: &CacheKey,
    version: Version,
    value: &Value,
) {
    let frame = match encode_entity_event(kind, key, version, value) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(key = %key, error = %err, "failed to encode confirmed mutation");
            return;
        }
    };
    let emit = Emit {
        event: kind.wire_name().to_string(),
        frame: Bytes::from(frame),
    };
    match connection.ask(emit).await.map_err(map_send_error) {
        Ok(_) => {}
        Err(err) => debug!(key = %key, error = %err, "confirmed mutation broadcast failed"),
    }
}
