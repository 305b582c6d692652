//! Push-channel connection actor.
//!
//! Socket reads, timers and connect attempts run on spawned tasks that report back by
//! message; the actor owns lifecycle state, the joined-room set and the writer. Every
//! internal message carries the connection generation it was produced for, and the
//! generation is bumped on every teardown, so nothing queued by a torn-down connection is
//! ever acted upon.

use std::collections::BTreeSet;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use kameo::prelude::{Actor, ActorRef, Context, Message as KameoMessage, WeakActorRef};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::engine::{ConnectionChanged, InboundEvent, SyncEngine};
use super::writer::{FrameWriter, WriteBatch, WriteFrame};
use super::{SyncMetricsHook, map_send_error};
use crate::core::{
    BackoffPolicy, ConnectionLifecycle, ConnectionState, ConnectionStats, DisconnectCause,
    EmitStatus, LivenessMonitor, ReconnectPlan, RoutedEvent, SharedClock, SyncError, SyncEvent,
    SyncResult, WebSocketBufferConfig, WsFrame, decode_event, encode_envelope, encode_room_join,
    encode_room_leave,
};
use crate::interfaces::Credentials;
use crate::transport::WsTransport;

const MIN_LIVENESS_TICK: Duration = Duration::from_millis(10);

pub struct ConnectionArgs<T: WsTransport> {
    pub transport: T,
    pub engine: ActorRef<SyncEngine>,
    pub state_tx: watch::Sender<ConnectionState>,
    pub policy: BackoffPolicy,
    pub heartbeat_timeout: Duration,
    pub handshake_timeout: Duration,
    pub buffers: WebSocketBufferConfig,
    pub clock: SharedClock,
    pub metrics: Option<SyncMetricsHook>,
}

pub struct ConnectionActor<T: WsTransport> {
    transport: T,
    engine: ActorRef<SyncEngine>,
    actor_ref: ActorRef<Self>,
    state_tx: watch::Sender<ConnectionState>,
    lifecycle: ConnectionLifecycle<BackoffPolicy>,
    liveness: LivenessMonitor,
    handshake_timeout: Duration,
    buffers: WebSocketBufferConfig,
    metrics: Option<SyncMetricsHook>,
    credentials: Option<Credentials>,
    rooms: BTreeSet<String>,
    generation: u64,
    awaiting_auth: bool,
    writer: Option<ActorRef<FrameWriter<T::Writer>>>,
    writer_shutdown: watch::Sender<bool>,
    reader_task: Option<JoinHandle<()>>,
    liveness_task: Option<JoinHandle<()>>,
    handshake_task: Option<JoinHandle<()>>,
    retry_task: Option<JoinHandle<()>>,
    connect_task: Option<JoinHandle<()>>,
}

impl<T: WsTransport> Actor for ConnectionActor<T> {
    type Args = ConnectionArgs<T>;
    type Error = SyncError;

    fn name() -> &'static str {
        "ConnectionActor"
    }

    async fn on_start(args: Self::Args, ctx: ActorRef<Self>) -> SyncResult<Self> {
        let ConnectionArgs {
            transport,
            engine,
            state_tx,
            policy,
            heartbeat_timeout,
            handshake_timeout,
            buffers,
            clock,
            metrics,
        } = args;

        let (writer_shutdown, _) = watch::channel(false);
        Ok(Self {
            transport,
            engine,
            actor_ref: ctx,
            state_tx,
            lifecycle: ConnectionLifecycle::new(policy),
            liveness: LivenessMonitor::new(heartbeat_timeout, clock),
            handshake_timeout,
            buffers,
            metrics,
            credentials: None,
            rooms: BTreeSet::new(),
            generation: 0,
            awaiting_auth: false,
            writer: None,
            writer_shutdown,
            reader_task: None,
            liveness_task: None,
            handshake_task: None,
            retry_task: None,
            connect_task: None,
        })
    }

    async fn on_stop(
        &mut self,
        _ctx: WeakActorRef<Self>,
        _reason: kameo::error::ActorStopReason,
    ) -> SyncResult<()> {
        self.teardown_io().await;
        self.lifecycle.teardown();
        self.state_tx.send_replace(ConnectionState::Disconnected);
        Ok(())
    }
}

impl<T: WsTransport> ConnectionActor<T> {
    fn connection_label(&self) -> &str {
        self.lifecycle.current_endpoint().unwrap_or("<unset>")
    }

    async fn publish(&mut self, state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
        if !changed {
            return;
        }
        debug!(connection = %self.connection_label(), state = %state, "push channel state");
        if let Err(err) = self.engine.tell(ConnectionChanged { state }).send().await {
            debug!(error = %err, "engine unavailable for state change");
        }
    }

    /// Cancel every task and the writer belonging to the current connection.
    async fn teardown_io(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.awaiting_auth = false;
        for task in [
            self.reader_task.take(),
            self.liveness_task.take(),
            self.handshake_task.take(),
            self.retry_task.take(),
            self.connect_task.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }

        self.writer_shutdown.send_replace(true);
        if let Some(writer) = self.writer.take() {
            let _ = writer.stop_gracefully().await;
            writer.wait_for_shutdown().await;
        }
    }

    fn start_attempt(&mut self) -> ConnectionState {
        let Some(url) = self.lifecycle.current_endpoint().map(str::to_string) else {
            return self.lifecycle.state();
        };
        let state = self.lifecycle.begin_attempt();
        let generation = self.generation;
        info!(
            connection = %url,
            attempt = self.lifecycle.attempts(),
            "opening push channel"
        );

        let transport = self.transport.clone();
        let buffers = self.buffers;
        let actor_ref = self.actor_ref.clone();
        self.connect_task = Some(tokio::spawn(async move {
            match transport.connect(url, buffers).await {
                Ok((reader, writer)) => {
                    let _ = actor_ref
                        .tell(TransportOpened::<T> {
                            generation,
                            reader,
                            writer,
                        })
                        .send()
                        .await;
                }
                Err(err) => {
                    let _ = actor_ref
                        .tell(TransportFailed {
                            generation,
                            error: err.to_string(),
                        })
                        .send()
                        .await;
                }
            }
        }));

        let timeout = self.handshake_timeout;
        let actor_ref = self.actor_ref.clone();
        self.handshake_task = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = actor_ref.tell(HandshakeExpired { generation }).send().await;
        }));

        state
    }

    fn spawn_reader(&self, mut reader: T::Reader) -> JoinHandle<()> {
        let generation = self.generation;
        let actor_ref = self.actor_ref.clone();
        tokio::spawn(async move {
            let cause = loop {
                match reader.next().await {
                    Some(Ok(WsFrame::Close(frame))) => {
                        debug!(close = ?frame, "push channel close frame");
                        break DisconnectCause::RemoteClosed;
                    }
                    Some(Ok(frame)) => {
                        if actor_ref
                            .tell(FrameReceived { generation, frame })
                            .send()
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Some(Err(err)) => {
                        break DisconnectCause::ReadFailure {
                            error: err.to_string(),
                        };
                    }
                    None => break DisconnectCause::RemoteClosed,
                }
            };
            let _ = actor_ref.tell(ReaderClosed { generation, cause }).send().await;
        })
    }

    fn spawn_liveness_ticker(&self) -> JoinHandle<()> {
        let generation = self.generation;
        let actor_ref = self.actor_ref.clone();
        let period = (self.liveness.heartbeat_timeout() / 4).max(MIN_LIVENESS_TICK);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if actor_ref
                    .tell(LivenessCheck { generation })
                    .send()
                    .await
                    .is_err()
                {
                    break;
                }
            }
        })
    }

    async fn send_frame(&mut self, frame: WsFrame) -> SyncResult<()> {
        let Some(writer) = self.writer.as_ref() else {
            return Err(SyncError::InvalidState(
                "push channel writer not ready".to_string(),
            ));
        };
        writer.ask(WriteFrame { frame }).await.map_err(map_send_error)
    }

    async fn on_transport_opened(&mut self, reader: T::Reader, writer: T::Writer) {
        self.connect_task = None;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.writer_shutdown = shutdown_tx;
        self.writer = Some(FrameWriter::spawn(FrameWriter::new(writer, shutdown_rx)));
        self.liveness.reset();
        self.reader_task = Some(self.spawn_reader(reader));
        self.liveness_task = Some(self.spawn_liveness_ticker());

        let Some(credentials) = self.credentials.clone() else {
            self.handshake_complete().await;
            return;
        };

        let frame = match encode_envelope("auth", Some(&credentials)) {
            Ok(bytes) => WsFrame::json(bytes),
            Err(err) => {
                self.handle_failure(DisconnectCause::HandshakeFailed {
                    message: err.to_string(),
                })
                .await;
                return;
            }
        };
        self.awaiting_auth = true;
        if let Err(err) = self.send_frame(frame).await {
            self.handle_failure(DisconnectCause::WriteFailure {
                error: err.to_string(),
            })
            .await;
        }
    }

    async fn handshake_complete(&mut self) {
        self.awaiting_auth = false;
        if let Some(task) = self.handshake_task.take() {
            task.abort();
        }
        let state = self.lifecycle.handshake_accepted();
        self.publish(state).await;
        info!(
            connection = %self.connection_label(),
            reconnects = self.lifecycle.reconnects(),
            rooms = self.rooms.len(),
            "push channel connected"
        );

        if self.rooms.is_empty() {
            return;
        }
        let frames: SyncResult<Vec<WsFrame>> = self
            .rooms
            .iter()
            .map(|room| encode_room_join(room).map(WsFrame::json))
            .collect();
        let result = match (frames, self.writer.as_ref()) {
            (Ok(frames), Some(writer)) => writer
                .ask(WriteBatch { frames })
                .await
                .map_err(map_send_error),
            (Err(err), _) => Err(err),
            (Ok(_), None) => Ok(()),
        };
        if let Err(err) = result {
            self.handle_failure(DisconnectCause::WriteFailure {
                error: err.to_string(),
            })
            .await;
        }
    }

    async fn route(&mut self, routed: RoutedEvent) {
        match &routed.event {
            SyncEvent::AuthAccepted if self.awaiting_auth => {
                self.handshake_complete().await;
            }
            SyncEvent::AuthRejected { message, code } => {
                error!(
                    connection = %self.connection_label(),
                    code = ?code,
                    reason = %message,
                    "push channel authentication rejected"
                );
                let cause = DisconnectCause::AuthRejected {
                    message: message.clone(),
                };
                self.forward(routed).await;
                self.handle_failure(cause).await;
                return;
            }
            _ => {}
        }

        if self.lifecycle.state() != ConnectionState::Connected {
            debug!(
                event = routed.event.kind().wire_name(),
                "dropping event received before handshake"
            );
            return;
        }
        self.forward(routed).await;
    }

    async fn forward(&self, routed: RoutedEvent) {
        if let Err(err) = self.engine.tell(InboundEvent(routed)).send().await {
            warn!(error = %err, "engine unavailable for inbound event");
        }
    }

    /// Tear the current connection down and follow the lifecycle's plan.
    async fn handle_failure(&mut self, cause: DisconnectCause) {
        let was_connected = self.lifecycle.state() == ConnectionState::Connected;
        self.liveness
            .record_error(failure_context(&cause), &format!("{cause:?}"));
        self.teardown_io().await;

        let plan = if was_connected {
            self.lifecycle.connection_lost(&cause)
        } else {
            if !cause.is_fatal() {
                self.publish(ConnectionState::Error).await;
            }
            self.lifecycle.attempt_failed(&cause)
        };
        let state = self.lifecycle.state();
        self.publish(state).await;

        match plan {
            ReconnectPlan::RetryAfter { delay, endpoint } => {
                self.liveness.increment_reconnect();
                let attempt = self.lifecycle.attempts();
                if let Some(metrics) = self.metrics.as_ref() {
                    metrics.track_reconnect(self.connection_label(), attempt);
                }
                warn!(
                    connection = %self.connection_label(),
                    cause = ?cause,
                    attempt,
                    endpoint,
                    delay_ms = delay.as_millis().min(u64::MAX as u128) as u64,
                    "push channel reconnect scheduled"
                );
                let generation = self.generation;
                let actor_ref = self.actor_ref.clone();
                self.retry_task = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = actor_ref.tell(RetryDue { generation }).send().await;
                }));
            }
            ReconnectPlan::Degraded => {
                warn!(
                    connection = %self.connection_label(),
                    cause = ?cause,
                    attempts = self.lifecycle.attempts(),
                    "push channel degraded; waiting for explicit reconnect"
                );
            }
            ReconnectPlan::Fatal => {
                error!(
                    connection = %self.connection_label(),
                    cause = ?cause,
                    "push channel failed permanently; waiting for explicit reconnect"
                );
            }
        }
    }
}

fn failure_context(cause: &DisconnectCause) -> &'static str {
    match cause {
        DisconnectCause::HeartbeatTimeout { .. } => "heartbeat",
        DisconnectCause::RemoteClosed => "remote_closed",
        DisconnectCause::ReadFailure { .. } => "read",
        DisconnectCause::HandshakeFailed { .. } => "connect",
        DisconnectCause::HandshakeTimeout => "handshake_timeout",
        DisconnectCause::AuthRejected { .. } => "auth",
        DisconnectCause::WriteFailure { .. } => "write",
    }
}

/// Open the push channel against `endpoints` (primary first). Connectivity failures are
/// never returned; they drive the state machine instead.
pub struct Connect {
    pub endpoints: Vec<String>,
    pub credentials: Option<Credentials>,
}

impl<T: WsTransport> KameoMessage<Connect> for ConnectionActor<T> {
    type Reply = SyncResult<ConnectionState>;

    async fn handle(&mut self, msg: Connect, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        if msg.endpoints.is_empty() {
            return Err(SyncError::InvalidState(
                "no push channel endpoint configured".to_string(),
            ));
        }
        self.teardown_io().await;
        self.lifecycle.teardown();
        self.lifecycle.set_endpoints(msg.endpoints);
        self.credentials = msg.credentials;
        let state = self.start_attempt();
        self.publish(state).await;
        Ok(state)
    }
}

pub struct Disconnect;

impl<T: WsTransport> KameoMessage<Disconnect> for ConnectionActor<T> {
    type Reply = SyncResult<()>;

    async fn handle(
        &mut self,
        _msg: Disconnect,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.teardown_io().await;
        self.rooms.clear();
        let state = self.lifecycle.teardown();
        self.publish(state).await;
        info!(connection = %self.connection_label(), "push channel disconnected");
        Ok(())
    }
}

/// Explicit reconnect; the only way out of `Degraded` and `Error`.
pub struct Reconnect;

impl<T: WsTransport> KameoMessage<Reconnect> for ConnectionActor<T> {
    type Reply = SyncResult<ConnectionState>;

    async fn handle(
        &mut self,
        _msg: Reconnect,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if !self.lifecycle.has_endpoints() {
            return Err(SyncError::InvalidState(
                "reconnect before connect".to_string(),
            ));
        }
        self.teardown_io().await;
        self.lifecycle.manual_reconnect();
        let state = self.start_attempt();
        self.publish(state).await;
        Ok(state)
    }
}

/// Send a pre-encoded envelope. A no-op (with a warning) unless connected.
pub struct Emit {
    pub event: String,
    pub frame: Bytes,
}

impl<T: WsTransport> KameoMessage<Emit> for ConnectionActor<T> {
    type Reply = SyncResult<EmitStatus>;

    async fn handle(&mut self, msg: Emit, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let state = self.lifecycle.state();
        if state != ConnectionState::Connected {
            warn!(
                event = %msg.event,
                state = %state,
                "emit while push channel not connected; dropped"
            );
            return Ok(EmitStatus::NotConnected);
        }
        match self.send_frame(WsFrame::json(msg.frame)).await {
            Ok(()) => Ok(EmitStatus::Sent),
            Err(err) => {
                warn!(event = %msg.event, error = %err, "emit write failed; dropped");
                self.handle_failure(DisconnectCause::WriteFailure {
                    error: err.to_string(),
                })
                .await;
                Ok(EmitStatus::WriteFailed)
            }
        }
    }
}

pub struct JoinRoom(pub String);

impl<T: WsTransport> KameoMessage<JoinRoom> for ConnectionActor<T> {
    type Reply = SyncResult<()>;

    async fn handle(
        &mut self,
        msg: JoinRoom,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let frame = WsFrame::json(encode_room_join(&msg.0)?);
        if !self.rooms.insert(msg.0) || self.lifecycle.state() != ConnectionState::Connected {
            return Ok(());
        }
        if let Err(err) = self.send_frame(frame).await {
            self.handle_failure(DisconnectCause::WriteFailure {
                error: err.to_string(),
            })
            .await;
            return Err(err);
        }
        Ok(())
    }
}

pub struct LeaveRoom(pub String);

impl<T: WsTransport> KameoMessage<LeaveRoom> for ConnectionActor<T> {
    type Reply = SyncResult<()>;

    async fn handle(
        &mut self,
        msg: LeaveRoom,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let frame = WsFrame::json(encode_room_leave(&msg.0)?);
        if !self.rooms.remove(&msg.0) || self.lifecycle.state() != ConnectionState::Connected {
            return Ok(());
        }
        if let Err(err) = self.send_frame(frame).await {
            self.handle_failure(DisconnectCause::WriteFailure {
                error: err.to_string(),
            })
            .await;
            return Err(err);
        }
        Ok(())
    }
}

pub struct GetConnectionStats;

impl<T: WsTransport> KameoMessage<GetConnectionStats> for ConnectionActor<T> {
    type Reply = SyncResult<ConnectionStats>;

    async fn handle(
        &mut self,
        _msg: GetConnectionStats,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.liveness.stats(self.lifecycle.state()))
    }
}

pub struct GetJoinedRooms;

impl<T: WsTransport> KameoMessage<GetJoinedRooms> for ConnectionActor<T> {
    type Reply = SyncResult<Vec<String>>;

    async fn handle(
        &mut self,
        _msg: GetJoinedRooms,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.rooms.iter().cloned().collect())
    }
}

pub(crate) struct TransportOpened<T: WsTransport> {
    generation: u64,
    reader: T::Reader,
    writer: T::Writer,
}

impl<T: WsTransport> KameoMessage<TransportOpened<T>> for ConnectionActor<T> {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: TransportOpened<T>,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if msg.generation != self.generation {
            debug!(generation = msg.generation, "discarding transport from stale attempt");
            return;
        }
        self.on_transport_opened(msg.reader, msg.writer).await;
    }
}

pub(crate) struct TransportFailed {
    generation: u64,
    error: String,
}

impl<T: WsTransport> KameoMessage<TransportFailed> for ConnectionActor<T> {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: TransportFailed,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if msg.generation != self.generation {
            return;
        }
        self.connect_task = None;
        self.handle_failure(DisconnectCause::HandshakeFailed { message: msg.error })
            .await;
    }
}

pub(crate) struct FrameReceived {
    generation: u64,
    frame: WsFrame,
}

impl<T: WsTransport> KameoMessage<FrameReceived> for ConnectionActor<T> {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: FrameReceived,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if msg.generation != self.generation {
            return;
        }
        self.liveness.record_inbound();
        let Some(payload) = msg.frame.data() else {
            return;
        };
        match decode_event(payload) {
            Ok(Some(routed)) => self.route(routed).await,
            Ok(None) => {}
            Err(err) => {
                warn!(
                    connection = %self.connection_label(),
                    error = %err,
                    payload_len = payload.len(),
                    "dropping malformed push payload"
                );
                self.liveness.record_error("decode", &err.to_string());
                if let Some(metrics) = self.metrics.as_ref() {
                    metrics.track_malformed_payload("push_event");
                }
            }
        }
    }
}

pub(crate) struct ReaderClosed {
    generation: u64,
    cause: DisconnectCause,
}

impl<T: WsTransport> KameoMessage<ReaderClosed> for ConnectionActor<T> {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: ReaderClosed,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if msg.generation != self.generation {
            return;
        }
        self.reader_task = None;
        self.handle_failure(msg.cause).await;
    }
}

pub(crate) struct LivenessCheck {
    generation: u64,
}

impl<T: WsTransport> KameoMessage<LivenessCheck> for ConnectionActor<T> {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: LivenessCheck,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if msg.generation != self.generation || !self.liveness.is_stale() {
            return;
        }
        let silent_for = self.liveness.silent_for();
        self.handle_failure(DisconnectCause::HeartbeatTimeout { silent_for })
            .await;
    }
}

pub(crate) struct HandshakeExpired {
    generation: u64,
}

impl<T: WsTransport> KameoMessage<HandshakeExpired> for ConnectionActor<T> {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: HandshakeExpired,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if msg.generation != self.generation
            || self.lifecycle.state() == ConnectionState::Connected
        {
            return;
        }
        self.handshake_task = None;
        self.handle_failure(DisconnectCause::HandshakeTimeout).await;
    }
}

pub(crate) struct RetryDue {
    generation: u64,
}

impl<T: WsTransport> KameoMessage<RetryDue> for ConnectionActor<T> {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: RetryDue,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if msg.generation != self.generation {
            return;
        }
        self.retry_task = None;
        let state = self.start_attempt();
        self.publish(state).await;
    }
}
