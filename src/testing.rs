//! Test utilities for driving the sync engine without a real server.
//!
//! [`MockTransport`] hands every successful connect to the paired [`MockServer`] as a
//! [`MockSocket`], so tests can play the server side of the push channel across reconnects:
//! read what the client wrote, push events, or drop the socket. Connect failures can be
//! scripted ahead of time.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Sink;
use sonic_rs::{JsonValueMutTrait, JsonValueTrait, Value, json};
use tokio::sync::mpsc;

use crate::core::{
    CacheKey, EventKind, RemoteError, SyncError, SyncResult, WebSocketBufferConfig, WsFrame,
};
use crate::interfaces::{BoxFuture, PullBatch, PullSource};
use crate::sync::SyncMetricsReporter;
use crate::transport::{ConnectFuture, WsTransport};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct MockShared {
    accepted_tx: mpsc::UnboundedSender<MockSocket>,
    failures: Mutex<VecDeque<String>>,
    attempts: Mutex<Vec<String>>,
}

/// In-memory push-channel transport; see [`MockTransport::channel_pair`].
#[derive(Clone)]
pub struct MockTransport {
    shared: Arc<MockShared>,
}

impl MockTransport {
    pub fn channel_pair() -> (Self, MockServer) {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(MockShared {
            accepted_tx,
            failures: Mutex::new(VecDeque::new()),
            attempts: Mutex::new(Vec::new()),
        });
        (
            Self {
                shared: Arc::clone(&shared),
            },
            MockServer {
                shared,
                accepted_rx,
            },
        )
    }
}

impl WsTransport for MockTransport {
    type Reader = MockReader;
    type Writer = MockWriter;

    fn connect(
        &self,
        url: String,
        _buffers: WebSocketBufferConfig,
    ) -> ConnectFuture<Self::Reader, Self::Writer> {
        let shared = Arc::clone(&self.shared);
        Box::pin(async move {
            lock(&shared.attempts).push(url.clone());
            if let Some(reason) = lock(&shared.failures).pop_front() {
                return Err(SyncError::ConnectionFailed(reason));
            }

            let (sent_tx, sent_rx) = mpsc::unbounded_channel();
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            shared
                .accepted_tx
                .send(MockSocket {
                    url,
                    outbound_rx: sent_rx,
                    inbound_tx: Some(inbound_tx),
                })
                .map_err(|_| SyncError::ConnectionFailed("mock server dropped".to_string()))?;
            Ok((MockReader { rx: inbound_rx }, MockWriter { sent_tx }))
        })
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MockServerError {
    /// The inbound socket side was intentionally dropped.
    SocketDropped,
    /// The client side is no longer reading.
    ChannelClosed,
}

impl std::fmt::Display for MockServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MockServerError::SocketDropped => f.write_str("mock socket already dropped"),
            MockServerError::ChannelClosed => f.write_str("mock client channel is closed"),
        }
    }
}

impl std::error::Error for MockServerError {}

/// Server-side handle paired with [`MockTransport`].
pub struct MockServer {
    shared: Arc<MockShared>,
    accepted_rx: mpsc::UnboundedReceiver<MockSocket>,
}

impl MockServer {
    /// Make the next `count` connect attempts fail.
    pub fn fail_next(&self, count: usize, reason: &str) {
        let mut failures = lock(&self.shared.failures);
        failures.extend(std::iter::repeat_n(reason.to_string(), count));
    }

    /// URLs of every connect attempt so far, in order.
    pub fn attempted_urls(&self) -> Vec<String> {
        lock(&self.shared.attempts).clone()
    }

    pub fn attempts(&self) -> usize {
        lock(&self.shared.attempts).len()
    }

    pub async fn accept(&mut self) -> Option<MockSocket> {
        self.accepted_rx.recv().await
    }

    pub async fn accept_timeout(&mut self, timeout: Duration) -> Option<MockSocket> {
        tokio::time::timeout(timeout, self.accepted_rx.recv())
            .await
            .unwrap_or_default()
    }
}

/// Server end of one accepted connection.
pub struct MockSocket {
    url: String,
    outbound_rx: mpsc::UnboundedReceiver<WsFrame>,
    inbound_tx: Option<mpsc::UnboundedSender<WsFrame>>,
}

impl MockSocket {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn recv_outbound(&mut self) -> Option<WsFrame> {
        self.outbound_rx.recv().await
    }

    pub async fn recv_outbound_timeout(&mut self, timeout: Duration) -> Option<WsFrame> {
        tokio::time::timeout(timeout, self.outbound_rx.recv())
            .await
            .unwrap_or_default()
    }

    /// Next client envelope as `(event, data)`; `data` is `null` when absent.
    pub async fn recv_event(&mut self, timeout: Duration) -> Option<(String, Value)> {
        let frame = self.recv_outbound_timeout(timeout).await?;
        let envelope: Value = sonic_rs::from_slice(frame.data()?).ok()?;
        let event = envelope.get("event")?.as_str()?.to_string();
        let data = envelope.get("data").cloned().unwrap_or_default();
        Some((event, data))
    }

    pub fn send_inbound(&self, frame: WsFrame) -> Result<(), MockServerError> {
        let Some(tx) = self.inbound_tx.as_ref() else {
            return Err(MockServerError::SocketDropped);
        };
        tx.send(frame).map_err(|_| MockServerError::ChannelClosed)
    }

    pub fn send_text(&self, text: impl AsRef<str>) -> Result<(), MockServerError> {
        self.send_inbound(WsFrame::json(text.as_ref().as_bytes().to_vec()))
    }

    pub fn send_event(&self, event: &str, data: Value) -> Result<(), MockServerError> {
        self.send_text(json!({"event": event, "data": data}).to_string())
    }

    pub fn send_room_event(
        &self,
        room: &str,
        event: &str,
        data: Value,
    ) -> Result<(), MockServerError> {
        self.send_text(json!({"event": event, "room": room, "data": data}).to_string())
    }

    /// Push an entity event in the wire shape the server uses.
    pub fn send_entity(
        &self,
        kind: EventKind,
        key: &CacheKey,
        version: u64,
        value: Value,
    ) -> Result<(), MockServerError> {
        let mut data = json!({
            "entity": key.entity.as_str(),
            "id": key.id.as_str(),
            "version": version,
            "value": value,
        });
        if let (Some(scope), Some(object)) = (key.scope.as_deref(), data.as_object_mut()) {
            object.insert(&"scope", json!(scope));
        }
        self.send_event(kind.wire_name(), data)
    }

    pub fn accept_auth(&self) -> Result<(), MockServerError> {
        self.send_text(r#"{"event":"auth:ok"}"#)
    }

    /// Stop reading client frames; further client writes fail.
    pub fn close_outbound(&mut self) {
        self.outbound_rx.close();
    }

    /// Simulate a server-side socket drop.
    pub fn drop_socket(&mut self) {
        self.inbound_tx = None;
    }
}

pub struct MockReader {
    rx: mpsc::UnboundedReceiver<WsFrame>,
}

impl futures_util::Stream for MockReader {
    type Item = SyncResult<WsFrame>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx).map(|frame| frame.map(Ok))
    }
}

pub struct MockWriter {
    sent_tx: mpsc::UnboundedSender<WsFrame>,
}

impl Sink<WsFrame> for MockWriter {
    type Error = SyncError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: WsFrame) -> Result<(), Self::Error> {
        self.get_mut()
            .sent_tx
            .send(item)
            .map_err(|_| SyncError::TransportError {
                context: "mock_transport_write",
                error: "mock outbound channel closed".to_string(),
            })
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
}

/// Pull source that replays queued results, then returns empty batches.
#[derive(Default)]
pub struct ScriptedPullSource {
    queue: Mutex<VecDeque<Result<PullBatch, RemoteError>>>,
    pulls: AtomicU64,
}

impl ScriptedPullSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, result: Result<PullBatch, RemoteError>) {
        lock(&self.queue).push_back(result);
    }

    pub fn pulls(&self) -> u64 {
        self.pulls.load(Ordering::Acquire)
    }
}

impl PullSource for ScriptedPullSource {
    fn pull(&self) -> BoxFuture<Result<PullBatch, RemoteError>> {
        self.pulls.fetch_add(1, Ordering::AcqRel);
        let next = lock(&self.queue).pop_front().unwrap_or_else(|| Ok(PullBatch::default()));
        Box::pin(async move { next })
    }
}

/// Metrics reporter that only counts.
#[derive(Debug, Default)]
pub struct CountingMetrics {
    pub reconnects: AtomicU64,
    pub stale_drops: AtomicU64,
    pub rollbacks: AtomicU64,
    pub subscriber_failures: AtomicU64,
    pub malformed_payloads: AtomicU64,
    pub latency_samples: AtomicU64,
}

impl CountingMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Acquire)
    }
}

impl SyncMetricsReporter for CountingMetrics {
    fn track_reconnect(&self, _connection: &str, _attempt: u32) {
        self.reconnects.fetch_add(1, Ordering::AcqRel);
    }

    fn track_stale_drop(&self, _key: &CacheKey) {
        self.stale_drops.fetch_add(1, Ordering::AcqRel);
    }

    fn track_rollback(&self, _key: &CacheKey) {
        self.rollbacks.fetch_add(1, Ordering::AcqRel);
    }

    fn track_subscriber_failure(&self, _kind: EventKind, failures: usize) {
        self.subscriber_failures
            .fetch_add(failures as u64, Ordering::AcqRel);
    }

    fn track_malformed_payload(&self, _context: &'static str) {
        self.malformed_payloads.fetch_add(1, Ordering::AcqRel);
    }

    fn observe_mutation_latency_us(&self, _latency_us: u64) {
        self.latency_samples.fetch_add(1, Ordering::AcqRel);
    }
}
