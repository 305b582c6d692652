use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use clinic_sync::core::BackoffPolicy;
use clinic_sync::testing::{MockServer, MockSocket, MockTransport};
use clinic_sync::{ConnectionState, Credentials, EmitStatus, EventKind, SyncConfig, SyncContext};
use sonic_rs::{JsonValueTrait, json};

const PRIMARY: &str = "wss://sync.clinic.test/ws";
const FALLBACK: &str = "wss://sync-backup.clinic.test/ws";
const WAIT: Duration = Duration::from_secs(120);

fn config() -> SyncConfig {
    SyncConfig {
        backoff: BackoffPolicy::default(),
        ..SyncConfig::default()
    }
}

fn context(config: SyncConfig) -> (SyncContext<MockTransport>, MockServer) {
    let (transport, server) = MockTransport::channel_pair();
    let ctx = SyncContext::builder(config).transport(transport).build();
    (ctx, server)
}

async fn wait_for_state(ctx: &SyncContext<MockTransport>, state: ConnectionState) {
    let mut rx = ctx.watch_connection();
    tokio::time::timeout(WAIT, rx.wait_for(|current| *current == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {state}"))
        .expect("state channel open");
}

async fn accept(server: &mut MockServer) -> MockSocket {
    server
        .accept_timeout(WAIT)
        .await
        .expect("client should connect")
}

#[tokio::test(start_paused = true)]
async fn unauthenticated_connect_reaches_connected() {
    let (ctx, mut server) = context(config());
    assert_eq!(ctx.connection_status(), ConnectionState::Disconnected);

    let state = ctx.connect(PRIMARY, None).await.unwrap();
    assert_eq!(state, ConnectionState::Connecting);

    let socket = accept(&mut server).await;
    assert_eq!(socket.url(), PRIMARY);
    wait_for_state(&ctx, ConnectionState::Connected).await;

    ctx.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn credentials_gate_connected_on_auth_ack() {
    let (ctx, mut server) = context(config());
    let mut creds = Credentials::bearer("session-token");
    creds.clinic_id = Some("clinic-7".to_string());
    ctx.connect(PRIMARY, Some(creds)).await.unwrap();

    let mut socket = accept(&mut server).await;
    let (event, data) = socket.recv_event(WAIT).await.expect("auth frame");
    assert_eq!(event, "auth");
    assert_eq!(data.get("token").and_then(|v| v.as_str()), Some("session-token"));
    assert_eq!(data.get("clinicId").and_then(|v| v.as_str()), Some("clinic-7"));
    assert_eq!(ctx.connection_status(), ConnectionState::Connecting);

    socket.accept_auth().unwrap();
    wait_for_state(&ctx, ConnectionState::Connected).await;

    ctx.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn auth_rejection_is_terminal_until_reconnect() {
    let (ctx, mut server) = context(config());
    let rejections = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&rejections);
    ctx.subscribe(EventKind::AuthRejected, None, move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
    .await
    .unwrap();

    ctx.connect(PRIMARY, Some(Credentials::bearer("expired")))
        .await
        .unwrap();
    let mut socket = accept(&mut server).await;
    socket.recv_event(WAIT).await.expect("auth frame");
    socket
        .send_event("auth:error", json!({"message": "token expired", "code": 401}))
        .unwrap();

    wait_for_state(&ctx, ConnectionState::Error).await;
    // Round-trip through the engine so the forwarded event has been dispatched.
    ctx.stats().await.unwrap();
    assert_eq!(rejections.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(server.attempts(), 1, "auth failures are never retried");
    assert_eq!(ctx.connection_status(), ConnectionState::Error);

    ctx.reconnect().await.unwrap();
    let mut socket = accept(&mut server).await;
    socket.recv_event(WAIT).await.expect("auth frame");
    socket.accept_auth().unwrap();
    wait_for_state(&ctx, ConnectionState::Connected).await;

    ctx.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_attempts_rotate_endpoints_then_degrade() {
    let (ctx, mut server) = context(SyncConfig {
        fallback_urls: vec![FALLBACK.to_string()],
        ..config()
    });
    // Initial attempt plus five retries.
    server.fail_next(6, "connection refused");

    ctx.connect(PRIMARY, None).await.unwrap();
    wait_for_state(&ctx, ConnectionState::Degraded).await;

    assert_eq!(
        server.attempted_urls(),
        vec![PRIMARY, FALLBACK, PRIMARY, FALLBACK, PRIMARY, FALLBACK]
    );

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(server.attempts(), 6, "degraded stays put");

    ctx.reconnect().await.unwrap();
    accept(&mut server).await;
    wait_for_state(&ctx, ConnectionState::Connected).await;

    ctx.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_attempt_passes_through_error_then_reconnecting() {
    let (ctx, mut server) = context(config());
    server.fail_next(1, "connection refused");
    let mut states = ctx.watch_connection();

    ctx.connect(PRIMARY, None).await.unwrap();
    let mut seen = Vec::new();
    while seen.last() != Some(&ConnectionState::Connected) {
        tokio::time::timeout(WAIT, states.changed())
            .await
            .expect("state change")
            .expect("state channel open");
        seen.push(*states.borrow_and_update());
    }
    accept(&mut server).await;

    assert!(seen.contains(&ConnectionState::Reconnecting));
    assert_eq!(seen.last(), Some(&ConnectionState::Connected));

    ctx.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn silent_server_trips_passive_heartbeat() {
    let (ctx, mut server) = context(SyncConfig {
        heartbeat_timeout: Duration::from_secs(2),
        ..config()
    });
    ctx.connect(PRIMARY, None).await.unwrap();
    let _first = accept(&mut server).await;
    wait_for_state(&ctx, ConnectionState::Connected).await;

    // No frames at all: the connection is treated as dropped and re-established.
    wait_for_state(&ctx, ConnectionState::Reconnecting).await;
    let _second = accept(&mut server).await;
    wait_for_state(&ctx, ConnectionState::Connected).await;

    let stats = ctx.stats().await.unwrap();
    assert!(stats.connection.reconnects >= 1);

    ctx.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn rooms_are_rejoined_after_socket_drop() {
    let (ctx, mut server) = context(config());
    ctx.join_room("clinic:7").await.unwrap();
    ctx.connect(PRIMARY, None).await.unwrap();

    let mut first = accept(&mut server).await;
    let (event, data) = first.recv_event(WAIT).await.expect("room join");
    assert_eq!(event, "room:join");
    assert_eq!(data.get("room").and_then(|v| v.as_str()), Some("clinic:7"));

    ctx.join_room("clinic:7:waitlist").await.unwrap();
    let (event, _) = first.recv_event(WAIT).await.expect("second join");
    assert_eq!(event, "room:join");

    first.drop_socket();
    wait_for_state(&ctx, ConnectionState::Reconnecting).await;

    let mut second = accept(&mut server).await;
    let mut rejoined = Vec::new();
    for _ in 0..2 {
        let (event, data) = second.recv_event(WAIT).await.expect("re-join");
        assert_eq!(event, "room:join");
        rejoined.push(data.get("room").and_then(|v| v.as_str()).unwrap().to_string());
    }
    rejoined.sort();
    assert_eq!(rejoined, vec!["clinic:7", "clinic:7:waitlist"]);

    ctx.leave_room("clinic:7:waitlist").await.unwrap();
    let (event, _) = second.recv_event(WAIT).await.expect("leave");
    assert_eq!(event, "room:leave");
    assert_eq!(ctx.joined_rooms().await.unwrap(), vec!["clinic:7".to_string()]);

    ctx.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn emit_only_sends_while_connected() {
    let (ctx, mut server) = context(config());
    assert_eq!(
        ctx.emit("appointment:viewed", Some(json!({"id": "appt-42"})))
            .await
            .unwrap(),
        EmitStatus::NotConnected
    );

    ctx.connect(PRIMARY, None).await.unwrap();
    let mut socket = accept(&mut server).await;
    wait_for_state(&ctx, ConnectionState::Connected).await;

    assert_eq!(
        ctx.emit("appointment:viewed", Some(json!({"id": "appt-42"})))
            .await
            .unwrap(),
        EmitStatus::Sent
    );
    let (event, data) = socket.recv_event(WAIT).await.expect("emitted frame");
    assert_eq!(event, "appointment:viewed");
    assert_eq!(data, json!({"id": "appt-42"}));

    ctx.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_emit_write_is_reported_not_raised() {
    let (ctx, mut server) = context(config());
    ctx.connect(PRIMARY, None).await.unwrap();
    let mut socket = accept(&mut server).await;
    wait_for_state(&ctx, ConnectionState::Connected).await;

    socket.close_outbound();
    assert_eq!(
        ctx.emit("appointment:viewed", Some(json!({"id": "appt-42"})))
            .await
            .unwrap(),
        EmitStatus::WriteFailed
    );

    // The broken socket is replaced like any other drop.
    let _replacement = accept(&mut server).await;
    wait_for_state(&ctx, ConnectionState::Connected).await;

    ctx.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn disconnect_tears_down_and_forgets_rooms() {
    let (ctx, mut server) = context(config());
    ctx.join_room("clinic:7").await.unwrap();
    ctx.connect(PRIMARY, None).await.unwrap();
    let socket = accept(&mut server).await;
    wait_for_state(&ctx, ConnectionState::Connected).await;

    ctx.disconnect().await.unwrap();
    assert_eq!(ctx.connection_status(), ConnectionState::Disconnected);
    assert!(ctx.joined_rooms().await.unwrap().is_empty());

    // Frames from the torn-down socket are never processed.
    socket
        .send_event("notification", json!({"text": "late"}))
        .ok();
    drop(socket);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(server.attempts(), 1);
    assert_eq!(ctx.connection_status(), ConnectionState::Disconnected);

    ctx.shutdown().await;
}
