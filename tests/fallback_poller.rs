use std::sync::Arc;
use std::time::Duration;

use clinic_sync::core::BackoffPolicy;
use clinic_sync::interfaces::PulledEntity;
use clinic_sync::testing::{MockServer, MockTransport, ScriptedPullSource};
use clinic_sync::{
    CacheKey, ConnectionState, PullBatch, RemoteError, SyncConfig, SyncContext, SyncError,
};
use sonic_rs::json;

const WAIT: Duration = Duration::from_secs(120);

fn config() -> SyncConfig {
    SyncConfig {
        backoff: BackoffPolicy::default(),
        // Tests idle on a silent mock socket; keep the passive heartbeat out of the way.
        heartbeat_timeout: Duration::from_secs(3600),
        fallback_after: Duration::from_secs(10),
        poll_interval: Duration::from_secs(15),
        ..SyncConfig::default()
    }
}

fn context(source: Arc<ScriptedPullSource>) -> (SyncContext<MockTransport>, MockServer) {
    let (transport, server) = MockTransport::channel_pair();
    let ctx = SyncContext::builder(config())
        .transport(transport)
        .pull_source(source)
        .build();
    (ctx, server)
}

fn batch(id: &str, version: u64) -> PullBatch {
    PullBatch {
        entities: vec![PulledEntity {
            key: CacheKey::new("appointment", id),
            value: json!({"id": id, "status": "SCHEDULED"}),
            version,
        }],
        ..PullBatch::default()
    }
}

async fn wait_until_pulls(source: &ScriptedPullSource, pulls: u64) {
    tokio::time::timeout(WAIT, async {
        while source.pulls() < pulls {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("expected pulls never happened");
    // Let the pulled batch travel poller -> engine before asserting on the cache.
    tokio::time::sleep(Duration::from_millis(10)).await;
}

async fn wait_connected(ctx: &SyncContext<MockTransport>) {
    ctx.watch_connection()
        .wait_for(|state| *state == ConnectionState::Connected)
        .await
        .unwrap();
    // The poller observes state changes through its own watcher.
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn polling_starts_after_debounce_and_applies_results() {
    let source = ScriptedPullSource::new();
    source.push(Ok(batch("appt-1", 3)));
    let (ctx, _server) = context(source.clone());

    ctx.activate_fallback(None).await.unwrap();
    tokio::time::sleep(Duration::from_secs(9)).await;
    assert_eq!(source.pulls(), 0, "debounced until the channel has been down long enough");

    // First pull fires immediately on activation.
    wait_until_pulls(&source, 1).await;
    let status = ctx.fallback_status().await.unwrap();
    assert!(status.armed && status.active);

    let entry = ctx
        .get_snapshot(&CacheKey::new("appointment", "appt-1"))
        .await
        .unwrap()
        .expect("pulled entity cached");
    assert_eq!(entry.version, 3);

    wait_until_pulls(&source, 2).await;
    ctx.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn reconnect_stops_polling_immediately() {
    let source = ScriptedPullSource::new();
    let (ctx, mut server) = context(source.clone());

    ctx.activate_fallback(Some(Duration::from_secs(1))).await.unwrap();
    wait_until_pulls(&source, 1).await;

    ctx.connect("wss://sync.clinic.test/ws", None).await.unwrap();
    let _socket = server.accept_timeout(WAIT).await.expect("connect");
    wait_connected(&ctx).await;

    let status = ctx.fallback_status().await.unwrap();
    assert!(status.armed, "arming survives reconnection");
    assert!(!status.active);

    let pulls = source.pulls();
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(source.pulls(), pulls, "no pulls while connected");

    ctx.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn polling_resumes_when_channel_drops_again() {
    let source = ScriptedPullSource::new();
    let (ctx, mut server) = context(source.clone());
    ctx.activate_fallback(None).await.unwrap();

    ctx.connect("wss://sync.clinic.test/ws", None).await.unwrap();
    let mut socket = server.accept_timeout(WAIT).await.expect("connect");
    wait_connected(&ctx).await;
    assert_eq!(source.pulls(), 0);

    // Keep the channel down: every reconnect attempt fails.
    server.fail_next(10, "connection refused");
    socket.drop_socket();

    wait_until_pulls(&source, 1).await;
    assert!(ctx.fallback_status().await.unwrap().active);
    ctx.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_pulls_are_counted_and_retried() {
    let source = ScriptedPullSource::new();
    source.push(Err(RemoteError::new(Some(503), "maintenance")));
    source.push(Ok(batch("appt-2", 1)));
    let (ctx, _server) = context(source.clone());

    ctx.activate_fallback(Some(Duration::ZERO)).await.unwrap();
    wait_until_pulls(&source, 2).await;

    let status = ctx.fallback_status().await.unwrap();
    assert_eq!(status.failures, 1);
    assert!(
        ctx.get_snapshot(&CacheKey::new("appointment", "appt-2"))
            .await
            .unwrap()
            .is_some()
    );

    ctx.deactivate_fallback().await.unwrap();
    let status = ctx.fallback_status().await.unwrap();
    assert!(!status.armed && !status.active);
    ctx.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn arming_without_pull_source_fails() {
    let (transport, _server) = MockTransport::channel_pair();
    let ctx = SyncContext::builder(config()).transport(transport).build();
    let err = ctx.activate_fallback(None).await.unwrap_err();
    assert!(matches!(err, SyncError::InvalidState(_)));
    ctx.shutdown().await;
}
