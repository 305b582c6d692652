//! The sync engine actor: cache, subscriber registry, mutation ledger and health snapshot.
//!
//! All three sources of truth meet here. Push events arrive from the connection actor,
//! mutation outcomes from the context's driver tasks and pulled batches from the fallback
//! poller; the mailbox serializes them, so the cache never needs a lock.

use std::time::Duration;

use kameo::prelude::{Actor, ActorRef, Context, Message as KameoMessage, WeakActorRef};
use sonic_rs::{JsonValueTrait, Value};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::SyncMetricsHook;
use crate::core::{
    CacheChange, CacheEntry, CacheKey, Coalescer, ConnectionState, EventCallback, EventKind,
    EventRouter, HealthSnapshot, KeyPattern, MutationId, MutationLedger, RemoteError,
    Resolution, RoutedEvent, SharedClock, SubscriptionToken, SyncCache, SyncError, SyncEvent,
    SyncResult, SyncStats, Version, WriteOutcome, merge_service_update,
};
use crate::interfaces::PullBatch;

pub struct EngineArgs {
    pub clock: SharedClock,
    pub coalesce_window: Duration,
    pub mutation_buffer: usize,
    pub tombstone_capacity: usize,
    pub changes_tx: broadcast::Sender<CacheChange>,
    pub connection_rx: watch::Receiver<ConnectionState>,
    pub metrics: Option<SyncMetricsHook>,
}

pub struct SyncEngine {
    actor_ref: ActorRef<Self>,
    clock: SharedClock,
    cache: SyncCache,
    router: EventRouter,
    ledger: MutationLedger,
    health: Option<HealthSnapshot>,
    coalescer: Coalescer,
    changes_tx: broadcast::Sender<CacheChange>,
    connection_rx: watch::Receiver<ConnectionState>,
    flush_task: Option<JoinHandle<()>>,
    metrics: Option<SyncMetricsHook>,
    stale_drops: u64,
}

impl Actor for SyncEngine {
    type Args = EngineArgs;
    type Error = SyncError;

    fn name() -> &'static str {
        "SyncEngine"
    }

    async fn on_start(args: Self::Args, ctx: ActorRef<Self>) -> SyncResult<Self> {
        Ok(Self {
            actor_ref: ctx,
            cache: SyncCache::with_tombstone_capacity(
                args.clock.clone(),
                args.tombstone_capacity,
            ),
            clock: args.clock,
            router: EventRouter::new(),
            ledger: MutationLedger::new(args.mutation_buffer),
            health: None,
            coalescer: Coalescer::new(args.coalesce_window),
            changes_tx: args.changes_tx,
            connection_rx: args.connection_rx,
            flush_task: None,
            metrics: args.metrics,
            stale_drops: 0,
        })
    }

    async fn on_stop(
        &mut self,
        _ctx: WeakActorRef<Self>,
        _reason: kameo::error::ActorStopReason,
    ) -> SyncResult<()> {
        if let Some(task) = self.flush_task.take() {
            task.abort();
        }
        for key in self.coalescer.drain_all() {
            let _ = self.changes_tx.send(self.cache.change_for(&key));
        }
        let abandoned = self.ledger.abandon_all();
        if !abandoned.is_empty() {
            warn!(pending = abandoned.len(), "sync engine stopped with mutations in flight");
        }
        self.router.clear();
        Ok(())
    }
}

impl SyncEngine {
    fn note_change(&mut self, key: &CacheKey) {
        let now = self.clock.now();
        self.coalescer.note(key, now);
        self.schedule_flush();
    }

    fn schedule_flush(&mut self) {
        if self.flush_task.is_some() {
            return;
        }
        let Some(due) = self.coalescer.next_due() else {
            return;
        };
        let delay = due.saturating_duration_since(self.clock.now());
        let actor_ref = self.actor_ref.clone();
        self.flush_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = actor_ref.tell(FlushChanges).send().await;
        }));
    }

    fn record_outcome(&mut self, key: &CacheKey, version: Version, outcome: WriteOutcome) {
        match outcome {
            WriteOutcome::Stale => {
                self.stale_drops = self.stale_drops.saturating_add(1);
                debug!(key = %key, version, "dropping stale write");
                if let Some(metrics) = self.metrics.as_ref() {
                    metrics.track_stale_drop(key);
                }
            }
            WriteOutcome::Deferred => {}
            WriteOutcome::Inserted | WriteOutcome::Updated | WriteOutcome::Removed => {
                self.note_change(key);
            }
        }
    }

    /// Apply an entity event to the cache, or hold it while the key has a pending mutation.
    fn apply_entity_event(&mut self, event: SyncEvent) -> WriteOutcome {
        let Some(key) = event.entity_key().cloned() else {
            return WriteOutcome::Stale;
        };
        if self.ledger.is_pending(&key) {
            if let Some(evicted) = self.ledger.buffer(&key, event) {
                warn!(
                    key = %key,
                    evicted = evicted.kind().wire_name(),
                    "mutation event buffer full; oldest event evicted"
                );
            }
            return WriteOutcome::Deferred;
        }

        let (version, outcome) = match event {
            SyncEvent::EntityCreated { value, version, .. } => {
                (version, self.cache.replace(&key, value, version))
            }
            SyncEvent::EntityUpdated { diff, version, .. } => {
                (version, self.cache.apply_patch(&key, &diff, version))
            }
            SyncEvent::EntityDeleted { version, .. } => (version, self.cache.remove(&key, version)),
            _ => return WriteOutcome::Stale,
        };
        self.record_outcome(&key, version, outcome);
        outcome
    }

    fn invalidate(&mut self, pattern: &KeyPattern) -> Vec<CacheKey> {
        let touched = self.cache.invalidate(pattern);
        for key in &touched {
            self.note_change(key);
        }
        touched
    }

    fn apply_health(&mut self, event: &SyncEvent) {
        match event {
            SyncEvent::HealthSnapshot(snapshot) => self.health = Some(snapshot.clone()),
            SyncEvent::HealthService(update) => match self.health.as_mut() {
                Some(snapshot) => {
                    merge_service_update(snapshot, update);
                }
                None => debug!(service = %update.id, "ignoring service update without snapshot"),
            },
            _ => {}
        }
    }

    fn handle_event(&mut self, routed: RoutedEvent) {
        let kind = routed.event.kind();
        match kind {
            EventKind::EntityCreated | EventKind::EntityUpdated | EventKind::EntityDeleted => {
                self.apply_entity_event(routed.event.clone());
            }
            EventKind::Invalidate => {
                if let SyncEvent::Invalidate { pattern } = &routed.event {
                    self.invalidate(pattern);
                }
            }
            EventKind::HealthSnapshot | EventKind::HealthService => {
                self.apply_health(&routed.event)
            }
            EventKind::Notification
            | EventKind::Heartbeat
            | EventKind::AuthAccepted
            | EventKind::AuthRejected => {}
        }

        let report = self.router.dispatch(&routed);
        if report.failed > 0 {
            if let Some(metrics) = self.metrics.as_ref() {
                metrics.track_subscriber_failure(kind, report.failed);
            }
        }
    }

    fn begin(&mut self, key: CacheKey, diff: Value) -> SyncResult<MutationTicket> {
        if self.ledger.is_pending(&key) {
            return Err(SyncError::MutationInFlight {
                key: key.to_string(),
            });
        }
        let prior = self.cache.apply_optimistic(&key, &diff);
        let now = self.clock.now();
        let id = self.ledger.begin(key.clone(), diff, prior, now)?;
        let pending_value = self
            .cache
            .get(&key)
            .map(|entry| entry.value.clone())
            .unwrap_or_default();
        self.note_change(&key);
        debug!(key = %key, mutation = id, "optimistic mutation applied");
        Ok(MutationTicket {
            id,
            key,
            pending_value,
        })
    }

    fn resolve(
        &mut self,
        id: MutationId,
        outcome: Result<Value, RemoteError>,
    ) -> SyncResult<MutationResolution> {
        let is_create = self
            .ledger
            .get(id)
            .map(|pending| pending.is_create())
            .ok_or(SyncError::UnknownMutation(id))?;
        let now = self.clock.now();

        let (resolved, resolution) = match outcome {
            Ok(response) => {
                let server_id = if is_create { response_id(&response) } else { None };
                let resolved = self.ledger.resolve(
                    id,
                    Resolution::Confirmed {
                        server_id: server_id.clone(),
                    },
                    now,
                )?;
                let key = &resolved.mutation.key;
                let prior_version = resolved.mutation.prior.as_ref().map_or(0, |e| e.version);
                let version = response
                    .get("version")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(prior_version);

                let final_key = match server_id.as_deref() {
                    Some(server_id) if server_id != key.id => {
                        self.cache.restore(key, None);
                        self.note_change(key);
                        key.with_id(server_id)
                    }
                    _ => key.clone(),
                };
                if !self.cache.confirm(&final_key, response, version) {
                    debug!(
                        key = %final_key,
                        version,
                        "confirmed value superseded by newer server state"
                    );
                }
                self.note_change(&final_key);

                let entry = self.cache.get(&final_key);
                let resolution = MutationResolution::Confirmed {
                    value: entry.map(|e| e.value.clone()).unwrap_or_default(),
                    version: entry.map_or(version, |e| e.version),
                    promoted_from: (final_key != *key).then(|| key.clone()),
                    key: final_key,
                };
                (resolved, resolution)
            }
            Err(error) => {
                let resolved = self.ledger.resolve(id, Resolution::RolledBack, now)?;
                let key = resolved.mutation.key.clone();
                self.cache.restore(&key, resolved.mutation.prior.clone());
                self.note_change(&key);
                if let Some(metrics) = self.metrics.as_ref() {
                    metrics.track_rollback(&key);
                }
                warn!(key = %key, mutation = id, error = %error, "mutation rejected; rolled back");
                (resolved, MutationResolution::RolledBack { key, error })
            }
        };

        if let Some(metrics) = self.metrics.as_ref() {
            metrics.observe_mutation_latency_us(
                resolved.latency.as_micros().min(u64::MAX as u128) as u64,
            );
        }
        for event in resolved.buffered {
            self.apply_entity_event(event);
        }
        Ok(resolution)
    }

    fn apply_pulled(&mut self, batch: PullBatch) -> usize {
        let mut applied = 0;
        for pulled in batch.entities {
            let event = SyncEvent::EntityCreated {
                key: pulled.key,
                value: pulled.value,
                version: pulled.version,
            };
            if self.apply_entity_event(event).is_applied() {
                applied += 1;
            }
        }
        for (key, version) in batch.deletions {
            if self
                .apply_entity_event(SyncEvent::EntityDeleted { key, version })
                .is_applied()
            {
                applied += 1;
            }
        }
        if let Some(snapshot) = batch.health {
            self.health = Some(snapshot);
        }
        applied
    }

    fn flush(&mut self) {
        let now = self.clock.now();
        for key in self.coalescer.drain_due(now) {
            // No receivers is fine; notifications are best-effort.
            let _ = self.changes_tx.send(self.cache.change_for(&key));
        }
        self.schedule_flush();
    }

    fn stats(&self) -> SyncStats {
        let (p50, p99) = self.ledger.latency_percentiles();
        SyncStats {
            entries: self.cache.len(),
            pending_mutations: self.ledger.pending_len(),
            confirmed_mutations: self.ledger.confirmed(),
            rolled_back_mutations: self.ledger.rolled_back(),
            stale_drops: self.stale_drops,
            subscribers: self.router.len(),
            p50_mutation_latency_us: p50,
            p99_mutation_latency_us: p99,
            mutation_latency_samples: self.ledger.latency_samples(),
        }
    }
}

fn response_id(response: &Value) -> Option<String> {
    let id = response.get("id")?;
    if let Some(text) = id.as_str() {
        return Some(text.to_string());
    }
    id.as_u64().map(|n| n.to_string())
}

/// Speculative state handed back to the caller of `mutate`/`create`.
#[derive(Debug, Clone)]
pub struct MutationTicket {
    pub id: MutationId,
    pub key: CacheKey,
    pub pending_value: Value,
}

#[derive(Debug, Clone)]
pub enum MutationResolution {
    Confirmed {
        key: CacheKey,
        value: Value,
        version: Version,
        /// Temporary key the entity lived under before the server assigned its id.
        promoted_from: Option<CacheKey>,
    },
    RolledBack {
        key: CacheKey,
        error: RemoteError,
    },
}

/// Push event forwarded by the connection actor.
pub struct InboundEvent(pub RoutedEvent);

impl KameoMessage<InboundEvent> for SyncEngine {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: InboundEvent,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.handle_event(msg.0);
    }
}

pub struct ConnectionChanged {
    pub state: ConnectionState,
}

impl KameoMessage<ConnectionChanged> for SyncEngine {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: ConnectionChanged,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if msg.state.is_connected() {
            return;
        }
        let marked = self.cache.mark_all_stale();
        if marked > 0 {
            info!(state = %msg.state, entries = marked, "push channel down; cache marked stale");
        }
    }
}

pub struct Subscribe {
    pub kind: EventKind,
    pub room: Option<String>,
    pub callback: EventCallback,
}

impl KameoMessage<Subscribe> for SyncEngine {
    type Reply = SyncResult<SubscriptionToken>;

    async fn handle(
        &mut self,
        msg: Subscribe,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.router.subscribe(msg.kind, msg.room, msg.callback))
    }
}

pub struct Unsubscribe(pub SubscriptionToken);

impl KameoMessage<Unsubscribe> for SyncEngine {
    type Reply = SyncResult<bool>;

    async fn handle(
        &mut self,
        msg: Unsubscribe,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.router.unsubscribe(msg.0))
    }
}

pub struct BeginMutation {
    pub key: CacheKey,
    pub diff: Value,
}

impl KameoMessage<BeginMutation> for SyncEngine {
    type Reply = SyncResult<MutationTicket>;

    async fn handle(
        &mut self,
        msg: BeginMutation,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.begin(msg.key, msg.diff)
    }
}

/// Insert a new entity under a temporary id until the server assigns one.
pub struct BeginCreate {
    pub entity: String,
    pub scope: Option<String>,
    pub value: Value,
}

impl KameoMessage<BeginCreate> for SyncEngine {
    type Reply = SyncResult<MutationTicket>;

    async fn handle(
        &mut self,
        msg: BeginCreate,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let key = CacheKey {
            entity: msg.entity,
            scope: msg.scope,
            id: self.ledger.temp_id(),
        };
        self.begin(key, msg.value)
    }
}

pub struct ResolveMutation {
    pub id: MutationId,
    pub outcome: Result<Value, RemoteError>,
}

impl KameoMessage<ResolveMutation> for SyncEngine {
    type Reply = SyncResult<MutationResolution>;

    async fn handle(
        &mut self,
        msg: ResolveMutation,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.resolve(msg.id, msg.outcome)
    }
}

pub struct GetEntry(pub CacheKey);

impl KameoMessage<GetEntry> for SyncEngine {
    type Reply = SyncResult<Option<CacheEntry>>;

    async fn handle(
        &mut self,
        msg: GetEntry,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.cache.get(&msg.0).cloned())
    }
}

pub struct GetHealthSnapshot;

impl KameoMessage<GetHealthSnapshot> for SyncEngine {
    type Reply = SyncResult<Option<HealthSnapshot>>;

    async fn handle(
        &mut self,
        _msg: GetHealthSnapshot,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.health.clone())
    }
}

pub struct ApplyPatch {
    pub key: CacheKey,
    pub diff: Value,
    pub version: Version,
}

impl KameoMessage<ApplyPatch> for SyncEngine {
    type Reply = SyncResult<WriteOutcome>;

    async fn handle(
        &mut self,
        msg: ApplyPatch,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.apply_entity_event(SyncEvent::EntityUpdated {
            key: msg.key,
            diff: msg.diff,
            version: msg.version,
        }))
    }
}

pub struct Invalidate(pub KeyPattern);

impl KameoMessage<Invalidate> for SyncEngine {
    type Reply = SyncResult<Vec<CacheKey>>;

    async fn handle(
        &mut self,
        msg: Invalidate,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.invalidate(&msg.0))
    }
}

/// Pulled refresh from the fallback poller. Refused while the push channel is connected.
pub struct ApplyPulled(pub PullBatch);

impl KameoMessage<ApplyPulled> for SyncEngine {
    type Reply = SyncResult<usize>;

    async fn handle(
        &mut self,
        msg: ApplyPulled,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if self.connection_rx.borrow().is_connected() {
            debug!("push channel connected; discarding pulled batch");
            return Ok(0);
        }
        Ok(self.apply_pulled(msg.0))
    }
}

pub(crate) struct FlushChanges;

impl KameoMessage<FlushChanges> for SyncEngine {
    type Reply = ();

    async fn handle(
        &mut self,
        _msg: FlushChanges,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.flush_task = None;
        self.flush();
    }
}

pub struct GetSyncStats;

impl KameoMessage<GetSyncStats> for SyncEngine {
    type Reply = SyncResult<SyncStats>;

    async fn handle(
        &mut self,
        _msg: GetSyncStats,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.stats())
    }
}
