//! Fallback poller: pull-based refresh while the push channel is down.
//!
//! Once armed, the poller activates after the channel has been out of `Connected` for the
//! configured delay and pulls immediately, then every poll interval. Reaching `Connected`
//! deactivates it synchronously in the state-change handler; in-flight pulls are aborted and
//! any result still in the mailbox is discarded by generation.

use std::sync::Arc;
use std::time::Duration;

use kameo::prelude::{Actor, ActorRef, Context, Message as KameoMessage, WeakActorRef};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::engine::{ApplyPulled, SyncEngine};
use crate::core::{ConnectionState, RemoteError, SyncError, SyncResult};
use crate::interfaces::{PullBatch, PullSource};

pub struct PollerArgs {
    pub engine: ActorRef<SyncEngine>,
    pub state_rx: watch::Receiver<ConnectionState>,
    pub source: Option<Arc<dyn PullSource>>,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PollerStatus {
    pub armed: bool,
    pub active: bool,
    pub pulls: u64,
    pub failures: u64,
}

pub struct FallbackPoller {
    actor_ref: ActorRef<Self>,
    engine: ActorRef<SyncEngine>,
    source: Option<Arc<dyn PullSource>>,
    poll_interval: Duration,
    state: ConnectionState,
    armed_after: Option<Duration>,
    active: bool,
    generation: u64,
    activation_task: Option<JoinHandle<()>>,
    poll_task: Option<JoinHandle<()>>,
    watch_task: Option<JoinHandle<()>>,
    pulls: u64,
    failures: u64,
}

impl Actor for FallbackPoller {
    type Args = PollerArgs;
    type Error = SyncError;

    fn name() -> &'static str {
        "FallbackPoller"
    }

    async fn on_start(args: Self::Args, ctx: ActorRef<Self>) -> SyncResult<Self> {
        let mut state_rx = args.state_rx;
        let state = *state_rx.borrow_and_update();

        let watcher = ctx.clone();
        let watch_task = tokio::spawn(async move {
            while state_rx.changed().await.is_ok() {
                let state = *state_rx.borrow_and_update();
                if watcher.tell(StateChanged(state)).send().await.is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            actor_ref: ctx,
            engine: args.engine,
            source: args.source,
            poll_interval: args.poll_interval,
            state,
            armed_after: None,
            active: false,
            generation: 0,
            activation_task: None,
            poll_task: None,
            watch_task: Some(watch_task),
            pulls: 0,
            failures: 0,
        })
    }

    async fn on_stop(
        &mut self,
        _ctx: WeakActorRef<Self>,
        _reason: kameo::error::ActorStopReason,
    ) -> SyncResult<()> {
        self.stop_polling();
        if let Some(task) = self.watch_task.take() {
            task.abort();
        }
        Ok(())
    }
}

impl FallbackPoller {
    fn stop_polling(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        for task in [self.activation_task.take(), self.poll_task.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
        if self.active {
            self.active = false;
            info!("push channel restored; fallback polling stopped");
        }
    }

    /// Start the activation countdown if armed and disconnected.
    fn schedule_activation(&mut self) {
        let Some(after) = self.armed_after else {
            return;
        };
        if self.state.is_connected() || self.active || self.activation_task.is_some() {
            return;
        }
        let generation = self.generation;
        let actor_ref = self.actor_ref.clone();
        self.activation_task = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = actor_ref.tell(Activate { generation }).send().await;
        }));
    }

    fn start_polling(&mut self) {
        let Some(source) = self.source.clone() else {
            return;
        };
        self.active = true;
        warn!(
            interval_ms = self.poll_interval.as_millis() as u64,
            "push channel unavailable; fallback polling started"
        );

        let generation = self.generation;
        let period = self.poll_interval;
        let actor_ref = self.actor_ref.clone();
        self.poll_task = Some(tokio::spawn(async move {
            // First tick fires immediately.
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let result = source.pull().await;
                if actor_ref
                    .tell(PollResult { generation, result })
                    .send()
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }));
    }
}

/// Enable fallback polling once the channel has been down for `after`.
pub struct Arm {
    pub after: Duration,
}

impl KameoMessage<Arm> for FallbackPoller {
    type Reply = SyncResult<()>;

    async fn handle(&mut self, msg: Arm, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        if self.source.is_none() {
            return Err(SyncError::InvalidState(
                "fallback polling needs a pull source".to_string(),
            ));
        }
        if self.armed_after != Some(msg.after) {
            self.stop_polling();
        }
        self.armed_after = Some(msg.after);
        debug!(after_ms = msg.after.as_millis() as u64, "fallback polling armed");
        self.schedule_activation();
        Ok(())
    }
}

pub struct Disarm;

impl KameoMessage<Disarm> for FallbackPoller {
    type Reply = SyncResult<()>;

    async fn handle(&mut self, _msg: Disarm, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.armed_after = None;
        self.stop_polling();
        Ok(())
    }
}

pub struct GetPollerStatus;

impl KameoMessage<GetPollerStatus> for FallbackPoller {
    type Reply = SyncResult<PollerStatus>;

    async fn handle(
        &mut self,
        _msg: GetPollerStatus,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(PollerStatus {
            armed: self.armed_after.is_some(),
            active: self.active,
            pulls: self.pulls,
            failures: self.failures,
        })
    }
}

pub(crate) struct StateChanged(ConnectionState);

impl KameoMessage<StateChanged> for FallbackPoller {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: StateChanged,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.state = msg.0;
        if self.state.is_connected() {
            self.stop_polling();
        } else {
            self.schedule_activation();
        }
    }
}

pub(crate) struct Activate {
    generation: u64,
}

impl KameoMessage<Activate> for FallbackPoller {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: Activate,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if msg.generation != self.generation {
            return;
        }
        self.activation_task = None;
        if self.state.is_connected() || self.armed_after.is_none() {
            return;
        }
        self.start_polling();
    }
}

pub(crate) struct PollResult {
    generation: u64,
    result: Result<PullBatch, RemoteError>,
}

impl KameoMessage<PollResult> for FallbackPoller {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: PollResult,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if msg.generation != self.generation || !self.active {
            debug!("discarding pull result from a stopped poll cycle");
            return;
        }
        match msg.result {
            Ok(batch) => {
                self.pulls = self.pulls.saturating_add(1);
                if batch.is_empty() {
                    return;
                }
                match self.engine.ask(ApplyPulled(batch)).await {
                    Ok(applied) => debug!(applied, "fallback pull applied"),
                    Err(err) => warn!(error = %err, "engine rejected fallback pull"),
                }
            }
            Err(err) => {
                self.failures = self.failures.saturating_add(1);
                warn!(error = %err, "fallback pull failed; retrying next interval");
            }
        }
    }
}
