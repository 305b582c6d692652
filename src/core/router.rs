use std::error::Error;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

use super::event::{EventKind, RoutedEvent};

pub type CallbackError = Box<dyn Error + Send + Sync>;

/// Subscriber callback. Returning an error (or panicking) is logged and never affects
/// other subscribers.
pub type EventCallback = Box<dyn Fn(&RoutedEvent) -> Result<(), CallbackError> + Send + Sync>;

/// Opaque handle returned by `subscribe`; needed to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

impl SubscriptionToken {
    pub fn id(self) -> u64 {
        self.0
    }
}

struct Subscription {
    token: SubscriptionToken,
    kind: EventKind,
    room: Option<String>,
    callback: EventCallback,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("token", &self.token)
            .field("kind", &self.kind)
            .field("room", &self.room)
            .finish_non_exhaustive()
    }
}

/// Result of fanning one event out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Registry of subscribers keyed by event kind and optional room.
///
/// Subscribers for a kind run in registration order, exactly once per dispatched event.
/// Registration is independent of connectivity and never replays past events.
#[derive(Debug, Default)]
pub struct EventRouter {
    subscriptions: Vec<Subscription>,
    next_token: u64,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &mut self,
        kind: EventKind,
        room: Option<String>,
        callback: EventCallback,
    ) -> SubscriptionToken {
        self.next_token = self.next_token.wrapping_add(1);
        let token = SubscriptionToken(self.next_token);
        self.subscriptions.push(Subscription {
            token,
            kind,
            room,
            callback,
        });
        token
    }

    /// Removes exactly the callback registered under `token`. Unknown or already-removed
    /// tokens are a no-op returning `false`.
    pub fn unsubscribe(&mut self, token: SubscriptionToken) -> bool {
        match self.subscriptions.iter().position(|sub| sub.token == token) {
            Some(index) => {
                self.subscriptions.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.subscriptions.clear();
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn dispatch(&self, routed: &RoutedEvent) -> DispatchReport {
        let kind = routed.event.kind();
        let mut report = DispatchReport::default();

        for sub in &self.subscriptions {
            if sub.kind != kind {
                continue;
            }
            if let Some(room) = &sub.room {
                if routed.room.as_deref() != Some(room.as_str()) {
                    continue;
                }
            }

            match catch_unwind(AssertUnwindSafe(|| (sub.callback)(routed))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(err)) => {
                    report.failed += 1;
                    tracing::warn!(
                        token = sub.token.0,
                        event = kind.wire_name(),
                        error = %err,
                        "subscriber callback failed"
                    );
                }
                Err(_) => {
                    report.failed += 1;
                    tracing::error!(
                        token = sub.token.0,
                        event = kind.wire_name(),
                        "subscriber callback panicked"
                    );
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::SyncEvent;
    use std::sync::{Arc, Mutex};

    fn recorder(log: &Arc<Mutex<Vec<String>>>, label: &'static str) -> EventCallback {
        let log = Arc::clone(log);
        Box::new(move |_event| {
            log.lock().expect("lock").push(label.to_string());
            Ok(())
        })
    }

    #[test]
    fn subscribers_run_once_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut router = EventRouter::new();
        router.subscribe(EventKind::Heartbeat, None, recorder(&log, "a"));
        router.subscribe(EventKind::Heartbeat, None, recorder(&log, "b"));
        router.subscribe(EventKind::Notification, None, recorder(&log, "other"));

        let report = router.dispatch(&RoutedEvent::new(SyncEvent::Heartbeat));
        assert_eq!(report.delivered, 2);
        assert_eq!(*log.lock().expect("lock"), vec!["a", "b"]);
    }

    #[test]
    fn failing_and_panicking_callbacks_are_isolated() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut router = EventRouter::new();
        router.subscribe(EventKind::Heartbeat, None, Box::new(|_| Err("nope".into())));
        router.subscribe(EventKind::Heartbeat, None, Box::new(|_| panic!("subscriber bug")));
        router.subscribe(EventKind::Heartbeat, None, recorder(&log, "survivor"));

        let report = router.dispatch(&RoutedEvent::new(SyncEvent::Heartbeat));
        assert_eq!(report, DispatchReport { delivered: 1, failed: 2 });
        assert_eq!(*log.lock().expect("lock"), vec!["survivor"]);
    }

    #[test]
    fn unsubscribe_is_idempotent_and_exact() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut router = EventRouter::new();
        let first = router.subscribe(EventKind::Heartbeat, None, recorder(&log, "first"));
        router.subscribe(EventKind::Heartbeat, None, recorder(&log, "second"));

        assert!(router.unsubscribe(first));
        assert!(!router.unsubscribe(first));
        assert_eq!(router.len(), 1);

        router.dispatch(&RoutedEvent::new(SyncEvent::Heartbeat));
        assert_eq!(*log.lock().expect("lock"), vec!["second"]);
    }

    #[test]
    fn room_scoped_subscribers_only_see_their_room() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut router = EventRouter::new();
        router.subscribe(
            EventKind::Heartbeat,
            Some("clinic:7".to_string()),
            recorder(&log, "scoped"),
        );
        router.subscribe(EventKind::Heartbeat, None, recorder(&log, "global"));

        router.dispatch(&RoutedEvent::in_room("clinic:9", SyncEvent::Heartbeat));
        router.dispatch(&RoutedEvent::in_room("clinic:7", SyncEvent::Heartbeat));
        router.dispatch(&RoutedEvent::new(SyncEvent::Heartbeat));

        assert_eq!(
            *log.lock().expect("lock"),
            vec!["global", "scoped", "global", "global"]
        );
    }
}
