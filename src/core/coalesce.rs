use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::key::CacheKey;

/// Trailing-edge coalescing of per-key change notifications.
///
/// The first change to a key opens a window; further changes inside it are absorbed and a
/// single notification is due when the window closes. Keys become due in the order their
/// windows were opened.
#[derive(Debug)]
pub struct Coalescer {
    window: Duration,
    pending: HashMap<CacheKey, Instant>,
    order: Vec<CacheKey>,
}

impl Coalescer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record a change. Returns `true` when this opened a new window.
    pub fn note(&mut self, key: &CacheKey, now: Instant) -> bool {
        if self.pending.contains_key(key) {
            return false;
        }
        self.pending.insert(key.clone(), now);
        self.order.push(key.clone());
        true
    }

    /// Earliest instant at which some key becomes due.
    pub fn next_due(&self) -> Option<Instant> {
        self.order
            .first()
            .and_then(|key| self.pending.get(key))
            .map(|opened| *opened + self.window)
    }

    /// Keys whose window has closed at `now`, in window-open order.
    pub fn drain_due(&mut self, now: Instant) -> Vec<CacheKey> {
        let split = self
            .order
            .iter()
            .position(|key| {
                self.pending
                    .get(key)
                    .is_some_and(|opened| *opened + self.window > now)
            })
            .unwrap_or(self.order.len());

        let due: Vec<CacheKey> = self.order.drain(..split).collect();
        for key in &due {
            self.pending.remove(key);
        }
        due
    }

    /// Every pending key regardless of window (used on shutdown).
    pub fn drain_all(&mut self) -> Vec<CacheKey> {
        self.pending.clear();
        std::mem::take(&mut self.order)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str) -> CacheKey {
        CacheKey::new("queue", id)
    }

    #[test]
    fn five_changes_in_one_window_yield_one_notification() {
        let start = Instant::now();
        let mut coalescer = Coalescer::new(Duration::from_millis(100));
        for offset in [0u64, 10, 30, 60, 90] {
            coalescer.note(&key("q-1"), start + Duration::from_millis(offset));
        }
        assert_eq!(coalescer.len(), 1);
        assert!(coalescer.drain_due(start + Duration::from_millis(99)).is_empty());
        assert_eq!(coalescer.drain_due(start + Duration::from_millis(100)), vec![key("q-1")]);
        assert!(coalescer.is_empty());
    }

    #[test]
    fn keys_close_independently_in_open_order() {
        let start = Instant::now();
        let mut coalescer = Coalescer::new(Duration::from_millis(100));
        assert!(coalescer.note(&key("a"), start));
        assert!(coalescer.note(&key("b"), start + Duration::from_millis(50)));
        assert!(!coalescer.note(&key("a"), start + Duration::from_millis(60)));

        assert_eq!(coalescer.next_due(), Some(start + Duration::from_millis(100)));
        assert_eq!(coalescer.drain_due(start + Duration::from_millis(120)), vec![key("a")]);
        assert_eq!(coalescer.next_due(), Some(start + Duration::from_millis(150)));

        // A change after the window closed opens a fresh one.
        assert!(coalescer.note(&key("a"), start + Duration::from_millis(130)));
        assert_eq!(
            coalescer.drain_due(start + Duration::from_millis(500)),
            vec![key("b"), key("a")]
        );
    }

    #[test]
    fn zero_window_is_immediately_due() {
        let now = Instant::now();
        let mut coalescer = Coalescer::new(Duration::ZERO);
        coalescer.note(&key("x"), now);
        assert_eq!(coalescer.drain_due(now), vec![key("x")]);
    }
}
