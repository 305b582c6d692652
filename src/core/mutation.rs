//! Bookkeeping for optimistic mutations.
//!
//! The ledger holds the prior snapshot of every in-flight mutation, buffers inbound events
//! that target a key while its mutation is pending, and records round-trip latency. It does
//! not touch the cache; the engine applies the outcome.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use hdrhistogram::Histogram;
use rand::{Rng, SeedableRng, rngs::SmallRng};
use sonic_rs::Value;

use super::bounded::BoundedQueue;
use super::cache::CacheEntry;
use super::event::SyncEvent;
use super::key::CacheKey;
use super::types::{SyncError, SyncResult};

pub type MutationId = u64;

pub const TEMP_ID_PREFIX: &str = "tmp-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    Pending,
    Confirmed,
    RolledBack,
}

#[derive(Debug, Clone)]
pub struct PendingMutation {
    pub id: MutationId,
    pub key: CacheKey,
    pub diff: Value,
    /// Entry as it was before the speculative apply; `None` when the key did not exist.
    pub prior: Option<CacheEntry>,
    pub status: MutationStatus,
    pub server_id: Option<String>,
    pub started_at: Instant,
}

impl PendingMutation {
    /// Created under a client-generated temporary id.
    pub fn is_create(&self) -> bool {
        self.key.id.starts_with(TEMP_ID_PREFIX)
    }
}

/// How a pending mutation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Confirmed { server_id: Option<String> },
    RolledBack,
}

#[derive(Debug)]
pub struct ResolvedMutation {
    pub mutation: PendingMutation,
    /// Events that arrived for the key while the mutation was pending, in arrival order.
    pub buffered: Vec<SyncEvent>,
    pub latency: Duration,
}

#[derive(Debug)]
pub struct MutationLedger {
    pending: HashMap<MutationId, PendingMutation>,
    by_key: HashMap<CacheKey, MutationId>,
    buffered: HashMap<CacheKey, BoundedQueue<SyncEvent>>,
    buffer_capacity: usize,
    next_id: MutationId,
    temp_seq: u16,
    confirmed: u64,
    rolled_back: u64,
    latency_us: Histogram<u64>,
    rng: SmallRng,
}

impl MutationLedger {
    pub fn new(buffer_capacity: usize) -> Self {
        Self {
            pending: HashMap::new(),
            by_key: HashMap::new(),
            buffered: HashMap::new(),
            buffer_capacity,
            next_id: 0,
            temp_seq: 0,
            confirmed: 0,
            rolled_back: 0,
            latency_us: Histogram::new_with_bounds(1, 600_000_000, 3)
                .expect("histogram bounds are valid"),
            rng: SmallRng::from_entropy(),
        }
    }

    /// Fresh `tmp-` id for an entity created before the server assigns one.
    pub fn temp_id(&mut self) -> String {
        self.temp_seq = self.temp_seq.wrapping_add(1);
        let salt: u32 = self.rng.r#gen();
        format!("{TEMP_ID_PREFIX}{salt:08x}{:04x}", self.temp_seq)
    }

    pub fn is_pending(&self, key: &CacheKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn get(&self, id: MutationId) -> Option<&PendingMutation> {
        self.pending.get(&id)
    }

    /// Register a mutation whose speculative value is already in the cache.
    pub fn begin(
        &mut self,
        key: CacheKey,
        diff: Value,
        prior: Option<CacheEntry>,
        now: Instant,
    ) -> SyncResult<MutationId> {
        if self.by_key.contains_key(&key) {
            return Err(SyncError::MutationInFlight {
                key: key.to_string(),
            });
        }
        self.next_id = self.next_id.wrapping_add(1);
        let id = self.next_id;
        self.by_key.insert(key.clone(), id);
        self.pending.insert(
            id,
            PendingMutation {
                id,
                key,
                diff,
                prior,
                status: MutationStatus::Pending,
                server_id: None,
                started_at: now,
            },
        );
        Ok(id)
    }

    /// Hold an inbound event for a key with a pending mutation. Returns the evicted event
    /// when the per-key buffer is full.
    pub fn buffer(&mut self, key: &CacheKey, event: SyncEvent) -> Option<SyncEvent> {
        let capacity = self.buffer_capacity;
        self.buffered
            .entry(key.clone())
            .or_insert_with(|| BoundedQueue::new(capacity))
            .push(event)
    }

    pub fn resolve(
        &mut self,
        id: MutationId,
        resolution: Resolution,
        now: Instant,
    ) -> SyncResult<ResolvedMutation> {
        let mut mutation = self
            .pending
            .remove(&id)
            .ok_or(SyncError::UnknownMutation(id))?;
        self.by_key.remove(&mutation.key);

        let buffered = self
            .buffered
            .remove(&mutation.key)
            .map(|mut queue| queue.drain().collect())
            .unwrap_or_default();

        match resolution {
            Resolution::Confirmed { server_id } => {
                mutation.status = MutationStatus::Confirmed;
                mutation.server_id = server_id;
                self.confirmed = self.confirmed.saturating_add(1);
            }
            Resolution::RolledBack => {
                mutation.status = MutationStatus::RolledBack;
                self.rolled_back = self.rolled_back.saturating_add(1);
            }
        }

        let latency = now.saturating_duration_since(mutation.started_at);
        let micros = latency.as_micros().min(u64::MAX as u128) as u64;
        self.latency_us.saturating_record(micros.max(1));

        Ok(ResolvedMutation {
            mutation,
            buffered,
            latency,
        })
    }

    /// Drop every pending mutation without resolving it (engine shutdown).
    pub fn abandon_all(&mut self) -> Vec<PendingMutation> {
        self.by_key.clear();
        self.buffered.clear();
        let mut abandoned: Vec<_> = self.pending.drain().map(|(_, m)| m).collect();
        abandoned.sort_by_key(|m| m.id);
        abandoned
    }

    pub fn confirmed(&self) -> u64 {
        self.confirmed
    }

    pub fn rolled_back(&self) -> u64 {
        self.rolled_back
    }

    pub fn latency_samples(&self) -> u64 {
        self.latency_us.len()
    }

    /// `(p50, p99)` round-trip latency in microseconds; zero without samples.
    pub fn latency_percentiles(&self) -> (u64, u64) {
        if self.latency_us.is_empty() {
            return (0, 0);
        }
        (
            self.latency_us.value_at_percentile(50.0),
            self.latency_us.value_at_percentile(99.0),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonic_rs::json;

    fn key() -> CacheKey {
        CacheKey::new("appointment", "appt-42")
    }

    #[test]
    fn one_mutation_per_key() {
        let mut ledger = MutationLedger::new(8);
        let now = Instant::now();
        ledger
            .begin(key(), json!({"status": "CONFIRMED"}), None, now)
            .expect("first mutation");
        let err = ledger
            .begin(key(), json!({"status": "CANCELLED"}), None, now)
            .expect_err("second mutation on same key");
        assert!(matches!(err, SyncError::MutationInFlight { .. }));
        assert!(ledger.is_pending(&key()));
    }

    #[test]
    fn resolve_returns_buffered_events_in_arrival_order() {
        let mut ledger = MutationLedger::new(8);
        let start = Instant::now();
        let id = ledger.begin(key(), json!({}), None, start).expect("begin");

        for version in [6, 7] {
            ledger.buffer(
                &key(),
                SyncEvent::EntityUpdated {
                    key: key(),
                    diff: json!({"v": version}),
                    version,
                },
            );
        }

        let resolved = ledger
            .resolve(
                id,
                Resolution::Confirmed { server_id: None },
                start + Duration::from_millis(40),
            )
            .expect("resolve");
        assert_eq!(resolved.mutation.status, MutationStatus::Confirmed);
        assert_eq!(resolved.latency, Duration::from_millis(40));
        let versions: Vec<_> = resolved
            .buffered
            .iter()
            .filter_map(|event| match event {
                SyncEvent::EntityUpdated { version, .. } => Some(*version),
                _ => None,
            })
            .collect();
        assert_eq!(versions, vec![6, 7]);
        assert!(!ledger.is_pending(&key()));
        assert_eq!(ledger.confirmed(), 1);
        assert_eq!(ledger.latency_samples(), 1);
    }

    #[test]
    fn buffer_evicts_oldest_when_full() {
        let mut ledger = MutationLedger::new(1);
        ledger.begin(key(), json!({}), None, Instant::now()).expect("begin");
        assert!(ledger.buffer(&key(), SyncEvent::Heartbeat).is_none());
        assert_eq!(
            ledger.buffer(&key(), SyncEvent::AuthAccepted),
            Some(SyncEvent::Heartbeat)
        );
    }

    #[test]
    fn unknown_and_double_resolution_fail() {
        let mut ledger = MutationLedger::new(4);
        let now = Instant::now();
        assert!(matches!(
            ledger.resolve(9, Resolution::RolledBack, now),
            Err(SyncError::UnknownMutation(9))
        ));
        let id = ledger.begin(key(), json!({}), None, now).expect("begin");
        ledger.resolve(id, Resolution::RolledBack, now).expect("resolve");
        assert!(ledger.resolve(id, Resolution::RolledBack, now).is_err());
        assert_eq!(ledger.rolled_back(), 1);
    }

    #[test]
    fn temp_ids_are_prefixed_and_distinct() {
        let mut ledger = MutationLedger::new(4);
        let a = ledger.temp_id();
        let b = ledger.temp_id();
        assert!(a.starts_with(TEMP_ID_PREFIX));
        assert_ne!(a, b);
    }
}
