//! Version-gated keyed cache.
//!
//! Every authoritative write carries a server version and is applied only when it is newer
//! than what the cache already holds, so duplicate and out-of-order deliveries are dropped
//! without side effects. Deletions leave a tombstone so older updates cannot resurrect the
//! entity.

use std::collections::HashMap;
use std::time::Instant;

use sonic_rs::{JsonContainerTrait, JsonValueMutTrait, JsonValueTrait, Value, json};

use super::bounded::BoundedQueue;
use super::clock::SharedClock;
use super::key::{CacheKey, KeyPattern};
use super::types::{Staleness, Version};

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub value: Value,
    pub version: Version,
    pub staleness: Staleness,
    pub last_updated_at: Instant,
    /// A pending mutation's speculative value is currently shown.
    pub optimistic: bool,
}

/// Result of an authoritative write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted,
    Updated,
    Removed,
    /// Version not newer than the cached value or the tombstone; nothing changed.
    Stale,
    /// Held behind a pending mutation on the same key; applied once it resolves.
    Deferred,
}

impl WriteOutcome {
    pub fn is_applied(self) -> bool {
        !matches!(self, WriteOutcome::Stale | WriteOutcome::Deferred)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Updated,
    Removed,
    Invalidated,
}

/// Coalesced change notification delivered to cache consumers.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheChange {
    pub key: CacheKey,
    pub kind: ChangeKind,
    pub value: Option<Value>,
    pub version: Version,
}

/// RFC 7386 JSON merge patch: objects merge recursively, `null` removes a field, anything
/// else replaces the target.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Some(patch_fields) = patch.as_object() else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = json!({});
    }
    let Some(target_fields) = target.as_object_mut() else {
        return;
    };

    for (field, value) in patch_fields.iter() {
        if value.is_null() {
            target_fields.remove(&field);
        } else if let Some(existing) = target_fields.get_mut(&field) {
            merge_patch(existing, value);
        } else {
            let mut fresh = json!(null);
            merge_patch(&mut fresh, value);
            target_fields.insert(&field, fresh);
        }
    }
}

pub const DEFAULT_TOMBSTONE_CAPACITY: usize = 4096;

#[derive(Debug)]
pub struct SyncCache {
    entries: HashMap<CacheKey, CacheEntry>,
    tombstones: HashMap<CacheKey, Version>,
    /// Deletion order; the oldest tombstone is forgotten once the cap is reached.
    tombstone_order: BoundedQueue<(CacheKey, Version)>,
    clock: SharedClock,
}

impl SyncCache {
    pub fn new(clock: SharedClock) -> Self {
        Self::with_tombstone_capacity(clock, DEFAULT_TOMBSTONE_CAPACITY)
    }

    pub fn with_tombstone_capacity(clock: SharedClock, capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            tombstones: HashMap::new(),
            tombstone_order: BoundedQueue::new(capacity),
            clock,
        }
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    pub fn get(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn tombstone(&self, key: &CacheKey) -> Option<Version> {
        self.tombstones.get(key).copied()
    }

    /// Newest version known for `key`, live or deleted.
    fn known_version(&self, key: &CacheKey) -> Option<Version> {
        match (self.entries.get(key), self.tombstones.get(key)) {
            (Some(entry), _) => Some(entry.version),
            (None, Some(deleted)) => Some(*deleted),
            (None, None) => None,
        }
    }

    fn is_newer(&self, key: &CacheKey, version: Version) -> bool {
        self.known_version(key).is_none_or(|known| version > known)
    }

    /// Merge `diff` into the entry for `key` when `version` is newer. Unknown keys are
    /// inserted with the diff as their value.
    pub fn apply_patch(&mut self, key: &CacheKey, diff: &Value, version: Version) -> WriteOutcome {
        if !self.is_newer(key, version) {
            return WriteOutcome::Stale;
        }
        let now = self.clock.now();
        self.tombstones.remove(key);

        match self.entries.get_mut(key) {
            Some(entry) => {
                merge_patch(&mut entry.value, diff);
                entry.version = version;
                entry.staleness = Staleness::Fresh;
                entry.last_updated_at = now;
                WriteOutcome::Updated
            }
            None => {
                let mut value = json!(null);
                merge_patch(&mut value, diff);
                self.entries
                    .insert(key.clone(), fresh_entry(key, value, version, now));
                WriteOutcome::Inserted
            }
        }
    }

    /// Version-gated full replacement.
    pub fn replace(&mut self, key: &CacheKey, value: Value, version: Version) -> WriteOutcome {
        if !self.is_newer(key, version) {
            return WriteOutcome::Stale;
        }
        let now = self.clock.now();
        self.tombstones.remove(key);
        match self
            .entries
            .insert(key.clone(), fresh_entry(key, value, version, now))
        {
            Some(_) => WriteOutcome::Updated,
            None => WriteOutcome::Inserted,
        }
    }

    /// Version-gated delete; records a tombstone at `version`.
    pub fn remove(&mut self, key: &CacheKey, version: Version) -> WriteOutcome {
        if !self.is_newer(key, version) {
            return WriteOutcome::Stale;
        }
        self.entries.remove(key);
        self.tombstones.insert(key.clone(), version);
        if let Some((evicted, at)) = self.tombstone_order.push((key.clone(), version)) {
            // A key deleted again later has a newer slot in the queue; keep that one.
            if self.tombstones.get(&evicted) == Some(&at) {
                self.tombstones.remove(&evicted);
            }
        }
        WriteOutcome::Removed
    }

    /// Mark every matching entry `Invalidated`; returns the keys touched. Never fetches.
    pub fn invalidate(&mut self, pattern: &KeyPattern) -> Vec<CacheKey> {
        let mut touched: Vec<CacheKey> = self
            .entries
            .values_mut()
            .filter(|entry| pattern.matches(&entry.key))
            .map(|entry| {
                entry.staleness = Staleness::Invalidated;
                entry.key.clone()
            })
            .collect();
        touched.sort();
        touched
    }

    /// Mark every fresh entry `Stale` (push channel left `Connected`).
    pub fn mark_all_stale(&mut self) -> usize {
        let mut marked = 0;
        for entry in self.entries.values_mut() {
            if entry.staleness == Staleness::Fresh {
                entry.staleness = Staleness::Stale;
                marked += 1;
            }
        }
        marked
    }

    /// Apply a speculative diff without touching the version. Returns the prior entry.
    pub fn apply_optimistic(&mut self, key: &CacheKey, diff: &Value) -> Option<CacheEntry> {
        let now = self.clock.now();
        let prior = self.entries.get(key).cloned();
        let entry = self.entries.entry(key.clone()).or_insert_with(|| CacheEntry {
            key: key.clone(),
            value: json!(null),
            version: 0,
            staleness: Staleness::Fresh,
            last_updated_at: now,
            optimistic: true,
        });
        merge_patch(&mut entry.value, diff);
        entry.optimistic = true;
        entry.last_updated_at = now;
        prior
    }

    /// Install the server's canonical value for a confirmed mutation. An authoritative
    /// entry (or tombstone) newer than `version` wins and `false` is returned.
    pub fn confirm(&mut self, key: &CacheKey, value: Value, version: Version) -> bool {
        let superseded = match (self.entries.get(key), self.tombstones.get(key)) {
            (Some(entry), _) if !entry.optimistic => entry.version > version,
            (Some(_), _) => false,
            (None, Some(deleted)) => *deleted >= version,
            (None, None) => false,
        };
        if superseded {
            return false;
        }
        let now = self.clock.now();
        let version = self
            .entries
            .get(key)
            .map_or(version, |entry| entry.version.max(version));
        self.tombstones.remove(key);
        self.entries
            .insert(key.clone(), fresh_entry(key, value, version, now));
        true
    }

    /// Put back what was there before a rejected mutation. Staleness recorded while the
    /// mutation was pending (invalidation, disconnect) is kept if it is worse.
    pub fn restore(&mut self, key: &CacheKey, prior: Option<CacheEntry>) {
        match prior {
            Some(mut entry) => {
                if let Some(current) = self.entries.get(key) {
                    entry.staleness = entry.staleness.max(current.staleness);
                }
                self.entries.insert(key.clone(), entry);
            }
            None => {
                self.entries.remove(key);
            }
        }
    }

    /// Notification describing the current state of `key`.
    pub fn change_for(&self, key: &CacheKey) -> CacheChange {
        match self.entries.get(key) {
            Some(entry) => CacheChange {
                key: key.clone(),
                kind: if entry.staleness == Staleness::Invalidated {
                    ChangeKind::Invalidated
                } else {
                    ChangeKind::Updated
                },
                value: Some(entry.value.clone()),
                version: entry.version,
            },
            None => CacheChange {
                key: key.clone(),
                kind: ChangeKind::Removed,
                value: None,
                version: self.tombstones.get(key).copied().unwrap_or_default(),
            },
        }
    }
}

fn fresh_entry(key: &CacheKey, value: Value, version: Version, now: Instant) -> CacheEntry {
    CacheEntry {
        key: key.clone(),
        value,
        version,
        staleness: Staleness::Fresh,
        last_updated_at: now,
        optimistic: false,
    }
}
