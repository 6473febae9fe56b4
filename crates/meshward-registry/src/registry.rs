//! ClientRegistry: thread-safe in-memory registry over the address store.
//!
//! All mutations take the single write lock. Readers get owned copies, so
//! no caller ever holds a reference into the map while it changes.
//!
//! Persistence discipline:
//! - `remember()` writes through to the store while holding the write
//!   lock, so an acknowledged heartbeat is on disk before the caller sees
//!   the result, and two registrations of one identity reach the disk in
//!   the order they reach memory. The cost is that a commit (with its
//!   fsync) blocks every other reader and writer. `remember()` is a
//!   blocking call; async callers run it with `spawn_blocking`.
//! - `record_ping_result()` only advances `last_seen` in memory and marks
//!   the identity dirty; `flush()` writes dirty identities in one
//!   transaction. A crash between a successful probe and the next flush
//!   loses at most that `last_seen` advance, never an address.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use meshward_core::epoch_secs;
use meshward_state::{AddressStore, StateResult};
use tracing::{debug, info, warn};

use crate::record::{ClientRecord, ClientStats};

#[derive(Default)]
struct Inner {
    records: BTreeMap<String, ClientRecord>,
    /// Identities whose durable fields changed since the last flush.
    dirty: BTreeSet<String>,
}

pub struct ClientRegistry {
    inner: RwLock<Inner>,
    store: Option<AddressStore>,
    degraded: AtomicBool,
}

impl ClientRegistry {
    /// Registry backed by a durable store. Call [`load`](Self::load) to
    /// repopulate it.
    pub fn new(store: AddressStore) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            store: Some(store),
            degraded: AtomicBool::new(false),
        }
    }

    /// Registry with no persistence at all.
    pub fn in_memory() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            store: None,
            degraded: AtomicBool::new(false),
        }
    }

    /// Replace the in-memory view with the store's contents.
    ///
    /// Probe state is not persisted, so every reloaded client starts as
    /// never pinged.
    pub fn load(&self) -> StateResult<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let stored = store.list()?;
        let mut inner = self.write();
        inner.records = stored
            .into_iter()
            .map(|s| (s.identity.clone(), ClientRecord::from(s)))
            .collect();
        inner.dirty.clear();
        let count = inner.records.len();
        info!(count, "client registry loaded");
        Ok(count)
    }

    /// Record a heartbeat: idempotent upsert of `identity → address`.
    ///
    /// A report older than the stored `last_seen` is ignored and the
    /// current record is returned unchanged.
    pub fn remember(&self, identity: &str, address: &str, timestamp: u64) -> ClientRecord {
        let mut inner = self.write();
        let record = match inner.records.get_mut(identity) {
            Some(existing) if timestamp < existing.last_seen => {
                debug!(
                    %identity,
                    timestamp,
                    last_seen = existing.last_seen,
                    "ignoring out-of-order heartbeat"
                );
                return existing.clone();
            }
            Some(existing) => {
                if existing.address != address {
                    info!(%identity, from = %existing.address, to = %address, "client address changed");
                }
                existing.address = address.to_string();
                existing.last_seen = timestamp;
                existing.clone()
            }
            None => {
                let record = ClientRecord::new(identity, address, timestamp);
                inner.records.insert(identity.to_string(), record.clone());
                info!(%identity, %address, "new client registered");
                record
            }
        };

        inner.dirty.remove(identity);
        if let Some(store) = &self.store {
            match store.put(&record.to_stored()) {
                Ok(()) => self.degraded.store(false, Ordering::Relaxed),
                Err(e) => {
                    warn!(%identity, error = %e, "failed to persist client, will retry on flush");
                    inner.dirty.insert(identity.to_string());
                    self.degraded.store(true, Ordering::Relaxed);
                }
            }
        }
        record
    }

    /// Apply one probe result. Returns false (and changes nothing) if the
    /// identity is not registered.
    pub fn record_ping_result(&self, identity: &str, ok: bool, timestamp: u64) -> bool {
        let mut inner = self.write();
        let Some(record) = inner.records.get_mut(identity) else {
            debug!(%identity, "dropping probe result for unknown client");
            return false;
        };

        record.last_ping_ok = Some(ok);
        record.last_ping_at = Some(record.last_ping_at.map_or(timestamp, |t| t.max(timestamp)));
        let mut advanced = false;
        if ok {
            record.consecutive_failures = 0;
            if timestamp > record.last_seen {
                record.last_seen = timestamp;
                advanced = true;
            }
        } else {
            record.consecutive_failures = record.consecutive_failures.saturating_add(1);
            if record.consecutive_failures == 1 {
                info!(%identity, address = %record.address, "client stopped answering probes");
            }
        }

        if advanced {
            inner.dirty.insert(identity.to_string());
        }
        true
    }

    /// Owned copy of every record, ordered by identity.
    pub fn snapshot(&self) -> Vec<ClientRecord> {
        self.read().records.values().cloned().collect()
    }

    pub fn get(&self, identity: &str) -> Option<ClientRecord> {
        self.read().records.get(identity).cloned()
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.read().records.contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().records.is_empty()
    }

    pub fn stats(&self, stale_after: Duration) -> ClientStats {
        self.stats_at(epoch_secs(), stale_after)
    }

    pub fn stats_at(&self, now: u64, stale_after: Duration) -> ClientStats {
        ClientStats::from_records(self.read().records.values(), now, stale_after)
    }

    /// Records that are not stale as of `now`.
    pub fn list_active_at(&self, now: u64, stale_after: Duration) -> Vec<ClientRecord> {
        self.read()
            .records
            .values()
            .filter(|r| r.is_active(now, stale_after))
            .cloned()
            .collect()
    }

    /// Explicitly remove one client from memory and the store.
    pub fn forget(&self, identity: &str) -> StateResult<bool> {
        let mut inner = self.write();
        let existed = inner.records.remove(identity).is_some();
        inner.dirty.remove(identity);
        if let Some(store) = &self.store {
            store.remove(identity)?;
        }
        if existed {
            info!(%identity, "client forgotten");
        }
        Ok(existed)
    }

    /// Remove every client not seen within `max_age` of `now`. Returns the
    /// evicted identities.
    pub fn evict_stale(&self, now: u64, max_age: Duration) -> StateResult<Vec<String>> {
        let mut inner = self.write();
        let evicted: Vec<String> = inner
            .records
            .values()
            .filter(|r| !r.is_active(now, max_age))
            .map(|r| r.identity.clone())
            .collect();

        for identity in &evicted {
            inner.records.remove(identity);
            inner.dirty.remove(identity);
            if let Some(store) = &self.store {
                store.remove(identity)?;
            }
            warn!(%identity, "evicted stale client");
        }
        Ok(evicted)
    }

    /// Write every dirty record to the store. Returns how many were written.
    pub fn flush(&self) -> StateResult<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let mut inner = self.write();
        if inner.dirty.is_empty() {
            return Ok(0);
        }
        let pending: Vec<_> = inner
            .dirty
            .iter()
            .filter_map(|id| inner.records.get(id))
            .map(ClientRecord::to_stored)
            .collect();

        match store.put_many(&pending) {
            Ok(()) => {
                inner.dirty.clear();
                self.degraded.store(false, Ordering::Relaxed);
                debug!(count = pending.len(), "registry flushed");
                Ok(pending.len())
            }
            Err(e) => {
                self.degraded.store(true, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Number of records waiting for the next flush.
    pub fn pending_writes(&self) -> usize {
        self.read().dirty.len()
    }

    /// True while the last persistence attempt failed.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use super::*;

    fn test_registry() -> ClientRegistry {
        ClientRegistry::new(AddressStore::open_in_memory().unwrap())
    }

    #[test]
    fn remember_creates_record() {
        let registry = test_registry();
        let record = registry.remember("laptop", "10.147.17.5", 1000);

        assert_eq!(record.identity, "laptop");
        assert_eq!(record.address, "10.147.17.5");
        assert_eq!(record.last_seen, 1000);
        assert_eq!(record.last_ping_ok, None);
        assert_eq!(record.consecutive_failures, 0);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remember_is_idempotent() {
        let registry = test_registry();
        let first = registry.remember("laptop", "10.147.17.5", 1000);
        let second = registry.remember("laptop", "10.147.17.5", 1000);

        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn increasing_heartbeats_keep_latest_address() {
        let registry = test_registry();
        let reports = [
            ("10.147.17.5", 1000),
            ("10.147.17.6", 1010),
            ("10.147.17.7", 1020),
            ("10.147.17.8", 1500),
        ];
        for (address, ts) in reports {
            registry.remember("laptop", address, ts);
        }

        let record = registry.get("laptop").unwrap();
        assert_eq!(record.last_seen, 1500);
        assert_eq!(record.address, "10.147.17.8");
    }

    #[test]
    fn out_of_order_heartbeat_is_ignored() {
        let registry = test_registry();
        registry.remember("laptop", "10.147.17.5", 2000);
        let returned = registry.remember("laptop", "10.147.17.99", 1500);

        assert_eq!(returned.address, "10.147.17.5");
        assert_eq!(returned.last_seen, 2000);
        assert_eq!(registry.get("laptop").unwrap(), returned);
    }

    #[test]
    fn ping_result_for_unknown_identity_creates_nothing() {
        let registry = test_registry();
        registry.remember("laptop", "10.147.17.5", 1000);

        assert!(!registry.record_ping_result("ghost", true, 1100));
        assert!(!registry.record_ping_result("ghost", false, 1100));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("ghost").is_none());
    }

    #[test]
    fn failures_count_up_and_reset_on_success() {
        let registry = test_registry();
        registry.remember("laptop", "10.147.17.5", 1000);

        for i in 1..=3 {
            registry.record_ping_result("laptop", false, 1000 + i);
            assert_eq!(registry.get("laptop").unwrap().consecutive_failures, i as u32);
        }
        let record = registry.get("laptop").unwrap();
        assert_eq!(record.last_ping_ok, Some(false));
        assert_eq!(record.last_seen, 1000);

        registry.record_ping_result("laptop", true, 1010);
        let record = registry.get("laptop").unwrap();
        assert_eq!(record.consecutive_failures, 0);
        assert_eq!(record.last_ping_ok, Some(true));
        assert_eq!(record.last_seen, 1010);
        assert_eq!(record.last_ping_at, Some(1010));
    }

    #[test]
    fn successful_probe_never_regresses_last_seen() {
        let registry = test_registry();
        registry.remember("laptop", "10.147.17.5", 2000);
        registry.record_ping_result("laptop", true, 1500);

        assert_eq!(registry.get("laptop").unwrap().last_seen, 2000);
        assert_eq!(registry.pending_writes(), 0);
    }

    #[test]
    fn stats_use_stale_threshold() {
        let registry = test_registry();
        registry.remember("a", "10.0.0.1", 1000);
        registry.remember("b", "10.0.0.2", 1000);
        registry.remember("c", "10.0.0.3", 500);
        registry.record_ping_result("a", true, 1000);
        registry.record_ping_result("b", false, 1000);

        let stats = registry.stats_at(1000, Duration::from_secs(300));
        assert_eq!(stats.total, 3);
        assert_eq!(stats.active, 2);
        assert_eq!(stats.stale, 1);
        assert_eq!(stats.online, 1);
        assert_eq!(stats.offline, 1);
        assert_eq!(stats.never_pinged, 1);

        let active: Vec<String> = registry
            .list_active_at(1000, Duration::from_secs(300))
            .into_iter()
            .map(|r| r.identity)
            .collect();
        assert_eq!(active, vec!["a", "b"]);
    }

    #[test]
    fn snapshot_is_ordered_copy() {
        let registry = test_registry();
        registry.remember("zeta", "10.0.0.9", 1);
        registry.remember("alpha", "10.0.0.1", 1);

        let snapshot = registry.snapshot();
        registry.remember("mid", "10.0.0.5", 2);

        let ids: Vec<&str> = snapshot.iter().map(|r| r.identity.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn probe_advance_is_flushed_lazily() {
        let store = AddressStore::open_in_memory().unwrap();
        let registry = ClientRegistry::new(store.clone());
        registry.remember("laptop", "10.147.17.5", 1000);
        registry.record_ping_result("laptop", true, 1100);

        assert_eq!(store.get("laptop").unwrap().unwrap().last_seen, 1000);
        assert_eq!(registry.pending_writes(), 1);

        assert_eq!(registry.flush().unwrap(), 1);
        assert_eq!(store.get("laptop").unwrap().unwrap().last_seen, 1100);
        assert_eq!(registry.flush().unwrap(), 0);
    }

    #[test]
    fn forget_and_evict_remove_from_store() {
        let store = AddressStore::open_in_memory().unwrap();
        let registry = ClientRegistry::new(store.clone());
        registry.remember("old", "10.0.0.1", 100);
        registry.remember("new", "10.0.0.2", 1000);
        registry.remember("gone", "10.0.0.3", 1000);

        assert!(registry.forget("gone").unwrap());
        assert!(!registry.forget("gone").unwrap());

        let evicted = registry.evict_stale(1000, Duration::from_secs(300)).unwrap();
        assert_eq!(evicted, vec!["old"]);

        let stored: Vec<String> = store.list().unwrap().into_iter().map(|s| s.identity).collect();
        assert_eq!(stored, vec!["new"]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn reload_reproduces_durable_tuples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meshward.redb");

        let before: BTreeSet<(String, String, u64)> = {
            let registry = ClientRegistry::new(AddressStore::open(&path).unwrap());
            registry.remember("a", "10.0.0.1", 1000);
            registry.remember("b", "10.0.0.2", 1001);
            registry.remember("b", "10.0.0.22", 1002);
            registry.remember("c", "host-c.overlay", 1003);
            registry.record_ping_result("c", true, 1100);
            registry.flush().unwrap();
            registry
                .snapshot()
                .into_iter()
                .map(|r| (r.identity, r.address, r.last_seen))
                .collect()
        };

        let registry = ClientRegistry::new(AddressStore::open(&path).unwrap());
        assert_eq!(registry.load().unwrap(), 3);
        let after: BTreeSet<(String, String, u64)> = registry
            .snapshot()
            .into_iter()
            .map(|r| (r.identity, r.address, r.last_seen))
            .collect();

        assert_eq!(before, after);
        assert!(registry.snapshot().iter().all(|r| r.last_ping_ok.is_none()));
    }

    #[test]
    fn in_memory_registry_never_degrades() {
        let registry = ClientRegistry::in_memory();
        registry.remember("laptop", "10.147.17.5", 1000);
        registry.record_ping_result("laptop", true, 1001);

        assert_eq!(registry.flush().unwrap(), 0);
        assert_eq!(registry.load().unwrap(), 0);
        assert!(!registry.is_degraded());
    }

    #[test]
    fn concurrent_writers_keep_invariants() {
        let registry = Arc::new(test_registry());
        registry.remember("shared", "10.0.0.1", 0);

        let handles: Vec<_> = (0..8u64)
            .map(|worker| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..100u64 {
                        let ts = worker * 1000 + i;
                        registry.remember("shared", &format!("10.0.{worker}.{i}"), ts);
                        registry.record_ping_result("shared", i % 2 == 0, ts);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let record = registry.get("shared").unwrap();
        // The highest timestamp any worker sent wins.
        assert_eq!(record.last_seen, 7099);
        assert_eq!(record.address, "10.0.7.99");
        assert_eq!(registry.len(), 1);
    }
}
