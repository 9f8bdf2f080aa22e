// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: AGPL-3.0-only

//! Per-FMSPC cache of TCB bundles.
//!
//! Bundles are stored only after they verified against a live quote, so
//! the cache cannot be poisoned by a bad download. Entries are written
//! through to the persistent store and reloaded at startup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use attestation::{Fmspc, TcbBundle};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tracing::warn;

use crate::store::{Store, StoreError};

const KEY_PREFIX: &str = "tcb_cache/";

const REFRESH_INTERVAL_SECS: i64 = 60 * 60;
const SAFETY_MARGIN_SECS: i64 = 15 * 60;

/// One cached bundle with its refresh schedule.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheEntry {
    pub bundle: TcbBundle,
    pub fetched_at: DateTime<Utc>,
    pub next_refresh_at: DateTime<Utc>,
}

/// TCB bundle cache shared by all runtimes on the host.
///
/// The index lock covers the in-memory map only; readers clone bundles
/// out. Per-FMSPC slots serialize refresh decisions so concurrent
/// updates for the same platform share one download.
pub struct TcbCache {
    store: Arc<dyn Store>,
    entries: Mutex<HashMap<Fmspc, CacheEntry>>,
    slots: Mutex<HashMap<Fmspc, Arc<tokio::sync::Mutex<()>>>>,
}

impl TcbCache {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            entries: Mutex::new(HashMap::new()),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Reloads persisted entries. Returns how many were restored;
    /// unreadable entries are skipped and refreshed naturally.
    pub fn load(&self) -> Result<usize, StoreError> {
        let mut entries = self.entries.lock().unwrap();

        for (key, value) in self.store.scan_prefix(KEY_PREFIX.as_bytes())? {
            let fmspc = std::str::from_utf8(&key[KEY_PREFIX.len()..])
                .ok()
                .and_then(Fmspc::from_hex);
            let fmspc = match fmspc {
                Some(fmspc) => fmspc,
                None => {
                    warn!(key = %String::from_utf8_lossy(&key), "skipping unparseable cache key");
                    continue;
                }
            };

            match ciborium::de::from_reader::<CacheEntry, _>(value.as_slice()) {
                Ok(entry) => {
                    entries.insert(fmspc, entry);
                }
                Err(err) => {
                    warn!(%fmspc, %err, "skipping unreadable cache entry");
                }
            }
        }

        Ok(entries.len())
    }

    /// Takes the per-FMSPC refresh slot. Holding the guard across one
    /// lookup/fetch/store round makes concurrent updates for the same
    /// FMSPC share a single download.
    pub async fn acquire(&self, fmspc: Fmspc) -> OwnedMutexGuard<()> {
        let slot = self
            .slots
            .lock()
            .unwrap()
            .entry(fmspc)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();

        slot.lock_owned().await
    }

    /// Returns the cached bundle, if any, and whether a refresh is due.
    pub fn lookup(&self, fmspc: Fmspc, now: DateTime<Utc>) -> (Option<TcbBundle>, bool) {
        let entries = self.entries.lock().unwrap();

        match entries.get(&fmspc) {
            Some(entry) => (Some(entry.bundle.clone()), now >= entry.next_refresh_at),
            None => (None, true),
        }
    }

    /// Stores a verified bundle and schedules its refresh.
    pub fn store(
        &self,
        fmspc: Fmspc,
        bundle: TcbBundle,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let next_update = bundle
            .next_update()
            .map_err(|err| StoreError::Codec(err.to_string()))?;

        let next_refresh_at = (next_update - Duration::seconds(SAFETY_MARGIN_SECS))
            .min(now + Duration::seconds(REFRESH_INTERVAL_SECS))
            // A bundle on the verge of expiry still must not be refetched
            // in a tight loop.
            .max(now + Duration::seconds(60))
            .min(next_update);

        let entry = CacheEntry {
            bundle,
            fetched_at: now,
            next_refresh_at,
        };

        let mut value = Vec::new();
        ciborium::ser::into_writer(&entry, &mut value)
            .map_err(|err| StoreError::Codec(err.to_string()))?;
        self.store.set(&cache_key(fmspc), &value)?;

        self.entries.lock().unwrap().insert(fmspc, entry);
        Ok(())
    }
}

fn cache_key(fmspc: Fmspc) -> Vec<u8> {
    format!("{}{}", KEY_PREFIX, hex::encode(fmspc.0)).into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use attestation::mock::MockEvidence;

    fn fixture() -> (MockEvidence, Arc<MemoryStore>, TcbCache) {
        let mock = MockEvidence::new();
        let store = Arc::new(MemoryStore::new());
        let cache = TcbCache::new(store.clone());
        (mock, store, cache)
    }

    #[test]
    fn missing_entry_wants_refresh() {
        let (mock, _store, cache) = fixture();
        let (cached, refresh) = cache.lookup(mock.fmspc(), MockEvidence::valid_at());
        assert!(cached.is_none());
        assert!(refresh);
    }

    #[test]
    fn refresh_is_scheduled_one_interval_out() {
        let (mock, _store, cache) = fixture();
        let now = MockEvidence::valid_at();

        cache.store(mock.fmspc(), mock.tcb_bundle(now), now).unwrap();

        let (cached, refresh) = cache.lookup(mock.fmspc(), now);
        assert!(cached.is_some());
        assert!(!refresh);

        // Not due just before the interval, due right at it.
        let just_before = now + Duration::seconds(REFRESH_INTERVAL_SECS - 1);
        assert!(!cache.lookup(mock.fmspc(), just_before).1);
        let at_interval = now + Duration::seconds(REFRESH_INTERVAL_SECS);
        assert!(cache.lookup(mock.fmspc(), at_interval).1);
    }

    #[test]
    fn refresh_never_lands_past_expiry() {
        let (mock, _store, cache) = fixture();
        let now = MockEvidence::valid_at();
        let bundle = mock.tcb_bundle(now);
        let next_update = bundle.next_update().unwrap();

        // Fetch very close to expiry: the schedule must stay within the
        // bundle lifetime and after the fetch time.
        let late = next_update - Duration::seconds(30);
        cache.store(mock.fmspc(), bundle, late).unwrap();

        let entries = cache.entries.lock().unwrap();
        let entry = entries.get(&mock.fmspc()).unwrap();
        assert!(entry.next_refresh_at > entry.fetched_at);
        assert!(entry.next_refresh_at <= next_update);
    }

    #[test]
    fn entries_survive_a_reload() {
        let (mock, store, cache) = fixture();
        let now = MockEvidence::valid_at();
        cache.store(mock.fmspc(), mock.tcb_bundle(now), now).unwrap();

        let restored = TcbCache::new(store);
        assert_eq!(restored.load().unwrap(), 1);

        let (cached, refresh) = restored.lookup(mock.fmspc(), now);
        assert!(cached.is_some());
        assert!(!refresh);
    }

    #[test]
    fn corrupt_entries_are_skipped() {
        let (mock, store, cache) = fixture();
        let now = MockEvidence::valid_at();
        cache.store(mock.fmspc(), mock.tcb_bundle(now), now).unwrap();

        store.set(b"tcb_cache/00112233aabb", b"junk").unwrap();

        let restored = TcbCache::new(store);
        assert_eq!(restored.load().unwrap(), 1);
    }
}
