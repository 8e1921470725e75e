// SPDX-License-Identifier: AGPL-3.0-or-later
// PointLock - Pessimistic Lock Manager for Transactional Key-Value Engines
// Copyright (C) 2026 PointLock Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Thread-local cache of column-family lock tables
//!
//! The hot acquire path must not take the registry mutex, so each thread
//! keeps its own column family to lock table references. Removing a
//! column family scrapes every thread's cache; operations already holding
//! a reference finish on their own `Arc`, and lookups after the scrape go
//! back through the registry.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::lock_map::LockMap;
use crate::txn::ColumnFamilyId;

type CfCache = HashMap<ColumnFamilyId, Arc<LockMap>>;
type SharedCfCache = Arc<Mutex<CfCache>>;

thread_local! {
    /// Per-thread cache slots keyed by manager id. The slot map is
    /// dropped on thread exit, releasing the thread's lock table
    /// references; the owning manager prunes the dead weak handle on its
    /// next scrape.
    static LOCAL_CACHES: RefCell<HashMap<u64, SharedCfCache>> = RefCell::new(HashMap::new());
}

static NEXT_CACHE_ID: AtomicU64 = AtomicU64::new(0);

/// One manager's view of every thread's lock table cache.
pub(crate) struct LockMapCache {
    /// Process-unique id so two managers never share thread slots.
    id: u64,
    /// Weak handles to the per-thread caches, walked on scrape.
    threads: Mutex<Vec<Weak<Mutex<CfCache>>>>,
}

impl LockMapCache {
    pub(crate) fn new() -> Self {
        Self {
            id: NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed),
            threads: Mutex::new(Vec::new()),
        }
    }

    fn local(&self) -> SharedCfCache {
        LOCAL_CACHES.with(|slots| {
            slots
                .borrow_mut()
                .entry(self.id)
                .or_insert_with(|| {
                    let cache: SharedCfCache = Arc::new(Mutex::new(HashMap::new()));
                    self.threads.lock().push(Arc::downgrade(&cache));
                    cache
                })
                .clone()
        })
    }

    /// The calling thread's cached reference, if any.
    pub(crate) fn get(&self, cf: ColumnFamilyId) -> Option<Arc<LockMap>> {
        self.local().lock().get(&cf).cloned()
    }

    pub(crate) fn insert(&self, cf: ColumnFamilyId, map: Arc<LockMap>) {
        self.local().lock().insert(cf, map);
    }

    /// Drop every thread's cached references and prune threads that have
    /// exited. Called after a column family is unpublished from the
    /// registry, and never while the registry mutex is held.
    pub(crate) fn scrape(&self) {
        let mut threads = self.threads.lock();
        threads.retain(|slot| match slot.upgrade() {
            Some(cache) => {
                cache.lock().clear();
                true
            }
            None => false,
        });
    }
}

impl Drop for LockMapCache {
    fn drop(&mut self) {
        // Unpin every lock table; the empty per-thread slots die with
        // their threads.
        self.scrape();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stripe::DefaultStripeFactory;
    use std::thread;

    fn lock_map() -> Arc<LockMap> {
        Arc::new(LockMap::new(4, &DefaultStripeFactory))
    }

    #[test]
    fn test_get_after_insert() {
        let cache = LockMapCache::new();
        assert!(cache.get(1).is_none());

        let map = lock_map();
        cache.insert(1, map.clone());
        assert!(Arc::ptr_eq(&cache.get(1).unwrap(), &map));
    }

    #[test]
    fn test_caches_are_per_thread() {
        let cache = Arc::new(LockMapCache::new());
        cache.insert(1, lock_map());

        let cache2 = cache.clone();
        thread::spawn(move || assert!(cache2.get(1).is_none()))
            .join()
            .unwrap();
    }

    #[test]
    fn test_scrape_clears_other_threads() {
        let cache = Arc::new(LockMapCache::new());
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (scraped_tx, scraped_rx) = std::sync::mpsc::channel();

        let worker = {
            let cache = cache.clone();
            thread::spawn(move || {
                cache.insert(5, lock_map());
                ready_tx.send(()).unwrap();
                scraped_rx.recv().unwrap();
                assert!(cache.get(5).is_none());
            })
        };

        ready_rx.recv().unwrap();
        cache.scrape();
        scraped_tx.send(()).unwrap();
        worker.join().unwrap();
    }

    #[test]
    fn test_scrape_prunes_exited_threads() {
        let cache = Arc::new(LockMapCache::new());

        let cache2 = cache.clone();
        thread::spawn(move || cache2.insert(1, lock_map()))
            .join()
            .unwrap();

        cache.scrape();
        assert!(cache.threads.lock().is_empty());
    }

    #[test]
    fn test_managers_do_not_share_slots() {
        let first = LockMapCache::new();
        let second = LockMapCache::new();

        first.insert(1, lock_map());
        assert!(second.get(1).is_none());
    }
}
