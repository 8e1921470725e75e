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

//! The lock manager
//!
//! Column-family registry, the acquire/release engine, deadlock
//! integration, and the status snapshot.
//!
//! Lock order, respected everywhere:
//! 1. registry mutex (outermost, brief except during a snapshot)
//! 2. stripe mutex (one at a time on acquire/release; ascending order
//!    across stripes only in the snapshot)
//! 3. wait-for graph mutex (innermost, never held across a CV wait)

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::cache::LockMapCache;
use crate::clock::{Clock, SystemClock};
use crate::deadlock::WaitForGraph;
use crate::error::{BusyKind, LockError, LockResult, TimeoutKind};
use crate::lock_map::{LockMap, LockRecord};
use crate::stripe::{DefaultStripeFactory, KeyTable, LockStripe, StripeFactory};
use crate::txn::{
    ColumnFamilyId, TrackedKeys, TransactionHandle, TransactionStore, TxnId, WaitingLock,
};

/// Tuning knobs fixed at construction.
#[derive(Debug, Clone)]
pub struct LockManagerConfig {
    /// Stripes per column-family lock table.
    pub default_num_stripes: usize,
    /// Cap on concurrently held locks per column family. A value of zero
    /// or below disables both the cap and the lock-count bookkeeping.
    pub max_num_locks: i64,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            default_num_stripes: 16,
            max_num_locks: 0,
        }
    }
}

/// One held lock as reported by [`LockManager::lock_status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLockInfo {
    pub column_family: ColumnFamilyId,
    pub key: Vec<u8>,
    pub txn_id: TxnId,
}

/// Advisory counters maintained by the engine. Relaxed and lock-free;
/// read them for monitoring, not for correctness decisions.
#[derive(Debug, Default)]
pub struct LockManagerStats {
    pub locks_acquired: AtomicU64,
    pub locks_released: AtomicU64,
    pub lock_steals: AtomicU64,
    pub lock_waits: AtomicU64,
    pub lock_timeouts: AtomicU64,
    pub lock_limit_rejections: AtomicU64,
    pub deadlocks_detected: AtomicU64,
}

/// Outcome of one failed attempt on a stripe, driving the wait loop.
struct Denied {
    error: LockError,
    /// Holder's expiration in clock microseconds; 0 when there is no
    /// useful wake-up deadline.
    expire_time_hint: u64,
    /// The holder blocking us; 0 when the denial was the lock cap.
    wait_id: TxnId,
}

/// Pessimistic point-lock manager for one storage engine instance.
///
/// Keys hash to stripes with independent mutex/condvar pairs, so disjoint
/// keys rarely contend; the wait-for graph and the registry are the only
/// global state, both owned here rather than by process globals.
pub struct LockManager {
    store: Arc<dyn TransactionStore>,
    clock: Arc<dyn Clock>,
    stripe_factory: Arc<dyn StripeFactory>,
    default_num_stripes: usize,
    max_num_locks: i64,
    /// Registry mutex, outermost in the lock order.
    lock_maps: Mutex<HashMap<ColumnFamilyId, Arc<LockMap>>>,
    cache: LockMapCache,
    wait_graph: WaitForGraph,
    stats: LockManagerStats,
}

impl LockManager {
    /// Create a manager with the default wall clock and parking_lot
    /// stripe primitives.
    pub fn new(store: Arc<dyn TransactionStore>, config: LockManagerConfig) -> Self {
        Self::with_primitives(
            store,
            config,
            Arc::new(SystemClock),
            Arc::new(DefaultStripeFactory),
        )
    }

    /// Create a manager with injected clock and stripe primitives, for
    /// deterministic tests or instrumented builds.
    pub fn with_primitives(
        store: Arc<dyn TransactionStore>,
        config: LockManagerConfig,
        clock: Arc<dyn Clock>,
        stripe_factory: Arc<dyn StripeFactory>,
    ) -> Self {
        Self {
            store,
            clock,
            stripe_factory,
            default_num_stripes: config.default_num_stripes.max(1),
            max_num_locks: config.max_num_locks,
            lock_maps: Mutex::new(HashMap::new()),
            cache: LockMapCache::new(),
            wait_graph: WaitForGraph::default(),
            stats: LockManagerStats::default(),
        }
    }

    pub fn stats(&self) -> &LockManagerStats {
        &self.stats
    }

    /// Register a lock table for `cf`. Registering a column family twice
    /// is a caller bug; release builds keep the existing table.
    pub fn add_column_family(&self, cf: ColumnFamilyId) {
        let mut maps = self.lock_maps.lock();
        match maps.entry(cf) {
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(LockMap::new(
                    self.default_num_stripes,
                    self.stripe_factory.as_ref(),
                )));
                debug!(column_family = cf, "lock table registered");
            }
            Entry::Occupied(_) => {
                debug_assert!(false, "column family {cf} already has a lock table");
            }
        }
    }

    /// Unpublish `cf`'s lock table and scrape every thread's cached
    /// reference. Operations already holding the table finish on their
    /// own `Arc`; later lookups fail cleanly.
    pub fn remove_column_family(&self, cf: ColumnFamilyId) {
        {
            let mut maps = self.lock_maps.lock();
            let removed = maps.remove(&cf);
            debug_assert!(removed.is_some(), "column family {cf} has no lock table");
        }
        self.cache.scrape();
        debug!(column_family = cf, "lock table removed");
    }

    /// Resolve `cf` through the thread-local cache, falling back to the
    /// registry and populating the cache on a miss.
    fn lock_map(&self, cf: ColumnFamilyId) -> Option<Arc<LockMap>> {
        if let Some(map) = self.cache.get(cf) {
            return Some(map);
        }

        let maps = self.lock_maps.lock();
        let map = maps.get(&cf)?.clone();
        // Populate the cache before releasing the registry mutex so a
        // concurrent removal cannot scrape between the copy and the
        // insert, which would leave a stale entry behind.
        self.cache.insert(cf, map.clone());
        drop(maps);
        Some(map)
    }

    /// Take the exclusive lock on `(cf, key)` for `txn`, waiting up to
    /// the transaction's lock timeout.
    ///
    /// Acquiring a key the transaction already holds succeeds without
    /// side effects. An expired holder's record is stolen once the
    /// transaction store confirms the holder abandoned its locks.
    pub fn try_lock(
        &self,
        txn: &dyn TransactionHandle,
        cf: ColumnFamilyId,
        key: &[u8],
    ) -> LockResult<()> {
        let lock_map = self
            .lock_map(cf)
            .ok_or(LockError::UnknownColumnFamily(cf))?;
        let stripe = lock_map.stripe(lock_map.stripe_index(key));

        let record = LockRecord {
            txn_id: txn.id(),
            expires_at: txn.expiration_time_us(),
        };
        self.acquire_with_timeout(
            txn,
            &lock_map,
            stripe,
            cf,
            key,
            txn.lock_timeout_us(),
            record,
        )
    }

    /// The wait loop around [`acquire_locked`](Self::acquire_locked).
    ///
    /// Timeout semantics: negative waits indefinitely, zero tries once
    /// without touching the condition variable, positive waits until
    /// `start + timeout`. A timed-out waiter always makes one final
    /// attempt, because the held lock may have expired without anyone
    /// signalling the stripe.
    #[allow(clippy::too_many_arguments)]
    fn acquire_with_timeout(
        &self,
        txn: &dyn TransactionHandle,
        lock_map: &LockMap,
        stripe: &dyn LockStripe,
        cf: ColumnFamilyId,
        key: &[u8],
        timeout_us: i64,
        record: LockRecord,
    ) -> LockResult<()> {
        let end_time = if timeout_us > 0 {
            self.clock.now_micros() + timeout_us as u64
        } else {
            0
        };

        let mut guard = if timeout_us < 0 {
            stripe.lock()
        } else {
            match stripe.try_lock_for(Duration::from_micros(timeout_us as u64)) {
                Some(guard) => guard,
                None => {
                    self.stats.lock_timeouts.fetch_add(1, Ordering::Relaxed);
                    return Err(LockError::TimedOut {
                        kind: TimeoutKind::StripeMutex,
                    });
                }
            }
        };

        let mut result = self.acquire_locked(lock_map, &mut guard, key, &record);

        if result.is_err() && timeout_us != 0 {
            self.stats.lock_waits.fetch_add(1, Ordering::Relaxed);
            let mut timed_out = false;

            loop {
                let denied = match &result {
                    Ok(()) => break,
                    Err(denied) => denied,
                };

                // Wake when the holder's lock becomes stealable if that
                // is sooner than our own deadline.
                let hint = denied.expire_time_hint;
                let cv_deadline = if hint > 0 && (timeout_us < 0 || hint < end_time) {
                    Some(hint)
                } else if timeout_us >= 0 {
                    Some(end_time)
                } else {
                    None
                };

                debug_assert!(
                    denied.wait_id != 0 || matches!(denied.error, LockError::Busy { .. })
                );

                let wait_id = denied.wait_id;
                if wait_id != 0 {
                    if txn.deadlock_detect()
                        && self.wait_graph.register_wait(
                            record.txn_id,
                            wait_id,
                            txn.deadlock_detect_depth(),
                        )
                    {
                        self.stats.deadlocks_detected.fetch_add(1, Ordering::Relaxed);
                        // The guard drops here, releasing the stripe.
                        return Err(LockError::Busy {
                            kind: BusyKind::Deadlock,
                        });
                    }
                    txn.set_waiting_on(Some(WaitingLock {
                        blocker: wait_id,
                        column_family: cf,
                        key: key.to_vec(),
                    }));
                }

                trace!(txn = record.txn_id, blocker = wait_id, "waiting for key lock");
                match cv_deadline {
                    None => stripe.wait(&mut guard),
                    Some(deadline) => {
                        let now = self.clock.now_micros();
                        if deadline > now {
                            if stripe.wait_for(&mut guard, Duration::from_micros(deadline - now)) {
                                timed_out = true;
                            }
                        } else {
                            // Deadline already behind us; skip straight
                            // to the final attempt, since the lock may
                            // have expired without a wake-up.
                            timed_out = true;
                        }
                    }
                }

                if wait_id != 0 {
                    txn.set_waiting_on(None);
                    if txn.deadlock_detect() {
                        self.wait_graph.unregister_wait(record.txn_id, wait_id);
                    }
                }

                result = self.acquire_locked(lock_map, &mut guard, key, &record);
                if timed_out {
                    break;
                }
            }
        }

        drop(guard);

        match result {
            Ok(()) => {
                self.stats.locks_acquired.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(denied) => {
                match denied.error {
                    LockError::TimedOut { .. } => {
                        self.stats.lock_timeouts.fetch_add(1, Ordering::Relaxed);
                    }
                    LockError::Busy {
                        kind: BusyKind::LockLimit,
                    } => {
                        self.stats
                            .lock_limit_rejections
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {}
                }
                Err(denied.error)
            }
        }
    }

    /// One attempt at the record, under the stripe mutex.
    fn acquire_locked(
        &self,
        lock_map: &LockMap,
        table: &mut MutexGuard<'_, KeyTable>,
        key: &[u8],
        record: &LockRecord,
    ) -> Result<(), Denied> {
        if let Some(held) = table.get_mut(key) {
            if held.txn_id == record.txn_id {
                // Re-entrant acquire by the current holder.
                return Ok(());
            }

            let (stealable, expire_time_hint) = self.is_lock_expired(held);
            if stealable {
                debug!(
                    from = held.txn_id,
                    to = record.txn_id,
                    "stealing expired key lock"
                );
                *held = record.clone();
                self.stats.lock_steals.fetch_add(1, Ordering::Relaxed);
                // The key stays locked throughout, so lock_count is
                // unchanged by a steal.
                return Ok(());
            }

            return Err(Denied {
                error: LockError::TimedOut {
                    kind: TimeoutKind::Lock,
                },
                expire_time_hint,
                wait_id: held.txn_id,
            });
        }

        if self.max_num_locks > 0
            && lock_map.lock_count.load(Ordering::Acquire) >= self.max_num_locks
        {
            return Err(Denied {
                error: LockError::Busy {
                    kind: BusyKind::LockLimit,
                },
                expire_time_hint: 0,
                wait_id: 0,
            });
        }

        table.insert(key.to_vec(), record.clone());
        if self.max_num_locks > 0 {
            lock_map.lock_count.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Whether `held` can be stolen right now. When it cannot but will
    /// expire later, the second value carries the holder's expiration as
    /// a wake-up hint; otherwise it is 0.
    fn is_lock_expired(&self, held: &LockRecord) -> (bool, u64) {
        if held.expires_at == 0 {
            return (false, 0);
        }

        let now = self.clock.now_micros();
        if held.expires_at > now {
            return (false, held.expires_at);
        }

        // The clock alone is not authoritative: the holder may still be
        // live. Only the store can confirm the steal and fence the
        // holder out atomically.
        if self.store.try_steal_expired_transaction_locks(held.txn_id) {
            (true, 0)
        } else {
            (false, 0)
        }
    }

    /// Release `txn`'s lock on `(cf, key)` and wake the stripe.
    ///
    /// Never fails. An unknown column family means it was dropped while
    /// the transaction still tracked the key; a missing or foreign record
    /// is only expected of an expired transaction whose lock was stolen.
    pub fn unlock(&self, txn: &dyn TransactionHandle, cf: ColumnFamilyId, key: &[u8]) {
        let Some(lock_map) = self.lock_map(cf) else {
            return;
        };
        let stripe = lock_map.stripe(lock_map.stripe_index(key));

        {
            let mut table = stripe.lock();
            self.unlock_key_locked(&lock_map, &mut table, key, txn);
        }
        stripe.notify_all();
    }

    /// Release every tracked key with one stripe-mutex acquisition per
    /// stripe, for commit and abort paths releasing many keys at once.
    pub fn unlock_batch(&self, txn: &dyn TransactionHandle, keys: &TrackedKeys) {
        for (&cf, cf_keys) in keys {
            let Some(lock_map) = self.lock_map(cf) else {
                // Column family dropped; nothing left to release there.
                continue;
            };

            let mut keys_by_stripe: HashMap<usize, SmallVec<[&Vec<u8>; 8]>> = HashMap::new();
            for key in cf_keys {
                keys_by_stripe
                    .entry(lock_map.stripe_index(key))
                    .or_default()
                    .push(key);
            }

            for (stripe_index, stripe_keys) in keys_by_stripe {
                let stripe = lock_map.stripe(stripe_index);
                {
                    let mut table = stripe.lock();
                    for key in stripe_keys {
                        self.unlock_key_locked(&lock_map, &mut table, key, txn);
                    }
                }
                stripe.notify_all();
            }
        }
    }

    fn unlock_key_locked(
        &self,
        lock_map: &LockMap,
        table: &mut MutexGuard<'_, KeyTable>,
        key: &[u8],
        txn: &dyn TransactionHandle,
    ) {
        let holds_key = table.get(key).is_some_and(|held| held.txn_id == txn.id());
        if holds_key {
            table.remove(key);
            if self.max_num_locks > 0 {
                let previous = lock_map.lock_count.fetch_sub(1, Ordering::AcqRel);
                debug_assert!(previous > 0);
            }
            self.stats.locks_released.fetch_add(1, Ordering::Relaxed);
        } else {
            // Only an expired transaction can lose its own lock: it was
            // stolen after the store confirmed the expiry.
            let expires_at = txn.expiration_time_us();
            debug_assert!(expires_at > 0 && expires_at < self.clock.now_micros());
            warn!(txn = txn.id(), "unlock of key not held by transaction");
        }
    }

    /// Consistent snapshot of every held lock.
    ///
    /// Holds the registry mutex for the whole snapshot and takes stripe
    /// mutexes in ascending column-family then stripe order, releasing
    /// them only after the copy completes. Acquire and release stall on
    /// the visited column families for the duration; this is an operator
    /// path, not a hot path.
    pub fn lock_status(&self) -> Vec<KeyLockInfo> {
        let maps = self.lock_maps.lock();

        let mut cf_ids: Vec<ColumnFamilyId> = maps.keys().copied().collect();
        cf_ids.sort_unstable();

        let mut data = Vec::new();
        let mut held_guards = Vec::new();
        for &cf in &cf_ids {
            for stripe in maps[&cf].stripes() {
                let table = stripe.lock();
                for (key, record) in table.iter() {
                    data.push(KeyLockInfo {
                        column_family: cf,
                        key: key.clone(),
                        txn_id: record.txn_id,
                    });
                }
                held_guards.push(table);
            }
        }

        // Every stripe is copied; release order does not matter.
        drop(held_guards);
        data
    }
}
