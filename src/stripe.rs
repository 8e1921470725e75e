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

//! Stripe primitives
//!
//! Each column family's lock table is split into stripes, and each stripe
//! is a mutex/condition-variable pair guarding its own key table. Waiters
//! on every key of a stripe share the one condition variable, which is
//! why wake-ups are always broadcast.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::lock_map::LockRecord;

/// Keys locked in one stripe. Only reachable through the stripe guard.
pub type KeyTable = HashMap<Vec<u8>, LockRecord>;

/// One stripe's mutex and condition variable together with the key table
/// they guard.
///
/// The guard type is fixed to `parking_lot::MutexGuard` so condition
/// variable waits stay safe Rust; custom implementations wrap the default
/// primitives to add tracing or fault injection rather than replacing the
/// locking discipline.
pub trait LockStripe: Send + Sync {
    /// Take the stripe mutex, blocking indefinitely.
    fn lock(&self) -> MutexGuard<'_, KeyTable>;

    /// Take the stripe mutex, giving up after `timeout`.
    fn try_lock_for(&self, timeout: Duration) -> Option<MutexGuard<'_, KeyTable>>;

    /// Block on the stripe condition variable until woken. The guard must
    /// come from this stripe's own `lock`; it is released for the
    /// duration of the wait and held again on return. Spurious wake-ups
    /// are allowed.
    fn wait(&self, guard: &mut MutexGuard<'_, KeyTable>);

    /// Like [`wait`](Self::wait) but bounded by `timeout`. Returns true
    /// when the wait timed out rather than being woken.
    fn wait_for(&self, guard: &mut MutexGuard<'_, KeyTable>, timeout: Duration) -> bool;

    /// Wake every waiter on this stripe.
    fn notify_all(&self);
}

/// Produces the stripe primitives for each lock table.
///
/// Injected at manager construction; tests and tracing builds substitute
/// their own implementations.
pub trait StripeFactory: Send + Sync {
    fn allocate_stripe(&self) -> Box<dyn LockStripe>;
}

/// Default factory producing parking_lot-backed stripes.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultStripeFactory;

impl StripeFactory for DefaultStripeFactory {
    fn allocate_stripe(&self) -> Box<dyn LockStripe> {
        Box::new(DefaultStripe::default())
    }
}

#[derive(Default)]
struct DefaultStripe {
    keys: Mutex<KeyTable>,
    cv: Condvar,
}

impl LockStripe for DefaultStripe {
    fn lock(&self) -> MutexGuard<'_, KeyTable> {
        self.keys.lock()
    }

    fn try_lock_for(&self, timeout: Duration) -> Option<MutexGuard<'_, KeyTable>> {
        self.keys.try_lock_for(timeout)
    }

    fn wait(&self, guard: &mut MutexGuard<'_, KeyTable>) {
        self.cv.wait(guard);
    }

    fn wait_for(&self, guard: &mut MutexGuard<'_, KeyTable>, timeout: Duration) -> bool {
        self.cv.wait_for(guard, timeout).timed_out()
    }

    fn notify_all(&self) {
        self.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_lock_guards_key_table() {
        let stripe = DefaultStripeFactory.allocate_stripe();

        let mut table = stripe.lock();
        table.insert(
            b"k".to_vec(),
            LockRecord {
                txn_id: 1,
                expires_at: 0,
            },
        );
        drop(table);

        let table = stripe.lock();
        assert_eq!(table.get(b"k".as_slice()).unwrap().txn_id, 1);
    }

    #[test]
    fn test_try_lock_for_times_out_under_contention() {
        let stripe: Arc<Box<dyn LockStripe>> = Arc::new(DefaultStripeFactory.allocate_stripe());

        let guard = stripe.lock();
        let contender = {
            let stripe = stripe.clone();
            thread::spawn(move || stripe.try_lock_for(Duration::from_millis(20)).is_none())
        };
        let timed_out = contender.join().unwrap();
        drop(guard);

        assert!(timed_out);
        assert!(stripe.try_lock_for(Duration::from_millis(20)).is_some());
    }

    #[test]
    fn test_notify_all_wakes_waiter() {
        let stripe: Arc<Box<dyn LockStripe>> = Arc::new(DefaultStripeFactory.allocate_stripe());

        let waiter = {
            let stripe = stripe.clone();
            thread::spawn(move || {
                let mut table = stripe.lock();
                while !table.contains_key(b"ready".as_slice()) {
                    stripe.wait(&mut table);
                }
            })
        };

        thread::sleep(Duration::from_millis(10));
        {
            let mut table = stripe.lock();
            table.insert(
                b"ready".to_vec(),
                LockRecord {
                    txn_id: 9,
                    expires_at: 0,
                },
            );
        }
        stripe.notify_all();
        waiter.join().unwrap();
    }

    #[test]
    fn test_wait_for_times_out_without_signal() {
        let stripe = DefaultStripeFactory.allocate_stripe();
        let mut table = stripe.lock();
        assert!(stripe.wait_for(&mut table, Duration::from_millis(10)));
    }
}
