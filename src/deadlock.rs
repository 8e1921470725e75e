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

//! Wait-for graph for online deadlock detection
//!
//! A transaction blocks on at most one key at a time, so the graph is a
//! partial function from waiter to blocker plus a reverse refcount. The
//! refcount short-circuits the common case: if nobody waits on the
//! would-be waiter, no cycle through it can exist and the chain walk is
//! skipped entirely.
//!
//! The graph mutex is innermost in the manager's lock order and is never
//! held across a condition-variable wait.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::txn::TxnId;

#[derive(Default)]
struct Graph {
    /// waiter -> the transaction it is blocked on
    waiting: HashMap<TxnId, TxnId>,
    /// blocker -> number of waiters pointing at it; entries removed at 0
    num_waiters: HashMap<TxnId, u32>,
}

impl Graph {
    fn remove_edge(&mut self, waiter: TxnId, blocker: TxnId) {
        let removed = self.waiting.remove(&waiter);
        debug_assert!(removed.is_some());

        match self.num_waiters.get_mut(&blocker) {
            Some(count) => {
                *count -= 1;
                if *count == 0 {
                    self.num_waiters.remove(&blocker);
                }
            }
            None => debug_assert!(false, "missing waiter count for blocker {blocker}"),
        }
    }
}

/// Process-wide wait-for graph, owned by the lock manager.
#[derive(Default)]
pub(crate) struct WaitForGraph {
    inner: Mutex<Graph>,
}

impl WaitForGraph {
    /// Record that `waiter` is about to block on `blocker`, then walk the
    /// chain starting at `blocker` for at most `depth` hops. Returns true
    /// when a cycle is found; a chain longer than `depth` is reported as
    /// a cycle too, since walking further under the shared mutex is worse
    /// than a false positive. On a true return the registration has been
    /// rolled back and the caller must not unregister.
    pub(crate) fn register_wait(&self, waiter: TxnId, blocker: TxnId, depth: u32) -> bool {
        let mut graph = self.inner.lock();

        debug_assert!(!graph.waiting.contains_key(&waiter));
        graph.waiting.insert(waiter, blocker);
        *graph.num_waiters.entry(blocker).or_insert(0) += 1;

        // A cycle through `waiter` needs someone waiting on it.
        if !graph.num_waiters.contains_key(&waiter) {
            return false;
        }

        let mut next = blocker;
        for _ in 0..depth {
            if next == waiter {
                graph.remove_edge(waiter, blocker);
                return true;
            }
            match graph.waiting.get(&next) {
                Some(&blocked_on) => next = blocked_on,
                None => return false,
            }
        }

        // Walk budget exhausted; assume the worst.
        graph.remove_edge(waiter, blocker);
        true
    }

    /// Tear down a registration whose wait ended without a detected
    /// cycle (wake-up, timeout, or spurious wake).
    pub(crate) fn unregister_wait(&self, waiter: TxnId, blocker: TxnId) {
        self.inner.lock().remove_edge(waiter, blocker);
    }

    #[cfg(test)]
    fn snapshot(&self) -> (HashMap<TxnId, TxnId>, HashMap<TxnId, u32>) {
        let graph = self.inner.lock();
        (graph.waiting.clone(), graph.num_waiters.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_edge_no_cycle() {
        let graph = WaitForGraph::default();
        assert!(!graph.register_wait(1, 2, 10));

        let (waiting, counts) = graph.snapshot();
        assert_eq!(waiting.get(&1), Some(&2));
        assert_eq!(counts.get(&2), Some(&1));

        graph.unregister_wait(1, 2);
        let (waiting, counts) = graph.snapshot();
        assert!(waiting.is_empty());
        assert!(counts.is_empty());
    }

    #[test]
    fn test_two_cycle_detected_and_rolled_back() {
        let graph = WaitForGraph::default();
        assert!(!graph.register_wait(1, 2, 10));
        assert!(graph.register_wait(2, 1, 10));

        // The losing registration was rolled back; only 1 -> 2 remains.
        let (waiting, counts) = graph.snapshot();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting.get(&1), Some(&2));
        assert_eq!(counts.get(&2), Some(&1));
        assert!(!counts.contains_key(&1));
    }

    #[test]
    fn test_long_chain_detected_within_depth() {
        let graph = WaitForGraph::default();
        // 2 -> 3 -> 4 -> 5, then closing 1 -> 2 is fine, 5 -> 1 cycles.
        assert!(!graph.register_wait(2, 3, 10));
        assert!(!graph.register_wait(3, 4, 10));
        assert!(!graph.register_wait(4, 5, 10));
        assert!(!graph.register_wait(1, 2, 10));
        assert!(graph.register_wait(5, 1, 10));
    }

    #[test]
    fn test_depth_exhaustion_is_conservative() {
        let graph = WaitForGraph::default();
        assert!(!graph.register_wait(2, 3, 10));
        assert!(!graph.register_wait(3, 4, 10));
        assert!(!graph.register_wait(4, 5, 10));
        assert!(!graph.register_wait(1, 2, 10));
        // The real cycle has length 5 but the walk stops after 2 hops.
        assert!(graph.register_wait(5, 1, 2));

        // Rolled back: 5 is not registered as waiting.
        let (waiting, _) = graph.snapshot();
        assert!(!waiting.contains_key(&5));
    }

    #[test]
    fn test_no_walk_when_nobody_waits_on_waiter() {
        let graph = WaitForGraph::default();
        // Even with depth 0 the fast path answers: no one waits on 1.
        assert!(!graph.register_wait(1, 2, 0));
        graph.unregister_wait(1, 2);
    }

    #[test]
    fn test_refcounts_track_waiters() {
        let graph = WaitForGraph::default();
        assert!(!graph.register_wait(1, 9, 10));
        assert!(!graph.register_wait(2, 9, 10));
        assert!(!graph.register_wait(3, 9, 10));

        let (_, counts) = graph.snapshot();
        assert_eq!(counts.get(&9), Some(&3));

        graph.unregister_wait(2, 9);
        let (_, counts) = graph.snapshot();
        assert_eq!(counts.get(&9), Some(&2));

        graph.unregister_wait(1, 9);
        graph.unregister_wait(3, 9);
        let (waiting, counts) = graph.snapshot();
        assert!(waiting.is_empty());
        assert!(counts.is_empty());
    }
}
