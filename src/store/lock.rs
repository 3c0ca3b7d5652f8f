// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
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

//! Row-lock bookkeeping and deadlock detection.
//!
//! The [`LockManager`] does not lock anything itself; the row mutexes do.
//! It records which unit of work holds each row lock and which row each
//! blocked unit of work is waiting for. A waiter that would close a cycle in
//! this wait-for graph is refused with [`EngineError::Deadlock`](crate::EngineError::Deadlock),
//! which breaks the cycle the same way a database deadlock detector does.

use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies one unit of work.
pub type TxnId = u64;

/// Identifies one row: table name plus the row key rendered as text.
pub(crate) type LockKey = (&'static str, String);

#[derive(Debug, Default)]
struct WaitGraph {
    holders: HashMap<LockKey, TxnId>,
    waiting: HashMap<TxnId, LockKey>,
}

#[derive(Debug, Default)]
pub(crate) struct LockManager {
    graph: Mutex<WaitGraph>,
    next_txn: AtomicU64,
}

impl LockManager {
    pub(crate) fn begin(&self) -> TxnId {
        self.next_txn.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn holds(&self, txn: TxnId, key: &LockKey) -> bool {
        self.graph.lock().holders.get(key) == Some(&txn)
    }

    pub(crate) fn acquired(&self, txn: TxnId, key: LockKey) {
        let mut graph = self.graph.lock();
        graph.waiting.remove(&txn);
        graph.holders.insert(key, txn);
    }

    pub(crate) fn released(&self, txn: TxnId, key: &LockKey) {
        let mut graph = self.graph.lock();
        if graph.holders.get(key) == Some(&txn) {
            graph.holders.remove(key);
        }
    }

    /// Records that `txn` is blocked on `key`.
    ///
    /// Returns `true` if waiting would complete a cycle; in that case the wait
    /// is not recorded and the caller must abort.
    pub(crate) fn wait_on(&self, txn: TxnId, key: &LockKey) -> bool {
        let mut graph = self.graph.lock();
        let mut current = key;
        // A cycle can visit each waiter at most once.
        for _ in 0..=graph.waiting.len() {
            let Some(&holder) = graph.holders.get(current) else {
                break;
            };
            if holder == txn {
                graph.waiting.remove(&txn);
                return true;
            }
            match graph.waiting.get(&holder) {
                Some(next) => current = next,
                None => break,
            }
        }
        graph.waiting.insert(txn, key.clone());
        false
    }

    pub(crate) fn stop_waiting(&self, txn: TxnId) {
        self.graph.lock().waiting.remove(&txn);
    }
}

/// An acquired row lock. Dropping it releases the row and clears the holder
/// entry.
pub(crate) struct HeldLock {
    key: LockKey,
    txn: TxnId,
    manager: Arc<LockManager>,
    _guard: ArcMutexGuard<RawMutex, ()>,
}

impl HeldLock {
    pub(crate) fn new(
        key: LockKey,
        txn: TxnId,
        manager: Arc<LockManager>,
        guard: ArcMutexGuard<RawMutex, ()>,
    ) -> Self {
        manager.acquired(txn, key.clone());
        Self {
            key,
            txn,
            manager,
            _guard: guard,
        }
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        // Runs before `_guard` unlocks the row.
        self.manager.released(self.txn, &self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(table: &'static str, id: u64) -> LockKey {
        (table, id.to_string())
    }

    #[test]
    fn waiting_on_free_row_is_not_a_cycle() {
        let manager = LockManager::default();
        let t1 = manager.begin();
        assert!(!manager.wait_on(t1, &key("accounts", 1)));
    }

    #[test]
    fn two_party_cycle_is_detected() {
        let manager = LockManager::default();
        let t1 = manager.begin();
        let t2 = manager.begin();
        manager.acquired(t1, key("accounts", 1));
        manager.acquired(t2, key("accounts", 2));

        // t1 waits for row 2 (held by t2): no cycle yet.
        assert!(!manager.wait_on(t1, &key("accounts", 2)));
        // t2 waiting for row 1 (held by t1) closes the loop.
        assert!(manager.wait_on(t2, &key("accounts", 1)));
    }

    #[test]
    fn three_party_cycle_is_detected() {
        let manager = LockManager::default();
        let (t1, t2, t3) = (manager.begin(), manager.begin(), manager.begin());
        manager.acquired(t1, key("products", 1));
        manager.acquired(t2, key("products", 2));
        manager.acquired(t3, key("products", 3));

        assert!(!manager.wait_on(t1, &key("products", 2)));
        assert!(!manager.wait_on(t2, &key("products", 3)));
        assert!(manager.wait_on(t3, &key("products", 1)));
    }

    #[test]
    fn released_rows_break_chains() {
        let manager = LockManager::default();
        let t1 = manager.begin();
        let t2 = manager.begin();
        manager.acquired(t1, key("accounts", 1));
        manager.acquired(t2, key("accounts", 2));
        assert!(!manager.wait_on(t1, &key("accounts", 2)));

        manager.released(t1, &key("accounts", 1));
        assert!(!manager.wait_on(t2, &key("accounts", 1)));
        assert!(!manager.holds(t1, &key("accounts", 1)));
    }

    #[test]
    fn release_by_non_holder_is_ignored() {
        let manager = LockManager::default();
        let t1 = manager.begin();
        let t2 = manager.begin();
        manager.acquired(t1, key("accounts", 1));
        manager.released(t2, &key("accounts", 1));
        assert!(manager.holds(t1, &key("accounts", 1)));
    }
}
