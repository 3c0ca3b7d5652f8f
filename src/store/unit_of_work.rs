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

//! Units of work.
//!
//! A [`UnitOfWork`] is one atomic, serializable transaction against the
//! [`Store`]. Rows are selected for update with [`UnitOfWork::lock`], which
//! returns a [`RowLock`]: an exclusive lock on the row plus a private copy of
//! its value. Changes made through the copy become visible only when the row
//! is staged and the unit of work commits. Dropping the unit of work, or any
//! row lock that was never staged, discards the changes and releases the
//! locks.

use super::Store;
use super::lock::{HeldLock, LockKey, TxnId};
use super::table::{Row, Table};
use crate::deadline::Deadline;
use crate::error::{EngineError, Result};
use std::fmt::{self, Display};
use std::hash::Hash;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// A change waiting for commit.
pub(crate) trait Staged {
    /// Checked for every staged change before any of them is published.
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    fn publish(&mut self);
}

/// An exclusively locked row and its staged value.
pub struct RowLock<K, R> {
    key: K,
    row: Arc<Row<R>>,
    staged: R,
    _held: HeldLock,
}

impl<K: Copy, R> RowLock<K, R> {
    pub fn key(&self) -> K {
        self.key
    }
}

impl<K: fmt::Debug, R: fmt::Debug> fmt::Debug for RowLock<K, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowLock")
            .field("key", &self.key)
            .field("staged", &self.staged)
            .finish_non_exhaustive()
    }
}

impl<K, R> Deref for RowLock<K, R> {
    type Target = R;

    fn deref(&self) -> &R {
        &self.staged
    }
}

impl<K, R> DerefMut for RowLock<K, R> {
    fn deref_mut(&mut self) -> &mut R {
        &mut self.staged
    }
}

impl<K, R: Clone> Staged for RowLock<K, R> {
    fn publish(&mut self) {
        *self.row.committed.write() = self.staged.clone();
    }
}

struct PendingInsert<'s, K, R> {
    table: &'s Table<K, R>,
    key: K,
    value: Option<R>,
}

impl<K, R> Staged for PendingInsert<'_, K, R>
where
    K: Copy + Eq + Hash + Display,
    R: Clone,
{
    fn validate(&self) -> Result<()> {
        if self.table.contains(&self.key) {
            return Err(EngineError::Conflict(format!(
                "duplicate key {} in {}",
                self.key,
                self.table.name()
            )));
        }
        Ok(())
    }

    fn publish(&mut self) {
        if let Some(value) = self.value.take() {
            // validate() ran under the commit gate, so the key is still free.
            let _ = self.table.insert(self.key, value);
        }
    }
}

pub struct UnitOfWork<'s> {
    store: &'s Store,
    txn: TxnId,
    deadline: Deadline,
    staged: Vec<Box<dyn Staged + 's>>,
}

impl<'s> UnitOfWork<'s> {
    pub(crate) fn new(store: &'s Store, deadline: Deadline) -> Self {
        let txn = store.locks.begin();
        debug!(txn, "unit of work started");
        Self {
            store,
            txn,
            deadline,
            staged: Vec::new(),
        }
    }

    pub fn id(&self) -> TxnId {
        self.txn
    }

    pub fn deadline(&self) -> &Deadline {
        &self.deadline
    }

    /// Selects a row for update, waiting for its exclusive lock.
    ///
    /// # Errors
    ///
    /// - [`EngineError::NotFound`] - no such row.
    /// - [`EngineError::Deadlock`] - waiting would close a lock cycle.
    /// - [`EngineError::Timeout`] - the deadline fired or the store's lock
    ///   timeout elapsed while waiting.
    /// - [`EngineError::Internal`] - this unit of work already holds the row.
    pub fn lock<K, R>(&self, table: &'s Table<K, R>, key: K) -> Result<RowLock<K, R>>
    where
        K: Copy + Eq + Hash + Display,
        R: Clone,
    {
        self.deadline.check()?;
        let row = table
            .row(&key)
            .ok_or_else(|| EngineError::not_found(table.name(), key))?;
        let lock_key: LockKey = (table.name(), key.to_string());
        let manager = &self.store.locks;
        if manager.holds(self.txn, &lock_key) {
            return Err(EngineError::Internal(format!(
                "{} {key} is already locked by this unit of work",
                table.name()
            )));
        }

        let guard = match row.lock.try_lock_arc() {
            Some(guard) => guard,
            None => {
                let give_up_at = Instant::now() + self.store.config.lock_timeout;
                loop {
                    if manager.wait_on(self.txn, &lock_key) {
                        warn!(txn = self.txn, table = table.name(), %key, "deadlock detected, aborting");
                        return Err(EngineError::Deadlock);
                    }
                    if let Err(e) = self.deadline.check() {
                        manager.stop_waiting(self.txn);
                        return Err(e);
                    }
                    let now = Instant::now();
                    if now >= give_up_at {
                        manager.stop_waiting(self.txn);
                        return Err(EngineError::Timeout(format!(
                            "lock wait timeout on {} {key}",
                            table.name()
                        )));
                    }
                    let mut slice = (give_up_at - now).min(Deadline::POLL_INTERVAL);
                    if let Some(remaining) = self.deadline.remaining() {
                        slice = slice.min(remaining);
                    }
                    if let Some(guard) = row.lock.try_lock_arc_for(slice) {
                        break guard;
                    }
                }
            }
        };

        let held = HeldLock::new(lock_key, self.txn, Arc::clone(&self.store.locks), guard);
        let staged = row.committed.read().clone();
        debug!(txn = self.txn, table = table.name(), %key, "row locked");
        Ok(RowLock {
            key,
            row,
            staged,
            _held: held,
        })
    }

    /// Queues a locked row to be written back on commit. Its lock stays held
    /// until the unit of work ends.
    pub fn stage<K, R>(&mut self, row: RowLock<K, R>)
    where
        K: 's,
        R: Clone + 's,
    {
        self.staged.push(Box::new(row));
    }

    /// Queues a new row to be inserted on commit.
    pub fn stage_insert<K, R>(&mut self, table: &'s Table<K, R>, key: K, value: R)
    where
        K: Copy + Eq + Hash + Display + 's,
        R: Clone + 's,
    {
        self.staged.push(Box::new(PendingInsert {
            table,
            key,
            value: Some(value),
        }));
    }

    /// Publishes every staged change atomically and releases all locks.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Timeout`] if the deadline fires before the
    /// commit completes; nothing is published in that case.
    pub fn commit(mut self) -> Result<()> {
        let delay = self.store.config.commit_delay;
        if !delay.is_zero() {
            self.deadline.sleep(delay)?;
        }
        self.deadline.check()?;

        {
            let _gate = self.store.gate.write();
            for change in &self.staged {
                change.validate()?;
            }
            for change in self.staged.iter_mut() {
                change.publish();
            }
        }
        debug!(txn = self.txn, rows = self.staged.len(), "unit of work committed");
        Ok(())
    }

    /// Discards every staged change and releases all locks.
    pub fn rollback(self) {
        debug!(txn = self.txn, rows = self.staged.len(), "unit of work rolled back");
    }
}
