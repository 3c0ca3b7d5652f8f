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

//! Row storage.
//!
//! Every row carries two locks with different jobs:
//! - an exclusive *row lock* (`Mutex<()>`) held by a unit of work from the
//!   moment it selects the row for update until it commits or rolls back;
//! - a short-lived `RwLock` around the committed value, held only while a
//!   reader copies it out or a commit publishes a new value.
//!
//! Readers therefore never wait on a unit of work, and writers never see each
//! other's staged copies.

use crate::error::{EngineError, Result};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Mutex, RwLock};
use std::fmt::{self, Display};
use std::hash::Hash;
use std::sync::Arc;

/// Values stored in tables that take part in optimistic concurrency control.
pub trait Versioned {
    fn version(&self) -> u64;
}

impl Versioned for crate::Account {
    fn version(&self) -> u64 {
        self.version
    }
}

impl Versioned for crate::Product {
    fn version(&self) -> u64 {
        self.version
    }
}

#[derive(Debug)]
pub(crate) struct Row<R> {
    pub(crate) lock: Arc<Mutex<()>>,
    pub(crate) committed: RwLock<R>,
}

/// A keyed collection of rows.
pub struct Table<K, R> {
    name: &'static str,
    rows: DashMap<K, Arc<Row<R>>>,
}

impl<K, R> fmt::Debug for Table<K, R>
where
    K: Eq + Hash,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("rows", &self.rows.len())
            .finish()
    }
}

impl<K, R> Table<K, R>
where
    K: Copy + Eq + Hash + Display,
    R: Clone,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            rows: DashMap::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.rows.contains_key(key)
    }

    /// Returns the committed value of a row. Not gated; multi-row readers go
    /// through [`crate::Store`].
    pub(crate) fn get(&self, key: &K) -> Option<R> {
        let row = self.row(key)?;
        let value = row.committed.read().clone();
        Some(value)
    }

    /// Returns committed values of every row, in no particular order.
    pub(crate) fn scan(&self) -> Vec<R> {
        let rows: Vec<Arc<Row<R>>> = self.rows.iter().map(|r| Arc::clone(r.value())).collect();
        rows.iter().map(|row| row.committed.read().clone()).collect()
    }

    /// Inserts a new committed row.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Conflict`] if the key is already present.
    pub(crate) fn insert(&self, key: K, value: R) -> Result<()> {
        // Entry API makes the existence check and insert one atomic step.
        match self.rows.entry(key) {
            Entry::Occupied(_) => Err(EngineError::Conflict(format!(
                "duplicate key {key} in {}",
                self.name
            ))),
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(Row {
                    lock: Arc::new(Mutex::new(())),
                    committed: RwLock::new(value),
                }));
                Ok(())
            }
        }
    }

    /// Clones the row handle out of the map so no shard lock is held while
    /// the caller blocks on the row itself.
    pub(crate) fn row(&self, key: &K) -> Option<Arc<Row<R>>> {
        self.rows.get(key).map(|r| Arc::clone(r.value()))
    }
}
