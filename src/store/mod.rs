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

//! In-process transactional datastore.
//!
//! The [`Store`] owns every table the engines work on and is the only way to
//! change them. It is built once at startup and shared through an `Arc`;
//! engines receive it explicitly, so tests construct as many independent
//! stores as they like.
//!
//! # Guarantees
//!
//! - **Serializable writes**: every row a [`UnitOfWork`] changes is held under
//!   an exclusive row lock from selection until commit.
//! - **Atomic commit**: staged rows are published together under the commit
//!   gate; readers see all of a commit or none of it.
//! - **Bounded waits**: lock waits end on deadline expiry, cancellation, the
//!   configured lock timeout, or deadlock detection.
//! - **Compare-and-swap**: [`Store::compare_and_swap`] applies a change only
//!   if the row's version is unchanged.

mod lock;
mod table;
mod unit_of_work;

pub use lock::TxnId;
pub use table::{Table, Versioned};
pub use unit_of_work::{RowLock, UnitOfWork};

use crate::account::Account;
use crate::amount::Amount;
use crate::base::{AccountId, OrderId, PaymentId, ProductId, SagaId};
use crate::deadline::Deadline;
use crate::error::{EngineError, Result};
use crate::ledger::TransactionLedger;
use crate::order::{Order, Payment};
use crate::product::Product;
use crate::saga::SagaRecord;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use lock::LockManager;
use parking_lot::RwLock;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    /// Longest time a unit of work waits for one row lock, independent of
    /// the caller's deadline.
    pub lock_timeout: Duration,
    /// Artificial delay inserted before every commit. Zero in production;
    /// used to widen race windows and exercise commit timeouts.
    pub commit_delay: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            commit_delay: Duration::ZERO,
        }
    }
}

pub struct Store {
    accounts: Table<AccountId, Account>,
    products: Table<ProductId, Product>,
    orders: Table<OrderId, Order>,
    payments: Table<PaymentId, Payment>,
    sagas: Table<SagaId, SagaRecord>,
    ledger: TransactionLedger,
    /// Unique index on account number.
    account_numbers: DashMap<String, AccountId>,
    /// Unique index on product SKU.
    product_skus: DashMap<String, ProductId>,
    next_account_id: AtomicU64,
    next_product_id: AtomicU64,
    next_order_id: AtomicU64,
    pub(crate) locks: Arc<LockManager>,
    /// Held for writing while a commit publishes, for reading by snapshots.
    pub(crate) gate: RwLock<()>,
    pub(crate) config: StoreConfig,
}

impl Store {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            accounts: Table::new("account"),
            products: Table::new("product"),
            orders: Table::new("order"),
            payments: Table::new("payment"),
            sagas: Table::new("saga"),
            ledger: TransactionLedger::new(),
            account_numbers: DashMap::new(),
            product_skus: DashMap::new(),
            next_account_id: AtomicU64::new(1),
            next_product_id: AtomicU64::new(1),
            next_order_id: AtomicU64::new(1),
            locks: Arc::new(LockManager::default()),
            gate: RwLock::new(()),
            config,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Opens a unit of work bounded by `deadline`.
    pub fn begin(&self, deadline: Deadline) -> UnitOfWork<'_> {
        UnitOfWork::new(self, deadline)
    }

    pub fn ledger(&self) -> &TransactionLedger {
        &self.ledger
    }

    pub fn accounts(&self) -> &Table<AccountId, Account> {
        &self.accounts
    }

    pub fn products(&self) -> &Table<ProductId, Product> {
        &self.products
    }

    pub fn orders(&self) -> &Table<OrderId, Order> {
        &self.orders
    }

    pub fn payments(&self) -> &Table<PaymentId, Payment> {
        &self.payments
    }

    pub fn sagas(&self) -> &Table<SagaId, SagaRecord> {
        &self.sagas
    }

    pub fn account(&self, id: AccountId) -> Option<Account> {
        let _gate = self.gate.read();
        self.accounts.get(&id)
    }

    pub fn product(&self, id: ProductId) -> Option<Product> {
        let _gate = self.gate.read();
        self.products.get(&id)
    }

    pub fn order(&self, id: OrderId) -> Option<Order> {
        let _gate = self.gate.read();
        self.orders.get(&id)
    }

    pub fn payment(&self, id: PaymentId) -> Option<Payment> {
        let _gate = self.gate.read();
        self.payments.get(&id)
    }

    pub fn saga(&self, id: SagaId) -> Option<SagaRecord> {
        let _gate = self.gate.read();
        self.sagas.get(&id)
    }

    /// Reads several accounts as of one point between commits.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] if any account is missing.
    pub fn accounts_snapshot(&self, ids: &[AccountId]) -> Result<Vec<Account>> {
        let _gate = self.gate.read();
        ids.iter()
            .map(|id| {
                self.accounts
                    .get(id)
                    .ok_or_else(|| EngineError::not_found("account", id))
            })
            .collect()
    }

    /// Reads every saga record as of one point between commits.
    pub fn sagas_snapshot(&self) -> Vec<SagaRecord> {
        let _gate = self.gate.read();
        self.sagas.scan()
    }

    /// Creates an account with an opening balance.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Validation`] - negative opening balance.
    /// - [`EngineError::Conflict`] - the account number is taken.
    pub fn create_account(
        &self,
        number: &str,
        name: &str,
        currency: &str,
        balance: Amount,
    ) -> Result<Account> {
        if balance.is_negative() {
            return Err(EngineError::Validation(
                "opening balance must not be negative".into(),
            ));
        }
        let id = match self.account_numbers.entry(number.to_string()) {
            Entry::Occupied(_) => {
                return Err(EngineError::Conflict(format!(
                    "account number {number} already exists"
                )));
            }
            Entry::Vacant(entry) => {
                let id = AccountId(self.next_account_id.fetch_add(1, Ordering::Relaxed));
                entry.insert(id);
                id
            }
        };
        let account = Account::new(id, number, name, currency, balance);
        self.accounts.insert(id, account.clone())?;
        info!(account = %id, number, %balance, "account created");
        Ok(account)
    }

    /// Creates a product with initial stock.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Validation`] - negative price.
    /// - [`EngineError::Conflict`] - the SKU is taken.
    pub fn create_product(
        &self,
        name: &str,
        sku: &str,
        price: Amount,
        stock: u32,
    ) -> Result<Product> {
        if price.is_negative() {
            return Err(EngineError::Validation("price must not be negative".into()));
        }
        let id = match self.product_skus.entry(sku.to_string()) {
            Entry::Occupied(_) => {
                return Err(EngineError::Conflict(format!("sku {sku} already exists")));
            }
            Entry::Vacant(entry) => {
                let id = ProductId(self.next_product_id.fetch_add(1, Ordering::Relaxed));
                entry.insert(id);
                id
            }
        };
        let product = Product::new(id, name, sku, price, stock);
        self.products.insert(id, product.clone())?;
        info!(product = %id, sku, stock, "product created");
        Ok(product)
    }

    pub(crate) fn next_order_id(&self) -> OrderId {
        OrderId(self.next_order_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Applies `change` to a row only if its version still equals
    /// `expected_version`.
    ///
    /// The row lock is taken for the duration of this single statement, so a
    /// conditional update never interleaves with a unit of work that holds the
    /// row. Returns `Ok(false)` when the version no longer matches (zero rows
    /// affected).
    ///
    /// # Errors
    ///
    /// Propagates errors from `change` and from the lock wait.
    pub fn compare_and_swap<K, R, F>(
        &self,
        table: &Table<K, R>,
        key: K,
        expected_version: u64,
        change: F,
    ) -> Result<bool>
    where
        K: Copy + Eq + Hash + Display,
        R: Clone + Versioned,
        F: FnOnce(&mut R) -> Result<()>,
    {
        let mut uow = self.begin(Deadline::none());
        let mut row = uow.lock(table, key)?;
        if row.version() != expected_version {
            return Ok(false);
        }
        change(&mut *row)?;
        uow.stage(row);
        uow.commit()?;
        Ok(true)
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}
