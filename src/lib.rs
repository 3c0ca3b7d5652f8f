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

//! # Transfer Engine
//!
//! A transactional engine that moves money between accounts and reserves or
//! decrements stock under concurrent access.
//!
//! ## Core Components
//!
//! - [`Store`]: in-process datastore with row locks, deadlock detection and
//!   atomic multi-row commits through a [`UnitOfWork`]
//! - [`TransferEngine`]: pessimistic transfers, deposits and withdrawals
//!   bounded by a [`Deadline`]
//! - [`StockService`]: optimistic compare-and-swap stock updates with a
//!   bounded [`RetryPolicy`]
//! - [`OrderSaga`]: reserve → pay → confirm as three commits with
//!   compensation, progress persisted as a [`SagaRecord`]
//! - [`OrderProcessor`]: the same workflow in a single unit of work
//! - [`TransactionLedger`]: audit trail of every transfer attempt
//! - [`ConcurrencyHarness`]: concurrent-transfer and lock-order scenarios that
//!   check conservation of money
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use transfer_engine::{Amount, Store, TransactionStatus, TransferEngine};
//! use rust_decimal_macros::dec;
//!
//! let engine = TransferEngine::new(Arc::new(Store::default()));
//! let alice = engine.open_account("ACC-1", "Alice", "USD", Amount::new(dec!(100))).unwrap();
//! let bob = engine.open_account("ACC-2", "Bob", "USD", Amount::ZERO).unwrap();
//!
//! let record = engine.transfer(alice.id, bob.id, Amount::new(dec!(40)), None).unwrap();
//! assert_eq!(record.status, TransactionStatus::Completed);
//! assert_eq!(engine.get_account(bob.id).unwrap().balance, Amount::new(dec!(40)));
//! ```
//!
//! ## Thread Safety
//!
//! Every engine holds an `Arc<Store>` and takes `&self`, so one instance can
//! serve any number of threads. Mutual exclusion lives entirely in the store's
//! row locks and version checks; there is no engine-wide lock.

pub mod account;
pub mod amount;
mod base;
mod checkout;
pub mod config;
mod deadline;
pub mod error;
pub mod harness;
mod ledger;
pub mod logging;
pub mod order;
mod payment;
mod product;
pub mod saga;
pub mod stock;
pub mod store;
mod transaction;
mod transfer;

pub use account::Account;
pub use amount::Amount;
pub use base::{AccountId, OrderId, PaymentId, ProductId, SagaId, TransactionId};
pub use checkout::OrderProcessor;
pub use config::{AppConfig, ConfigError};
pub use deadline::Deadline;
pub use error::{EngineError, Result};
pub use harness::{ConcurrencyHarness, DeadlockReport, HarnessConfig, SideOutcome, TransferReport};
pub use ledger::{LedgerSummary, TransactionLedger};
pub use order::{Order, OrderItem, OrderStatus, Payment, PaymentStatus};
pub use payment::{DecliningGateway, PaymentGateway, SimulatedGateway};
pub use product::Product;
pub use saga::{OrderSaga, SagaRecord, SagaState};
pub use stock::{Backoff, RetryPolicy, StockService, StockUpdate};
pub use store::{RowLock, Store, StoreConfig, Table, UnitOfWork, Versioned};
pub use transaction::{TransactionRecord, TransactionStatus, TransactionType};
pub use transfer::TransferEngine;
