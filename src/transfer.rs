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

//! Pessimistic transfer engine.
//!
//! [`TransferEngine::transfer`] moves money between two accounts inside one
//! unit of work:
//!
//! 1. record a `pending` ledger entry;
//! 2. validate input against committed snapshots (no locks taken);
//! 3. lock both account rows in ascending id order;
//! 4. re-check lock flags and funds on the locked copies;
//! 5. debit, credit, commit;
//! 6. move the ledger entry to `completed`, or to `failed`/`timeout` after a
//!    rollback.
//!
//! Locking in id order rather than in transfer direction means two transfers
//! over the same pair of accounts always queue on the same first row and can
//! never wait on each other in a cycle.
//!
//! There is no retry inside the engine; retry policy belongs to the caller.

use crate::account::Account;
use crate::amount::Amount;
use crate::base::AccountId;
use crate::deadline::Deadline;
use crate::error::{EngineError, Result};
use crate::store::Store;
use crate::transaction::{TransactionRecord, TransactionStatus, TransactionType};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub struct TransferEngine {
    store: Arc<Store>,
    default_timeout: Duration,
}

impl TransferEngine {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(store: Arc<Store>) -> Self {
        Self::with_default_timeout(store, Self::DEFAULT_TIMEOUT)
    }

    /// `default_timeout` bounds calls that do not pass their own timeout.
    pub fn with_default_timeout(store: Arc<Store>, default_timeout: Duration) -> Self {
        Self {
            store,
            default_timeout,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Opens an account with an opening balance.
    ///
    /// # Errors
    ///
    /// See [`Store::create_account`].
    pub fn open_account(
        &self,
        number: &str,
        name: &str,
        currency: &str,
        balance: Amount,
    ) -> Result<Account> {
        self.store.create_account(number, name, currency, balance)
    }

    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for an unknown id.
    pub fn get_account(&self, id: AccountId) -> Result<Account> {
        self.store
            .account(id)
            .ok_or_else(|| EngineError::not_found("account", id))
    }

    /// Freezes or unfreezes an account. A locked account rejects transfers,
    /// deposits and withdrawals.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`], or [`EngineError::Timeout`] if the row stays
    /// locked past the default timeout.
    pub fn set_account_locked(&self, id: AccountId, locked: bool) -> Result<Account> {
        let mut uow = self.store.begin(Deadline::after(self.default_timeout));
        let mut row = uow.lock(self.store.accounts(), id)?;
        row.is_locked = locked;
        row.version += 1;
        let account = (*row).clone();
        uow.stage(row);
        uow.commit()?;
        info!(account = %id, locked, "account lock flag changed");
        Ok(account)
    }

    /// Moves `amount` from `from` to `to`.
    ///
    /// `timeout` bounds lock waits and the commit; `None` uses the engine's
    /// default. Returns the completed ledger entry.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Validation`] - non-positive amount, same account, or
    ///   currency mismatch.
    /// - [`EngineError::NotFound`] - either account is missing.
    /// - [`EngineError::AccountLocked`] - either account is locked.
    /// - [`EngineError::InsufficientFunds`] - source balance below `amount`.
    /// - [`EngineError::Timeout`] - deadline expired during lock wait or commit.
    /// - [`EngineError::Deadlock`] - chosen as a deadlock victim by the store.
    ///
    /// Every error leaves both balances untouched and the ledger entry in
    /// `failed` or `timeout`.
    pub fn transfer(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Amount,
        timeout: Option<Duration>,
    ) -> Result<TransactionRecord> {
        let deadline = Deadline::after(timeout.unwrap_or(self.default_timeout));
        self.transfer_with_deadline(from, to, amount, deadline)
    }

    /// Like [`TransferEngine::transfer`] but bounded by a caller-owned
    /// deadline, which may also be cancelled from another thread.
    ///
    /// # Errors
    ///
    /// See [`TransferEngine::transfer`].
    pub fn transfer_with_deadline(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Amount,
        deadline: Deadline,
    ) -> Result<TransactionRecord> {
        let currency = self.currency_of(from).or_else(|| self.currency_of(to));
        self.record_attempt(
            TransactionType::Transfer,
            Some(from),
            Some(to),
            amount,
            currency.as_deref().unwrap_or_default(),
            || {
                self.validate_transfer(from, to, amount)?;
                self.execute_transfer(from, to, amount, deadline)
            },
        )
    }

    /// Credits `amount` to one account.
    ///
    /// # Errors
    ///
    /// Same single-account subset as [`TransferEngine::transfer`].
    pub fn deposit(
        &self,
        account: AccountId,
        amount: Amount,
        timeout: Option<Duration>,
    ) -> Result<TransactionRecord> {
        let deadline = Deadline::after(timeout.unwrap_or(self.default_timeout));
        let currency = self.currency_of(account);
        self.record_attempt(
            TransactionType::Deposit,
            None,
            Some(account),
            amount,
            currency.as_deref().unwrap_or_default(),
            || {
                validate_amount(amount)?;
                self.validate_account(account)?;
                self.execute_single(account, deadline, |row| row.credit(amount))
            },
        )
    }

    /// Debits `amount` from one account.
    ///
    /// # Errors
    ///
    /// Same single-account subset as [`TransferEngine::transfer`].
    pub fn withdraw(
        &self,
        account: AccountId,
        amount: Amount,
        timeout: Option<Duration>,
    ) -> Result<TransactionRecord> {
        let deadline = Deadline::after(timeout.unwrap_or(self.default_timeout));
        let currency = self.currency_of(account);
        self.record_attempt(
            TransactionType::Withdrawal,
            Some(account),
            None,
            amount,
            currency.as_deref().unwrap_or_default(),
            || {
                validate_amount(amount)?;
                self.validate_account(account)?;
                self.execute_single(account, deadline, |row| row.debit(amount))
            },
        )
    }

    /// Ledger entries oldest first, optionally filtered by status.
    pub fn transaction_history(&self, status: Option<TransactionStatus>) -> Vec<TransactionRecord> {
        self.store.ledger().history(status)
    }

    fn currency_of(&self, id: AccountId) -> Option<String> {
        self.store.account(id).map(|account| account.currency)
    }

    /// Runs `attempt` between a `pending` ledger entry and its terminal update.
    fn record_attempt<F>(
        &self,
        kind: TransactionType,
        from: Option<AccountId>,
        to: Option<AccountId>,
        amount: Amount,
        currency: &str,
        attempt: F,
    ) -> Result<TransactionRecord>
    where
        F: FnOnce() -> Result<()>,
    {
        let started = Instant::now();
        let ledger = self.store.ledger();
        let record = ledger.begin(kind, from, to, amount, currency)?;

        match attempt() {
            Ok(()) => {
                let record = ledger.complete(record.id, started.elapsed())?;
                info!(
                    tx = %record.id,
                    %kind,
                    %amount,
                    elapsed_ms = record.processing_time_ms,
                    "transaction completed"
                );
                Ok(record)
            }
            Err(error) => {
                let failed = ledger.fail(record.id, &error, started.elapsed())?;
                warn!(
                    tx = %failed.id,
                    %kind,
                    %amount,
                    status = %failed.status,
                    %error,
                    "transaction rolled back"
                );
                Err(error)
            }
        }
    }

    fn validate_transfer(&self, from: AccountId, to: AccountId, amount: Amount) -> Result<()> {
        validate_amount(amount)?;
        if from == to {
            return Err(EngineError::Validation(
                "source and destination must differ".into(),
            ));
        }
        let source = self.validate_account(from)?;
        let destination = self.validate_account(to)?;
        if source.currency != destination.currency {
            return Err(EngineError::Validation(format!(
                "currency mismatch: {} vs {}",
                source.currency, destination.currency
            )));
        }
        Ok(())
    }

    fn validate_account(&self, id: AccountId) -> Result<Account> {
        let account = self.get_account(id)?;
        if account.is_locked {
            return Err(EngineError::AccountLocked);
        }
        Ok(account)
    }

    fn execute_transfer(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Amount,
        deadline: Deadline,
    ) -> Result<()> {
        let mut uow = self.store.begin(deadline);
        let accounts = self.store.accounts();

        let (low, high) = if from < to { (from, to) } else { (to, from) };
        let mut low_row = uow.lock(accounts, low)?;
        let mut high_row = uow.lock(accounts, high)?;
        let (source, destination) = if from < to {
            (&mut *low_row, &mut *high_row)
        } else {
            (&mut *high_row, &mut *low_row)
        };

        // Flags may have changed since validation.
        if source.is_locked || destination.is_locked {
            return Err(EngineError::AccountLocked);
        }
        source.debit(amount)?;
        destination.credit(amount)?;

        uow.stage(low_row);
        uow.stage(high_row);
        uow.commit()
    }

    fn execute_single<F>(&self, id: AccountId, deadline: Deadline, change: F) -> Result<()>
    where
        F: FnOnce(&mut Account) -> Result<()>,
    {
        let mut uow = self.store.begin(deadline);
        let mut row = uow.lock(self.store.accounts(), id)?;
        change(&mut *row)?;
        uow.stage(row);
        uow.commit()
    }
}

fn validate_amount(amount: Amount) -> Result<()> {
    if !amount.is_positive() {
        return Err(EngineError::Validation("amount must be positive".into()));
    }
    Ok(())
}
