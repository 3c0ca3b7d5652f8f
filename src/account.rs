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

//! Account rows.
//!
//! An [`Account`] is mutated only through [`TransferEngine`](crate::TransferEngine)
//! while its row lock is held. Every successful mutation bumps `version`, so
//! optimistic readers of an account notice pessimistic writes.
//!
//! # Example
//!
//! ```
//! use rust_decimal_macros::dec;
//! use transfer_engine::{Account, AccountId, Amount};
//!
//! let account = Account::new(AccountId(1), "ACC-001", "Alice", "USD", Amount::new(dec!(50)));
//! assert_eq!(account.balance, Amount::new(dec!(50)));
//! assert!(!account.is_locked);
//! ```

use crate::amount::Amount;
use crate::base::AccountId;
use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    /// Externally visible account number, unique across the store.
    pub number: String,
    pub name: String,
    pub balance: Amount,
    pub currency: String,
    pub is_locked: bool,
    pub version: u64,
}

impl Account {
    pub fn new(
        id: AccountId,
        number: impl Into<String>,
        name: impl Into<String>,
        currency: impl Into<String>,
        balance: Amount,
    ) -> Self {
        Self {
            id,
            number: number.into(),
            name: name.into(),
            balance,
            currency: currency.into(),
            is_locked: false,
            version: 1,
        }
    }

    fn assert_invariants(&self) {
        debug_assert!(
            !self.balance.is_negative(),
            "Invariant violated: balance of account {} went negative: {}",
            self.id,
            self.balance
        );
    }

    /// Decreases the balance.
    pub(crate) fn debit(&mut self, amount: Amount) -> Result<()> {
        if !amount.is_positive() {
            return Err(EngineError::Validation("amount must be positive".into()));
        }
        if self.is_locked {
            return Err(EngineError::AccountLocked);
        }
        if self.balance < amount {
            return Err(EngineError::InsufficientFunds);
        }
        self.balance -= amount;
        self.version += 1;
        self.assert_invariants();
        Ok(())
    }

    /// Increases the balance.
    pub(crate) fn credit(&mut self, amount: Amount) -> Result<()> {
        if !amount.is_positive() {
            return Err(EngineError::Validation("amount must be positive".into()));
        }
        if self.is_locked {
            return Err(EngineError::AccountLocked);
        }
        self.balance = self
            .balance
            .checked_add(amount)
            .ok_or_else(|| EngineError::Validation("balance overflow".into()))?;
        self.version += 1;
        self.assert_invariants();
        Ok(())
    }
}
