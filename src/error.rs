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

//! Error types for transfer, stock and order processing.

use thiserror::Error;

/// Errors returned by the engines and the store.
///
/// Variants are cloneable so outcomes can be collected into reports and
/// compared in tests.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Malformed input (non-positive amount, zero quantity, same account).
    /// Always rejected before any unit of work is opened.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Referenced row does not exist
    #[error("{0} not found")]
    NotFound(String),

    /// Source balance is below the transfer amount
    #[error("insufficient funds")]
    InsufficientFunds,

    /// Available stock (stock - reserved) is below the requested quantity
    #[error("insufficient stock")]
    InsufficientStock,

    /// Source or destination account is locked
    #[error("account is locked")]
    AccountLocked,

    /// Optimistic retries exhausted, or a unique key collided
    #[error("conflict: {0}")]
    Conflict(String),

    /// The store chose this unit of work as the victim of a lock cycle
    #[error("deadlock detected")]
    Deadlock,

    /// Deadline expired or was cancelled while waiting on a lock or commit
    #[error("timeout: {0}")]
    Timeout(String),

    /// Saga step 1 could not reserve every item
    #[error("stock unavailable: {0}")]
    StockUnavailable(String),

    /// Saga step 2 was declined by the payment gateway
    #[error("payment failed: {0}")]
    PaymentFailed(String),

    /// Unexpected store failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, EngineError::Timeout(_))
    }

    /// Conflict-class errors are caused by concurrent writers rather than by
    /// the request itself.
    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Conflict(_) | EngineError::Deadlock)
    }

    pub(crate) fn not_found(what: &str, id: impl std::fmt::Display) -> Self {
        EngineError::NotFound(format!("{what} {id}"))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::EngineError;

    #[test]
    fn error_display_messages() {
        assert_eq!(
            EngineError::Validation("amount must be positive".into()).to_string(),
            "validation failed: amount must be positive"
        );
        assert_eq!(
            EngineError::not_found("account", 7).to_string(),
            "account 7 not found"
        );
        assert_eq!(EngineError::InsufficientFunds.to_string(), "insufficient funds");
        assert_eq!(EngineError::InsufficientStock.to_string(), "insufficient stock");
        assert_eq!(EngineError::AccountLocked.to_string(), "account is locked");
        assert_eq!(EngineError::Deadlock.to_string(), "deadlock detected");
        assert_eq!(
            EngineError::Timeout("deadline exceeded".into()).to_string(),
            "timeout: deadline exceeded"
        );
    }

    #[test]
    fn classification() {
        assert!(EngineError::Timeout(String::new()).is_timeout());
        assert!(!EngineError::Deadlock.is_timeout());
        assert!(EngineError::Deadlock.is_conflict());
        assert!(EngineError::Conflict("x".into()).is_conflict());
        assert!(!EngineError::InsufficientFunds.is_conflict());
    }

    #[test]
    fn errors_are_cloneable() {
        let error = EngineError::PaymentFailed("declined".into());
        let cloned = error.clone();
        assert_eq!(error, cloned);
    }
}
