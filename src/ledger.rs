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

//! Append-only audit ledger of transfer, deposit and withdrawal attempts.
//!
//! Every attempt is recorded as `pending` before any row lock is taken and is
//! moved to exactly one terminal status afterwards, whether or not the
//! underlying mutation committed.

use crate::amount::Amount;
use crate::base::{AccountId, TransactionId};
use crate::error::{EngineError, Result};
use crate::transaction::{TransactionRecord, TransactionStatus, TransactionType};
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug)]
struct LedgerEntry {
    /// Insertion order, used to return history oldest first.
    sequence: u64,
    record: TransactionRecord,
}

/// Number of ledger entries per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerSummary {
    pub pending: usize,
    pub completed: usize,
    pub failed: usize,
    pub timeout: usize,
}

/// Thread-safe ledger. Lookups by id are O(1); history is returned in
/// insertion order.
#[derive(Debug, Default)]
pub struct TransactionLedger {
    entries: DashMap<TransactionId, LedgerEntry>,
    sequence: AtomicU64,
}

impl TransactionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new attempt in `pending` status.
    pub(crate) fn begin(
        &self,
        kind: TransactionType,
        from_account: Option<AccountId>,
        to_account: Option<AccountId>,
        amount: Amount,
        currency: &str,
    ) -> Result<TransactionRecord> {
        let record = TransactionRecord::pending(kind, from_account, to_account, amount, currency);
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        match self.entries.entry(record.id) {
            Entry::Occupied(_) => Err(EngineError::Conflict(format!(
                "duplicate transaction id {}",
                record.id
            ))),
            Entry::Vacant(entry) => {
                entry.insert(LedgerEntry {
                    sequence,
                    record: record.clone(),
                });
                Ok(record)
            }
        }
    }

    /// Marks a pending attempt `completed`.
    ///
    /// # Errors
    ///
    /// - [`EngineError::NotFound`] - unknown transaction id.
    /// - [`EngineError::Conflict`] - the attempt already has a terminal status.
    pub(crate) fn complete(
        &self,
        id: TransactionId,
        elapsed: Duration,
    ) -> Result<TransactionRecord> {
        self.finish(id, TransactionStatus::Completed, None, elapsed)
    }

    /// Marks a pending attempt `timeout` or `failed` depending on `error`.
    ///
    /// # Errors
    ///
    /// Same as [`TransactionLedger::complete`].
    pub(crate) fn fail(
        &self,
        id: TransactionId,
        error: &EngineError,
        elapsed: Duration,
    ) -> Result<TransactionRecord> {
        self.finish(
            id,
            TransactionStatus::for_error(error),
            Some(error.to_string()),
            elapsed,
        )
    }

    fn finish(
        &self,
        id: TransactionId,
        status: TransactionStatus,
        error_message: Option<String>,
        elapsed: Duration,
    ) -> Result<TransactionRecord> {
        let mut entry = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| EngineError::not_found("transaction", id))?;
        let record = &mut entry.record;
        if record.status.is_terminal() {
            return Err(EngineError::Conflict(format!(
                "transaction {id} is already {}",
                record.status
            )));
        }
        record.status = status;
        record.error_message = error_message;
        record.processing_time_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        record.completed_at = Some(Utc::now());
        Ok(record.clone())
    }

    pub fn get(&self, id: TransactionId) -> Option<TransactionRecord> {
        self.entries.get(&id).map(|entry| entry.record.clone())
    }

    /// Returns all attempts, oldest first, optionally filtered by status.
    pub fn history(&self, status: Option<TransactionStatus>) -> Vec<TransactionRecord> {
        let mut entries: Vec<(u64, TransactionRecord)> = self
            .entries
            .iter()
            .filter(|entry| status.is_none_or(|s| entry.record.status == s))
            .map(|entry| (entry.sequence, entry.record.clone()))
            .collect();
        entries.sort_by_key(|(sequence, _)| *sequence);
        entries.into_iter().map(|(_, record)| record).collect()
    }

    pub fn summary(&self) -> LedgerSummary {
        let mut summary = LedgerSummary::default();
        for entry in self.entries.iter() {
            match entry.record.status {
                TransactionStatus::Pending => summary.pending += 1,
                TransactionStatus::Completed => summary.completed += 1,
                TransactionStatus::Failed => summary.failed += 1,
                TransactionStatus::Timeout => summary.timeout += 1,
            }
        }
        summary
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
