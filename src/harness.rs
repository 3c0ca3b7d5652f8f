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

//! Concurrency harness.
//!
//! Drives the transfer engine from many threads and provokes a two-sided
//! lock-order conflict, then checks that money was conserved. Every run works
//! on two freshly opened accounts, so runs never interfere with each other or
//! with accounts already in the store.

use crate::amount::Amount;
use crate::base::AccountId;
use crate::deadline::Deadline;
use crate::error::{EngineError, Result};
use crate::store::Store;
use crate::transfer::TransferEngine;
use crossbeam::channel;
use rand::Rng;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
    pub initial_balance_a: Amount,
    pub initial_balance_b: Amount,
    /// Upper bound of each random transfer amount.
    pub max_amount: Amount,
    /// Per-call timeouts are drawn from `min_timeout..=max_timeout`.
    pub min_timeout: Duration,
    pub max_timeout: Duration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            initial_balance_a: Amount::from_minor(1_000_000),
            initial_balance_b: Amount::from_minor(1_000_000),
            max_amount: Amount::from_minor(10_000),
            min_timeout: Duration::from_millis(500),
            max_timeout: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub workers: usize,
    pub successes: usize,
    pub failures: usize,
    pub timeouts: usize,
    pub initial_total: Amount,
    pub final_total: Amount,
    pub elapsed: Duration,
}

impl TransferReport {
    pub fn is_conserved(&self) -> bool {
        self.initial_total == self.final_total
    }
}

/// Outcome of one side of the opposite-order deadlock scenario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SideOutcome {
    pub first: AccountId,
    pub second: AccountId,
    pub result: Result<()>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadlockReport {
    pub outcomes: Vec<SideOutcome>,
    pub total_before: Amount,
    pub total_after: Amount,
}

impl DeadlockReport {
    /// True if at least one side was stopped by deadlock detection, a lock
    /// wait timeout or its deadline.
    pub fn error_surfaced(&self) -> bool {
        self.outcomes.iter().any(|outcome| {
            outcome
                .result
                .as_ref()
                .is_err_and(|e| e.is_conflict() || e.is_timeout())
        })
    }

    pub fn is_conserved(&self) -> bool {
        self.total_before == self.total_after
    }
}

pub struct ConcurrencyHarness {
    engine: TransferEngine,
    config: HarnessConfig,
}

impl ConcurrencyHarness {
    /// Runs scenarios through `engine`, so its store configuration and
    /// default timeout apply to every transfer the harness makes.
    pub fn new(engine: TransferEngine, config: HarnessConfig) -> Self {
        Self { engine, config }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Runs `workers` concurrent transfers in random directions between two
    /// new accounts, each with a random amount and a random timeout, and
    /// tallies their outcomes.
    ///
    /// # Errors
    ///
    /// Only setup and final reads can fail; transfer failures are counted.
    pub fn concurrent_transfers(&self, workers: usize) -> Result<TransferReport> {
        let (a, b) = self.open_pair("conc")?;
        let initial_total = self.total(a, b)?;
        let max_minor = to_minor(self.config.max_amount).max(1);
        let (min_ms, max_ms) = self.timeout_range_ms();

        let started = Instant::now();
        let (tx, rx) = channel::unbounded::<Result<()>>();
        thread::scope(|s| {
            for _ in 0..workers {
                let tx = tx.clone();
                s.spawn(move || {
                    let mut rng = rand::thread_rng();
                    let (from, to) = if rng.gen_bool(0.5) { (a, b) } else { (b, a) };
                    let amount = Amount::from_minor(rng.gen_range(1..=max_minor));
                    let timeout = Duration::from_millis(rng.gen_range(min_ms..=max_ms));
                    let result = self
                        .engine
                        .transfer(from, to, amount, Some(timeout))
                        .map(|_| ());
                    // The receiver outlives every worker.
                    let _ = tx.send(result);
                });
            }
        });
        drop(tx);

        let (mut successes, mut failures, mut timeouts) = (0, 0, 0);
        for result in rx {
            match result {
                Ok(()) => successes += 1,
                Err(e) if e.is_timeout() => timeouts += 1,
                Err(_) => failures += 1,
            }
        }

        let report = TransferReport {
            workers,
            successes,
            failures,
            timeouts,
            initial_total,
            final_total: self.total(a, b)?,
            elapsed: started.elapsed(),
        };
        if report.is_conserved() {
            info!(
                workers,
                successes, failures, timeouts,
                elapsed_ms = u64::try_from(report.elapsed.as_millis()).unwrap_or(u64::MAX),
                "concurrent transfers finished"
            );
        } else {
            warn!(
                initial_total = %report.initial_total,
                final_total = %report.final_total,
                "balance not conserved"
            );
        }
        Ok(report)
    }

    /// Two threads each lock both accounts of a new pair in opposite order,
    /// sleeping `delay` between the two acquisitions, then move one unit.
    ///
    /// The sides bypass [`TransferEngine`] and its ordered locking on purpose.
    ///
    /// # Errors
    ///
    /// Only setup and final reads can fail; side outcomes are reported.
    pub fn deadlock(&self, delay: Duration) -> Result<DeadlockReport> {
        let (a, b) = self.open_pair("dl")?;
        let total_before = self.total(a, b)?;
        let store = self.engine.store().as_ref();
        let timeout = delay.saturating_add(self.config.max_timeout);

        let outcomes = thread::scope(|s| {
            let handles: Vec<_> = [(a, b), (b, a)]
                .into_iter()
                .map(|(first, second)| {
                    s.spawn(move || SideOutcome {
                        first,
                        second,
                        result: lock_in_order(store, first, second, delay, timeout),
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| SideOutcome {
                        first: a,
                        second: b,
                        result: Err(EngineError::Internal("deadlock side panicked".into())),
                    })
                })
                .collect::<Vec<_>>()
        });

        let report = DeadlockReport {
            outcomes,
            total_before,
            total_after: self.total(a, b)?,
        };
        for outcome in &report.outcomes {
            match &outcome.result {
                Ok(()) => info!(first = %outcome.first, second = %outcome.second, "side committed"),
                Err(e) => warn!(first = %outcome.first, second = %outcome.second, error = %e, "side aborted"),
            }
        }
        Ok(report)
    }

    fn open_pair(&self, tag: &str) -> Result<(AccountId, AccountId)> {
        let run = uuid::Uuid::new_v4().simple().to_string();
        let a = self.engine.open_account(
            &format!("{tag}-{run}-a"),
            "Harness A",
            "USD",
            self.config.initial_balance_a,
        )?;
        let b = self.engine.open_account(
            &format!("{tag}-{run}-b"),
            "Harness B",
            "USD",
            self.config.initial_balance_b,
        )?;
        Ok((a.id, b.id))
    }

    fn total(&self, a: AccountId, b: AccountId) -> Result<Amount> {
        let accounts = self.engine.store().accounts_snapshot(&[a, b])?;
        accounts
            .iter()
            .try_fold(Amount::ZERO, |total, account| total.checked_add(account.balance))
            .ok_or_else(|| EngineError::Validation("total balance overflow".into()))
    }

    fn timeout_range_ms(&self) -> (u64, u64) {
        let min = u64::try_from(self.config.min_timeout.as_millis()).unwrap_or(u64::MAX);
        let max = u64::try_from(self.config.max_timeout.as_millis()).unwrap_or(u64::MAX);
        (min.min(max), max.max(min))
    }
}

fn lock_in_order(
    store: &Store,
    first: AccountId,
    second: AccountId,
    delay: Duration,
    timeout: Duration,
) -> Result<()> {
    let mut uow = store.begin(Deadline::after(timeout));
    let mut source = uow.lock(store.accounts(), first)?;
    thread::sleep(delay);
    let mut destination = uow.lock(store.accounts(), second)?;
    let unit = Amount::from_minor(1);
    source.debit(unit)?;
    destination.credit(unit)?;
    uow.stage(source);
    uow.stage(destination);
    uow.commit()
}

fn to_minor(amount: Amount) -> i64 {
    amount
        .value()
        .checked_mul(Decimal::ONE_HUNDRED)
        .and_then(|minor| minor.trunc().to_i64())
        .unwrap_or(i64::MAX)
}
