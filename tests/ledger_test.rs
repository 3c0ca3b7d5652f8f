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

//! TransactionLedger integration tests, driven through the TransferEngine.

use rust_decimal_macros::dec;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use transfer_engine::{
    Amount, EngineError, LedgerSummary, Store, TransactionStatus, TransactionType, TransferEngine,
};

fn engine() -> TransferEngine {
    TransferEngine::new(Arc::new(Store::default()))
}

#[test]
fn every_attempt_is_recorded_in_order() {
    let engine = engine();
    let a = engine
        .open_account("L-1", "Alice", "USD", Amount::new(dec!(100)))
        .unwrap()
        .id;
    let b = engine
        .open_account("L-2", "Bob", "USD", Amount::ZERO)
        .unwrap()
        .id;

    engine.transfer(a, b, Amount::new(dec!(30)), None).unwrap();
    let _ = engine.transfer(b, a, Amount::new(dec!(31)), None);
    engine.deposit(b, Amount::new(dec!(5)), None).unwrap();
    let _ = engine.withdraw(a, Amount::ZERO, None);

    let history = engine.transaction_history(None);
    let kinds: Vec<_> = history.iter().map(|r| (r.kind, r.status)).collect();
    assert_eq!(
        kinds,
        vec![
            (TransactionType::Transfer, TransactionStatus::Completed),
            (TransactionType::Transfer, TransactionStatus::Failed),
            (TransactionType::Deposit, TransactionStatus::Completed),
            (TransactionType::Withdrawal, TransactionStatus::Failed),
        ]
    );
    assert_eq!(
        engine.store().ledger().summary(),
        LedgerSummary {
            pending: 0,
            completed: 2,
            failed: 2,
            timeout: 0,
        }
    );
}

#[test]
fn recorded_entries_match_the_returned_record() {
    let engine = engine();
    let a = engine
        .open_account("L-1", "Alice", "USD", Amount::new(dec!(10)))
        .unwrap()
        .id;
    let b = engine.open_account("L-2", "Bob", "USD", Amount::ZERO).unwrap().id;

    let record = engine.transfer(a, b, Amount::new(dec!(1)), None).unwrap();
    let failed = engine.transfer(a, b, Amount::new(dec!(100)), None);

    let ledger = engine.store().ledger();
    assert_eq!(ledger.get(record.id), Some(record));
    assert_eq!(failed, Err(EngineError::InsufficientFunds));
    let failures = ledger.history(Some(TransactionStatus::Failed));
    assert_eq!(failures.len(), 1);
    assert!(failures[0].completed_at.is_some());
    assert_eq!(
        failures[0].error_message.as_deref(),
        Some(EngineError::InsufficientFunds.to_string().as_str())
    );
}

#[test]
fn unknown_entry_is_absent() {
    let engine = engine();
    assert!(engine.store().ledger().is_empty());
    let missing = transfer_engine::TransactionId::new();
    assert_eq!(engine.store().ledger().get(missing), None);
}

#[test]
fn concurrent_attempts_all_reach_a_terminal_status() {
    let engine = engine();
    let a = engine
        .open_account("L-1", "Alice", "USD", Amount::new(dec!(50)))
        .unwrap()
        .id;
    let b = engine
        .open_account("L-2", "Bob", "USD", Amount::new(dec!(50)))
        .unwrap()
        .id;
    const THREADS: usize = 8;
    const PER_THREAD: usize = 25;

    thread::scope(|s| {
        for i in 0..THREADS {
            let engine = &engine;
            s.spawn(move || {
                let (from, to) = if i % 2 == 0 { (a, b) } else { (b, a) };
                for _ in 0..PER_THREAD {
                    let _ = engine.transfer(from, to, Amount::new(dec!(7)), Some(Duration::from_secs(2)));
                }
            });
        }
    });

    let ledger = engine.store().ledger();
    assert_eq!(ledger.len(), THREADS * PER_THREAD);
    let summary = ledger.summary();
    assert_eq!(summary.pending, 0);
    assert_eq!(summary.completed + summary.failed + summary.timeout, THREADS * PER_THREAD);
    assert!(ledger
        .history(None)
        .iter()
        .all(|r| r.status.is_terminal() && r.completed_at.is_some()));

    let total = engine.get_account(a).unwrap().balance + engine.get_account(b).unwrap().balance;
    assert_eq!(total, Amount::new(dec!(100)));
}
