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

//! Deadlock detection tests using parking_lot's built-in deadlock detector.
//!
//! These tests drive the public engines from many threads and verify that
//! their locking patterns never form a cycle: transfers lock accounts in id
//! order, and order workflows lock products in id order.
//!
//! Row locks are parking_lot mutexes, so the `deadlock_detection` feature sees
//! every row-lock wait.

use parking_lot::deadlock;
use rand::Rng;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use transfer_engine::{
    AccountId, Amount, EngineError, OrderProcessor, OrderSaga, ProductId, SimulatedGateway,
    StockService, Store, TransferEngine,
};

// === Deadlock Detection Infrastructure ===

/// Starts a background thread that checks for deadlocks.
/// Returns a handle to stop the detector.
fn start_deadlock_detector() -> Arc<AtomicBool> {
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();

    thread::spawn(move || {
        while running_clone.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(100));
            let deadlocks = deadlock::check_deadlock();
            if !deadlocks.is_empty() {
                eprintln!("\n=== DEADLOCK DETECTED ===");
                for (i, threads) in deadlocks.iter().enumerate() {
                    eprintln!("\nDeadlock #{}", i + 1);
                    for t in threads {
                        eprintln!("Thread ID: {:?}", t.thread_id());
                        eprintln!("Backtrace:\n{:#?}", t.backtrace());
                    }
                }
                panic!("Deadlock detected! See output above for details.");
            }
        }
    });

    running
}

/// Stops the deadlock detector.
fn stop_deadlock_detector(running: Arc<AtomicBool>) {
    running.store(false, Ordering::SeqCst);
    thread::sleep(Duration::from_millis(150)); // Let detector thread exit
}

fn open_accounts(engine: &TransferEngine, count: usize) -> Vec<AccountId> {
    (0..count)
        .map(|i| {
            engine
                .open_account(&format!("DL-{i:03}"), "Stress", "USD", Amount::new(dec!(1000)))
                .unwrap()
                .id
        })
        .collect()
}

fn total(engine: &TransferEngine, ids: &[AccountId]) -> Amount {
    engine
        .store()
        .accounts_snapshot(ids)
        .unwrap()
        .iter()
        .map(|account| account.balance)
        .sum()
}

// === Tests ===

/// Two accounts hammered in both directions by many threads.
#[test]
fn no_deadlock_opposite_direction_transfers() {
    let detector = start_deadlock_detector();
    let engine = TransferEngine::new(Arc::new(Store::default()));
    let ids = open_accounts(&engine, 2);

    const NUM_THREADS: usize = 16;
    const OPS_PER_THREAD: usize = 100;

    thread::scope(|s| {
        for t in 0..NUM_THREADS {
            let engine = &engine;
            let ids = &ids;
            s.spawn(move || {
                let (from, to) = if t % 2 == 0 { (ids[0], ids[1]) } else { (ids[1], ids[0]) };
                for _ in 0..OPS_PER_THREAD {
                    let result = engine.transfer(from, to, Amount::new(dec!(1)), None);
                    assert!(!matches!(result, Err(EngineError::Deadlock)));
                }
            });
        }
    });

    stop_deadlock_detector(detector);
    assert_eq!(total(&engine, &ids), Amount::new(dec!(2000)));
    println!(
        "Opposite direction test passed: {} threads × {} ops",
        NUM_THREADS, OPS_PER_THREAD
    );
}

/// Random transfers across a ring of accounts.
#[test]
fn no_deadlock_cross_account_transfers() {
    let detector = start_deadlock_detector();
    let engine = TransferEngine::new(Arc::new(Store::default()));
    let ids = open_accounts(&engine, 8);

    const NUM_THREADS: usize = 12;
    const OPS_PER_THREAD: usize = 200;

    thread::scope(|s| {
        for _ in 0..NUM_THREADS {
            let engine = &engine;
            let ids = &ids;
            s.spawn(move || {
                let mut rng = rand::thread_rng();
                for _ in 0..OPS_PER_THREAD {
                    let from = ids[rng.gen_range(0..ids.len())];
                    let to = ids[rng.gen_range(0..ids.len())];
                    let amount = Amount::from_minor(rng.gen_range(1..=5_000));
                    match engine.transfer(from, to, amount, None) {
                        Ok(_) => {}
                        Err(EngineError::Validation(_) | EngineError::InsufficientFunds) => {}
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
            });
        }
    });

    stop_deadlock_detector(detector);
    assert_eq!(total(&engine, &ids), Amount::new(dec!(8000)));
}

/// Transfers, stock updates and both order workflows share one store.
#[test]
fn no_deadlock_mixed_workloads() {
    let detector = start_deadlock_detector();
    let store = Arc::new(Store::default());
    let engine = TransferEngine::new(Arc::clone(&store));
    let stock = StockService::new(Arc::clone(&store));
    let saga = OrderSaga::new(Arc::clone(&store), Arc::new(SimulatedGateway));
    let processor = OrderProcessor::new(Arc::clone(&store), Arc::new(SimulatedGateway));

    let ids = open_accounts(&engine, 4);
    let products: Vec<ProductId> = (0..3)
        .map(|i| {
            stock
                .add_product(&format!("P{i}"), &format!("SKU-{i}"), Amount::new(dec!(1)), 1_000)
                .unwrap()
                .id
        })
        .collect();

    const OPS_PER_THREAD: usize = 50;

    thread::scope(|s| {
        s.spawn(|| {
            for i in 0..OPS_PER_THREAD {
                let _ = engine.transfer(ids[i % 4], ids[(i + 1) % 4], Amount::new(dec!(3)), None);
            }
        });
        s.spawn(|| {
            for i in 0..OPS_PER_THREAD {
                let _ = stock.update_stock(products[i % 3], 1);
            }
        });
        s.spawn(|| {
            for i in 0..OPS_PER_THREAD {
                let items = [(products[(i + 2) % 3], 1), (products[i % 3], 1)];
                let order = saga.place_order(1, &items).unwrap();
                saga.process_order_saga(order.id).unwrap();
            }
        });
        s.spawn(|| {
            for i in 0..OPS_PER_THREAD {
                let items = [(products[(i + 1) % 3], 1), (products[i % 3], 2)];
                let order = processor.place_order(2, &items).unwrap();
                processor.process_order(order.id).unwrap();
            }
        });
    });

    stop_deadlock_detector(detector);
    assert_eq!(total(&engine, &ids), Amount::new(dec!(4000)));
    for id in products {
        let product = store.product(id).unwrap();
        assert!(product.reserved <= product.stock);
    }
}
