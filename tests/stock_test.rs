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

//! StockService integration tests: optimistic updates under contention.

use rust_decimal_macros::dec;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use transfer_engine::{
    Amount, Backoff, Deadline, EngineError, ProductId, RetryPolicy, StockService, Store,
};

fn setup(stock: u32, policy: RetryPolicy) -> (Arc<Store>, StockService, ProductId) {
    let store = Arc::new(Store::default());
    let service = StockService::with_policy(Arc::clone(&store), policy);
    let product = service
        .add_product("Widget", "WID-001", Amount::new(dec!(9.99)), stock)
        .unwrap();
    (store, service, product.id)
}

/// Commits a restock through a raw unit of work after `delay`, while a stock
/// update on another thread is between its read and its compare-and-swap.
fn race_with_writer(
    store: &Store,
    service: &StockService,
    id: ProductId,
) -> transfer_engine::Result<transfer_engine::StockUpdate> {
    let mut uow = store.begin(Deadline::none());
    let mut row = uow.lock(store.products(), id).unwrap();
    row.stock += 5;
    row.version += 1;

    thread::scope(|s| {
        let updater = s.spawn(|| service.update_stock(id, 3));
        thread::sleep(Duration::from_millis(50));
        uow.stage(row);
        uow.commit().unwrap();
        updater.join().unwrap()
    })
}

#[test]
fn decrement_reduces_stock_and_bumps_version() {
    let (_, service, id) = setup(20, RetryPolicy::default());
    let update = service.update_stock(id, 7).unwrap();
    assert_eq!(update.product.stock, 13);
    assert_eq!(update.product.version, 2);
    assert_eq!(update.attempts, 1);
}

#[test]
fn insufficient_stock_is_final_and_not_retried() {
    let (_, service, id) = setup(2, RetryPolicy::default());
    assert_eq!(service.update_stock(id, 3), Err(EngineError::InsufficientStock));
    assert_eq!(service.get_product(id).unwrap().stock, 2);
}

#[test]
fn unknown_product_is_not_found() {
    let (_, service, _) = setup(2, RetryPolicy::default());
    assert!(matches!(
        service.update_stock(ProductId(999), 1),
        Err(EngineError::NotFound(_))
    ));
}

#[test]
fn restock_adds_units() {
    let (_, service, id) = setup(2, RetryPolicy::default());
    let update = service.restock(id, 8).unwrap();
    assert_eq!(update.product.stock, 10);
}

#[test]
fn duplicate_sku_is_a_conflict() {
    let (_, service, _) = setup(2, RetryPolicy::default());
    let result = service.add_product("Other", "WID-001", Amount::new(dec!(1)), 1);
    assert!(matches!(result, Err(EngineError::Conflict(_))));
}

#[test]
fn lost_race_is_retried_after_backoff() {
    let (store, service, id) = setup(10, RetryPolicy::default());

    let update = race_with_writer(&store, &service, id).unwrap();

    assert_eq!(update.attempts, 2);
    assert_eq!(update.product.stock, 12);
    assert_eq!(update.product.version, 3);
}

#[test]
fn single_attempt_policy_reports_conflict() {
    let policy = RetryPolicy {
        max_attempts: 1,
        backoff: Backoff::Linear {
            step: Duration::from_millis(50),
        },
    };
    let (store, service, id) = setup(10, policy);

    let result = race_with_writer(&store, &service, id);

    assert!(matches!(result, Err(EngineError::Conflict(_))));
    assert!(result.unwrap_err().is_conflict());
    assert_eq!(store.product(id).unwrap().stock, 15);
}

#[test]
fn two_concurrent_updates_both_land_within_default_attempts() {
    let policy = RetryPolicy::default();
    let (_, service, id) = setup(50, policy);
    let start = Barrier::new(2);

    let updates: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                s.spawn(|| {
                    start.wait();
                    service.update_stock(id, 5)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for update in updates {
        let update = update.unwrap();
        assert!(update.attempts >= 1);
        assert!(update.attempts <= policy.max_attempts);
    }
    let product = service.get_product(id).unwrap();
    assert_eq!(product.stock, 40);
    assert_eq!(product.version, 3);
}

#[test]
fn concurrent_decrements_never_oversell() {
    let policy = RetryPolicy {
        max_attempts: 10,
        backoff: Backoff::ExponentialJitter {
            base: Duration::from_millis(1),
            max: Duration::from_millis(20),
        },
    };
    let (_, service, id) = setup(50, policy);
    const WORKERS: usize = 40;

    let results: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..WORKERS)
            .map(|_| s.spawn(|| service.update_stock(id, 2)))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let sold: u32 = results.iter().filter(|r| r.is_ok()).count() as u32 * 2;
    for result in &results {
        if let Err(e) = result {
            assert!(matches!(e, EngineError::Conflict(_) | EngineError::InsufficientStock));
        }
    }
    let product = service.get_product(id).unwrap();
    assert_eq!(product.stock, 50 - sold);
    assert!(product.available() <= product.stock);
}

#[test]
fn reservations_limit_what_can_be_sold() {
    let (store, service, id) = setup(10, RetryPolicy::default());
    let mut uow = store.begin(Deadline::none());
    let mut row = uow.lock(store.products(), id).unwrap();
    row.reserved = 8;
    row.version += 1;
    uow.stage(row);
    uow.commit().unwrap();

    assert_eq!(service.update_stock(id, 3), Err(EngineError::InsufficientStock));
    assert_eq!(service.update_stock(id, 2).unwrap().product.available(), 0);
}
