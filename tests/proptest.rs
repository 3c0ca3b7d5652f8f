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

//! Property-based tests for the transfer and inventory engines.
//!
//! These tests verify invariants that should hold for any sequence of
//! operations, whether individual operations succeed or fail.

use proptest::prelude::*;
use std::sync::Arc;
use transfer_engine::{
    AccountId, Amount, DecliningGateway, OrderSaga, OrderStatus, ProductId, StockService, Store,
    TransactionStatus, TransferEngine,
};

// =============================================================================
// Arbitrary Strategies
// =============================================================================

/// Generate an amount in cents, including zero and negatives to exercise
/// validation.
fn arb_amount() -> impl Strategy<Value = Amount> {
    (-100i64..=200_000i64).prop_map(Amount::from_minor)
}

/// A transfer between two of three accounts (possibly the same one).
fn arb_transfer() -> impl Strategy<Value = (usize, usize, Amount)> {
    (0usize..3, 0usize..3, arb_amount())
}

#[derive(Debug, Clone)]
enum StockOp {
    Sell(u32),
    Restock(u32),
}

fn arb_stock_op() -> impl Strategy<Value = StockOp> {
    prop_oneof![
        (0u32..30).prop_map(StockOp::Sell),
        (0u32..30).prop_map(StockOp::Restock),
    ]
}

fn open_accounts(engine: &TransferEngine, balances: &[i64]) -> Vec<AccountId> {
    balances
        .iter()
        .enumerate()
        .map(|(i, minor)| {
            engine
                .open_account(&format!("P-{i}"), "Prop", "USD", Amount::from_minor(*minor))
                .unwrap()
                .id
        })
        .collect()
}

// =============================================================================
// Transfer Invariants
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// The sum of balances never changes, and no balance goes negative.
    #[test]
    fn transfers_conserve_total_balance(
        balances in prop::collection::vec(0i64..500_000, 3),
        transfers in prop::collection::vec(arb_transfer(), 1..40),
    ) {
        let engine = TransferEngine::new(Arc::new(Store::default()));
        let ids = open_accounts(&engine, &balances);
        let initial: Amount = balances.iter().map(|b| Amount::from_minor(*b)).sum();

        for (from, to, amount) in transfers {
            let _ = engine.transfer(ids[from], ids[to], amount, None);
        }

        let accounts = engine.store().accounts_snapshot(&ids).unwrap();
        let total: Amount = accounts.iter().map(|a| a.balance).sum();
        prop_assert_eq!(total, initial);
        for account in &accounts {
            prop_assert!(!account.balance.is_negative());
        }
    }

    /// Every attempt ends in exactly one terminal status that matches the
    /// result returned to the caller.
    #[test]
    fn ledger_status_matches_outcome(
        transfers in prop::collection::vec(arb_transfer(), 1..30),
    ) {
        let engine = TransferEngine::new(Arc::new(Store::default()));
        let ids = open_accounts(&engine, &[100_000, 50_000, 0]);

        let mut expected = Vec::new();
        for (from, to, amount) in transfers {
            let status = match engine.transfer(ids[from], ids[to], amount, None) {
                Ok(record) => record.status,
                Err(e) if e.is_timeout() => TransactionStatus::Timeout,
                Err(_) => TransactionStatus::Failed,
            };
            expected.push(status);
        }

        let recorded: Vec<_> = engine
            .transaction_history(None)
            .into_iter()
            .map(|r| r.status)
            .collect();
        prop_assert_eq!(recorded, expected);
        prop_assert_eq!(engine.store().ledger().summary().pending, 0);
    }
}

// =============================================================================
// Stock Invariants
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Stock equals the initial stock plus accepted restocks minus accepted
    /// sales, and a sale is refused only when it would oversell.
    #[test]
    fn stock_tracks_accepted_operations(
        initial in 0u32..100,
        ops in prop::collection::vec(arb_stock_op(), 1..30),
    ) {
        let service = StockService::new(Arc::new(Store::default()));
        let id = service
            .add_product("Prop", "PROP-1", Amount::from_minor(100), initial)
            .unwrap()
            .id;

        let mut model = initial;
        for op in ops {
            match op {
                StockOp::Sell(qty) => match service.update_stock(id, qty) {
                    Ok(_) => model -= qty,
                    Err(_) => prop_assert!(qty == 0 || qty > model),
                },
                StockOp::Restock(qty) => {
                    if service.restock(id, qty).is_ok() {
                        model += qty;
                    } else {
                        prop_assert_eq!(qty, 0);
                    }
                }
            }
        }

        prop_assert_eq!(service.get_product(id).unwrap().stock, model);
    }
}

// =============================================================================
// Saga Invariants
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// A declined payment returns every reservation, whatever the items.
    #[test]
    fn declined_saga_restores_reservations(
        items in prop::collection::vec((0usize..3, 1u32..8), 1..6),
    ) {
        let store = Arc::new(Store::default());
        let products: Vec<ProductId> = (0..3)
            .map(|i| {
                store
                    .create_product(&format!("P{i}"), &format!("SKU-{i}"), Amount::from_minor(250), 20)
                    .unwrap()
                    .id
            })
            .collect();
        let saga = OrderSaga::new(Arc::clone(&store), Arc::new(DecliningGateway::new("declined")));
        let lines: Vec<_> = items.iter().map(|(p, q)| (products[*p], *q)).collect();
        let order = saga.place_order(1, &lines).unwrap();

        prop_assert!(saga.process_order_saga(order.id).is_err());

        for id in &products {
            let product = store.product(*id).unwrap();
            prop_assert_eq!(product.reserved, 0);
            prop_assert_eq!(product.stock, 20);
        }
        prop_assert_eq!(store.order(order.id).unwrap().status, OrderStatus::Cancelled);
    }
}
