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

//! Orders, order items and payments.
//!
//! Order and payment statuses only move forward; rows are never deleted.

use crate::amount::Amount;
use crate::base::{OrderId, PaymentId, ProductId, TransactionId};
use crate::error::{EngineError, Result};
use crate::store::Store;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Processing,
    Completed,
    Cancelled,
}

/// A line of an order. `price` is the unit price snapshotted when the order
/// was placed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub quantity: u32,
    pub price: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub order_number: String,
    pub customer_id: u64,
    pub total_amount: Amount,
    pub status: OrderStatus,
    pub items: Vec<OrderItem>,
    pub payment_id: Option<PaymentId>,
    pub created_at: DateTime<Utc>,
}

impl Order {
    /// Items merged per product and sorted by product id, which is the lock
    /// order used when reserving stock.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] if one product's lines add up past
    /// `u32::MAX`. Orders created by `place_order` never do.
    pub fn quantities(&self) -> Result<Vec<(ProductId, u32)>> {
        merge_quantities(
            self.items
                .iter()
                .map(|item| (item.product_id, item.quantity))
                .collect(),
        )
    }

    pub(crate) fn start_processing(&mut self) -> Result<()> {
        match self.status {
            OrderStatus::Pending => {
                self.status = OrderStatus::Processing;
                Ok(())
            }
            other => Err(EngineError::Conflict(format!(
                "order {} cannot be processed from status {other:?}",
                self.id
            ))),
        }
    }

    pub(crate) fn complete(&mut self, payment_id: PaymentId) -> Result<()> {
        match self.status {
            OrderStatus::Pending | OrderStatus::Processing => {
                self.status = OrderStatus::Completed;
                self.payment_id = Some(payment_id);
                Ok(())
            }
            other => Err(EngineError::Conflict(format!(
                "order {} cannot be completed from status {other:?}",
                self.id
            ))),
        }
    }

    /// Cancels unless the order already completed.
    pub(crate) fn cancel(&mut self) {
        if self.status != OrderStatus::Completed {
            self.status = OrderStatus::Cancelled;
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub order_id: OrderId,
    pub amount: Amount,
    pub method: String,
    pub status: PaymentStatus,
    pub transaction_id: Option<TransactionId>,
}

fn merge_quantities(mut items: Vec<(ProductId, u32)>) -> Result<Vec<(ProductId, u32)>> {
    items.sort_by_key(|&(id, _)| id);
    let mut merged: Vec<(ProductId, u32)> = Vec::with_capacity(items.len());
    for (product_id, quantity) in items {
        match merged.last_mut() {
            Some((id, total)) if *id == product_id => {
                *total = total.checked_add(quantity).ok_or_else(|| {
                    EngineError::Validation(format!(
                        "total quantity for product {product_id} is too large"
                    ))
                })?;
            }
            _ => merged.push((product_id, quantity)),
        }
    }
    Ok(merged)
}

/// Persists a new `pending` order, snapshotting current product prices.
///
/// # Errors
///
/// - [`EngineError::Validation`] - no items, an item with zero quantity, a
///   per-product quantity past `u32::MAX`, or a total too large to represent.
/// - [`EngineError::NotFound`] - an item references an unknown product.
pub(crate) fn place_order(
    store: &Store,
    customer_id: u64,
    items: &[(ProductId, u32)],
) -> Result<Order> {
    if items.is_empty() {
        return Err(EngineError::Validation("order has no items".into()));
    }
    merge_quantities(items.to_vec())?;
    let id = store.next_order_id();
    let mut lines = Vec::with_capacity(items.len());
    for &(product_id, quantity) in items {
        if quantity == 0 {
            return Err(EngineError::Validation(format!(
                "quantity for product {product_id} must be positive"
            )));
        }
        let product = store
            .product(product_id)
            .ok_or_else(|| EngineError::not_found("product", product_id))?;
        lines.push(OrderItem {
            order_id: id,
            product_id,
            quantity,
            price: product.price,
        });
    }

    let total_amount = lines
        .iter()
        .try_fold(Amount::ZERO, |total, item| {
            item.price
                .checked_mul(item.quantity)
                .and_then(|line| total.checked_add(line))
        })
        .ok_or_else(|| EngineError::Validation("order total is too large".into()))?;

    let created_at = Utc::now();
    let order = Order {
        id,
        order_number: format!("ORD-{}-{:06}", created_at.format("%Y%m%d"), id.0),
        customer_id,
        total_amount,
        status: OrderStatus::Pending,
        items: lines,
        payment_id: None,
        created_at,
    };
    store.orders().insert(id, order.clone())?;
    info!(order = %id, number = %order.order_number, total = %order.total_amount, "order placed");
    Ok(order)
}
