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

//! Single-transaction order processing.
//!
//! [`OrderProcessor::process_order`] does in one unit of work what
//! [`crate::OrderSaga`] does in three: lock the order and its products,
//! decrement stock, charge, record the payment and complete the order. Either
//! everything commits or nothing does, at the cost of holding every lock
//! across the gateway call.

use crate::base::{OrderId, PaymentId, ProductId};
use crate::deadline::Deadline;
use crate::error::{EngineError, Result};
use crate::order::{self, Order, Payment, PaymentStatus};
use crate::payment::PaymentGateway;
use crate::store::Store;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct OrderProcessor {
    store: Arc<Store>,
    gateway: Arc<dyn PaymentGateway>,
    timeout: Duration,
}

impl OrderProcessor {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(store: Arc<Store>, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self {
            store,
            gateway,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn place_order(&self, customer_id: u64, items: &[(ProductId, u32)]) -> Result<Order> {
        order::place_order(&self.store, customer_id, items)
    }

    /// Processes a pending order atomically and returns it completed.
    ///
    /// # Errors
    ///
    /// - [`EngineError::NotFound`] - unknown order or product.
    /// - [`EngineError::Conflict`] - the order is not pending.
    /// - [`EngineError::StockUnavailable`] - an item is short.
    /// - [`EngineError::PaymentFailed`] - the gateway declined.
    /// - [`EngineError::Timeout`] / [`EngineError::Deadlock`] - lock waits.
    ///
    /// On any error nothing is written and the order stays pending.
    pub fn process_order(&self, order_id: OrderId) -> Result<Order> {
        let mut uow = self.store.begin(Deadline::after(self.timeout));
        let mut order = uow.lock(self.store.orders(), order_id)?;
        if order.items.is_empty() {
            return Err(EngineError::Validation("order has no items".into()));
        }
        order.start_processing()?;

        for (product_id, quantity) in order.quantities()? {
            let mut product = uow.lock(self.store.products(), product_id)?;
            product.decrement(quantity).map_err(|_| {
                EngineError::StockUnavailable(format!(
                    "product {product_id}: requested {quantity}, available {}",
                    product.available()
                ))
            })?;
            uow.stage(product);
        }

        if let Err(reason) = self.gateway.charge(&*order) {
            warn!(order = %order_id, %reason, "payment declined");
            return Err(EngineError::PaymentFailed(reason));
        }

        let payment_id = PaymentId::new();
        uow.stage_insert(
            self.store.payments(),
            payment_id,
            Payment {
                id: payment_id,
                order_id,
                amount: order.total_amount,
                method: self.gateway.method().to_string(),
                status: PaymentStatus::Completed,
                transaction_id: None,
            },
        );
        order.complete(payment_id)?;
        let completed = (*order).clone();
        uow.stage(order);
        uow.commit()?;

        info!(order = %order_id, payment = %payment_id, total = %completed.total_amount, "order processed");
        Ok(completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::Amount;
    use crate::order::OrderStatus;
    use crate::payment::{DecliningGateway, SimulatedGateway};
    use rust_decimal_macros::dec;

    fn setup(gateway: Arc<dyn PaymentGateway>) -> (Arc<Store>, OrderProcessor, ProductId) {
        let store = Arc::new(Store::default());
        let product = store
            .create_product("Widget", "W-1", Amount::new(dec!(5)), 10)
            .unwrap();
        let processor = OrderProcessor::new(Arc::clone(&store), gateway);
        (store, processor, product.id)
    }

    #[test]
    fn processes_order_in_one_commit() {
        let (store, processor, product) = setup(Arc::new(SimulatedGateway));
        let order = processor.place_order(1, &[(product, 3)]).unwrap();

        let done = processor.process_order(order.id).unwrap();
        assert_eq!(done.status, OrderStatus::Completed);
        let payment = store.payment(done.payment_id.unwrap()).unwrap();
        assert_eq!(payment.status, PaymentStatus::Completed);
        assert_eq!(payment.amount, Amount::new(dec!(15)));
        assert_eq!(store.product(product).unwrap().stock, 7);
    }

    #[test]
    fn declined_payment_writes_nothing() {
        let (store, processor, product) = setup(Arc::new(DecliningGateway::new("card expired")));
        let order = processor.place_order(1, &[(product, 3)]).unwrap();

        let err = processor.process_order(order.id).unwrap_err();
        assert_eq!(err, EngineError::PaymentFailed("card expired".into()));
        assert_eq!(store.order(order.id).unwrap().status, OrderStatus::Pending);
        assert_eq!(store.product(product).unwrap().stock, 10);
    }

    #[test]
    fn short_stock_is_unavailable() {
        let (store, processor, product) = setup(Arc::new(SimulatedGateway));
        let order = processor.place_order(1, &[(product, 11)]).unwrap();

        let err = processor.process_order(order.id).unwrap_err();
        assert!(matches!(err, EngineError::StockUnavailable(_)));
        assert_eq!(store.product(product).unwrap().stock, 10);
    }

    #[test]
    fn completed_order_is_not_processed_twice() {
        let (_, processor, product) = setup(Arc::new(SimulatedGateway));
        let order = processor.place_order(1, &[(product, 1)]).unwrap();
        processor.process_order(order.id).unwrap();
        assert!(matches!(
            processor.process_order(order.id),
            Err(EngineError::Conflict(_))
        ));
    }
}
