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

//! Order saga with persisted progress and compensation.
//!
//! [`OrderSaga::process_order_saga`] runs three independently committed steps:
//!
//! ```text
//! Reserving ──reserve stock──► Paying ──take payment──► Confirming ──confirm order──► Done
//!     │                          │                          │
//!     └──► Failed                └───► Compensating ◄───────┘
//!                                          │
//!                       cancel payment, release stock, cancel order
//!                                          ▼
//!                                        Failed
//! ```
//!
//! Each step advances the [`SagaRecord`] inside the same unit of work that
//! commits the step, so the persisted state never disagrees with the rows it
//! describes. Compensations are forward writes committed on their own and are
//! idempotent, which lets [`OrderSaga::recover`] finish sagas abandoned
//! mid-flight.

use crate::base::{OrderId, PaymentId, ProductId, SagaId};
use crate::deadline::Deadline;
use crate::error::{EngineError, Result};
use crate::order::{self, Order, OrderStatus, Payment, PaymentStatus};
use crate::payment::PaymentGateway;
use crate::store::{Store, UnitOfWork};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SagaState {
    Reserving,
    Paying,
    Confirming,
    Compensating,
    Done,
    Failed,
}

impl SagaState {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaState::Done | SagaState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SagaState::Reserving => "reserving",
            SagaState::Paying => "paying",
            SagaState::Confirming => "confirming",
            SagaState::Compensating => "compensating",
            SagaState::Done => "done",
            SagaState::Failed => "failed",
        }
    }
}

impl fmt::Display for SagaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable progress of one saga run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaRecord {
    pub id: SagaId,
    pub order_id: OrderId,
    pub state: SagaState,
    pub payment_id: Option<PaymentId>,
    /// True while the order's items are held in `Product::reserved`.
    pub stock_reserved: bool,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SagaRecord {
    fn new(order_id: OrderId) -> Self {
        let now = Utc::now();
        Self {
            id: SagaId::new(),
            order_id,
            state: SagaState::Reserving,
            payment_id: None,
            stock_reserved: false,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn advance(&mut self, state: SagaState) {
        self.state = state;
        self.updated_at = Utc::now();
    }
}

pub struct OrderSaga {
    store: Arc<Store>,
    gateway: Arc<dyn PaymentGateway>,
    step_timeout: Duration,
}

impl OrderSaga {
    pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(store: Arc<Store>, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self::with_step_timeout(store, gateway, Self::DEFAULT_STEP_TIMEOUT)
    }

    /// `step_timeout` bounds each step's and each compensation's unit of work.
    pub fn with_step_timeout(
        store: Arc<Store>,
        gateway: Arc<dyn PaymentGateway>,
        step_timeout: Duration,
    ) -> Self {
        Self {
            store,
            gateway,
            step_timeout,
        }
    }

    /// Persists a new `pending` order at current prices.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Validation`] - empty order or zero quantity.
    /// - [`EngineError::NotFound`] - unknown product.
    pub fn place_order(&self, customer_id: u64, items: &[(ProductId, u32)]) -> Result<Order> {
        order::place_order(&self.store, customer_id, items)
    }

    /// Runs reserve → pay → confirm for `order_id`, compensating on failure.
    ///
    /// Returns the completed order.
    ///
    /// # Errors
    ///
    /// - [`EngineError::NotFound`] / [`EngineError::Validation`] - bad order;
    ///   nothing is started.
    /// - [`EngineError::Conflict`] - the order is not pending; nothing is
    ///   started.
    /// - [`EngineError::StockUnavailable`] - reservation failed; nothing was
    ///   reserved and the order is cancelled.
    /// - [`EngineError::PaymentFailed`] - the gateway declined; the
    ///   reservation is released and the order cancelled.
    /// - Any error from confirming (e.g. [`EngineError::Conflict`] for an order
    ///   cancelled concurrently) after payment and reservation are reversed.
    pub fn process_order_saga(&self, order_id: OrderId) -> Result<Order> {
        let order = self
            .store
            .order(order_id)
            .ok_or_else(|| EngineError::not_found("order", order_id))?;
        if order.items.is_empty() {
            return Err(EngineError::Validation("order has no items".into()));
        }
        if order.status != OrderStatus::Pending {
            return Err(EngineError::Conflict(format!(
                "order {order_id} is {:?}, expected Pending",
                order.status
            )));
        }

        let saga = SagaRecord::new(order_id);
        let saga_id = saga.id;
        self.store.sagas().insert(saga_id, saga)?;
        info!(saga = %saga_id, order = %order_id, "saga started");

        if let Err(e) = self.reserve_stock(saga_id, &order) {
            warn!(saga = %saga_id, error = %e, "stock reservation failed");
            if let Err(abandon_err) = self.abandon(saga_id, order_id, &e.to_string()) {
                error!(saga = %saga_id, error = %abandon_err, "could not close saga, left for recovery");
            }
            return Err(e);
        }

        let payment_id = match self.process_payment(saga_id, &order) {
            Ok(payment_id) => payment_id,
            Err(e) => {
                warn!(saga = %saga_id, error = %e, "payment failed, compensating");
                self.settle_failure(saga_id, &order, &e);
                return Err(e);
            }
        };

        if let Err(e) = self.confirm_order(saga_id, order_id, payment_id) {
            warn!(saga = %saga_id, error = %e, "confirmation failed, compensating");
            self.settle_failure(saga_id, &order, &e);
            return Err(e);
        }

        info!(saga = %saga_id, order = %order_id, payment = %payment_id, "saga done");
        self.store
            .order(order_id)
            .ok_or_else(|| EngineError::not_found("order", order_id))
    }

    /// Finishes every saga left in a non-terminal state, compensating
    /// whatever it had committed. Meant to run at startup, before new sagas
    /// begin. Returns the number of sagas recovered.
    ///
    /// # Errors
    ///
    /// Returns the first compensation error; remaining sagas stay pending for
    /// the next run.
    pub fn recover(&self) -> Result<usize> {
        let mut recovered = 0;
        for saga in self.store.sagas_snapshot() {
            if saga.state.is_terminal() {
                continue;
            }
            let order = self
                .store
                .order(saga.order_id)
                .ok_or_else(|| EngineError::not_found("order", saga.order_id))?;
            warn!(saga = %saga.id, state = %saga.state, "recovering interrupted saga");
            let cause = saga
                .error
                .clone()
                .unwrap_or_else(|| format!("interrupted while {}", saga.state));
            if saga.state == SagaState::Reserving {
                self.abandon(saga.id, order.id, &cause)?;
            } else {
                self.compensate(saga.id, &order, &cause)?;
            }
            recovered += 1;
        }
        Ok(recovered)
    }

    fn deadline(&self) -> Deadline {
        Deadline::after(self.step_timeout)
    }

    /// Locks the saga row and checks it is in `expected` state.
    fn lock_saga<'s>(
        &'s self,
        uow: &UnitOfWork<'s>,
        saga_id: SagaId,
        expected: SagaState,
    ) -> Result<crate::store::RowLock<SagaId, SagaRecord>> {
        let saga = uow.lock(self.store.sagas(), saga_id)?;
        if saga.state != expected {
            return Err(EngineError::Conflict(format!(
                "saga {saga_id} is {}, expected {expected}",
                saga.state
            )));
        }
        Ok(saga)
    }

    /// Step 1: reserve every item atomically and move the order to processing.
    fn reserve_stock(&self, saga_id: SagaId, order: &Order) -> Result<()> {
        let mut uow = self.store.begin(self.deadline());
        let mut saga = self.lock_saga(&uow, saga_id, SagaState::Reserving)?;
        let mut order_row = uow.lock(self.store.orders(), order.id)?;
        order_row.start_processing()?;

        // Sorted by product id, so concurrent sagas lock products in one order.
        for (product_id, quantity) in order.quantities()? {
            let mut product = uow.lock(self.store.products(), product_id)?;
            product.reserve(quantity).map_err(|_| {
                EngineError::StockUnavailable(format!(
                    "product {product_id}: requested {quantity}, available {}",
                    product.available()
                ))
            })?;
            uow.stage(product);
        }

        saga.stock_reserved = true;
        saga.advance(SagaState::Paying);
        uow.stage(order_row);
        uow.stage(saga);
        uow.commit()
    }

    /// Step 2: charge through the gateway and record a completed payment.
    fn process_payment(&self, saga_id: SagaId, order: &Order) -> Result<PaymentId> {
        self.gateway
            .charge(order)
            .map_err(EngineError::PaymentFailed)?;

        let payment = Payment {
            id: PaymentId::new(),
            order_id: order.id,
            amount: order.total_amount,
            method: self.gateway.method().to_string(),
            status: PaymentStatus::Completed,
            transaction_id: None,
        };
        let payment_id = payment.id;

        let mut uow = self.store.begin(self.deadline());
        let mut saga = self.lock_saga(&uow, saga_id, SagaState::Paying)?;
        saga.payment_id = Some(payment_id);
        saga.advance(SagaState::Confirming);
        uow.stage_insert(self.store.payments(), payment_id, payment);
        uow.stage(saga);
        uow.commit()?;
        Ok(payment_id)
    }

    /// Step 3: complete the order and link the payment.
    fn confirm_order(&self, saga_id: SagaId, order_id: OrderId, payment_id: PaymentId) -> Result<()> {
        let mut uow = self.store.begin(self.deadline());
        let mut saga = self.lock_saga(&uow, saga_id, SagaState::Confirming)?;
        let mut order_row = uow.lock(self.store.orders(), order_id)?;
        order_row.complete(payment_id)?;
        saga.advance(SagaState::Done);
        uow.stage(order_row);
        uow.stage(saga);
        uow.commit()
    }

    /// Compensates after a failed step. Errors are logged, not returned: the
    /// caller reports the step's error, and an unfinished compensation stays
    /// visible to [`OrderSaga::recover`].
    fn settle_failure(&self, saga_id: SagaId, order: &Order, cause: &EngineError) {
        if let Err(e) = self.compensate(saga_id, order, &cause.to_string()) {
            error!(saga = %saga_id, error = %e, "compensation incomplete, left for recovery");
        }
    }

    fn compensate(&self, saga_id: SagaId, order: &Order, cause: &str) -> Result<()> {
        self.mark_compensating(saga_id, cause)?;
        let saga = self
            .store
            .saga(saga_id)
            .ok_or_else(|| EngineError::not_found("saga", saga_id))?;
        if let Some(payment_id) = saga.payment_id {
            self.cancel_payment(payment_id)?;
        }
        if saga.stock_reserved {
            self.cancel_stock_reservation(saga_id, order)?;
        }
        self.fail_saga(saga_id, order.id)?;
        info!(saga = %saga_id, order = %order.id, "saga compensated");
        Ok(())
    }

    fn mark_compensating(&self, saga_id: SagaId, cause: &str) -> Result<()> {
        let mut uow = self.store.begin(self.deadline());
        let mut saga = uow.lock(self.store.sagas(), saga_id)?;
        if saga.state.is_terminal() {
            return Err(EngineError::Conflict(format!(
                "saga {saga_id} already {}",
                saga.state
            )));
        }
        if saga.error.is_none() {
            saga.error = Some(cause.to_string());
        }
        saga.advance(SagaState::Compensating);
        uow.stage(saga);
        uow.commit()
    }

    /// Marks the payment cancelled. Idempotent.
    fn cancel_payment(&self, payment_id: PaymentId) -> Result<()> {
        let mut uow = self.store.begin(self.deadline());
        let mut payment = uow.lock(self.store.payments(), payment_id)?;
        if payment.status == PaymentStatus::Cancelled {
            return Ok(());
        }
        payment.status = PaymentStatus::Cancelled;
        uow.stage(payment);
        uow.commit()?;
        info!(payment = %payment_id, "payment cancelled");
        Ok(())
    }

    /// Returns every reserved unit. The saga's `stock_reserved` flag is
    /// cleared in the same commit, so a repeat is a no-op.
    fn cancel_stock_reservation(&self, saga_id: SagaId, order: &Order) -> Result<()> {
        let mut uow = self.store.begin(self.deadline());
        let mut saga = uow.lock(self.store.sagas(), saga_id)?;
        if !saga.stock_reserved {
            return Ok(());
        }
        for (product_id, quantity) in order.quantities()? {
            let mut product = uow.lock(self.store.products(), product_id)?;
            product.release(quantity);
            uow.stage(product);
        }
        saga.stock_reserved = false;
        saga.updated_at = Utc::now();
        uow.stage(saga);
        uow.commit()?;
        info!(saga = %saga_id, order = %order.id, "stock reservation released");
        Ok(())
    }

    /// Closes a saga whose first step never committed. The order is
    /// cancelled only if no other caller has started processing it.
    fn abandon(&self, saga_id: SagaId, order_id: OrderId, cause: &str) -> Result<()> {
        let mut uow = self.store.begin(self.deadline());
        let mut saga = self.lock_saga(&uow, saga_id, SagaState::Reserving)?;
        let mut order_row = uow.lock(self.store.orders(), order_id)?;
        if order_row.status == OrderStatus::Pending {
            order_row.cancel();
        }
        saga.error = Some(cause.to_string());
        saga.advance(SagaState::Failed);
        uow.stage(order_row);
        uow.stage(saga);
        uow.commit()?;
        info!(saga = %saga_id, order = %order_id, "saga abandoned before reservation");
        Ok(())
    }

    fn fail_saga(&self, saga_id: SagaId, order_id: OrderId) -> Result<()> {
        let mut uow = self.store.begin(self.deadline());
        let mut saga = self.lock_saga(&uow, saga_id, SagaState::Compensating)?;
        let mut order_row = uow.lock(self.store.orders(), order_id)?;
        order_row.cancel();
        saga.advance(SagaState::Failed);
        uow.stage(order_row);
        uow.stage(saga);
        uow.commit()
    }
}
